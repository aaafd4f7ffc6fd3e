//! RTMP publisher: loops an FLV source (file or HTTP) into an RTMP
//! publish session.

use super::Runner;
use crate::av::pktque::{Filter, FilterDemuxer, FixTime, Walltime};
use crate::av::{Demuxer, Transport};
use crate::error::{Result, StreamerError};
use crate::format::rtmp::{self, Options};
use crate::format::{flv, httpflv};
use crate::utils::url::repair_host_with_port_1935;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Publishes an FLV source to an RTMP endpoint; local files loop
/// forever with spliced timestamps and wall-clock pacing.
pub struct RtmpPusher {
    rtmp_url: String,
    source: String,
    opts: Options,
}

impl RtmpPusher {
    pub fn new(rtmp_url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            rtmp_url: rtmp_url.into(),
            source: source.into(),
            opts: Options::default(),
        }
    }

    pub fn with_options(mut self, opts: Options) -> Self {
        self.opts = opts;
        self
    }
}

async fn open_source(source: &str) -> Result<Box<dyn Demuxer>> {
    if source.starts_with("http") {
        Ok(Box::new(httpflv::open(source).await?))
    } else {
        let file = tokio::fs::File::open(source).await.map_err(|e| {
            tracing::error!(file = %source, error = %e, "open source failed");
            StreamerError::from(e)
        })?;
        Ok(Box::new(flv::Demuxer::new(file)))
    }
}

#[async_trait]
impl Runner for RtmpPusher {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let u = Url::parse(&self.rtmp_url)
            .map_err(|e| StreamerError::connect_url(format!("{}: {e}", self.rtmp_url)))?;
        let mut host = u.host_str().unwrap_or_default().to_string();
        if let Some(port) = u.port() {
            host = format!("{host}:{port}");
        }
        let host = repair_host_with_port_1935(&host);

        let opts = self.opts.clone().with_tc_url(self.rtmp_url.clone());
        let mut conn = rtmp::dial(&host, opts).await?;
        conn.handshake_client().await?;
        conn.connect_publish().await?;

        let is_file = !self.source.starts_with("http");
        let mut filters: Vec<Box<dyn Filter>> = Vec::new();
        if is_file {
            filters.push(Box::new(FixTime::new(true)));
            filters.push(Box::new(Walltime::new()));
        }
        let mut demuxer = FilterDemuxer::new(open_source(&self.source).await?, filters);

        let mut pkt_count = 0u64;
        let mut transport = Transport::new()
            .with_sid(conn.info().id.clone())
            .with_after_write_packet(move |_| {
                pkt_count += 1;
                if pkt_count % 1000 == 0 {
                    tracing::debug!(sent = pkt_count, "publish progress");
                }
                Ok(())
            });

        let mut round = 0u64;
        loop {
            transport.copy_av(&cancel, &mut conn, &mut demuxer).await?;
            round += 1;
            tracing::debug!(round, source = %self.source, "source drained, reopening");
            demuxer.set_demuxer(open_source(&self.source).await?);
        }
    }
}
