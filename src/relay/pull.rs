//! HTTP-FLV puller: downloads a live FLV stream into a writer.

use super::Runner;
use crate::av::Transport;
use crate::error::Result;
use crate::format::{flv, httpflv};
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Pulls an HTTP-FLV stream and remuxes it to `writer` (a file, or a
/// sink when only measuring).
pub struct FlvPuller<W: AsyncWrite + Unpin + Send + 'static> {
    url: String,
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FlvPuller<W> {
    pub fn new(url: impl Into<String>, writer: W) -> Self {
        Self {
            url: url.into(),
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Runner for FlvPuller<W> {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut demuxer = httpflv::open(&self.url).await?;
        let writer = self.writer.take().expect("puller runs once");
        let mut muxer = flv::Muxer::new(writer);

        let mut pkt_count = 0u64;
        let mut transport = Transport::new()
            .with_sid(self.url.clone())
            .with_after_read_packet(move |_| {
                pkt_count += 1;
                if pkt_count % 1000 == 0 {
                    tracing::debug!(received = pkt_count, "pull progress");
                }
                Ok(())
            })
            .with_after_read_headers(|streams| {
                for codec in streams {
                    if codec.is_video() {
                        tracing::info!(
                            codec = %codec.codec_type(),
                            width = codec.width(),
                            height = codec.height(),
                            fps = codec.fps(),
                            "pulled stream geometry"
                        );
                    }
                }
                Ok(())
            });

        transport.copy_av(&cancel, &mut muxer, &mut demuxer).await
    }
}
