//! HTTP-FLV pull source: a streaming GET whose body feeds the FLV
//! demuxer.

use crate::error::{Result, StreamerError};
use crate::format::flv;
use bytes::Bytes;
use futures::TryStreamExt;
use std::pin::Pin;
use tokio_util::io::StreamReader;

type BodyStream = Pin<Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The demuxer type produced by [`open`].
pub type HttpFlvDemuxer = flv::Demuxer<StreamReader<BodyStream, Bytes>>;

/// Opens an HTTP-FLV URL and returns a demuxer over the live body.
///
/// Non-200 responses map to the stream-not-exist code, request errors
/// to the connect-url code.
pub async fn open(url: &str) -> Result<HttpFlvDemuxer> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| StreamerError::connect_url(format!("{url}: {e}")))?;

    let response = client
        .get(url)
        .header("User-Agent", "streamer")
        .header("Accept", "*/*")
        .header("Range", "bytes=0-")
        .header("Connection", "close")
        .send()
        .await
        .map_err(|e| {
            tracing::error!(url = %url, error = %e, "http-flv request failed");
            StreamerError::connect_url(url)
        })?;

    if response.status() != reqwest::StatusCode::OK {
        tracing::error!(url = %url, status = %response.status(), "http-flv status not ok");
        return Err(StreamerError::stream_not_exist(url));
    }

    let stream: BodyStream = Box::pin(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    Ok(flv::Demuxer::new(StreamReader::new(stream)))
}
