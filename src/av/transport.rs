//! The reader-to-writer pump coupling a demuxer to a muxer.

use super::{CodecData, Demuxer, Muxer, Packet};
use crate::error::{Result, StreamerError};
use tokio_util::sync::CancellationToken;

type PacketHook = Box<dyn FnMut(&mut Packet) -> Result<()> + Send>;
type HeaderHook = Box<dyn FnMut(&[CodecData]) -> Result<()> + Send>;

/// Copies headers and packets from a demuxer to a muxer, re-emitting
/// headers whenever a packet arrives with `header_changed` set.
///
/// Optional hooks observe each step; a hook error aborts the pipeline.
#[derive(Default)]
pub struct Transport {
    sid: String,
    after_read_packet: Option<PacketHook>,
    after_write_packet: Option<PacketHook>,
    after_read_headers: Option<HeaderHook>,
    after_write_headers: Option<HeaderHook>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stream id used in log lines.
    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = sid.into();
        self
    }

    pub fn with_after_read_packet(mut self, f: impl FnMut(&mut Packet) -> Result<()> + Send + 'static) -> Self {
        self.after_read_packet = Some(Box::new(f));
        self
    }

    pub fn with_after_write_packet(mut self, f: impl FnMut(&mut Packet) -> Result<()> + Send + 'static) -> Self {
        self.after_write_packet = Some(Box::new(f));
        self
    }

    pub fn with_after_read_headers(mut self, f: impl FnMut(&[CodecData]) -> Result<()> + Send + 'static) -> Self {
        self.after_read_headers = Some(Box::new(f));
        self
    }

    pub fn with_after_write_headers(mut self, f: impl FnMut(&[CodecData]) -> Result<()> + Send + 'static) -> Self {
        self.after_write_headers = Some(Box::new(f));
        self
    }

    /// Copies headers then packets until the source ends or the token is
    /// canceled; writes the trailer on a clean end.
    pub async fn copy_av<M, D>(&mut self, cancel: &CancellationToken, dst: &mut M, src: &mut D) -> Result<()>
    where
        M: Muxer,
        D: Demuxer,
    {
        self.copy_headers(cancel, dst, src).await?;

        match self.copy_packets(cancel, dst, src).await {
            Ok(()) | Err(StreamerError::EndOfStream) => {}
            Err(e) => return Err(e),
        }
        if cancel.is_cancelled() {
            return Err(StreamerError::Canceled);
        }
        dst.write_trailer().await?;
        Ok(())
    }

    /// Reads the source's codec data and writes it to the sink, firing
    /// the header hooks around both steps.
    pub async fn copy_headers<M, D>(&mut self, cancel: &CancellationToken, dst: &mut M, src: &mut D) -> Result<()>
    where
        M: Muxer,
        D: Demuxer,
    {
        if cancel.is_cancelled() {
            return Err(StreamerError::Canceled);
        }
        let headers = src.streams().await?;
        if let Some(f) = &mut self.after_read_headers {
            f(&headers)?;
        }
        dst.write_header(&headers).await?;
        if let Some(f) = &mut self.after_write_headers {
            f(&headers)?;
        }
        Ok(())
    }

    /// Pumps packets until the source reports end-of-stream.
    ///
    /// A packet with `header_changed` triggers a header re-copy first;
    /// sequence-header and script-data packets then carry nothing the
    /// sink has not already seen and are not forwarded.
    pub async fn copy_packets<M, D>(&mut self, cancel: &CancellationToken, dst: &mut M, src: &mut D) -> Result<()>
    where
        M: Muxer,
        D: Demuxer,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(StreamerError::Canceled);
            }

            let mut pkt = match src.read_packet().await {
                Ok(pkt) => pkt,
                Err(StreamerError::EndOfStream) => return Err(StreamerError::EndOfStream),
                Err(e) => return Err(e),
            };

            if let Some(f) = &mut self.after_read_packet {
                f(&mut pkt)?;
            }

            if pkt.header_changed {
                tracing::info!(sid = %self.sid, "header change, re-copying headers");
                self.copy_headers(cancel, dst, src).await?;
                if pkt.is_sequence_header() || pkt.is_script_data() {
                    continue;
                }
            }
            if pkt.drop {
                continue;
            }

            let mut written = pkt.clone();
            dst.write_packet(pkt).await?;
            if let Some(f) = &mut self.after_write_packet {
                f(&mut written)?;
            }
        }
    }
}
