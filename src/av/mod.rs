//! Audio/Video base types: codec descriptions, packets, and the
//! demuxer/muxer traits every container and protocol implements.

use crate::codec::aac::AacCodecData;
use crate::codec::h264::H264CodecData;
use crate::error::Result;
use crate::format::flv::tag::Tag;
use async_trait::async_trait;

pub mod packet;
pub mod pktque;
pub mod transport;

pub use packet::{DataType, Packet, PKT_AVC_END_OF_SEQ, PKT_AV_PAYLOAD, PKT_SEQ_HEADER};
pub use transport::Transport;

/// Supported codec families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    H264,
    AAC,
}

impl CodecType {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecType::H264)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, CodecType::AAC)
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecType::H264 => write!(f, "H264"),
            CodecType::AAC => write!(f, "AAC"),
        }
    }
}

/// Codec configuration for one elementary stream.
///
/// Carries the codec-specific sequence-header bytes
/// (AVCDecoderConfigurationRecord / AudioSpecificConfig), their decoded
/// fields, and the cached FLV sequence-header tag for fast re-emission.
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub enum CodecData {
    H264(H264CodecData),
    AAC(AacCodecData),
}

impl CodecData {
    pub fn codec_type(&self) -> CodecType {
        match self {
            CodecData::H264(_) => CodecType::H264,
            CodecData::AAC(_) => CodecType::AAC,
        }
    }

    pub fn is_video(&self) -> bool {
        self.codec_type().is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type().is_audio()
    }

    /// Raw sequence-header bytes (configuration record or audio config).
    pub fn sequence_header_bytes(&self) -> &bytes::Bytes {
        match self {
            CodecData::H264(c) => c.record_bytes(),
            CodecData::AAC(c) => c.config_bytes(),
        }
    }

    /// The cached FLV-encoded sequence-header tag, when the producer
    /// attached one.
    pub fn seq_header_tag(&self) -> Option<&Tag> {
        match self {
            CodecData::H264(c) => c.seq_header_tag(),
            CodecData::AAC(c) => c.seq_header_tag(),
        }
    }

    /// Video width; 0 for audio streams or when SPS decoding failed.
    pub fn width(&self) -> u32 {
        match self {
            CodecData::H264(c) => c.width(),
            CodecData::AAC(_) => 0,
        }
    }

    /// Video height; 0 for audio streams or when SPS decoding failed.
    pub fn height(&self) -> u32 {
        match self {
            CodecData::H264(c) => c.height(),
            CodecData::AAC(_) => 0,
        }
    }

    /// Frame rate from the SPS VUI; 0 when absent.
    pub fn fps(&self) -> u32 {
        match self {
            CodecData::H264(c) => c.fps(),
            CodecData::AAC(_) => 0,
        }
    }

    /// Audio sample rate; 0 for video streams.
    pub fn sample_rate(&self) -> u32 {
        match self {
            CodecData::H264(_) => 0,
            CodecData::AAC(c) => c.sample_rate(),
        }
    }

    /// Audio channel count; 0 for video streams.
    pub fn channels(&self) -> u8 {
        match self {
            CodecData::H264(_) => 0,
            CodecData::AAC(c) => c.channels(),
        }
    }
}

/// Index of the first video stream in a codec-data list.
pub fn video_stream_index(streams: &[CodecData]) -> Option<usize> {
    streams.iter().position(|s| s.is_video())
}

/// Byte-wise equality of two codec-data lists (types and sequence
/// headers).
pub fn codec_data_equal(a: &[CodecData], b: &[CodecData]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.codec_type() == y.codec_type() && x.sequence_header_bytes() == y.sequence_header_bytes()
        })
}

/// A source of codec data and packets.
#[async_trait]
pub trait Demuxer: Send {
    /// The stream's codec-data list; probes the input if needed.
    async fn streams(&mut self) -> Result<Vec<CodecData>>;

    /// Reads the next packet, `Err(EndOfStream)` when drained.
    async fn read_packet(&mut self) -> Result<Packet>;
}

#[async_trait]
impl Demuxer for Box<dyn Demuxer> {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        (**self).streams().await
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        (**self).read_packet().await
    }
}

/// A sink for codec data and packets.
#[async_trait]
pub trait Muxer: Send {
    /// Writes container headers derived from `streams`.
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<()>;

    /// Writes one packet.
    async fn write_packet(&mut self, pkt: Packet) -> Result<()>;

    /// Finishes the output; called once.
    async fn write_trailer(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A muxer that records everything written to it.
    #[derive(Default)]
    pub struct TestMuxer {
        pub headers: Vec<Vec<CodecData>>,
        pub packets: Vec<Packet>,
        pub trailer_written: bool,
    }

    impl TestMuxer {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Muxer for TestMuxer {
        async fn write_header(&mut self, streams: &[CodecData]) -> Result<()> {
            self.headers.push(streams.to_vec());
            Ok(())
        }

        async fn write_packet(&mut self, pkt: Packet) -> Result<()> {
            self.packets.push(pkt);
            Ok(())
        }

        async fn write_trailer(&mut self) -> Result<()> {
            self.trailer_written = true;
            Ok(())
        }
    }
}
