use crate::error::{Result, StreamerError};
use crate::format::flv::tag::Tag;
use crate::utils::BitReader;
use bytes::{BufMut, Bytes, BytesMut};

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: u32 = 1024;
/// ADTS header length in bytes (no CRC).
pub const ADTS_HEADER_LENGTH: usize = 7;

const SAMPLE_RATE_TABLE: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// MPEG-4 AudioSpecificConfig fields per ISO/IEC 14496-3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mpeg4AudioConfig {
    /// Audio object type (2 = AAC-LC).
    pub object_type: u8,
    /// Index into the sampling-frequency table; 0x0f means an explicit
    /// 24-bit rate follows.
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    /// Channel configuration (1 = mono, 2 = stereo).
    pub channel_config: u8,
}

impl Mpeg4AudioConfig {
    /// Decodes the 2+ byte AudioSpecificConfig.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 2 {
            return Err(StreamerError::Codec("AudioSpecificConfig shorter than 2 bytes".into()));
        }
        let mut r = BitReader::new(b);
        let mut cfg = Mpeg4AudioConfig {
            object_type: r.read_bits(5)? as u8,
            ..Default::default()
        };
        cfg.sample_rate_index = r.read_bits(4)? as u8;
        if cfg.sample_rate_index == 0x0f {
            cfg.sample_rate = r.read_bits(24)?;
        } else if (cfg.sample_rate_index as usize) < SAMPLE_RATE_TABLE.len() {
            cfg.sample_rate = SAMPLE_RATE_TABLE[cfg.sample_rate_index as usize];
        } else {
            return Err(StreamerError::Codec(format!(
                "invalid sample rate index {}",
                cfg.sample_rate_index
            )));
        }
        cfg.channel_config = r.read_bits(4)? as u8;
        Ok(cfg)
    }

    /// Encodes the AudioSpecificConfig (5-bit object type, 4-bit rate
    /// index or 24-bit explicit rate, 4-bit channel config).
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(5);
        if self.sample_rate_index == 0x0f {
            // 5 + 4 + 24 + 4 = 37 bits
            let mut v: u64 = (self.object_type as u64 & 0x1f) << 32;
            v |= 0x0f_u64 << 28;
            v |= (self.sample_rate as u64 & 0xff_ffff) << 4;
            v |= self.channel_config as u64 & 0x0f;
            // left-align 37 bits into 5 bytes
            let v = v << 3;
            out.put_u8((v >> 32) as u8);
            out.put_u32(v as u32);
        } else {
            let v: u16 = ((self.object_type as u16 & 0x1f) << 11)
                | ((self.sample_rate_index as u16 & 0x0f) << 7)
                | ((self.channel_config as u16 & 0x0f) << 3);
            out.put_u16(v);
        }
        out.freeze()
    }

    /// Resolves a sample rate to its table index, 0x0f when absent.
    pub fn index_for_rate(rate: u32) -> u8 {
        SAMPLE_RATE_TABLE
            .iter()
            .position(|&r| r == rate)
            .map(|i| i as u8)
            .unwrap_or(0x0f)
    }
}

/// AAC codec configuration: the raw AudioSpecificConfig and its decoded
/// fields. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct AacCodecData {
    config_bytes: Bytes,
    config: Mpeg4AudioConfig,
    seq_header_tag: Option<Tag>,
}

impl AacCodecData {
    /// Builds codec data from serialized AudioSpecificConfig bytes.
    pub fn from_config_bytes(b: impl Into<Bytes>) -> Result<Self> {
        let config_bytes = b.into();
        let config = Mpeg4AudioConfig::decode(&config_bytes)?;
        Ok(Self {
            config_bytes,
            config,
            seq_header_tag: None,
        })
    }

    /// Builds codec data from decoded config fields.
    pub fn from_config(config: Mpeg4AudioConfig) -> Self {
        Self {
            config_bytes: config.encode(),
            config,
            seq_header_tag: None,
        }
    }

    /// Attaches the cached FLV sequence-header tag.
    pub fn with_seq_header_tag(mut self, tag: Tag) -> Self {
        self.seq_header_tag = Some(tag);
        self
    }

    /// Raw AudioSpecificConfig bytes.
    pub fn config_bytes(&self) -> &Bytes {
        &self.config_bytes
    }

    pub fn config(&self) -> &Mpeg4AudioConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.config.channel_config
    }

    pub fn object_type(&self) -> u8 {
        self.config.object_type
    }

    pub fn seq_header_tag(&self) -> Option<&Tag> {
        self.seq_header_tag.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_audio_specific_config_round_trip() {
        // AAC-LC 44100 Hz stereo == 12 10
        let cfg = Mpeg4AudioConfig {
            object_type: 2,
            sample_rate_index: 4,
            sample_rate: 44100,
            channel_config: 2,
        };
        let bytes = cfg.encode();
        assert_eq!(&bytes[..], &[0x12, 0x10]);
        assert_eq!(Mpeg4AudioConfig::decode(&bytes).unwrap(), cfg);
    }

    #[test]
    fn test_explicit_sample_rate() {
        let cfg = Mpeg4AudioConfig {
            object_type: 2,
            sample_rate_index: 0x0f,
            sample_rate: 37800,
            channel_config: 1,
        };
        let bytes = cfg.encode();
        let back = Mpeg4AudioConfig::decode(&bytes).unwrap();
        assert_eq!(back.sample_rate, 37800);
        assert_eq!(back.channel_config, 1);
    }

    #[test]
    fn test_rate_index_lookup() {
        assert_eq!(Mpeg4AudioConfig::index_for_rate(48000), 3);
        assert_eq!(Mpeg4AudioConfig::index_for_rate(44100), 4);
        assert_eq!(Mpeg4AudioConfig::index_for_rate(12345), 0x0f);
    }
}
