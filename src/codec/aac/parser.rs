use super::types::{Mpeg4AudioConfig, ADTS_HEADER_LENGTH, SAMPLES_PER_FRAME};
use crate::error::{Result, StreamerError};

/// Parses a 7-byte ADTS header.
///
/// Returns the decoded audio config, the header length (9 with CRC), the
/// total frame length in bytes (header included), and the sample count.
pub fn parse_adts_header(b: &[u8]) -> Result<(Mpeg4AudioConfig, usize, usize, u32)> {
    if b.len() < ADTS_HEADER_LENGTH {
        return Err(StreamerError::Parser("ADTS header too short".into()));
    }
    if b[0] != 0xff || b[1] & 0xf6 != 0xf0 {
        return Err(StreamerError::Parser("invalid ADTS sync word".into()));
    }

    let object_type = (b[2] >> 6) + 1;
    let sample_rate_index = (b[2] >> 2) & 0x0f;
    let channel_config = ((b[2] & 0x01) << 2) | (b[3] >> 6);

    let mut config = Mpeg4AudioConfig {
        object_type,
        sample_rate_index,
        channel_config,
        sample_rate: 0,
    };
    // resolve the index through the shared table
    let resolved = Mpeg4AudioConfig::decode(&config.encode())?;
    config.sample_rate = resolved.sample_rate;

    let frame_length = ((b[3] as usize & 0x03) << 11) | ((b[4] as usize) << 3) | (b[5] as usize >> 5);
    let samples = ((b[6] as u32 & 0x03) + 1) * SAMPLES_PER_FRAME;

    let protection_absent = b[1] & 0x01 == 1;
    let header_length = if protection_absent { 7 } else { 9 };

    if frame_length < header_length {
        return Err(StreamerError::Parser(format!(
            "ADTS frame length {frame_length} shorter than header"
        )));
    }

    Ok((config, header_length, frame_length, samples))
}

/// Writes a 7-byte ADTS header for a payload of `payload_len` bytes into
/// `out`.
pub fn fill_adts_header(out: &mut [u8; ADTS_HEADER_LENGTH], config: &Mpeg4AudioConfig, samples: u32, payload_len: usize) {
    let frame_length = payload_len + ADTS_HEADER_LENGTH;
    let raw_blocks = samples / SAMPLES_PER_FRAME - 1;

    out[0] = 0xff;
    out[1] = 0xf1; // MPEG-4, layer 0, no CRC
    out[2] = ((config.object_type - 1) << 6)
        | ((config.sample_rate_index & 0x0f) << 2)
        | ((config.channel_config >> 2) & 0x01);
    out[3] = ((config.channel_config & 0x03) << 6) | ((frame_length >> 11) & 0x03) as u8;
    out[4] = ((frame_length >> 3) & 0xff) as u8;
    out[5] = (((frame_length & 0x07) << 5) as u8) | 0x1f; // fullness high bits
    out[6] = 0xfc | (raw_blocks & 0x03) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_adts_round_trip() {
        let config = Mpeg4AudioConfig {
            object_type: 2,
            sample_rate_index: 4,
            sample_rate: 44100,
            channel_config: 2,
        };
        let mut hdr = [0u8; ADTS_HEADER_LENGTH];
        fill_adts_header(&mut hdr, &config, SAMPLES_PER_FRAME, 312);

        let (parsed, hdrlen, framelen, samples) = parse_adts_header(&hdr).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(hdrlen, 7);
        assert_eq!(framelen, 7 + 312);
        assert_eq!(samples, SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_adts_invalid_sync() {
        let data = [0x00, 0x00, 0x50, 0x80, 0x43, 0x80, 0x00];
        assert!(parse_adts_header(&data).is_err());
    }

    #[test]
    fn test_adts_truncated() {
        assert!(parse_adts_header(&[0xff, 0xf1]).is_err());
    }
}
