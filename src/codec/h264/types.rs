use crate::error::{Result, StreamerError};
use crate::format::flv::tag::Tag;
use bytes::{BufMut, Bytes, BytesMut};

/// Decoded fields of a sequence parameter set, through the VUI timing
/// info. Width/height/fps stay zero when the parse failed non-fatally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub constraint_set_flags: u8,
    pub seq_parameter_set_id: u32,
    pub chroma_format_idc: u32,

    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: u32,

    pub crop_left: u32,
    pub crop_right: u32,
    pub crop_top: u32,
    pub crop_bottom: u32,

    pub width: u32,
    pub height: u32,

    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
    pub fps: u32,
}

/// Decoded fields of a picture parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PpsInfo {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub entropy_coding_mode_flag: bool,
    pub pic_order_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u32,
    pub pic_init_qp_minus26: i32,
    pub deblocking_filter_control_present_flag: bool,
}

/// Decoded SEI payload header; payload type 5 carries user data with a
/// UUID prefix, type 242 a timestamp.
#[derive(Debug, Clone, Default)]
pub struct SeiInfo {
    pub payload_type: u32,
    pub payload_size: u32,
    pub uuid: Vec<u8>,
    pub user_data: Vec<u8>,
    pub ts: u64,
}

/// Slice type extracted from a coded-slice NALU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
}

impl std::fmt::Display for SliceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceType::P => write!(f, "P"),
            SliceType::B => write!(f, "B"),
            SliceType::I => write!(f, "I"),
        }
    }
}

/// AVCDecoderConfigurationRecord per ISO/IEC 14496-15 §5.2.4.1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvcDecoderConfRecord {
    pub avc_profile_indication: u8,
    pub profile_compatibility: u8,
    pub avc_level_indication: u8,
    pub length_size_minus_one: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfRecord {
    /// Parses a configuration record; requires the 7-byte fixed part and
    /// complete SPS/PPS length-prefixed lists.
    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < 7 {
            return Err(StreamerError::InvalidData(
                "AVCDecoderConfRecord shorter than 7 bytes".into(),
            ));
        }

        let mut rec = AvcDecoderConfRecord {
            avc_profile_indication: b[1],
            profile_compatibility: b[2],
            avc_level_indication: b[3],
            length_size_minus_one: b[4] & 0x03,
            ..Default::default()
        };

        let sps_count = (b[5] & 0x1f) as usize;
        let mut n = 6;
        for _ in 0..sps_count {
            if b.len() < n + 2 {
                return Err(StreamerError::InvalidData("AVCDecoderConfRecord truncated SPS length".into()));
            }
            let len = u16::from_be_bytes([b[n], b[n + 1]]) as usize;
            n += 2;
            if b.len() < n + len {
                return Err(StreamerError::InvalidData("AVCDecoderConfRecord truncated SPS".into()));
            }
            rec.sps.push(Bytes::copy_from_slice(&b[n..n + len]));
            n += len;
        }

        if b.len() < n + 1 {
            return Err(StreamerError::InvalidData("AVCDecoderConfRecord missing PPS count".into()));
        }
        let pps_count = b[n] as usize;
        n += 1;
        for _ in 0..pps_count {
            if b.len() < n + 2 {
                return Err(StreamerError::InvalidData("AVCDecoderConfRecord truncated PPS length".into()));
            }
            let len = u16::from_be_bytes([b[n], b[n + 1]]) as usize;
            n += 2;
            if b.len() < n + len {
                return Err(StreamerError::InvalidData("AVCDecoderConfRecord truncated PPS".into()));
            }
            rec.pps.push(Bytes::copy_from_slice(&b[n..n + len]));
            n += len;
        }

        Ok(rec)
    }

    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        let mut n = 7;
        for sps in &self.sps {
            n += 2 + sps.len();
        }
        for pps in &self.pps {
            n += 2 + pps.len();
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty()
    }

    /// Serializes the record (version 1, reserved bits all set).
    pub fn marshal(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.len());
        b.put_u8(1);
        b.put_u8(self.avc_profile_indication);
        b.put_u8(self.profile_compatibility);
        b.put_u8(self.avc_level_indication);
        b.put_u8(self.length_size_minus_one | 0xfc);
        b.put_u8(self.sps.len() as u8 | 0xe0);
        for sps in &self.sps {
            b.put_u16(sps.len() as u16);
            b.put_slice(sps);
        }
        b.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            b.put_u16(pps.len() as u16);
            b.put_slice(pps);
        }
        b.freeze()
    }
}

/// H.264 codec configuration: the raw configuration record, its decoded
/// form, and the decoded first SPS/PPS. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct H264CodecData {
    record: Bytes,
    record_info: AvcDecoderConfRecord,
    sps_info: SpsInfo,
    pps_info: PpsInfo,
    seq_header_tag: Option<Tag>,
}

impl H264CodecData {
    /// Builds codec data from serialized AVCDecoderConfigurationRecord
    /// bytes. The record must hold at least one SPS and one PPS; SPS/PPS
    /// field decoding failures are tolerated and leave width/height/fps
    /// at zero.
    pub fn from_record(record: impl Into<Bytes>) -> Result<Self> {
        let record = record.into();
        let record_info = AvcDecoderConfRecord::unmarshal(&record)?;
        if record_info.sps.is_empty() {
            return Err(StreamerError::Codec("no SPS in AVCDecoderConfRecord".into()));
        }
        if record_info.pps.is_empty() {
            return Err(StreamerError::Codec("no PPS in AVCDecoderConfRecord".into()));
        }

        let sps_info = match super::parser::parse_sps(&record_info.sps[0]) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "SPS decode failed, resolution unknown");
                SpsInfo::default()
            }
        };
        let pps_info = match super::parser::parse_pps(&record_info.pps[0]) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "PPS decode failed");
                PpsInfo::default()
            }
        };

        Ok(Self {
            record,
            record_info,
            sps_info,
            pps_info,
            seq_header_tag: None,
        })
    }

    /// Builds codec data from raw SPS and PPS NALUs, synthesizing the
    /// configuration record (`length_size_minus_one = 3`).
    pub fn from_sps_and_pps(sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Result<Self> {
        let sps = sps.into();
        let pps = pps.into();
        if sps.len() < 4 {
            return Err(StreamerError::Codec("SPS too short for profile/level bytes".into()));
        }

        let record_info = AvcDecoderConfRecord {
            avc_profile_indication: sps[1],
            profile_compatibility: sps[2],
            avc_level_indication: sps[3],
            length_size_minus_one: 3,
            sps: vec![sps],
            pps: vec![pps],
        };
        let record = record_info.marshal();
        Self::from_record(record)
    }

    /// Attaches the cached FLV sequence-header tag.
    pub fn with_seq_header_tag(mut self, tag: Tag) -> Self {
        self.seq_header_tag = Some(tag);
        self
    }

    /// Raw AVCDecoderConfigurationRecord bytes.
    pub fn record_bytes(&self) -> &Bytes {
        &self.record
    }

    pub fn record_info(&self) -> &AvcDecoderConfRecord {
        &self.record_info
    }

    /// First SPS NALU.
    pub fn sps(&self) -> &Bytes {
        &self.record_info.sps[0]
    }

    /// First PPS NALU.
    pub fn pps(&self) -> &Bytes {
        &self.record_info.pps[0]
    }

    pub fn sps_info(&self) -> &SpsInfo {
        &self.sps_info
    }

    pub fn pps_info(&self) -> &PpsInfo {
        &self.pps_info
    }

    pub fn width(&self) -> u32 {
        self.sps_info.width
    }

    pub fn height(&self) -> u32 {
        self.sps_info.height
    }

    pub fn fps(&self) -> u32 {
        self.sps_info.fps
    }

    pub fn seq_header_tag(&self) -> Option<&Tag> {
        self.seq_header_tag.as_ref()
    }

    /// RFC 6381 codec string, e.g. `avc1.64001F`.
    pub fn codec_tag(&self) -> String {
        format!(
            "avc1.{:02X}{:02X}{:02X}",
            self.record_info.avc_profile_indication,
            self.record_info.profile_compatibility,
            self.record_info.avc_level_indication
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_round_trip() {
        let rec = AvcDecoderConfRecord {
            avc_profile_indication: 0x42,
            profile_compatibility: 0xc0,
            avc_level_indication: 0x1e,
            length_size_minus_one: 3,
            sps: vec![Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1e, 0xa9])],
            pps: vec![Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])],
        };
        let bytes = rec.marshal();
        assert_eq!(bytes.len(), rec.len());
        // fixed prefix: version, profile/compat/level, reserved|lengthsize,
        // reserved|spscount
        assert_eq!(&bytes[..6], &[1, 0x42, 0xc0, 0x1e, 0xff, 0xe1]);

        let back = AvcDecoderConfRecord::unmarshal(&bytes).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn record_too_short() {
        assert!(AvcDecoderConfRecord::unmarshal(&[1, 2, 3]).is_err());
    }
}
