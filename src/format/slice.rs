//! Slice application framing: sub-stream packetization of FLV tags for
//! networks that route on slice ids.
//!
//! Wire layout (15-byte header):
//!
//! ```text
//! |SliceLen|SliceType|SliceId|FrameId|posFlag|frameType|reserved|extend|data|
//! |UB12    |UB4      |u64    |u32    |UB2    |UB2      |UB3     |UB1   |... |
//! ```

use crate::av::{self, Packet as AvPacket};
use crate::error::{Result, StreamerError};
use crate::format::flv::tag::{self, Tag};
use crate::utils::time_to_ts;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Slice payload carries an FLV file header plus a sequence-header tag.
pub const SLICE_TYPE_FLV_HEADER: u8 = 0;
/// Slice payload carries script data.
pub const SLICE_TYPE_SCRIPT_DATA: u8 = 1;
/// Slice payload carries audio.
pub const SLICE_TYPE_AUDIO: u8 = 2;
/// Slice payload carries video.
pub const SLICE_TYPE_VIDEO: u8 = 3;

/// Frame type: audio or header.
pub const SLICE_FRAME_TYPE_AUDIO: u8 = 0;
/// Frame type: IDR frame.
pub const SLICE_FRAME_TYPE_IDR: u8 = 1;
/// Frame type: referenced frame.
pub const SLICE_FRAME_TYPE_REF: u8 = 2;
/// Frame type: non-referenced frame.
pub const SLICE_FRAME_TYPE_NOREF: u8 = 3;

/// Middle of a frame's slice run.
pub const SLICE_POSFLAG_MIDDLE: u8 = 0;
/// First slice of a frame.
pub const SLICE_POSFLAG_START: u8 = 1;
/// Last slice of a frame.
pub const SLICE_POSFLAG_END: u8 = 2;
/// The frame fits one slice.
pub const SLICE_POSFLAG_STARTEND: u8 = 3;

/// Reserved slice id carrying the AVC sequence header.
pub const SLICE_ID_AVC_HEADER: u64 = 1;
/// Reserved slice id carrying the AAC sequence header.
pub const SLICE_ID_AAC_HEADER: u64 = 2;

/// Default maximum payload per slice.
pub const SLICE_DEFAULT_SIZE_MAX: usize = 1280;
/// Slice header length in bytes.
pub const SLICE_HEADER_SIZE: usize = 15;
/// Headers declaring more than this are rejected.
pub const SLICE_SIZE_THRESHOLD: u16 = 3 << 10;

const EXTEND_HEADER_LEN: usize = 2;
/// Extend key carrying the frame timestamp.
pub const EXTEND_KEY_TIMESTAMP: u8 = 1;

/// Key/value extension block; encoded as a 2-byte total length followed
/// by 5-byte entries.
pub type Extend = BTreeMap<u8, u32>;

/// Encodes an extend block.
pub fn encode_extend(e: &Extend) -> Bytes {
    let mut w = BytesMut::with_capacity(EXTEND_HEADER_LEN + e.len() * 5);
    w.put_u16((e.len() * 5 + EXTEND_HEADER_LEN) as u16);
    for (&k, &v) in e {
        w.put_u8(k);
        w.put_u32(v);
    }
    w.freeze()
}

/// Decodes an extend block.
pub fn decode_extend(data: &[u8]) -> Result<Extend> {
    if data.len() < EXTEND_HEADER_LEN {
        return Err(StreamerError::Parser("slice extend truncated".into()));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if len < EXTEND_HEADER_LEN || (len - EXTEND_HEADER_LEN) % 5 != 0 || data.len() < len {
        return Err(StreamerError::Parser(format!("slice extend length {len} invalid")));
    }
    let mut e = Extend::new();
    let mut i = EXTEND_HEADER_LEN;
    while i < len {
        e.insert(data[i], u32::from_be_bytes([data[i + 1], data[i + 2], data[i + 3], data[i + 4]]));
        i += 5;
    }
    Ok(e)
}

/// One slice packet: decoded header fields plus the full on-wire bytes
/// (header included) in `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlicePacket {
    pub size: u16,
    pub slice_type: u8,
    pub slice_id: u64,
    pub frame_id: u32,
    pub pos_flag: u8,
    pub frame_type: u8,
    pub reserved: u8,
    pub extend_flag: u8,
    pub extend: Extend,
    pub data: Bytes,

    // not encoded; used by the queue and transports
    pub frame_dts: i32,
    pub header_begin_at: i64,
    pub header_changed: bool,
}

impl SlicePacket {
    /// True for the reserved sequence-header slice ids.
    pub fn is_header(&self) -> bool {
        self.slice_id == SLICE_ID_AVC_HEADER || self.slice_id == SLICE_ID_AAC_HEADER
    }
}

/// Serializes a slice header.
pub fn make_slice_header(pkt: &SlicePacket) -> [u8; SLICE_HEADER_SIZE] {
    let mut b = [0u8; SLICE_HEADER_SIZE];
    let size_type = (pkt.size << 4) | (pkt.slice_type as u16 & 0x0f);
    b[0..2].copy_from_slice(&size_type.to_be_bytes());
    b[2..10].copy_from_slice(&pkt.slice_id.to_be_bytes());
    b[10..14].copy_from_slice(&pkt.frame_id.to_be_bytes());
    b[14] = (pkt.pos_flag << 6) | ((pkt.frame_type & 0x3) << 4) | (pkt.extend_flag & 0x1);
    b
}

/// Parses a slice header, returning the packet shell and its declared
/// total size. Sizes beyond [`SLICE_SIZE_THRESHOLD`] are rejected.
pub fn parse_slice_header(data: &[u8]) -> Result<(SlicePacket, u16)> {
    if data.len() < SLICE_HEADER_SIZE {
        return Err(StreamerError::Parser("slice header truncated".into()));
    }
    let size_type = u16::from_be_bytes([data[0], data[1]]);
    let mut pkt = SlicePacket {
        size: size_type >> 4,
        slice_type: (size_type & 0x0f) as u8,
        slice_id: u64::from_be_bytes(data[2..10].try_into().unwrap()),
        frame_id: u32::from_be_bytes(data[10..14].try_into().unwrap()),
        ..Default::default()
    };
    let last = data[14];
    pkt.pos_flag = last >> 6;
    pkt.frame_type = (last >> 4) & 0x3;
    pkt.reserved = 0;
    pkt.extend_flag = last & 0x1;

    let len = pkt.size;
    if pkt.size > SLICE_SIZE_THRESHOLD {
        return Err(StreamerError::Parser(format!("slice pkt size {} too big", pkt.size)));
    }
    Ok((pkt, len))
}

/// Splits AV packets into bounded slices with running slice/frame ids.
pub struct DataSlicer {
    pub slice_id: u64,
    pub frame_id: u32,
    pub slice_size_max: usize,
}

impl DataSlicer {
    /// Seeds the slice-id space from the wall clock so ids are unique
    /// across restarts.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            slice_id: now * 100_000,
            frame_id: 0,
            slice_size_max: SLICE_DEFAULT_SIZE_MAX,
        }
    }

    pub fn with_slice_size_max(mut self, n: usize) -> Self {
        self.slice_size_max = n;
        self
    }

    /// Splits one serialized FLV tag (`data`) into slices, spreading the
    /// bytes evenly and tagging each with position and frame type from
    /// the AV packet.
    pub fn generate_slices(&mut self, data: &[u8], av_pkt: &AvPacket) -> Vec<SlicePacket> {
        let data_size = data.len();
        let slice_cnt = (data_size + self.slice_size_max - 1) / self.slice_size_max.max(1);
        let slice_cnt = slice_cnt.max(1);
        let base_size = data_size / slice_cnt;
        let mut over = data_size - base_size * slice_cnt;

        let mut pkts = Vec::with_capacity(slice_cnt);
        let mut start = 0usize;
        for i in 0..slice_cnt {
            let mut take = base_size;
            if over > 0 {
                take += 1;
                over -= 1;
            }

            let mut pkt = SlicePacket {
                slice_id: self.slice_id,
                frame_id: self.frame_id,
                frame_dts: time_to_ts(av_pkt.time),
                ..Default::default()
            };

            if av_pkt.is_video() {
                pkt.slice_type = SLICE_TYPE_VIDEO;
                pkt.frame_type = if av_pkt.is_key_frame {
                    SLICE_FRAME_TYPE_IDR
                } else {
                    SLICE_FRAME_TYPE_REF
                };
            } else if av_pkt.data_type == av::DataType::Audio {
                pkt.slice_type = SLICE_TYPE_AUDIO;
                pkt.frame_type = SLICE_FRAME_TYPE_AUDIO;
            } else {
                pkt.slice_type = SLICE_TYPE_SCRIPT_DATA;
            }

            pkt.pos_flag = if slice_cnt == 1 {
                SLICE_POSFLAG_STARTEND
            } else if i == 0 {
                SLICE_POSFLAG_START
            } else if i == slice_cnt - 1 {
                SLICE_POSFLAG_END
            } else {
                SLICE_POSFLAG_MIDDLE
            };

            pkt.size = (SLICE_HEADER_SIZE + take) as u16;
            let header = make_slice_header(&pkt);
            let mut out = BytesMut::with_capacity(pkt.size as usize);
            out.put_slice(&header);
            out.put_slice(&data[start..start + take]);
            pkt.data = out.freeze();

            pkts.push(pkt);
            start += take;
            self.slice_id += 1;
        }
        self.frame_id += 1;
        pkts
    }
}

impl Default for DataSlicer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps an FLV file header + sequence-header tag into the reserved
/// header slice for its family.
pub fn generate_header_slice(data: &[u8], t: &Tag) -> SlicePacket {
    let mut pkt = SlicePacket {
        slice_type: SLICE_TYPE_FLV_HEADER,
        pos_flag: SLICE_POSFLAG_STARTEND,
        size: (data.len() + SLICE_HEADER_SIZE) as u16,
        ..Default::default()
    };
    if t.tag_type == tag::TAG_VIDEO {
        pkt.slice_id = SLICE_ID_AVC_HEADER;
    } else if t.tag_type == tag::TAG_AUDIO {
        pkt.slice_id = SLICE_ID_AAC_HEADER;
    }

    let header = make_slice_header(&pkt);
    let mut out = BytesMut::with_capacity(pkt.size as usize);
    out.put_slice(&header);
    out.put_slice(data);
    pkt.data = out.freeze();
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{DataType, Packet};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn extend_round_trip() {
        let mut e = Extend::new();
        e.insert(EXTEND_KEY_TIMESTAMP, 1234);
        e.insert(2, 3456);
        let data = encode_extend(&e);
        assert_eq!(decode_extend(&data).unwrap(), e);
    }

    #[test]
    fn slicing_spreads_bytes_and_round_trips_headers() {
        let mut slicer = DataSlicer::new();
        slicer.slice_size_max = SLICE_DEFAULT_SIZE_MAX;
        let data = vec![0u8; 5003];

        let av_pkt = Packet::new(vec![])
            .with_data_type(DataType::Video)
            .with_time(Duration::from_millis(1324));
        let slices = slicer.generate_slices(&data, &av_pkt);
        assert_eq!(slices.len(), 4);

        let total: usize = slices.iter().map(|s| s.data.len() - SLICE_HEADER_SIZE).sum();
        assert_eq!(total, 5003);

        assert_eq!(slices[0].pos_flag, SLICE_POSFLAG_START);
        assert_eq!(slices[1].pos_flag, SLICE_POSFLAG_MIDDLE);
        assert_eq!(slices[3].pos_flag, SLICE_POSFLAG_END);

        for s in &slices {
            let (mut parsed, len) = parse_slice_header(&s.data).unwrap();
            assert_eq!(len, s.size);
            parsed.frame_dts = 1324;
            parsed.data = s.data.clone();
            assert_eq!(&parsed, s);
        }

        // consecutive ids, one frame id
        assert_eq!(slices[1].slice_id, slices[0].slice_id + 1);
        assert!(slices.iter().all(|s| s.frame_id == slices[0].frame_id));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut pkt = SlicePacket {
            size: SLICE_SIZE_THRESHOLD + 1,
            ..Default::default()
        };
        pkt.slice_type = SLICE_TYPE_VIDEO;
        let hdr = make_slice_header(&pkt);
        assert!(parse_slice_header(&hdr).is_err());
    }

    #[test]
    fn header_slice_ids() {
        let t = Tag {
            tag_type: tag::TAG_VIDEO,
            ..Default::default()
        };
        let pkt = generate_header_slice(&[1, 2, 3], &t);
        assert_eq!(pkt.slice_id, SLICE_ID_AVC_HEADER);
        assert!(pkt.is_header());

        let t = Tag {
            tag_type: tag::TAG_AUDIO,
            ..Default::default()
        };
        assert_eq!(generate_header_slice(&[], &t).slice_id, SLICE_ID_AAC_HEADER);
    }
}
