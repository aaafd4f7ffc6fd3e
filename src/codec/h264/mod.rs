//! # H.264/AVC parsing
//!
//! NAL unit splitting for all three framings (raw, AVCC length-prefixed,
//! Annex-B start codes), emulation-prevention handling, SPS/PPS/SEI
//! decoding with resolution and frame-rate extraction, slice-type
//! detection, and the AVCDecoderConfigurationRecord codec used by FLV
//! and RTMP sequence headers.

pub mod parser;
pub mod types;

pub use parser::{
    add_emulation_bytes, is_data_nalu, nalu_type, parse_pps, parse_sei, parse_slice_header_type,
    parse_sps, remove_emulation_bytes, split_nalus, NaluKind, AUD_BYTES, NALU_AUD, NALU_IDR,
    NALU_PPS, NALU_SEI, NALU_SPS, START_CODE_BYTES,
};
pub use types::{AvcDecoderConfRecord, H264CodecData, PpsInfo, SeiInfo, SliceType, SpsInfo};
