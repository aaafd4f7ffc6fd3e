use super::types::{PpsInfo, SeiInfo, SliceType, SpsInfo};
use crate::error::{Result, StreamerError};
use crate::utils::BitReader;

/// NALU type for supplemental enhancement information.
pub const NALU_SEI: u8 = 6;
/// NALU type for a sequence parameter set.
pub const NALU_SPS: u8 = 7;
/// NALU type for a picture parameter set.
pub const NALU_PPS: u8 = 8;
/// NALU type for an access unit delimiter.
pub const NALU_AUD: u8 = 9;
/// NALU type for an IDR slice.
pub const NALU_IDR: u8 = 5;

/// Annex-B start code.
pub const START_CODE_BYTES: &[u8] = &[0, 0, 1];
/// 4-byte start code, an access-unit-delimiter NALU, and the start code
/// of the following NALU; written before the first NALU of each access
/// unit in MPEG-TS.
pub const AUD_BYTES: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0, 0, 0, 0, 1];

/// NALU framing detected by [`split_nalus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    /// A single NALU with no framing.
    Raw,
    /// Big-endian length-prefixed NALUs.
    Avcc,
    /// Start-code-delimited NALUs.
    AnnexB,
}

/// True for coded-slice NALU types 1..=5.
pub fn is_data_nalu(b: &[u8]) -> bool {
    if b.is_empty() {
        return false;
    }
    let typ = b[0] & 0x1f;
    (1..=5).contains(&typ)
}

pub fn nalu_type(b: &[u8]) -> u8 {
    if b.is_empty() {
        return 0;
    }
    b[0] & 0x1f
}

/// Splits a buffer into NALUs, detecting the framing.
///
/// AVCC is assumed when interpreting the first 4 bytes as a big-endian
/// length and iterating consumes the buffer exactly; otherwise a leading
/// `00 00 01` / `00 00 00 01` selects Annex-B; otherwise the whole buffer
/// is one raw NALU.
pub fn split_nalus(b: &[u8]) -> (Vec<&[u8]>, NaluKind) {
    if b.len() < 4 {
        return (vec![b], NaluKind::Raw);
    }

    let val3 = u32::from_be_bytes([0, b[0], b[1], b[2]]);
    let val4 = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);

    // maybe AVCC
    if val4 as usize <= b.len() {
        let mut len = val4 as usize;
        let mut rest = &b[4..];
        let mut nalus = Vec::new();
        loop {
            if len > rest.len() {
                break;
            }
            nalus.push(&rest[..len]);
            rest = &rest[len..];
            if rest.len() < 4 {
                break;
            }
            len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if len > rest.len() {
                break;
            }
        }
        if rest.is_empty() {
            return (nalus, NaluKind::Avcc);
        }
    }

    // Annex-B
    if val3 == 1 || val4 == 1 {
        let mut nalus = Vec::new();
        let mut pos = if val3 == 1 { 3 } else { 4 };
        let mut start = pos;
        while pos < b.len() {
            if pos + 2 < b.len() && b[pos] == 0 && b[pos + 1] == 0 && b[pos + 2] == 1 {
                if start < pos {
                    // trim a preceding zero from a 4-byte start code
                    let mut end = pos;
                    if end > start && b[end - 1] == 0 {
                        end -= 1;
                    }
                    if start < end {
                        nalus.push(&b[start..end]);
                    }
                }
                pos += 3;
                start = pos;
            } else {
                pos += 1;
            }
        }
        if start < b.len() {
            nalus.push(&b[start..]);
        }
        return (nalus, NaluKind::AnnexB);
    }

    (vec![b], NaluKind::Raw)
}

/// Inserts emulation-prevention bytes: a `0x03` is spliced in whenever
/// two zero bytes precede a byte `<= 0x03`.
pub fn add_emulation_bytes(b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(b.len() + 4);
    let mut zeros = 0;
    for &byte in b {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
    out
}

/// Removes emulation-prevention bytes: every `00 00 03` collapses to
/// `00 00`.
pub fn remove_emulation_bytes(b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if i + 2 < b.len() && b[i] == 0 && b[i + 1] == 0 && b[i + 2] == 3 {
            out.push(0);
            out.push(0);
            i += 3;
        } else {
            out.push(b[i]);
            i += 1;
        }
    }
    out
}

/// Decodes a sequence parameter set NALU (header byte included) per
/// ITU-T H.264 §7.3.2.1.1 through the VUI timing info.
pub fn parse_sps(data: &[u8]) -> Result<SpsInfo> {
    let rbsp = remove_emulation_bytes(data);
    let mut r = BitReader::new(&rbsp);
    let mut sps = SpsInfo::default();

    // forbidden_zero_bit, nal_ref_idc, nal_unit_type
    r.skip_bits(8)?;

    sps.profile_idc = r.read_bits(8)? as u8;
    sps.constraint_set_flags = r.read_bits(6)? as u8;
    r.skip_bits(2)?; // reserved_zero_2bits
    sps.level_idc = r.read_bits(8)? as u8;
    sps.seq_parameter_set_id = r.read_golomb()?;

    if matches!(
        sps.profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        sps.chroma_format_idc = r.read_golomb()?;
        if sps.chroma_format_idc == 3 {
            r.skip_bits(1)?; // separate_colour_plane_flag
        }
        r.read_golomb()?; // bit_depth_luma_minus8
        r.read_golomb()?; // bit_depth_chroma_minus8
        r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag

        if r.read_bit()? {
            // seq_scaling_matrix_present_flag
            let count = if sps.chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if r.read_bit()? {
                    let size = if i < 6 { 16 } else { 64 };
                    let mut last_scale = 8i32;
                    let mut next_scale = 8i32;
                    for _ in 0..size {
                        if next_scale != 0 {
                            let delta = r.read_signed_golomb()?;
                            next_scale = (last_scale + delta + 256) % 256;
                        }
                        if next_scale != 0 {
                            last_scale = next_scale;
                        }
                    }
                }
            }
        }
    }

    r.read_golomb()?; // log2_max_frame_num_minus4

    let pic_order_cnt_type = r.read_golomb()?;
    if pic_order_cnt_type == 0 {
        r.read_golomb()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.skip_bits(1)?; // delta_pic_order_always_zero_flag
        r.read_signed_golomb()?; // offset_for_non_ref_pic
        r.read_signed_golomb()?; // offset_for_top_to_bottom_field
        let cycle = r.read_golomb()?;
        for _ in 0..cycle {
            r.read_signed_golomb()?;
        }
    }

    r.read_golomb()?; // max_num_ref_frames
    r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    sps.pic_width_in_mbs_minus1 = r.read_golomb()?;
    sps.pic_height_in_map_units_minus1 = r.read_golomb()?;

    sps.frame_mbs_only_flag = r.read_bit()? as u32;
    if sps.frame_mbs_only_flag == 0 {
        r.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }

    r.skip_bits(1)?; // direct_8x8_inference_flag

    if r.read_bit()? {
        // frame_cropping_flag
        sps.crop_left = r.read_golomb()?;
        sps.crop_right = r.read_golomb()?;
        sps.crop_top = r.read_golomb()?;
        sps.crop_bottom = r.read_golomb()?;
    }

    sps.width = (sps.pic_width_in_mbs_minus1 + 1) * 16 - sps.crop_left * 2 - sps.crop_right * 2;
    sps.height = (2 - sps.frame_mbs_only_flag) * (sps.pic_height_in_map_units_minus1 + 1) * 16
        - sps.crop_top * 2
        - sps.crop_bottom * 2;

    if r.read_bit()? {
        // vui_parameters_present_flag
        parse_vui(&mut sps, &mut r)?;
    }

    Ok(sps)
}

fn parse_vui(sps: &mut SpsInfo, r: &mut BitReader) -> Result<()> {
    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let idc = r.read_bits(8)?;
        if idc == 255 {
            // SAR_Extended
            r.skip_bits(32)?;
        }
    }

    if r.read_bit()? {
        // overscan_info_present_flag
        r.skip_bits(1)?;
    }

    if r.read_bit()? {
        // video_signal_type_present_flag
        r.skip_bits(4)?; // video_format + full_range
        if r.read_bit()? {
            // colour_description_present_flag
            r.skip_bits(24)?;
        }
    }

    if r.read_bit()? {
        // chroma_loc_info_present_flag
        r.read_golomb()?;
        r.read_golomb()?;
    }

    sps.timing_info_present = r.read_bit()?;
    if sps.timing_info_present {
        sps.num_units_in_tick = r.read_bits(32)?;
        sps.time_scale = r.read_bits(32)?;
        sps.fixed_frame_rate_flag = r.read_bit()?;
        if sps.num_units_in_tick > 0 {
            sps.fps = sps.time_scale / sps.num_units_in_tick;
            if sps.fixed_frame_rate_flag {
                sps.fps /= 2;
            }
        }
    }

    Ok(())
}

/// Decodes a picture parameter set NALU (header byte included).
pub fn parse_pps(data: &[u8]) -> Result<PpsInfo> {
    let rbsp = remove_emulation_bytes(data);
    let mut r = BitReader::new(&rbsp);
    let mut pps = PpsInfo::default();

    r.skip_bits(8)?; // nalu header

    pps.pic_parameter_set_id = r.read_golomb()?;
    pps.seq_parameter_set_id = r.read_golomb()?;
    pps.entropy_coding_mode_flag = r.read_bit()?;
    pps.pic_order_present_flag = r.read_bit()?;
    pps.num_slice_groups_minus1 = r.read_golomb()?;

    if pps.num_slice_groups_minus1 > 0 {
        let map_type = r.read_golomb()?;
        match map_type {
            0 => {
                for _ in 0..=pps.num_slice_groups_minus1 {
                    r.read_golomb()?; // run_length_minus1
                }
            }
            2 => {
                for _ in 0..pps.num_slice_groups_minus1 {
                    r.read_golomb()?; // top_left
                    r.read_golomb()?; // bottom_right
                }
            }
            3 | 4 | 5 => {
                r.skip_bits(1)?; // slice_group_change_direction_flag
                r.read_golomb()?; // slice_group_change_rate_minus1
            }
            6 => {
                let pic_size = r.read_golomb()?;
                let bits = 32 - (pps.num_slice_groups_minus1 + 1).leading_zeros();
                let bits = bits.saturating_sub(1).max(1);
                for _ in 0..=pic_size {
                    r.read_bits(bits)?;
                }
            }
            _ => {}
        }
    }

    r.read_golomb()?; // num_ref_idx_l0_active_minus1
    r.read_golomb()?; // num_ref_idx_l1_active_minus1
    pps.weighted_pred_flag = r.read_bit()?;
    pps.weighted_bipred_idc = r.read_bits(2)?;
    pps.pic_init_qp_minus26 = r.read_signed_golomb()?;
    r.read_signed_golomb()?; // pic_init_qs_minus26
    r.read_signed_golomb()?; // chroma_qp_index_offset
    pps.deblocking_filter_control_present_flag = r.read_bit()?;
    r.skip_bits(2)?; // constrained_intra_pred + redundant_pic_cnt_present

    Ok(pps)
}

/// Decodes an SEI NALU header (header byte included). Payload types 5
/// (user data unregistered) and 242 (embedded timestamp) are extracted.
pub fn parse_sei(data: &[u8]) -> Result<SeiInfo> {
    let mut r = BitReader::new(data);
    let mut sei = SeiInfo::default();

    r.skip_bits(8)?; // nalu header

    loop {
        let t = r.read_bits(8)?;
        sei.payload_type += t;
        if t != 255 {
            break;
        }
    }
    loop {
        let s = r.read_bits(8)?;
        sei.payload_size += s;
        if s != 255 {
            break;
        }
    }

    match sei.payload_type {
        5 => {
            if sei.payload_size < 16 {
                return Err(StreamerError::Codec("SEI type 5 shorter than UUID".into()));
            }
            for _ in 0..16 {
                sei.uuid.push(r.read_bits(8)? as u8);
            }
            for _ in 0..sei.payload_size - 16 {
                sei.user_data.push(r.read_bits(8)? as u8);
            }
        }
        242 => {
            if sei.payload_size == 8 {
                let mut ts = 0u64;
                for _ in 0..8 {
                    ts = (ts << 8) | r.read_bits(8)? as u64;
                }
                sei.ts = ts;
            }
        }
        _ => {}
    }

    Ok(sei)
}

/// Parses the slice type of a coded-slice NALU from its
/// `first_mb_in_slice` and `slice_type` Exp-Golomb fields.
pub fn parse_slice_header_type(nalu: &[u8]) -> Result<SliceType> {
    if nalu.len() <= 1 {
        return Err(StreamerError::Codec("packet too short to parse slice header".into()));
    }

    let typ = nalu[0] & 0x1f;
    match typ {
        1 | 2 | 5 | 19 => {}
        _ => {
            return Err(StreamerError::Codec(format!(
                "nal_unit_type={typ} has no slice header"
            )));
        }
    }

    let rbsp = remove_emulation_bytes(&nalu[1..]);
    let mut r = BitReader::new(&rbsp);

    r.read_golomb()?; // first_mb_in_slice
    let slice_type = r.read_golomb()?;

    match slice_type {
        0 | 3 | 5 | 8 => Ok(SliceType::P),
        1 | 6 => Ok(SliceType::B),
        2 | 4 | 7 | 9 => Ok(SliceType::I),
        other => Err(StreamerError::Codec(format!("slice_type={other} invalid"))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::add_emulation_bytes;
    use crate::utils::bits::test_utils::BitWriter;

    /// Encodes a baseline-profile SPS with the given geometry, with
    /// emulation prevention applied.
    pub(crate) fn make_sps(
        width_mbs: u32,
        height_map_units: u32,
        timing: Option<(u32, u32, bool)>,
    ) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(8, 0x67); // nalu header: SPS
        w.put_bits(8, 66); // profile_idc (baseline)
        w.put_bits(8, 0xc0); // constraint flags + reserved
        w.put_bits(8, 30); // level_idc
        w.put_golomb(0); // seq_parameter_set_id
        w.put_golomb(0); // log2_max_frame_num_minus4
        w.put_golomb(2); // pic_order_cnt_type
        w.put_golomb(1); // max_num_ref_frames
        w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
        w.put_golomb(width_mbs - 1); // pic_width_in_mbs_minus1
        w.put_golomb(height_map_units - 1); // pic_height_in_map_units_minus1
        w.put_bit(true); // frame_mbs_only_flag
        w.put_bit(false); // direct_8x8_inference_flag
        w.put_bit(false); // frame_cropping_flag
        match timing {
            None => w.put_bit(false), // vui_parameters_present_flag
            Some((num_units, time_scale, fixed)) => {
                w.put_bit(true); // vui present
                w.put_bit(false); // aspect_ratio_info_present_flag
                w.put_bit(false); // overscan_info_present_flag
                w.put_bit(false); // video_signal_type_present_flag
                w.put_bit(false); // chroma_loc_info_present_flag
                w.put_bit(true); // timing_info_present_flag
                w.put_bits(32, num_units);
                w.put_bits(32, time_scale);
                w.put_bit(fixed);
            }
        }
        add_emulation_bytes(&w.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_sps;
    use super::*;
    use crate::utils::bits::test_utils::BitWriter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_sps_geometry_and_fps() {
        // 640x360: 40x23 macroblocks minus 4 lines of bottom crop
        let mut w = BitWriter::new();
        w.put_bits(8, 0x67);
        w.put_bits(8, 66);
        w.put_bits(8, 0xc0);
        w.put_bits(8, 30);
        w.put_golomb(0);
        w.put_golomb(0);
        w.put_golomb(2);
        w.put_golomb(1);
        w.put_bit(false);
        w.put_golomb(39); // 40 mbs wide
        w.put_golomb(22); // 23 map units high
        w.put_bit(true); // frame_mbs_only
        w.put_bit(false);
        w.put_bit(true); // frame_cropping_flag
        w.put_golomb(0); // left
        w.put_golomb(0); // right
        w.put_golomb(0); // top
        w.put_golomb(4); // bottom: 368 - 8 = 360
        w.put_bit(true); // vui present
        w.put_bit(false);
        w.put_bit(false);
        w.put_bit(false);
        w.put_bit(false);
        w.put_bit(true); // timing info
        w.put_bits(32, 1);
        w.put_bits(32, 60);
        w.put_bit(true); // fixed frame rate: fps = 60 / 1 / 2
        let sps = w.finish();

        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 360);
        assert_eq!(info.fps, 30);
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.level_idc, 30);
    }

    #[test]
    fn test_parse_sps_no_vui() {
        let sps = make_sps(8, 6, None);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 128);
        assert_eq!(info.height, 96);
        assert_eq!(info.fps, 0);
    }

    #[test]
    fn test_split_nalus_annexb() {
        let data: Vec<u8> = [
            &[0, 0, 0, 1, 0x67, 1, 2][..],
            &[0, 0, 1, 0x68, 3, 4][..],
            &[0, 0, 0, 1, 0x65, 5, 6][..],
        ]
        .concat();
        let (nalus, kind) = split_nalus(&data);
        assert_eq!(kind, NaluKind::AnnexB);
        assert_eq!(nalus, vec![&[0x67, 1, 2][..], &[0x68, 3, 4][..], &[0x65, 5, 6][..]]);
    }

    #[test]
    fn test_split_nalus_avcc() {
        let data: Vec<u8> = [
            &[0, 0, 0, 3, 0x67, 1, 2][..],
            &[0, 0, 0, 2, 0x68, 3][..],
        ]
        .concat();
        let (nalus, kind) = split_nalus(&data);
        assert_eq!(kind, NaluKind::Avcc);
        assert_eq!(nalus, vec![&[0x67, 1, 2][..], &[0x68, 3][..]]);
    }

    #[test]
    fn test_split_nalus_raw() {
        let data = [0x65, 0x88, 0x80, 0x10, 0x20];
        let (nalus, kind) = split_nalus(&data);
        assert_eq!(kind, NaluKind::Raw);
        assert_eq!(nalus, vec![&data[..]]);
    }

    #[test]
    fn test_emulation_prevention() {
        assert_eq!(
            remove_emulation_bytes(&[0x00, 0x00, 0x03, 0x01, 0xab]),
            vec![0x00, 0x00, 0x01, 0xab]
        );
        assert_eq!(remove_emulation_bytes(&[1, 2, 3]), vec![1, 2, 3]);

        let raw = [0x00, 0x00, 0x00, 0x01, 0x40, 0x00, 0x00, 0x02];
        let protected = add_emulation_bytes(&raw);
        assert_eq!(protected, vec![0x00, 0x00, 0x03, 0x00, 0x01, 0x40, 0x00, 0x00, 0x03, 0x02]);
        assert_eq!(remove_emulation_bytes(&protected), raw.to_vec());
    }

    #[test]
    fn test_slice_header_type() {
        // IDR slice, first_mb_in_slice=0, slice_type=7 (I)
        let mut w = BitWriter::new();
        w.put_golomb(0);
        w.put_golomb(7);
        let mut nalu = vec![0x65];
        nalu.extend(w.finish());
        assert_eq!(parse_slice_header_type(&nalu).unwrap(), SliceType::I);

        // non-IDR, slice_type=0 (P)
        let mut w = BitWriter::new();
        w.put_golomb(0);
        w.put_golomb(0);
        let mut nalu = vec![0x41];
        nalu.extend(w.finish());
        assert_eq!(parse_slice_header_type(&nalu).unwrap(), SliceType::P);

        // SPS has no slice header
        assert!(parse_slice_header_type(&[0x67, 0x42]).is_err());
    }

    #[test]
    fn test_sei_timestamp() {
        let mut data = vec![0x06, 242, 8];
        data.extend_from_slice(&1234567u64.to_be_bytes());
        let sei = parse_sei(&data).unwrap();
        assert_eq!(sei.payload_type, 242);
        assert_eq!(sei.ts, 1234567);
    }
}
