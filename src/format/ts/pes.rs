//! PES packet header codec.

use super::types::{pts_to_time, time_to_pts};
use crate::error::{Result, StreamerError};
use bytes::{BufMut, BytesMut};
use std::time::Duration;

/// Largest PES header this crate emits (start code through PTS+DTS).
pub const MAX_PES_HEADER_LENGTH: usize = 19;

fn put_pes_ts(buf: &mut BytesMut, flag: u8, ts: u64) {
    buf.put_u8(flag << 4 | ((ts >> 30) as u8 & 0x07) << 1 | 1);
    buf.put_u16(((ts >> 15) as u16 & 0x7fff) << 1 | 1);
    buf.put_u16((ts as u16 & 0x7fff) << 1 | 1);
}

fn get_pes_ts(b: &[u8]) -> u64 {
    let hi = ((b[0] >> 1) & 0x07) as u64;
    let mid = (u16::from_be_bytes([b[1], b[2]]) >> 1) as u64;
    let lo = (u16::from_be_bytes([b[3], b[4]]) >> 1) as u64;
    hi << 30 | mid << 15 | lo
}

/// Builds a PES header for `stream_id`.
///
/// `data_len` is the elementary payload length; pass `None` for video
/// (unbounded PES, packet_length 0). A DTS is written only when it
/// differs from the PTS.
pub fn fill_pes_header(stream_id: u8, data_len: Option<usize>, pts: Duration, dts: Option<Duration>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MAX_PES_HEADER_LENGTH);
    buf.put_slice(&[0x00, 0x00, 0x01, stream_id]);

    let write_dts = dts.is_some() && dts != Some(pts);
    let header_data_len: usize = if write_dts { 10 } else { 5 };

    let packet_length = match data_len {
        Some(len) => 3 + header_data_len + len,
        None => 0,
    };
    buf.put_u16(packet_length as u16);

    buf.put_u8(0x80); // marker bits, no scrambling
    buf.put_u8(if write_dts { 0xc0 } else { 0x80 });
    buf.put_u8(header_data_len as u8);

    if write_dts {
        put_pes_ts(&mut buf, 0x3, time_to_pts(pts));
        put_pes_ts(&mut buf, 0x1, time_to_pts(dts.unwrap()));
    } else {
        put_pes_ts(&mut buf, 0x2, time_to_pts(pts));
    }

    buf
}

/// Parses a PES header, returning (header length, stream id, payload
/// length or 0 when unbounded, pts, dts). A missing DTS mirrors the PTS.
pub fn parse_pes_header(b: &[u8]) -> Result<(usize, u8, usize, Duration, Duration)> {
    if b.len() < 9 {
        return Err(StreamerError::Parser("PES header truncated".into()));
    }
    if b[0] != 0 || b[1] != 0 || b[2] != 1 {
        return Err(StreamerError::Parser("PES start code missing".into()));
    }

    let stream_id = b[3];
    let packet_length = u16::from_be_bytes([b[4], b[5]]) as usize;
    let flags = b[7];
    let header_data_len = b[8] as usize;
    let header_length = 9 + header_data_len;
    if b.len() < header_length {
        return Err(StreamerError::Parser("PES header data truncated".into()));
    }

    let mut pts = Duration::ZERO;
    let mut dts = Duration::ZERO;
    match flags >> 6 {
        0x2 => {
            if header_data_len < 5 {
                return Err(StreamerError::Parser("PES PTS field truncated".into()));
            }
            pts = pts_to_time(get_pes_ts(&b[9..]));
            dts = pts;
        }
        0x3 => {
            if header_data_len < 10 {
                return Err(StreamerError::Parser("PES PTS/DTS fields truncated".into()));
            }
            pts = pts_to_time(get_pes_ts(&b[9..]));
            dts = pts_to_time(get_pes_ts(&b[14..]));
        }
        _ => {}
    }

    let data_len = if packet_length == 0 {
        0
    } else {
        packet_length.saturating_sub(3 + header_data_len)
    };

    Ok((header_length, stream_id, data_len, pts, dts))
}

#[cfg(test)]
mod tests {
    use super::super::types::{STREAM_ID_AAC, STREAM_ID_H264};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn audio_header_round_trip() {
        let pts = Duration::from_millis(1234);
        let hdr = fill_pes_header(STREAM_ID_AAC, Some(312), pts, None);

        let (hdrlen, stream_id, datalen, got_pts, got_dts) = parse_pes_header(&hdr).unwrap();
        assert_eq!(hdrlen, hdr.len());
        assert_eq!(stream_id, STREAM_ID_AAC);
        assert_eq!(datalen, 312);
        assert_eq!(got_pts, pts);
        assert_eq!(got_dts, pts);
    }

    #[test]
    fn video_header_with_dts() {
        let pts = Duration::from_millis(1040);
        let dts = Duration::from_millis(1000);
        let hdr = fill_pes_header(STREAM_ID_H264, None, pts, Some(dts));

        let (hdrlen, stream_id, datalen, got_pts, got_dts) = parse_pes_header(&hdr).unwrap();
        assert_eq!(hdrlen, 19);
        assert_eq!(stream_id, STREAM_ID_H264);
        assert_eq!(datalen, 0); // unbounded
        assert_eq!(got_pts, pts);
        assert_eq!(got_dts, dts);
    }

    #[test]
    fn malformed_start_code() {
        assert!(parse_pes_header(&[0, 0, 2, 0xe0, 0, 0, 0x80, 0x80, 5]).is_err());
    }
}
