use crate::error::{Result, StreamerError};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of a transport stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;
/// Fixed TS header size in bytes.
pub const TS_HEADER_SIZE: usize = 4;

/// PID carrying the program association table.
pub const PID_PAT: u16 = 0x0000;
/// PID carrying the program map table.
pub const PID_PMT: u16 = 0x1000;

/// Table ID of the PAT.
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID of the PMT.
pub const TABLE_ID_PMT: u8 = 0x02;
/// Table extension used for both tables.
pub const TABLE_EXT: u16 = 1;

/// Elementary stream type for H.264 video.
pub const STREAM_TYPE_H264: u8 = 0x1b;
/// Elementary stream type for ADTS AAC audio.
pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0f;

/// PES stream ID for video.
pub const STREAM_ID_H264: u8 = 0xe0;
/// PES stream ID for audio.
pub const STREAM_ID_AAC: u8 = 0xc0;

/// Bytes of PSI framing before the section body (pointer + table header).
pub const PSI_HEADER_LENGTH: usize = 9;

/// Clock frequency of PTS/DTS values.
pub const PTS_HZ: u64 = 90_000;
/// Clock frequency of the program clock reference.
pub const PCR_HZ: u64 = 27_000_000;

/// Converts a duration to a 90 kHz PTS value.
pub fn time_to_pts(t: Duration) -> u64 {
    t.as_nanos() as u64 * PTS_HZ / 1_000_000_000
}

/// Converts a 90 kHz PTS value to a duration.
pub fn pts_to_time(pts: u64) -> Duration {
    Duration::from_nanos(pts * 1_000_000_000 / PTS_HZ)
}

/// Converts a duration to a 42-bit PCR value (33-bit base, 9-bit
/// extension).
pub fn time_to_pcr(t: Duration) -> u64 {
    let ts = t.as_nanos() as u64 * PCR_HZ / 1_000_000_000;
    let base = ts / 300;
    let ext = ts % 300;
    base << 15 | 0x3f << 9 | ext
}

/// One PAT entry mapping a program number to its PMT PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub program_map_pid: u16,
}

/// Program association table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pat {
    pub entries: Vec<PatEntry>,
}

impl Pat {
    pub fn len(&self) -> usize {
        self.entries.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        for entry in &self.entries {
            buf.put_u16(entry.program_number);
            buf.put_u16(entry.program_map_pid & 0x1fff | 7 << 13);
        }
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() % 4 != 0 {
            return Err(StreamerError::Parser("PAT body length not a multiple of 4".into()));
        }
        let mut pat = Pat::default();
        for chunk in b.chunks_exact(4) {
            pat.entries.push(PatEntry {
                program_number: u16::from_be_bytes([chunk[0], chunk[1]]),
                program_map_pid: u16::from_be_bytes([chunk[2], chunk[3]]) & 0x1fff,
            });
        }
        Ok(pat)
    }
}

/// One elementary stream description inside a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
}

/// Program map table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pmt {
    pub pcr_pid: u16,
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

impl Pmt {
    pub fn len(&self) -> usize {
        4 + self.elementary_stream_infos.len() * 5
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16(self.pcr_pid & 0x1fff | 7 << 13);
        buf.put_u16(0xf << 12); // program_info_length = 0
        for info in &self.elementary_stream_infos {
            buf.put_u8(info.stream_type);
            buf.put_u16(info.elementary_pid & 0x1fff | 7 << 13);
            buf.put_u16(0xf << 12); // ES_info_length = 0
        }
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(StreamerError::Parser("PMT body too short".into()));
        }
        let mut pmt = Pmt {
            pcr_pid: u16::from_be_bytes([b[0], b[1]]) & 0x1fff,
            ..Default::default()
        };
        let prog_info_len = (u16::from_be_bytes([b[2], b[3]]) & 0x3ff) as usize;
        let mut n = 4 + prog_info_len;
        while n + 5 <= b.len() {
            let stream_type = b[n];
            let elementary_pid = u16::from_be_bytes([b[n + 1], b[n + 2]]) & 0x1fff;
            let es_info_len = (u16::from_be_bytes([b[n + 3], b[n + 4]]) & 0x3ff) as usize;
            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
            });
            n += 5 + es_info_len;
        }
        Ok(pmt)
    }
}

/// Wraps a marshalled table body into a PSI section: pointer field,
/// table header, body, CRC32. Returns the full section bytes.
pub fn fill_psi(table_id: u8, table_ext: u16, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(PSI_HEADER_LENGTH + body.len() + 4);
    out.put_u8(0); // pointer field
    out.put_u8(table_id);
    // section_syntax_indicator=1, reserved bits set
    let section_length = 5 + body.len() + 4;
    out.put_u16(0xb << 12 | section_length as u16);
    out.put_u16(table_ext);
    out.put_u8(0xc1); // version 0, current_next 1
    out.put_u8(0); // section number
    out.put_u8(0); // last section number
    out.put_slice(body);
    let crc = Crc32Mpeg2::new().calculate(&out[1..]);
    out.put_u32(crc);
    out
}

/// Parses a PSI section, returning (table id, table ext, body).
pub fn parse_psi(b: &[u8]) -> Result<(u8, u16, &[u8])> {
    if b.len() < PSI_HEADER_LENGTH {
        return Err(StreamerError::Parser("PSI section truncated".into()));
    }
    let pointer = b[0] as usize;
    let b = &b[1 + pointer..];
    if b.len() < 8 {
        return Err(StreamerError::Parser("PSI section truncated".into()));
    }
    let table_id = b[0];
    let section_length = (u16::from_be_bytes([b[1], b[2]]) & 0x3ff) as usize;
    if section_length < 9 || b.len() < 3 + section_length {
        return Err(StreamerError::Parser("PSI section length invalid".into()));
    }
    let table_ext = u16::from_be_bytes([b[3], b[4]]);
    let body = &b[8..3 + section_length - 4];
    Ok((table_id, table_ext, body))
}

/// Parsed fixed TS header.
#[derive(Debug, Clone, Copy)]
pub struct TsHeader {
    pub pid: u16,
    pub payload_unit_start: bool,
    /// Random-access indicator from the adaptation field.
    pub is_keyframe: bool,
    pub continuity_counter: u8,
    /// Offset of the payload within the 188-byte packet.
    pub header_length: usize,
}

/// Parses the 4-byte TS header plus any adaptation field.
pub fn parse_ts_header(b: &[u8]) -> Result<TsHeader> {
    if b.len() != TS_PACKET_SIZE {
        return Err(StreamerError::Parser(format!("TS packet size {} != 188", b.len())));
    }
    if b[0] != 0x47 {
        return Err(StreamerError::Parser("TS sync byte missing".into()));
    }

    let mut hdr = TsHeader {
        pid: u16::from_be_bytes([b[1], b[2]]) & 0x1fff,
        payload_unit_start: b[1] & 0x40 != 0,
        is_keyframe: false,
        continuity_counter: b[3] & 0x0f,
        header_length: TS_HEADER_SIZE,
    };

    let afc = (b[3] >> 4) & 0x3;
    if afc & 0x2 != 0 {
        let aflen = b[4] as usize;
        if TS_HEADER_SIZE + 1 + aflen > TS_PACKET_SIZE {
            return Err(StreamerError::Parser("adaptation field overruns packet".into()));
        }
        if aflen > 0 {
            hdr.is_keyframe = b[5] & 0x40 != 0;
        }
        hdr.header_length += 1 + aflen;
    }
    Ok(hdr)
}

/// Writes the payload of one PID as a run of 188-byte packets,
/// maintaining the continuity counter. `pcr` is written (with the
/// random-access indicator) on the first packet when `is_keyframe` is
/// set; short tails are stuffed through the adaptation field, or with
/// 0xff payload bytes when `pad_data` is set (PSI sections).
pub struct TsWriter {
    pub pid: u16,
    pub continuity_counter: u8,
}

impl TsWriter {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            continuity_counter: 0,
        }
    }

    pub async fn write_packets<W: AsyncWrite + Unpin + Send>(
        &mut self,
        w: &mut W,
        datav: &[&[u8]],
        pcr: Duration,
        is_keyframe: bool,
        pad_data: bool,
    ) -> Result<()> {
        let payload: Vec<u8> = datav.concat();
        let mut off = 0;
        let mut first = true;

        loop {
            let remaining = payload.len() - off;
            if remaining == 0 && !first {
                break;
            }

            let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
            pkt.put_u8(0x47);
            let mut b1 = ((self.pid >> 8) & 0x1f) as u8;
            if first {
                b1 |= 0x40;
            }
            pkt.put_u8(b1);
            pkt.put_u8(self.pid as u8);

            let with_pcr = first && is_keyframe;
            let mut space = TS_PACKET_SIZE - TS_HEADER_SIZE;
            let af_body_len = if with_pcr { 7 } else { 0 };
            let mut needs_af = with_pcr;
            let af_overhead = if needs_af { 1 + af_body_len } else { 0 };
            if !pad_data && remaining < space - af_overhead {
                needs_af = true;
            }

            let mut b3 = 0x10 | (self.continuity_counter & 0x0f);
            if needs_af {
                b3 |= 0x20;
            }
            pkt.put_u8(b3);
            self.continuity_counter = (self.continuity_counter + 1) & 0x0f;

            if needs_af {
                space -= 1; // length byte
                let mut aflen = af_body_len;
                if remaining < space - aflen {
                    aflen = space - remaining;
                }
                pkt.put_u8(aflen as u8);
                if aflen > 0 {
                    let flags = if with_pcr { 0x50 } else { 0x00 };
                    pkt.put_u8(flags);
                    let mut used = 1;
                    if with_pcr {
                        let v = time_to_pcr(pcr);
                        pkt.put_u8((v >> 40) as u8);
                        pkt.put_u8((v >> 32) as u8);
                        pkt.put_u8((v >> 24) as u8);
                        pkt.put_u8((v >> 16) as u8);
                        pkt.put_u8((v >> 8) as u8);
                        pkt.put_u8(v as u8);
                        used += 6;
                    }
                    for _ in used..aflen {
                        pkt.put_u8(0xff);
                    }
                }
                space -= aflen;
            }

            let take = remaining.min(space);
            pkt.put_slice(&payload[off..off + take]);
            off += take;

            // PSI sections pad the payload itself
            while pkt.len() < TS_PACKET_SIZE {
                pkt.put_u8(0xff);
            }

            w.write_all(&pkt).await?;
            first = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pat_round_trip() {
        let pat = Pat {
            entries: vec![PatEntry {
                program_number: 1,
                program_map_pid: PID_PMT,
            }],
        };
        let mut buf = BytesMut::new();
        pat.marshal(&mut buf);
        assert_eq!(buf.len(), pat.len());
        assert_eq!(Pat::unmarshal(&buf).unwrap(), pat);
    }

    #[test]
    fn pmt_round_trip() {
        let pmt = Pmt {
            pcr_pid: 0x100,
            elementary_stream_infos: vec![
                ElementaryStreamInfo {
                    stream_type: STREAM_TYPE_H264,
                    elementary_pid: 0x100,
                },
                ElementaryStreamInfo {
                    stream_type: STREAM_TYPE_AAC_ADTS,
                    elementary_pid: 0x101,
                },
            ],
        };
        let mut buf = BytesMut::new();
        pmt.marshal(&mut buf);
        assert_eq!(buf.len(), pmt.len());
        assert_eq!(Pmt::unmarshal(&buf).unwrap(), pmt);
    }

    #[test]
    fn psi_round_trip() {
        let pat = Pat {
            entries: vec![PatEntry {
                program_number: 1,
                program_map_pid: PID_PMT,
            }],
        };
        let mut body = BytesMut::new();
        pat.marshal(&mut body);
        let section = fill_psi(TABLE_ID_PAT, TABLE_EXT, &body);

        let (table_id, table_ext, parsed_body) = parse_psi(&section).unwrap();
        assert_eq!(table_id, TABLE_ID_PAT);
        assert_eq!(table_ext, TABLE_EXT);
        assert_eq!(parsed_body, &body[..]);
    }

    #[tokio::test]
    async fn ts_writer_packetizes_and_counts() {
        let mut tsw = TsWriter::new(0x100);
        let payload = vec![0xabu8; 400];
        let mut out = Vec::new();
        tsw.write_packets(&mut out, &[&payload], Duration::ZERO, false, false)
            .await
            .unwrap();

        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        let n = out.len() / TS_PACKET_SIZE;
        assert_eq!(n, 3); // 184 + 184 + 32

        let mut collected = Vec::new();
        for (i, chunk) in out.chunks_exact(TS_PACKET_SIZE).enumerate() {
            let hdr = parse_ts_header(chunk).unwrap();
            assert_eq!(hdr.pid, 0x100);
            assert_eq!(hdr.payload_unit_start, i == 0);
            assert_eq!(hdr.continuity_counter, i as u8);
            collected.extend_from_slice(&chunk[hdr.header_length..]);
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn keyframe_packet_carries_pcr() {
        let mut tsw = TsWriter::new(0x100);
        let payload = vec![1u8; 100];
        let mut out = Vec::new();
        tsw.write_packets(&mut out, &[&payload], Duration::from_secs(1), true, false)
            .await
            .unwrap();

        let hdr = parse_ts_header(&out[..TS_PACKET_SIZE]).unwrap();
        assert!(hdr.is_keyframe);
        // adaptation flags: RAI + PCR
        assert_eq!(out[5] & 0x50, 0x50);
    }
}
