//! TS demuxer: PID reassembly between payload-unit boundaries and
//! per-stream elementary processing.

use super::pes;
use super::types::*;
use crate::av::{self, CodecData, DataType, Packet};
use crate::codec::aac::{self, AacCodecData, Mpeg4AudioConfig};
use crate::codec::h264::{self, H264CodecData};
use crate::error::{Result, StreamerError};
use crate::format::flv::codec_data_to_tag;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

struct DemuxStream {
    idx: usize,
    pid: u16,
    stream_type: u8,
    codec: Option<CodecData>,

    is_keyframe: bool,
    pts: Duration,
    dts: Duration,
    data: Option<Vec<u8>>,
    data_len: usize,

    config: Option<Mpeg4AudioConfig>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl DemuxStream {
    fn new(idx: usize, pid: u16, stream_type: u8) -> Self {
        Self {
            idx,
            pid,
            stream_type,
            codec: None,
            is_keyframe: false,
            pts: Duration::ZERO,
            dts: Duration::ZERO,
            data: None,
            data_len: 0,
            config: None,
            sps: None,
            pps: None,
        }
    }

    fn handle_ts_packet(&mut self, start: bool, is_keyframe: bool, payload: &[u8], out: &mut VecDeque<Packet>) -> Result<()> {
        if start {
            self.payload_end(out)?;
            let (hdrlen, _, data_len, pts, dts) = pes::parse_pes_header(payload)?;
            self.pts = pts;
            self.dts = dts;
            self.data_len = data_len;
            self.is_keyframe = is_keyframe;
            let mut buf = Vec::with_capacity(if data_len == 0 { 4096 } else { data_len });
            buf.extend_from_slice(&payload[hdrlen..]);
            self.data = Some(buf);
        } else if let Some(data) = &mut self.data {
            data.extend_from_slice(payload);
        }
        Ok(())
    }

    /// Flushes the accumulated elementary payload, emitting one packet
    /// per ADTS frame or data NALU. Returns the number emitted.
    fn payload_end(&mut self, out: &mut VecDeque<Packet>) -> Result<usize> {
        let payload = match self.data.take() {
            Some(p) => p,
            None => return Ok(0),
        };
        if self.data_len != 0 && payload.len() != self.data_len {
            return Err(StreamerError::Parser(format!(
                "PES payload size mismatch: got {}, expected {}",
                payload.len(),
                self.data_len
            )));
        }

        match self.stream_type {
            STREAM_TYPE_AAC_ADTS => self.flush_aac(&payload, out),
            STREAM_TYPE_H264 => self.flush_h264(&payload, out),
            _ => Ok(0),
        }
    }

    fn flush_aac(&mut self, mut payload: &[u8], out: &mut VecDeque<Packet>) -> Result<usize> {
        let mut n = 0;
        let mut delta = Duration::ZERO;
        let mut header_changed = false;

        while !payload.is_empty() {
            let (config, hdrlen, framelen, samples) = aac::parse_adts_header(payload)?;
            if framelen > payload.len() {
                return Err(StreamerError::Parser("ADTS frame overruns PES payload".into()));
            }

            match self.config {
                None => {
                    self.config = Some(config);
                    self.update_aac_codec()?;
                }
                Some(cur) if cur != config => {
                    header_changed = true;
                    self.config = Some(config);
                    self.update_aac_codec()?;
                }
                _ => {}
            }

            let dts = if self.dts == Duration::ZERO { self.pts } else { self.dts };
            let mut pkt = Packet::new(Bytes::copy_from_slice(&payload[hdrlen..framelen]))
                .with_idx(self.idx)
                .with_data_type(DataType::Audio)
                .with_avc_packet_type(crate::format::flv::tag::AAC_RAW)
                .with_time(dts + delta);
            pkt.header_changed = header_changed;
            header_changed = false;
            out.push_back(pkt);
            n += 1;

            delta += Duration::from_nanos(samples as u64 * 1_000_000_000 / config.sample_rate as u64);
            payload = &payload[framelen..];
        }
        Ok(n)
    }

    fn flush_h264(&mut self, payload: &[u8], out: &mut VecDeque<Packet>) -> Result<usize> {
        let (nalus, _) = h264::split_nalus(payload);
        let mut n = 0;
        let mut sps_seen: Option<&[u8]> = None;
        let mut pps_seen: Option<&[u8]> = None;
        let mut sps_changed = false;
        let mut pps_changed = false;
        let mut header_changed = false;

        for nalu in nalus {
            if nalu.is_empty() {
                continue;
            }
            match h264::nalu_type(nalu) {
                h264::NALU_SPS => {
                    sps_seen = Some(nalu);
                    if let Some(cur) = &self.sps {
                        if cur.as_ref() != nalu {
                            sps_changed = true;
                            self.sps = Some(Bytes::copy_from_slice(nalu));
                        }
                    }
                }
                h264::NALU_PPS => {
                    pps_seen = Some(nalu);
                    if let Some(cur) = &self.pps {
                        if cur.as_ref() != nalu {
                            pps_changed = true;
                            self.pps = Some(Bytes::copy_from_slice(nalu));
                        }
                    }
                }
                _ if h264::is_data_nalu(nalu) => {
                    // re-wrap into a 4-byte AVCC length prefix
                    let mut b = BytesMut::with_capacity(4 + nalu.len());
                    b.put_u32(nalu.len() as u32);
                    b.put_slice(nalu);

                    if sps_changed && pps_changed {
                        header_changed = true;
                        self.update_avc_codec()?;
                        sps_changed = false;
                        pps_changed = false;
                    } else if sps_changed || pps_changed {
                        // a lone parameter-set change is absorbed; the
                        // codec record is only rebuilt when both moved
                        tracing::warn!("SPS and PPS did not change together");
                        sps_changed = false;
                        pps_changed = false;
                    }

                    let dts = if self.dts == Duration::ZERO { self.pts } else { self.dts };
                    let mut pkt = Packet::new(b.freeze())
                        .with_idx(self.idx)
                        .with_data_type(DataType::Video)
                        .with_avc_packet_type(crate::format::flv::tag::AVC_NALU)
                        .with_time(dts)
                        .with_key_flag(h264::nalu_type(nalu) == h264::NALU_IDR);
                    if self.pts != dts {
                        pkt.composition_time = self.pts - dts;
                    }
                    pkt.header_changed = header_changed;
                    header_changed = false;
                    out.push_back(pkt);
                    n += 1;
                }
                _ => {}
            }
        }

        if self.codec.is_none() {
            if let (Some(sps), Some(pps)) = (sps_seen, pps_seen) {
                self.sps = Some(Bytes::copy_from_slice(sps));
                self.pps = Some(Bytes::copy_from_slice(pps));
                self.update_avc_codec()?;
            }
        }

        Ok(n)
    }

    fn update_aac_codec(&mut self) -> Result<()> {
        let config = self.config.expect("config set before update");
        let codec = AacCodecData::from_config(config);
        let data = CodecData::AAC(codec);
        let tag = codec_data_to_tag(&data)?;
        if let CodecData::AAC(c) = data {
            self.codec = Some(CodecData::AAC(c.with_seq_header_tag(tag)));
        }
        Ok(())
    }

    fn update_avc_codec(&mut self) -> Result<()> {
        let (sps, pps) = match (&self.sps, &self.pps) {
            (Some(s), Some(p)) => (s.clone(), p.clone()),
            _ => return Err(StreamerError::Parser("SPS/PPS missing for codec rebuild".into())),
        };
        let codec = H264CodecData::from_sps_and_pps(sps, pps)?;
        let data = CodecData::H264(codec);
        let tag = codec_data_to_tag(&data)?;
        if let CodecData::H264(c) = data {
            self.codec = Some(CodecData::H264(c.with_seq_header_tag(tag)));
        }
        Ok(())
    }
}

/// Demuxes a single-program transport stream.
pub struct Demuxer<R: AsyncRead + Unpin + Send> {
    r: BufReader<R>,
    pkts: VecDeque<Packet>,
    pat: Option<Pat>,
    pmt: Option<Pmt>,
    streams: Vec<DemuxStream>,
    probed: bool,
}

impl<R: AsyncRead + Unpin + Send> Demuxer<R> {
    pub fn new(r: R) -> Self {
        Self {
            r: BufReader::new(r),
            pkts: VecDeque::new(),
            pat: None,
            pmt: None,
            streams: Vec::new(),
            probed: false,
        }
    }

    async fn probe(&mut self) -> Result<()> {
        if self.probed {
            return Ok(());
        }
        loop {
            if self.pmt.is_some() && !self.streams.is_empty() && self.streams.iter().all(|s| s.codec.is_some()) {
                break;
            }
            self.poll().await?;
        }
        self.probed = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<()> {
        match self.read_ts_packet().await {
            Ok(()) => Ok(()),
            Err(StreamerError::EndOfStream) => {
                let mut n = 0;
                for stream in &mut self.streams {
                    n += stream.payload_end(&mut self.pkts)?;
                }
                if n == 0 {
                    Err(StreamerError::EndOfStream)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_ts_packet(&mut self) -> Result<()> {
        let mut buf = [0u8; TS_PACKET_SIZE];
        if let Err(e) = self.r.read_exact(&mut buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(StreamerError::EndOfStream);
            }
            return Err(e.into());
        }

        let hdr = parse_ts_header(&buf)?;
        let payload = &buf[hdr.header_length..];

        if self.pat.is_none() {
            if hdr.pid == PID_PAT {
                let (_, _, body) = parse_psi(payload)?;
                self.pat = Some(Pat::unmarshal(body)?);
            }
            return Ok(());
        }

        if self.pmt.is_none() {
            let is_pmt = self
                .pat
                .as_ref()
                .map(|p| p.entries.iter().any(|e| e.program_number != 0 && e.program_map_pid == hdr.pid))
                .unwrap_or(false);
            if is_pmt {
                let (_, _, body) = parse_psi(payload)?;
                let pmt = Pmt::unmarshal(body)?;
                self.init_streams(&pmt);
                self.pmt = Some(pmt);
            }
            return Ok(());
        }

        if let Some(stream) = self.streams.iter_mut().find(|s| s.pid == hdr.pid) {
            stream.handle_ts_packet(hdr.payload_unit_start, hdr.is_keyframe, payload, &mut self.pkts)?;
        }
        Ok(())
    }

    fn init_streams(&mut self, pmt: &Pmt) {
        self.streams.clear();
        for info in &pmt.elementary_stream_infos {
            match info.stream_type {
                STREAM_TYPE_H264 | STREAM_TYPE_AAC_ADTS => {
                    let idx = self.streams.len();
                    self.streams.push(DemuxStream::new(idx, info.elementary_pid, info.stream_type));
                }
                other => {
                    tracing::debug!(stream_type = other, "skipping unsupported elementary stream");
                }
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> av::Demuxer for Demuxer<R> {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        self.probe().await?;
        Ok(self
            .streams
            .iter()
            .filter_map(|s| s.codec.clone())
            .collect())
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        self.probe().await?;
        while self.pkts.is_empty() {
            self.poll().await?;
        }
        Ok(self.pkts.pop_front().expect("non-empty queue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{Demuxer as _, Muxer as _};
    use crate::format::ts;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn h264_stream() -> CodecData {
        let sps = crate::codec::h264::parser::test_support::make_sps(40, 23, Some((1, 60, true)));
        let pps = vec![0x68, 0xce, 0x3c, 0x80];
        CodecData::H264(H264CodecData::from_sps_and_pps(sps, pps).unwrap())
    }

    fn avcc(nalu: &[u8]) -> Vec<u8> {
        let mut b = (nalu.len() as u32).to_be_bytes().to_vec();
        b.extend_from_slice(nalu);
        b
    }

    #[tokio::test]
    async fn mux_demux_idr_and_p_frames() {
        let streams = vec![h264_stream()];

        let mut out = Vec::new();
        {
            let mut muxer = ts::Muxer::new(Cursor::new(&mut out));
            muxer.write_header(&streams).await.unwrap();

            for i in 0..30u64 {
                let nalu = if i == 0 {
                    vec![0x65, 0x88, 0x84, i as u8]
                } else {
                    vec![0x41, 0x9a, 0x22, i as u8]
                };
                let pkt = Packet::new(avcc(&nalu))
                    .with_idx(0)
                    .with_data_type(DataType::Video)
                    .with_key_flag(i == 0)
                    .with_time(Duration::from_millis(i * 40));
                muxer.write_packet(pkt).await.unwrap();
            }
            muxer.write_trailer().await.unwrap();
        }

        let mut demuxer = Demuxer::new(Cursor::new(out));
        let probed = demuxer.streams().await.unwrap();
        assert_eq!(probed.len(), 1);
        // the keyframe AU carried SPS+PPS in-band, so the demuxer
        // rebuilt an equal configuration record
        assert_eq!(
            probed[0].sequence_header_bytes(),
            streams[0].sequence_header_bytes()
        );
        assert_eq!(probed[0].width(), 640);
        assert_eq!(probed[0].height(), 360);

        let mut count = 0;
        let mut keys = 0;
        loop {
            match demuxer.read_packet().await {
                Ok(pkt) => {
                    assert!(pkt.is_video());
                    if pkt.is_key_frame {
                        keys += 1;
                    }
                    count += 1;
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("demux failed: {e}"),
            }
        }
        assert_eq!(count, 30);
        assert_eq!(keys, 1);
    }

    #[tokio::test]
    async fn aac_frames_get_sequential_times() {
        let config = Mpeg4AudioConfig {
            object_type: 2,
            sample_rate_index: 4,
            sample_rate: 44100,
            channel_config: 2,
        };
        let streams = vec![CodecData::AAC(AacCodecData::from_config(config))];

        let mut out = Vec::new();
        {
            let mut muxer = ts::Muxer::new(Cursor::new(&mut out));
            muxer.write_header(&streams).await.unwrap();
            for i in 0..5u64 {
                let pkt = Packet::new(vec![0x21, 0x10, i as u8])
                    .with_idx(0)
                    .with_data_type(DataType::Audio)
                    .with_time(Duration::from_millis(i * 23));
                muxer.write_packet(pkt).await.unwrap();
            }
        }

        let mut demuxer = Demuxer::new(Cursor::new(out));
        let probed = demuxer.streams().await.unwrap();
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].sample_rate(), 44100);
        assert_eq!(probed[0].channels(), 2);

        let mut count = 0;
        let mut last = Duration::ZERO;
        loop {
            match demuxer.read_packet().await {
                Ok(pkt) => {
                    assert!(pkt.is_audio());
                    assert!(pkt.time >= last);
                    last = pkt.time;
                    count += 1;
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("demux failed: {e}"),
            }
        }
        assert_eq!(count, 5);
    }
}
