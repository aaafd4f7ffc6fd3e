//! TS muxer: PAT/PMT emission and PES packetization of H.264/AAC.

use super::pes;
use super::types::*;
use crate::av::{self, CodecData, Packet};
use crate::codec::aac::{self, ADTS_HEADER_LENGTH, SAMPLES_PER_FRAME};
use crate::codec::h264;
use crate::error::{Result, StreamerError};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// PTS values must stay positive after composition-time offsets; all
/// timestamps are shifted forward by this much.
const TIME_SHIFT: Duration = Duration::from_secs(1);

struct MuxStream {
    codec: CodecData,
    pid: u16,
    tsw: TsWriter,
}

/// Muxes packets into a single-program transport stream.
pub struct Muxer<W: AsyncWrite + Unpin + Send> {
    w: BufWriter<W>,
    streams: Vec<MuxStream>,
    tsw_pat: TsWriter,
    tsw_pmt: TsWriter,
    /// Pads each PID to a full continuity cycle in the trailer so
    /// concatenated segments keep counters continuous.
    pub padding_to_make_counter_cont: bool,
}

impl<W: AsyncWrite + Unpin + Send> Muxer<W> {
    pub fn new(w: W) -> Self {
        Self {
            w: BufWriter::new(w),
            streams: Vec::new(),
            tsw_pat: TsWriter::new(PID_PAT),
            tsw_pmt: TsWriter::new(PID_PMT),
            padding_to_make_counter_cont: false,
        }
    }

    fn new_stream(&mut self, codec: CodecData) {
        let pid = 0x100 + self.streams.len() as u16;
        self.streams.push(MuxStream {
            codec,
            pid,
            tsw: TsWriter::new(pid),
        });
    }

    /// Writes the PAT and PMT for the current stream set.
    pub async fn write_pat_pmt(&mut self) -> Result<()> {
        let pat = Pat {
            entries: vec![PatEntry {
                program_number: 1,
                program_map_pid: PID_PMT,
            }],
        };
        let mut body = BytesMut::new();
        pat.marshal(&mut body);
        let section = fill_psi(TABLE_ID_PAT, TABLE_EXT, &body);
        self.tsw_pat
            .write_packets(&mut self.w, &[&section], Duration::ZERO, false, true)
            .await?;

        let pmt = Pmt {
            pcr_pid: 0x100,
            elementary_stream_infos: self
                .streams
                .iter()
                .map(|s| ElementaryStreamInfo {
                    stream_type: match s.codec.codec_type() {
                        av::CodecType::H264 => STREAM_TYPE_H264,
                        av::CodecType::AAC => STREAM_TYPE_AAC_ADTS,
                    },
                    elementary_pid: s.pid,
                })
                .collect(),
        };
        let mut body = BytesMut::new();
        pmt.marshal(&mut body);
        let section = fill_psi(TABLE_ID_PMT, TABLE_EXT, &body);
        self.tsw_pmt
            .write_packets(&mut self.w, &[&section], Duration::ZERO, false, true)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> av::Muxer for Muxer<W> {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<()> {
        if self.streams.is_empty() {
            for codec in streams {
                self.new_stream(codec.clone());
            }
        } else {
            for (i, codec) in streams.iter().enumerate() {
                if i < self.streams.len() {
                    self.streams[i].codec = codec.clone();
                } else {
                    self.new_stream(codec.clone());
                }
            }
        }

        self.write_pat_pmt().await?;
        self.w.flush().await?;
        Ok(())
    }

    async fn write_packet(&mut self, pkt: Packet) -> Result<()> {
        if pkt.idx >= self.streams.len() {
            return Err(StreamerError::InvalidData(format!(
                "packet idx {} out of range for {} streams",
                pkt.idx,
                self.streams.len()
            )));
        }

        let time = pkt.time + TIME_SHIFT;
        let stream = &mut self.streams[pkt.idx];

        match &stream.codec {
            CodecData::AAC(c) => {
                let mut adts = [0u8; ADTS_HEADER_LENGTH];
                aac::fill_adts_header(&mut adts, c.config(), SAMPLES_PER_FRAME, pkt.data.len());
                let peshdr =
                    pes::fill_pes_header(STREAM_ID_AAC, Some(ADTS_HEADER_LENGTH + pkt.data.len()), time, None);
                stream
                    .tsw
                    .write_packets(&mut self.w, &[&peshdr, &adts, &pkt.data], time, true, false)
                    .await?;
            }
            CodecData::H264(c) => {
                let mut nalus: Vec<&[u8]> = Vec::new();
                if pkt.is_key_frame {
                    nalus.push(c.sps());
                    nalus.push(c.pps());
                }
                let (pkt_nalus, _) = h264::split_nalus(&pkt.data);
                nalus.extend(pkt_nalus);

                let peshdr =
                    pes::fill_pes_header(STREAM_ID_H264, None, time + pkt.composition_time, Some(time));

                let mut datav: Vec<&[u8]> = vec![&peshdr];
                for (i, nalu) in nalus.iter().enumerate() {
                    if i == 0 {
                        datav.push(h264::AUD_BYTES);
                    } else {
                        datav.push(h264::START_CODE_BYTES);
                    }
                    datav.push(nalu);
                }

                stream
                    .tsw
                    .write_packets(&mut self.w, &datav, time, pkt.is_key_frame, false)
                    .await?;
            }
        }

        self.w.flush().await?;
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<()> {
        if self.padding_to_make_counter_cont {
            for stream in &mut self.streams {
                while stream.tsw.continuity_counter & 0x0f != 0 {
                    stream
                        .tsw
                        .write_packets(&mut self.w, &[], Duration::ZERO, false, true)
                        .await?;
                }
            }
        }
        self.w.flush().await?;
        Ok(())
    }
}
