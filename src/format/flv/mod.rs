//! FLV container: tag stream codec, probing demuxer, and muxer.
//!
//! The [`Prober`] is shared with the RTMP engine: both feed it FLV tags
//! and get back [`CodecData`]/[`Packet`] conversions, keyed off the
//! AVC/AAC sequence-header tags.

pub mod amf0;
pub mod tag;

use crate::av::{self, CodecData, DataType, Packet};
use crate::codec::aac::AacCodecData;
use crate::codec::h264::{self, H264CodecData};
use crate::error::{Result, StreamerError};
use crate::utils::time_to_ts;
use amf0::{Amf0Object, Amf0Value};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tag::Tag;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Codec families this container carries.
pub const CODEC_TYPES: [av::CodecType; 2] = [av::CodecType::H264, av::CodecType::AAC];

/// Tags accumulated before the prober gives up waiting for both
/// families.
const MAX_PROBE_PACKET_COUNT: usize = 20;

/// Builds the FLV sequence-header tag for a stream's codec data.
pub fn codec_data_to_tag(stream: &CodecData) -> Result<Tag> {
    match stream {
        CodecData::H264(c) => Ok(Tag {
            tag_type: tag::TAG_VIDEO,
            frame_type: tag::FRAME_KEY,
            codec_id: tag::VIDEO_H264,
            avc_packet_type: tag::AVC_SEQHDR,
            data: c.record_bytes().clone(),
            ..Default::default()
        }),
        CodecData::AAC(c) => Ok(Tag {
            tag_type: tag::TAG_AUDIO,
            sound_format: tag::SOUND_AAC,
            sound_rate: tag::SOUND_44KHZ,
            sound_size: tag::SOUND_16BIT,
            sound_type: if c.channels() == 1 {
                tag::SOUND_MONO
            } else {
                tag::SOUND_STEREO
            },
            aac_packet_type: tag::AAC_SEQHDR,
            data: c.config_bytes().clone(),
            ..Default::default()
        }),
    }
}

/// Rebuilds codec data from a sequence-header tag, caching the tag on
/// the result.
pub fn tag_to_codec_data(t: &Tag) -> Result<CodecData> {
    match t.tag_type {
        tag::TAG_VIDEO => {
            if t.codec_id != tag::VIDEO_H264 {
                return Err(StreamerError::Parser(format!(
                    "video codec id {} unsupported",
                    t.codec_id
                )));
            }
            Ok(CodecData::H264(
                H264CodecData::from_record(t.data.clone())?.with_seq_header_tag(t.clone()),
            ))
        }
        tag::TAG_AUDIO => {
            if t.sound_format != tag::SOUND_AAC {
                return Err(StreamerError::Parser(format!(
                    "sound format {} unsupported",
                    t.sound_format
                )));
            }
            Ok(CodecData::AAC(
                AacCodecData::from_config_bytes(t.data.clone())?.with_seq_header_tag(t.clone()),
            ))
        }
        other => Err(StreamerError::Parser(format!("tag type {other} is not codec config"))),
    }
}

/// Converts a packet into an FLV tag plus its 32-bit timestamp.
pub fn packet_to_tag(pkt: &Packet, stream: &CodecData) -> (Tag, i32) {
    let ts = time_to_ts(pkt.time);
    let t = match stream {
        CodecData::H264(_) => Tag {
            tag_type: tag::TAG_VIDEO,
            frame_type: if pkt.is_key_frame {
                tag::FRAME_KEY
            } else {
                tag::FRAME_INTER
            },
            codec_id: tag::VIDEO_H264,
            avc_packet_type: pkt.avc_packet_type,
            composition_time: time_to_ts(pkt.composition_time),
            data: pkt.data.clone(),
            ..Default::default()
        },
        CodecData::AAC(c) => Tag {
            tag_type: tag::TAG_AUDIO,
            sound_format: tag::SOUND_AAC,
            sound_rate: tag::SOUND_44KHZ,
            sound_size: tag::SOUND_16BIT,
            sound_type: if c.channels() == 1 {
                tag::SOUND_MONO
            } else {
                tag::SOUND_STEREO
            },
            aac_packet_type: pkt.avc_packet_type,
            data: pkt.data.clone(),
            ..Default::default()
        },
    };
    (t, ts)
}

/// Builds the `onMetaData` map written ahead of the codec-config tags.
pub fn new_metadata_by_streams(streams: &[CodecData]) -> Result<Amf0Object> {
    let mut obj: Amf0Object = vec![("duration".into(), Amf0Value::Number(0.0))];
    for stream in streams {
        match stream {
            CodecData::H264(c) => {
                obj.push(("width".into(), Amf0Value::Number(c.width() as f64)));
                obj.push(("height".into(), Amf0Value::Number(c.height() as f64)));
                obj.push(("framerate".into(), Amf0Value::Number(c.fps() as f64)));
                obj.push(("videocodecid".into(), Amf0Value::Number(tag::VIDEO_H264 as f64)));
            }
            CodecData::AAC(c) => {
                obj.push(("audiocodecid".into(), Amf0Value::Number(tag::SOUND_AAC as f64)));
                obj.push(("audiosamplerate".into(), Amf0Value::Number(c.sample_rate() as f64)));
                obj.push(("audiosamplesize".into(), Amf0Value::Number(16.0)));
                obj.push(("stereo".into(), Amf0Value::Boolean(c.channels() != 1)));
            }
        }
    }
    Ok(obj)
}

/// Accumulates FLV tags until codec configuration for every expected
/// stream family has been seen, then converts subsequent tags to
/// packets.
#[derive(Default)]
pub struct Prober {
    /// Stream name used in log lines.
    pub task_id: String,
    /// Codec data in stream-index order.
    pub streams: Vec<CodecData>,

    got_metadata: bool,
    expect_video: bool,
    expect_audio: bool,

    video_stream_idx: Option<usize>,
    audio_stream_idx: Option<usize>,

    cached_pkts: VecDeque<Packet>,
    pushed_count: usize,

    inband_sps: Option<Bytes>,
}

impl Prober {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once every expected codec-config tag has arrived (or the
    /// probe budget is spent with at least one family seen).
    pub fn probed(&self) -> bool {
        if self.got_metadata && (self.expect_video || self.expect_audio) {
            return (!self.expect_video || self.video_stream_idx.is_some())
                && (!self.expect_audio || self.audio_stream_idx.is_some());
        }
        if self.video_stream_idx.is_some() && self.audio_stream_idx.is_some() {
            return true;
        }
        self.pushed_count >= MAX_PROBE_PACKET_COUNT
            && (self.video_stream_idx.is_some() || self.audio_stream_idx.is_some())
    }

    /// Feeds one tag into the probe; packets for non-config tags are
    /// cached and drained through [`Prober::pop_packet`].
    pub fn push_tag(&mut self, t: Tag, ts: i32) -> Result<()> {
        self.pushed_count += 1;

        match t.tag_type {
            tag::TAG_SCRIPTDATA => {
                self.absorb_metadata(&t);
            }
            tag::TAG_VIDEO if t.is_seq_header() => {
                let data = tag_to_codec_data(&t)?;
                match self.video_stream_idx {
                    Some(idx) => self.streams[idx] = data,
                    None => {
                        self.video_stream_idx = Some(self.streams.len());
                        self.streams.push(data);
                    }
                }
            }
            tag::TAG_AUDIO if t.is_seq_header() => {
                let data = tag_to_codec_data(&t)?;
                match self.audio_stream_idx {
                    Some(idx) => self.streams[idx] = data,
                    None => {
                        self.audio_stream_idx = Some(self.streams.len());
                        self.streams.push(data);
                    }
                }
            }
            _ => {
                if let Some(pkt) = self.tag_to_packet(&t, ts) {
                    self.cached_pkts.push_back(pkt);
                }
            }
        }
        Ok(())
    }

    fn absorb_metadata(&mut self, t: &Tag) {
        let vals = match amf0::parse_amf0_vals(&t.data) {
            Ok(vals) => vals,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "script data unparsable");
                return;
            }
        };
        let is_metadata = vals
            .iter()
            .any(|v| matches!(v.as_str(), Some("onMetaData") | Some("@setDataFrame")));
        if !is_metadata {
            return;
        }
        for v in &vals {
            if let Some(obj) = v.as_object() {
                self.got_metadata = true;
                if amf0::object_get(obj, "videocodecid").is_some()
                    || amf0::object_get(obj, "width").is_some()
                {
                    self.expect_video = true;
                }
                if amf0::object_get(obj, "audiocodecid").is_some()
                    || amf0::object_get(obj, "audiosamplerate").is_some()
                {
                    self.expect_audio = true;
                }
            }
        }
    }

    /// Converts an AV or script tag into a packet; `None` when the tag's
    /// family has no probed stream or the codec is unsupported.
    pub fn tag_to_packet(&self, t: &Tag, ts: i32) -> Option<Packet> {
        let time = Duration::from_millis(ts.max(0) as u64);
        match t.tag_type {
            tag::TAG_VIDEO => {
                if t.codec_id != tag::VIDEO_H264 {
                    return None;
                }
                let idx = self.video_stream_idx?;
                let mut pkt = Packet::new(t.data.clone())
                    .with_idx(idx)
                    .with_data_type(DataType::Video)
                    .with_avc_packet_type(t.avc_packet_type)
                    .with_time(time)
                    .with_composition_time(Duration::from_millis(t.composition_time.max(0) as u64));
                pkt.is_key_frame = t.frame_type == tag::FRAME_KEY && t.avc_packet_type == tag::AVC_NALU;
                Some(pkt)
            }
            tag::TAG_AUDIO => {
                if t.sound_format != tag::SOUND_AAC {
                    return None;
                }
                let idx = self.audio_stream_idx?;
                Some(
                    Packet::new(t.data.clone())
                        .with_idx(idx)
                        .with_data_type(DataType::Audio)
                        .with_avc_packet_type(t.aac_packet_type)
                        .with_time(time),
                )
            }
            tag::TAG_SCRIPTDATA => {
                let mut pkt = Packet::new(t.data.clone())
                    .with_data_type(DataType::ScriptData)
                    .with_time(time);
                pkt.header_changed = true;
                Some(pkt)
            }
            _ => None,
        }
    }

    /// Re-resolves codec data when a new sequence-header tag differs
    /// byte-wise from the cached one; returns whether a swap happened.
    pub fn header_changed(&mut self, t: &Tag) -> Result<bool> {
        if !t.is_seq_header() {
            return Ok(false);
        }

        let idx = match t.tag_type {
            tag::TAG_VIDEO => self.video_stream_idx,
            _ => self.audio_stream_idx,
        };

        match idx {
            Some(idx) => {
                if self.streams[idx].sequence_header_bytes() == &t.data {
                    return Ok(false);
                }
                self.streams[idx] = tag_to_codec_data(t)?;
                Ok(true)
            }
            None => {
                // a family appearing after probe completes is a header
                // change too
                let data = tag_to_codec_data(t)?;
                let idx = self.streams.len();
                match t.tag_type {
                    tag::TAG_VIDEO => self.video_stream_idx = Some(idx),
                    _ => self.audio_stream_idx = Some(idx),
                }
                self.streams.push(data);
                Ok(true)
            }
        }
    }

    /// Scans a keyframe payload for an in-band SPS and logs resolution
    /// moves; FLV sources that skip sequence-header resends still reveal
    /// geometry this way.
    pub fn dig_key_frame(&mut self, data: &[u8]) {
        let (nalus, _) = h264::split_nalus(data);
        for nalu in nalus {
            if h264::nalu_type(nalu) != h264::NALU_SPS {
                continue;
            }
            if self.inband_sps.as_deref() == Some(nalu) {
                return;
            }
            if let Ok(info) = h264::parse_sps(nalu) {
                tracing::info!(
                    task_id = %self.task_id,
                    width = info.width,
                    height = info.height,
                    "in-band SPS"
                );
            }
            self.inband_sps = Some(Bytes::copy_from_slice(nalu));
            return;
        }
    }

    pub fn video_stream_idx(&self) -> Option<usize> {
        self.video_stream_idx
    }

    pub fn audio_stream_idx(&self) -> Option<usize> {
        self.audio_stream_idx
    }

    pub fn is_empty(&self) -> bool {
        self.cached_pkts.is_empty()
    }

    pub fn pop_packet(&mut self) -> Option<Packet> {
        self.cached_pkts.pop_front()
    }
}

/// FLV demuxer over any async byte source.
pub struct Demuxer<R: AsyncRead + Unpin + Send> {
    r: BufReader<R>,
    prober: Prober,
    read_file_header: bool,
}

impl<R: AsyncRead + Unpin + Send> Demuxer<R> {
    pub fn new(r: R) -> Self {
        Self {
            r: BufReader::new(r),
            prober: Prober::new(),
            read_file_header: false,
        }
    }

    pub fn set_task_id(&mut self, id: impl Into<String>) {
        self.prober.task_id = id.into();
    }

    async fn probe(&mut self) -> Result<()> {
        if !self.read_file_header {
            tag::read_file_header(&mut self.r).await?;
            self.read_file_header = true;
        }
        while !self.prober.probed() {
            let (t, ts) = tag::read_tag(&mut self.r).await?;
            self.prober.push_tag(t, ts)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> av::Demuxer for Demuxer<R> {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        self.probe().await?;
        Ok(self.prober.streams.clone())
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        self.probe().await?;

        if let Some(pkt) = self.prober.pop_packet() {
            return Ok(pkt);
        }

        loop {
            let (t, ts) = tag::read_tag(&mut self.r).await?;

            if t.is_seq_header() {
                let changed = self.prober.header_changed(&t)?;
                if !changed {
                    tracing::debug!(task_id = %self.prober.task_id, "same sequence header, ignored");
                    continue;
                }
                let mut pkt = self
                    .prober
                    .tag_to_packet(&t, ts)
                    .ok_or_else(|| StreamerError::Parser("sequence header tag unconvertible".into()))?;
                pkt.header_changed = true;
                return Ok(pkt);
            }

            if let Some(pkt) = self.prober.tag_to_packet(&t, ts) {
                if pkt.is_key_frame {
                    self.prober.dig_key_frame(&pkt.data);
                }
                return Ok(pkt);
            }
        }
    }
}

/// FLV muxer over any async byte sink.
pub struct Muxer<W: AsyncWrite + Unpin + Send> {
    w: BufWriter<W>,
    streams: Vec<CodecData>,
    wrote_file_header: bool,
}

impl<W: AsyncWrite + Unpin + Send> Muxer<W> {
    pub fn new(w: W) -> Self {
        Self {
            w: BufWriter::new(w),
            streams: Vec::new(),
            wrote_file_header: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> av::Muxer for Muxer<W> {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<()> {
        self.streams = streams.to_vec();

        if !self.wrote_file_header {
            let mut flags = 0u8;
            for stream in streams {
                if stream.is_video() {
                    flags |= tag::FILE_HAS_VIDEO;
                } else {
                    flags |= tag::FILE_HAS_AUDIO;
                }
            }
            self.w.write_all(&tag::fill_file_header(flags)).await?;
            self.wrote_file_header = true;
        }

        let metadata = new_metadata_by_streams(streams)?;
        let mut body = bytes::BytesMut::new();
        amf0::fill_amf0_val(&mut body, &Amf0Value::String("onMetaData".into()));
        amf0::fill_amf0_val(&mut body, &Amf0Value::EcmaArray(metadata));
        let script = Tag {
            tag_type: tag::TAG_SCRIPTDATA,
            data: body.freeze(),
            ..Default::default()
        };
        tag::write_tag(&mut self.w, &script, 0).await?;

        for stream in streams {
            let t = codec_data_to_tag(stream)?;
            tag::write_tag(&mut self.w, &t, 0).await?;
        }
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
        let (t, ts) = packet_to_tag(&pkt, &self.streams[pkt.idx]);
        tag::write_tag(&mut self.w, &t, ts).await?;
        self.w.flush().await?;
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<()> {
        self.w.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::av::{Demuxer as _, Muxer as _};
    use crate::codec::aac::Mpeg4AudioConfig;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    pub(crate) fn test_h264_codec_data() -> CodecData {
        let sps = Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1e, 0xd9, 0x00, 0x10]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        CodecData::H264(H264CodecData::from_sps_and_pps(sps, pps).unwrap())
    }

    pub(crate) fn test_aac_codec_data() -> CodecData {
        CodecData::AAC(AacCodecData::from_config(Mpeg4AudioConfig {
            object_type: 2,
            sample_rate_index: 4,
            sample_rate: 44100,
            channel_config: 2,
        }))
    }

    #[test]
    fn metadata_reflects_streams() {
        let streams = vec![test_h264_codec_data(), test_aac_codec_data()];
        let meta = new_metadata_by_streams(&streams).unwrap();
        assert_eq!(
            amf0::object_get(&meta, "videocodecid").unwrap().as_number(),
            Some(7.0)
        );
        assert_eq!(
            amf0::object_get(&meta, "audiosamplerate").unwrap().as_number(),
            Some(44100.0)
        );
    }

    #[tokio::test]
    async fn mux_demux_round_trip() {
        let streams = vec![test_h264_codec_data(), test_aac_codec_data()];

        let mut out = Vec::new();
        {
            let mut muxer = Muxer::new(Cursor::new(&mut out));
            muxer.write_header(&streams).await.unwrap();

            for i in 0..10u64 {
                let video = Packet::new(vec![0, 0, 0, 1, 0x65, i as u8])
                    .with_idx(0)
                    .with_data_type(DataType::Video)
                    .with_key_flag(i % 5 == 0)
                    .with_time(Duration::from_millis(i * 40));
                muxer.write_packet(video).await.unwrap();

                let audio = Packet::new(vec![0xaa, i as u8])
                    .with_idx(1)
                    .with_data_type(DataType::Audio)
                    .with_time(Duration::from_millis(i * 23));
                muxer.write_packet(audio).await.unwrap();
            }
            muxer.write_trailer().await.unwrap();
        }

        let mut demuxer = Demuxer::new(Cursor::new(out));
        let probed = demuxer.streams().await.unwrap();
        assert_eq!(probed.len(), 2);
        assert_eq!(
            probed[0].sequence_header_bytes(),
            streams[0].sequence_header_bytes()
        );
        assert_eq!(
            probed[1].sequence_header_bytes(),
            streams[1].sequence_header_bytes()
        );

        let mut video = 0;
        let mut audio = 0;
        let mut last_video_ts = Duration::ZERO;
        loop {
            match demuxer.read_packet().await {
                Ok(pkt) => {
                    if pkt.is_video() {
                        assert!(pkt.time >= last_video_ts);
                        last_video_ts = pkt.time;
                        video += 1;
                    } else if pkt.is_audio() {
                        audio += 1;
                    }
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(video, 10);
        assert_eq!(audio, 10);
    }

    #[tokio::test]
    async fn packet_idx_out_of_range_is_programming_error() {
        let mut muxer = Muxer::new(Cursor::new(Vec::new()));
        muxer.write_header(&[test_h264_codec_data()]).await.unwrap();
        let pkt = Packet::new(vec![1]).with_idx(5);
        assert!(muxer.write_packet(pkt).await.is_err());
    }

    #[test]
    fn prober_detects_header_change() {
        let mut prober = Prober::new();
        let stream = test_h264_codec_data();
        let t = codec_data_to_tag(&stream).unwrap();
        prober.push_tag(t.clone(), 0).unwrap();
        assert!(prober.video_stream_idx().is_some());

        // identical bytes: no change
        assert!(!prober.header_changed(&t).unwrap());

        // different SPS bytes: swapped in
        let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f, 0xac, 0x00, 0x20]);
        let pps = Bytes::from_static(&[0x68, 0xee, 0x3c, 0x80]);
        let other = CodecData::H264(H264CodecData::from_sps_and_pps(sps, pps).unwrap());
        let t2 = codec_data_to_tag(&other).unwrap();
        assert!(prober.header_changed(&t2).unwrap());
        assert_eq!(
            prober.streams[0].sequence_header_bytes(),
            other.sequence_header_bytes()
        );
    }
}
