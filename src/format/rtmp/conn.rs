//! The RTMP connection: chunk reader/writer, AMF0 command dispatch, and
//! the publish/play state machine. A connection is simultaneously a
//! demuxer (play/ingest side) and a muxer (publish/egress side).

use super::chunk::*;
use super::handshake as hs;
use super::options::Options;
use super::{Info, AMF_ON_STATUS_PUBLISH_START, AMF_ON_STATUS_PUBLISH_STREAM_DUPLICATED};
use crate::av::{self, CodecData, Packet};
use crate::error::{Result, StreamerError};
use crate::format::flv::amf0::{self, Amf0Object, Amf0Value};
use crate::format::flv::tag::{self, Tag};
use crate::format::flv::{self, Prober};
use crate::utils::url as urlutil;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use url::Url;

const STAGE_HANDSHAKE_DONE: u8 = 1;
const STAGE_COMMAND_DONE: u8 = 2;
const STAGE_CODEC_DATA_DONE: u8 = 3;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Prepare {
    Reading,
    Writing,
}

/// An RTMP connection over any async byte stream.
pub struct Conn<S: AsyncRead + AsyncWrite + Unpin + Send> {
    stream: BufStream<S>,
    opts: Options,

    url: Option<Url>,
    info: Info,

    prober: Prober,
    streams: Vec<CodecData>,

    stage: u8,
    publishing: bool,
    playing: bool,
    reading: bool,
    writing: bool,

    av_msg_sid: u32,
    write_max_chunk_size: usize,
    read_max_chunk_size: usize,
    read_ack_size: u32,
    ackn: u32,
    read_cs_map: HashMap<u32, ChunkStream>,
    /// Extended-timestamp bytes peeked off a type-3 continuation that
    /// turned out to be payload.
    pushback: Vec<u8>,

    got_command: bool,
    command_name: String,
    command_transid: f64,
    command_obj: Amf0Object,
    command_params: Vec<Amf0Value>,

    got_msg: bool,
    timestamp: u32,
    msg_type_id: u8,
    av_tag: Option<Tag>,
    script_tag: Option<Tag>,
    event_type: u16,

    tx_bytes: u64,
    rx_bytes: u64,
}

/// Dials an RTMP URL (as carried in `opts.tc_url`) and prepares a
/// client-side connection.
pub async fn dial(host: &str, opts: Options) -> Result<Conn<TcpStream>> {
    let opts = Options {
        is_server: false,
        ..opts
    };

    let stream = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(host))
        .await
        .map_err(|_| StreamerError::Timeout(opts.dial_timeout))?
        .map_err(|e| StreamerError::connect_url(format!("{host}: {e}")))?;
    stream.set_nodelay(true)?;

    let tc_url = opts.tc_url.clone();
    let mut conn = Conn::new(stream, opts);
    conn.set_tc_url(&tc_url)?;
    Ok(conn)
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Conn<S> {
    /// Wraps an accepted or dialed stream. Server/client role comes from
    /// the options.
    pub fn new(stream: S, opts: Options) -> Self {
        Self {
            stream: BufStream::with_capacity(opts.read_buffer_size, opts.write_buffer_size, stream),
            opts,
            url: None,
            info: Info::default(),
            prober: Prober::new(),
            streams: Vec::new(),
            stage: 0,
            publishing: false,
            playing: false,
            reading: false,
            writing: false,
            av_msg_sid: 0,
            write_max_chunk_size: 128,
            read_max_chunk_size: 128,
            read_ack_size: 0,
            ackn: 0,
            read_cs_map: HashMap::new(),
            pushback: Vec::new(),
            got_command: false,
            command_name: String::new(),
            command_transid: 0.0,
            command_obj: Amf0Object::new(),
            command_params: Vec::new(),
            got_msg: false,
            timestamp: 0,
            msg_type_id: 0,
            av_tag: None,
            script_tag: None,
            event_type: 0,
            tx_bytes: 0,
            rx_bytes: 0,
        }
    }

    /// Derives the connection identity from an `rtmp://` URL; client
    /// connections need this before `connect_publish`/`connect_play`.
    pub fn set_tc_url(&mut self, tc_url: &str) -> Result<()> {
        let (url, addr) = urlutil::parse_url_detail(tc_url)?;
        self.info = Info {
            domain: addr.host,
            app: addr.app,
            id: urlutil::extract_stream_id(&addr.stream_name),
            stream_name: addr.stream_name,
            raw_url: tc_url.to_string(),
            is_publishing: false,
            is_playing: false,
        };
        self.prober.task_id = self.info.stream_name.clone();
        self.url = Some(url);
        Ok(())
    }

    pub fn info(&self) -> Info {
        let mut info = self.info.clone();
        info.is_publishing = self.publishing;
        info.is_playing = self.playing;
        info
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn set_prober_task_id(&mut self, id: impl Into<String>) {
        self.prober.task_id = id.into();
    }

    /// Resolution from the probed video codec data, zero when absent.
    pub fn video_resolution(&self) -> (u32, u32) {
        for stream in &self.streams {
            if stream.is_video() {
                return (stream.width(), stream.height());
            }
        }
        (0, 0)
    }

    // ---- deadline IO ----

    async fn read_exact_deadline(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() && !self.pushback.is_empty() {
            buf[off] = self.pushback.remove(0);
            off += 1;
        }
        if off < buf.len() {
            match tokio::time::timeout(self.opts.read_write_timeout, self.stream.read_exact(&mut buf[off..])).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(StreamerError::EndOfStream);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(StreamerError::Timeout(self.opts.read_write_timeout)),
            }
            // pushback bytes were already counted when first read
            self.rx_bytes += (buf.len() - off) as u64;
        }
        Ok(())
    }

    async fn write_all_deadline(&mut self, buf: &[u8]) -> Result<()> {
        match tokio::time::timeout(self.opts.read_write_timeout, self.stream.write_all(buf)).await {
            Ok(Ok(())) => {
                self.tx_bytes += buf.len() as u64;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StreamerError::Timeout(self.opts.read_write_timeout)),
        }
    }

    async fn flush_write(&mut self) -> Result<()> {
        match tokio::time::timeout(self.opts.read_write_timeout, self.stream.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StreamerError::Timeout(self.opts.read_write_timeout)),
        }
    }

    // ---- handshake ----

    /// Server side of the handshake; uses the digest scheme when the
    /// peer's C1 carries a nonzero version, echoing otherwise.
    pub async fn handshake_server(&mut self) -> Result<()> {
        let mut c0c1 = vec![0u8; 1 + hs::HANDSHAKE_SIZE];
        self.read_exact_deadline(&mut c0c1).await?;
        if c0c1[0] != hs::HANDSHAKE_VERSION {
            return Err(StreamerError::Protocol(format!(
                "handshake version {} invalid",
                c0c1[0]
            )));
        }
        let c1 = &c0c1[1..];

        let mut s0s1s2 = vec![0u8; 1 + hs::HANDSHAKE_SIZE * 2];
        let cli_time = u32::from_be_bytes(c1[0..4].try_into().unwrap());
        let cli_ver = u32::from_be_bytes(c1[4..8].try_into().unwrap());

        if cli_ver != 0 {
            let digest = hs::parse_1(c1, hs::client_partial_key(), hs::SERVER_FULL_KEY.as_slice())
                .ok_or_else(|| StreamerError::Protocol("handshake C1 digest invalid".into()))?;
            hs::create_01(
                &mut s0s1s2[..1 + hs::HANDSHAKE_SIZE],
                cli_time,
                hs::SERVER_VERSION,
                hs::server_partial_key(),
            );
            hs::create_2(&mut s0s1s2[1 + hs::HANDSHAKE_SIZE..], &digest);
        } else {
            s0s1s2[0] = hs::HANDSHAKE_VERSION;
            s0s1s2[1..1 + hs::HANDSHAKE_SIZE].copy_from_slice(c1);
            s0s1s2[1 + hs::HANDSHAKE_SIZE..].copy_from_slice(c1);
        }

        self.write_all_deadline(&s0s1s2).await?;
        self.flush_write().await?;

        let mut c2 = vec![0u8; hs::HANDSHAKE_SIZE];
        self.read_exact_deadline(&mut c2).await?;

        self.stage = STAGE_HANDSHAKE_DONE;
        Ok(())
    }

    /// Client side of the handshake: a zero-version C1, echoing S1 as
    /// C2.
    pub async fn handshake_client(&mut self) -> Result<()> {
        let mut c0c1 = vec![0u8; 1 + hs::HANDSHAKE_SIZE];
        c0c1[0] = hs::HANDSHAKE_VERSION;

        self.write_all_deadline(&c0c1).await?;
        self.flush_write().await?;

        let mut s0s1s2 = vec![0u8; 1 + hs::HANDSHAKE_SIZE * 2];
        self.read_exact_deadline(&mut s0s1s2).await?;
        let s1 = s0s1s2[1..1 + hs::HANDSHAKE_SIZE].to_vec();

        self.write_all_deadline(&s1).await?;
        self.flush_write().await?;

        self.stage = STAGE_HANDSHAKE_DONE;
        Ok(())
    }

    // ---- chunk reader ----

    async fn poll_msg(&mut self) -> Result<()> {
        self.got_msg = false;
        self.got_command = false;
        self.av_tag = None;
        self.script_tag = None;
        loop {
            self.read_chunk().await?;
            if self.got_msg {
                return Ok(());
            }
        }
    }

    async fn poll_command(&mut self) -> Result<()> {
        loop {
            self.poll_msg().await?;
            if self.got_command {
                return Ok(());
            }
        }
    }

    async fn poll_av_tag(&mut self) -> Result<(Tag, u32)> {
        loop {
            self.poll_msg().await?;
            match self.msg_type_id {
                MSG_TYPE_VIDEO | MSG_TYPE_AUDIO => {
                    if let Some(t) = self.av_tag.take() {
                        return Ok((t, self.timestamp));
                    }
                }
                MSG_TYPE_DATA_AMF0 | MSG_TYPE_DATA_AMF3 => {
                    if let Some(t) = self.script_tag.take() {
                        return Ok((t, self.timestamp));
                    }
                }
                other => {
                    tracing::debug!(
                        task_id = %self.prober.task_id,
                        msg_type_id = other,
                        command = %self.command_name,
                        "unhandled message while polling av"
                    );
                }
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<()> {
        let rx_start = self.rx_bytes;

        let mut b = [0u8; 11];
        self.read_exact_deadline(&mut b[..1]).await?;
        let header = b[0];
        let msg_hdr_type = header >> 6;
        let mut csid = (header & 0x3f) as u32;
        match csid {
            0 => {
                self.read_exact_deadline(&mut b[..1]).await?;
                csid = b[0] as u32 + 64;
            }
            1 => {
                self.read_exact_deadline(&mut b[..2]).await?;
                csid = u16::from_be_bytes([b[0], b[1]]) as u32 + 64;
            }
            _ => {}
        }

        let mut cs = self.read_cs_map.remove(&csid).unwrap_or_default();
        let complete = match self.read_chunk_into(&mut cs, msg_hdr_type, csid).await {
            Ok(complete) => complete,
            Err(e) => {
                // mid-message failures tear the connection down; the
                // partial accumulator is never reused
                return Err(e);
            }
        };
        self.read_cs_map.insert(csid, cs);

        if let Some((timestamp, msg_sid, msg_type_id, data)) = complete {
            self.handle_msg(timestamp, msg_sid, msg_type_id, data)?;
        }

        self.ackn += (self.rx_bytes - rx_start) as u32;
        if self.read_ack_size != 0 && self.ackn > self.read_ack_size {
            let ackn = self.ackn;
            self.write_ack(ackn).await?;
            self.ackn = 0;
        }

        Ok(())
    }

    async fn read_chunk_into(
        &mut self,
        cs: &mut ChunkStream,
        msg_hdr_type: u8,
        csid: u32,
    ) -> Result<Option<(u32, u32, u8, Vec<u8>)>> {
        let mut b = [0u8; 11];

        match msg_hdr_type {
            0 => {
                if cs.msg_data_left != 0 {
                    return Err(StreamerError::Protocol(format!(
                        "headertype=0 csid={csid} arrived with {} bytes left",
                        cs.msg_data_left
                    )));
                }
                self.read_exact_deadline(&mut b).await?;
                let mut timestamp = u32::from_be_bytes([0, b[0], b[1], b[2]]);
                cs.msg_hdr_type = msg_hdr_type;
                cs.msg_data_len = u32::from_be_bytes([0, b[3], b[4], b[5]]);
                cs.msg_type_id = b[6];
                cs.msg_sid = u32::from_le_bytes([b[7], b[8], b[9], b[10]]);
                if timestamp == FLV_TIMESTAMP_MAX {
                    let mut ext = [0u8; 4];
                    self.read_exact_deadline(&mut ext).await?;
                    timestamp = u32::from_be_bytes(ext);
                    cs.has_time_ext = true;
                } else {
                    cs.has_time_ext = false;
                }
                cs.time_now = timestamp;
                cs.start();
            }
            1 => {
                if cs.msg_data_left != 0 {
                    return Err(StreamerError::Protocol(format!(
                        "headertype=1 csid={csid} arrived with {} bytes left",
                        cs.msg_data_left
                    )));
                }
                self.read_exact_deadline(&mut b[..7]).await?;
                let mut timestamp = u32::from_be_bytes([0, b[0], b[1], b[2]]);
                cs.msg_hdr_type = msg_hdr_type;
                cs.msg_data_len = u32::from_be_bytes([0, b[3], b[4], b[5]]);
                cs.msg_type_id = b[6];
                if timestamp == FLV_TIMESTAMP_MAX {
                    let mut ext = [0u8; 4];
                    self.read_exact_deadline(&mut ext).await?;
                    timestamp = u32::from_be_bytes(ext);
                    cs.has_time_ext = true;
                } else {
                    cs.has_time_ext = false;
                }
                cs.time_delta = timestamp;
                cs.time_now = cs.time_now.wrapping_add(timestamp);
                cs.start();
            }
            2 => {
                if cs.msg_data_left != 0 {
                    return Err(StreamerError::Protocol(format!(
                        "headertype=2 csid={csid} arrived with {} bytes left",
                        cs.msg_data_left
                    )));
                }
                self.read_exact_deadline(&mut b[..3]).await?;
                let mut timestamp = u32::from_be_bytes([0, b[0], b[1], b[2]]);
                if timestamp == FLV_TIMESTAMP_MAX {
                    let mut ext = [0u8; 4];
                    self.read_exact_deadline(&mut ext).await?;
                    timestamp = u32::from_be_bytes(ext);
                    cs.has_time_ext = true;
                } else {
                    cs.has_time_ext = false;
                }
                cs.time_delta = timestamp;
                cs.time_now = cs.time_now.wrapping_add(timestamp);
                cs.start();
            }
            3 => {
                if cs.msg_data_left == 0 {
                    match cs.msg_hdr_type {
                        0 => {
                            if cs.has_time_ext {
                                let mut ext = [0u8; 4];
                                self.read_exact_deadline(&mut ext).await?;
                                cs.time_now = u32::from_be_bytes(ext);
                            }
                        }
                        _ => {
                            let delta = if cs.has_time_ext {
                                let mut ext = [0u8; 4];
                                self.read_exact_deadline(&mut ext).await?;
                                u32::from_be_bytes(ext)
                            } else {
                                cs.time_delta
                            };
                            cs.time_now = cs.time_now.wrapping_add(delta);
                        }
                    }
                    cs.start();
                } else if cs.has_time_ext {
                    // non-compliant senders repeat the extended
                    // timestamp on continuations; consume it only when
                    // it matches the current one
                    let mut peeked = [0u8; 4];
                    self.read_exact_deadline(&mut peeked).await?;
                    let tmpts = u32::from_be_bytes(peeked);
                    if tmpts > 0 && tmpts == cs.time_now {
                        tracing::debug!(csid, timestamp = tmpts, "discarding repeated ext timestamp");
                    } else {
                        self.pushback.extend_from_slice(&peeked);
                    }
                }
            }
            other => {
                return Err(StreamerError::Protocol(format!(
                    "headertype={other} csid={csid} invalid"
                )));
            }
        }

        let size = (cs.msg_data_left as usize).min(self.read_max_chunk_size);
        let off = (cs.msg_data_len - cs.msg_data_left) as usize;
        let mut body = std::mem::take(&mut cs.msg_data);
        self.read_exact_deadline(&mut body[off..off + size]).await?;
        cs.msg_data = body;
        cs.msg_data_left -= size as u32;

        if cs.msg_data_left == 0 {
            let data = std::mem::take(&mut cs.msg_data);
            return Ok(Some((cs.time_now, cs.msg_sid, cs.msg_type_id, data)));
        }
        Ok(None)
    }

    fn handle_command_amf0(&mut self, b: &[u8]) -> Result<()> {
        let mut off = 0;
        let (name, n) = amf0::parse_amf0_val(&b[off..])
            .map_err(|e| StreamerError::Protocol(format!("command name: {e}")))?;
        off += n;
        let (transid, n) = amf0::parse_amf0_val(&b[off..])
            .map_err(|e| StreamerError::Protocol(format!("command transid: {e}")))?;
        off += n;
        let (obj, n) = amf0::parse_amf0_val(&b[off..])
            .map_err(|e| StreamerError::Protocol(format!("command object: {e}")))?;
        off += n;

        self.command_name = name
            .as_str()
            .ok_or_else(|| StreamerError::Protocol("command name is not a string".into()))?
            .to_string();
        self.command_transid = transid.as_number().unwrap_or(0.0);
        self.command_obj = obj.as_object().cloned().unwrap_or_default();
        self.command_params.clear();

        while off < b.len() {
            let (val, n) = amf0::parse_amf0_val(&b[off..])
                .map_err(|e| StreamerError::Protocol(format!("command params: {e}")))?;
            off += n;
            self.command_params.push(val);
        }

        self.got_command = true;
        Ok(())
    }

    fn handle_msg(&mut self, timestamp: u32, msg_sid: u32, msg_type_id: u8, data: Vec<u8>) -> Result<()> {
        self.msg_type_id = msg_type_id;
        self.timestamp = timestamp;

        match msg_type_id {
            MSG_TYPE_COMMAND_AMF0 => self.handle_command_amf0(&data)?,
            MSG_TYPE_COMMAND_AMF3 => {
                if data.is_empty() {
                    return Err(StreamerError::Protocol("short AMF3 command".into()));
                }
                self.handle_command_amf0(&data[1..])?;
            }
            MSG_TYPE_USER_CONTROL => {
                if data.len() < 2 {
                    return Err(StreamerError::Protocol("short user control message".into()));
                }
                self.event_type = u16::from_be_bytes([data[0], data[1]]);
                match self.event_type {
                    EVENT_STREAM_BEGIN | EVENT_SET_BUFFER_LENGTH | EVENT_STREAM_IS_RECORDED => {
                        tracing::debug!(event = self.event_type, "user control event");
                    }
                    other => {
                        tracing::debug!(event = other, "unhandled user control event");
                    }
                }
            }
            MSG_TYPE_DATA_AMF0 | MSG_TYPE_DATA_AMF3 => {
                let body = if msg_type_id == MSG_TYPE_DATA_AMF3 && !data.is_empty() {
                    &data[1..]
                } else {
                    &data[..]
                };
                amf0::parse_amf0_vals(body)
                    .map_err(|e| StreamerError::Protocol(format!("data message: {e}")))?;
                self.script_tag = Some(Tag {
                    tag_type: tag::TAG_SCRIPTDATA,
                    data: Bytes::copy_from_slice(body),
                    ..Default::default()
                });
            }
            MSG_TYPE_VIDEO => {
                if data.is_empty() {
                    return Ok(());
                }
                let mut t = Tag {
                    tag_type: tag::TAG_VIDEO,
                    ..Default::default()
                };
                let n = t.parse_header(&data)?;
                if !(t.frame_type == tag::FRAME_INTER || t.frame_type == tag::FRAME_KEY) {
                    return Ok(());
                }
                t.data = Bytes::from(data).slice(n..);
                self.av_tag = Some(t);
            }
            MSG_TYPE_AUDIO => {
                if data.is_empty() {
                    return Ok(());
                }
                let mut t = Tag {
                    tag_type: tag::TAG_AUDIO,
                    ..Default::default()
                };
                let n = t.parse_header(&data)?;
                t.data = Bytes::from(data).slice(n..);
                self.av_tag = Some(t);
            }
            MSG_TYPE_SET_CHUNK_SIZE => {
                if data.len() < 4 {
                    return Err(StreamerError::Protocol("short SetChunkSize".into()));
                }
                self.read_max_chunk_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                tracing::info!(
                    task_id = %self.prober.task_id,
                    chunk_size = self.read_max_chunk_size,
                    "peer set chunk size"
                );
                return Ok(());
            }
            MSG_TYPE_WINDOW_ACK_SIZE => {
                if data.len() == 4 {
                    self.read_ack_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                }
            }
            MSG_TYPE_ACK => {
                tracing::debug!(msg_sid, "peer acknowledgement");
            }
            other => {
                tracing::debug!(
                    msg_type_id = other,
                    msg_sid,
                    timestamp,
                    task_id = %self.prober.task_id,
                    role = %self.opts.role_id,
                    "unhandled message"
                );
            }
        }

        self.got_msg = true;
        Ok(())
    }

    // ---- chunk writer ----

    async fn write_set_chunk_size(&mut self, size: usize) -> Result<()> {
        self.write_max_chunk_size = size;
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 4];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_SET_CHUNK_SIZE, 0, 4);
        b[n..n + 4].copy_from_slice(&(size as u32).to_be_bytes());
        self.write_all_deadline(&b[..n + 4]).await
    }

    async fn write_ack(&mut self, seqnum: u32) -> Result<()> {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 4];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_ACK, 0, 4);
        b[n..n + 4].copy_from_slice(&seqnum.to_be_bytes());
        self.write_all_deadline(&b[..n + 4]).await
    }

    async fn write_window_ack_size(&mut self, size: u32) -> Result<()> {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 4];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_WINDOW_ACK_SIZE, 0, 4);
        b[n..n + 4].copy_from_slice(&size.to_be_bytes());
        self.write_all_deadline(&b[..n + 4]).await
    }

    async fn write_set_peer_bandwidth(&mut self, ack_size: u32, limit_type: u8) -> Result<()> {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 5];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_SET_PEER_BANDWIDTH, 0, 5);
        b[n..n + 4].copy_from_slice(&ack_size.to_be_bytes());
        b[n + 4] = limit_type;
        self.write_all_deadline(&b[..n + 5]).await
    }

    async fn write_stream_begin(&mut self, msg_sid: u32) -> Result<()> {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 6];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_USER_CONTROL, 0, 6);
        b[n..n + 2].copy_from_slice(&EVENT_STREAM_BEGIN.to_be_bytes());
        b[n + 2..n + 6].copy_from_slice(&msg_sid.to_be_bytes());
        self.write_all_deadline(&b[..n + 6]).await
    }

    async fn write_set_buffer_length(&mut self, msg_sid: u32, timestamp_ms: u32) -> Result<()> {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 10];
        let n = fill_chunk_header(&mut b, 2, 0, MSG_TYPE_USER_CONTROL, 0, 10);
        b[n..n + 2].copy_from_slice(&EVENT_SET_BUFFER_LENGTH.to_be_bytes());
        b[n + 2..n + 6].copy_from_slice(&msg_sid.to_be_bytes());
        b[n + 6..n + 10].copy_from_slice(&timestamp_ms.to_be_bytes());
        self.write_all_deadline(&b[..n + 10]).await
    }

    async fn write_amf0_msg(&mut self, msg_type_id: u8, csid: u32, msg_sid: u32, args: &[Amf0Value]) -> Result<()> {
        let size: usize = args.iter().map(amf0::len_amf0_val).sum();
        let mut buf = bytes::BytesMut::with_capacity(CHUNK_HEADER_LENGTH + size);
        buf.resize(CHUNK_HEADER_LENGTH + 4, 0);
        let n = fill_chunk_header(&mut buf, csid, 0, msg_type_id, msg_sid, size);
        buf.truncate(n);
        for arg in args {
            amf0::fill_amf0_val(&mut buf, arg);
        }
        let out = buf.freeze();
        self.write_all_deadline(&out).await
    }

    async fn write_command_msg(&mut self, csid: u32, msg_sid: u32, args: &[Amf0Value]) -> Result<()> {
        self.write_amf0_msg(MSG_TYPE_COMMAND_AMF0, csid, msg_sid, args)
            .await
            .map_err(|e| StreamerError::Protocol(format!("write command csid={csid}: {e}")))
    }

    async fn write_data_msg(&mut self, csid: u32, msg_sid: u32, args: &[Amf0Value]) -> Result<()> {
        self.write_amf0_msg(MSG_TYPE_DATA_AMF0, csid, msg_sid, args)
            .await
            .map_err(|e| StreamerError::Protocol(format!("write data msg csid={csid}: {e}")))
    }

    async fn write_av_tag(&mut self, t: &Tag, ts: i32) -> Result<()> {
        let (msg_type_id, csid) = match t.tag_type {
            tag::TAG_AUDIO => (MSG_TYPE_AUDIO, 6),
            tag::TAG_VIDEO => (MSG_TYPE_VIDEO, 7),
            other => {
                return Err(StreamerError::InvalidData(format!("tag type {other} is not av")));
            }
        };

        let mut sub = [0u8; tag::MAX_TAG_SUB_HEADER_LENGTH];
        let sublen = t.fill_header(&mut sub);
        let msg_len = sublen + t.data.len();

        if CHUNK_HEADER_LENGTH + 4 + msg_len > self.write_max_chunk_size {
            // a single av message must fit one chunk; raise the size
            self.write_set_chunk_size(CHUNK_HEADER_LENGTH + 4 + msg_len).await?;
        }

        let mut head = [0u8; CHUNK_HEADER_LENGTH + 4];
        let n = fill_chunk_header(&mut head, csid, ts as u32, msg_type_id, self.av_msg_sid, msg_len);
        let header = head[..n].to_vec();
        self.write_all_deadline(&header).await?;
        let sub = sub[..sublen].to_vec();
        self.write_all_deadline(&sub).await?;
        let data = t.data.clone();
        self.write_all_deadline(&data).await?;
        Ok(())
    }

    // ---- server command flow ----

    async fn write_basic_conf(&mut self) -> Result<()> {
        let chunk_size = self.opts.chunk_size;
        self.write_set_chunk_size(chunk_size).await?;
        self.write_window_ack_size(5_000_000).await?;
        self.write_set_peer_bandwidth(5_000_000, 2).await?;
        Ok(())
    }

    /// Server role: consume `connect`, `createStream`, then `publish`
    /// or `play`, transitioning this connection into its reading or
    /// writing state.
    pub async fn read_connect(&mut self) -> Result<()> {
        self.poll_command().await?;
        if self.command_name != "connect" {
            return Err(StreamerError::Protocol("first command is not connect".into()));
        }

        let connect_path = amf0::object_get(&self.command_obj, "app")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StreamerError::Protocol("connect params missing app".into()))?
            .to_string();
        let tc_url = amf0::object_get(&self.command_obj, "tcUrl")
            .or_else(|| amf0::object_get(&self.command_obj, "tcurl"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        tracing::info!(app = %connect_path, tc_url = %tc_url, "rtmp < connect");

        self.write_basic_conf().await?;

        let transid = self.command_transid;
        self.write_command_msg(
            3,
            0,
            &[
                Amf0Value::String("_result".into()),
                Amf0Value::Number(transid),
                Amf0Value::Object(vec![
                    ("fmtVer".into(), Amf0Value::String("FMS/3,0,1,123".into())),
                    ("capabilities".into(), Amf0Value::Number(31.0)),
                ]),
                Amf0Value::Object(vec![
                    ("level".into(), Amf0Value::String("status".into())),
                    ("code".into(), Amf0Value::String("NetConnection.Connect.Success".into())),
                    ("description".into(), Amf0Value::String("Connection succeeded.".into())),
                    ("objectEncoding".into(), Amf0Value::Number(3.0)),
                ]),
            ],
        )
        .await?;
        self.flush_write().await?;

        loop {
            self.poll_msg().await?;
            if !self.got_command {
                continue;
            }
            match self.command_name.as_str() {
                "createStream" => {
                    self.av_msg_sid = 1;
                    let transid = self.command_transid;
                    self.write_command_msg(
                        3,
                        0,
                        &[
                            Amf0Value::String("_result".into()),
                            Amf0Value::Number(transid),
                            Amf0Value::Null,
                            Amf0Value::Number(self.av_msg_sid as f64),
                        ],
                    )
                    .await?;
                    self.flush_write().await?;
                }
                "publish" => {
                    let publish_path = self
                        .command_params
                        .first()
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| StreamerError::Protocol("publish params invalid".into()))?
                        .to_string();

                    tracing::info!(path = %publish_path, "rtmp < publish");

                    self.info = create_info(&tc_url, &connect_path, &publish_path)?;
                    self.prober.task_id = self.info.stream_name.clone();

                    let hook_result = match &self.opts.hook {
                        Some(hook) => hook.on_play_or_publish(&self.info()),
                        None => Ok(()),
                    };
                    let status = if hook_result.is_ok() {
                        AMF_ON_STATUS_PUBLISH_START.clone()
                    } else {
                        AMF_ON_STATUS_PUBLISH_STREAM_DUPLICATED.clone()
                    };

                    let transid = self.command_transid;
                    let av_msg_sid = self.av_msg_sid;
                    self.write_command_msg(
                        5,
                        av_msg_sid,
                        &[
                            Amf0Value::String("onStatus".into()),
                            Amf0Value::Number(transid),
                            Amf0Value::Null,
                            Amf0Value::Object(status),
                        ],
                    )
                    .await?;
                    self.flush_write().await?;

                    if let Err(e) = hook_result {
                        return Err(StreamerError::Protocol(format!("publish rejected: {e}")));
                    }

                    self.publishing = true;
                    self.reading = true;
                    self.stage = STAGE_COMMAND_DONE;
                    return Ok(());
                }
                "play" => {
                    let play_path = self
                        .command_params
                        .first()
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| StreamerError::Protocol("play params invalid".into()))?
                        .to_string();

                    tracing::debug!(path = %play_path, "rtmp < play");

                    self.info = create_info(&tc_url, &connect_path, &play_path)?;
                    self.prober.task_id = self.info.stream_name.clone();

                    if let Some(hook) = &self.opts.hook {
                        hook.on_play_or_publish(&self.info())
                            .map_err(|e| StreamerError::Protocol(format!("play rejected: {e}")))?;
                    }

                    let av_msg_sid = self.av_msg_sid;
                    self.write_stream_begin(av_msg_sid).await?;

                    let transid = self.command_transid;
                    self.write_command_msg(
                        5,
                        av_msg_sid,
                        &[
                            Amf0Value::String("onStatus".into()),
                            Amf0Value::Number(transid),
                            Amf0Value::Null,
                            Amf0Value::Object(vec![
                                ("level".into(), Amf0Value::String("status".into())),
                                ("code".into(), Amf0Value::String("NetStream.Play.Start".into())),
                                ("description".into(), Amf0Value::String("Start live".into())),
                            ]),
                        ],
                    )
                    .await?;

                    self.write_data_msg(
                        5,
                        av_msg_sid,
                        &[
                            Amf0Value::String("|RtmpSampleAccess".into()),
                            Amf0Value::Boolean(true),
                            Amf0Value::Boolean(true),
                        ],
                    )
                    .await?;
                    self.flush_write().await?;

                    self.playing = true;
                    self.writing = true;
                    self.stage = STAGE_COMMAND_DONE;
                    return Ok(());
                }
                other => {
                    tracing::debug!(command = other, "ignoring command");
                }
            }
        }
    }

    // ---- client command flow ----

    async fn write_connect(&mut self, app: &str) -> Result<()> {
        self.write_basic_conf().await?;

        let tc_url = self
            .url
            .as_ref()
            .map(|u| {
                let mut tu = u.clone();
                tu.set_path(&format!("/{app}"));
                tu.set_query(None);
                tu.to_string()
            })
            .unwrap_or_default();

        tracing::debug!(app = %app, tc_url = %tc_url, "rtmp > connect");

        self.write_command_msg(
            3,
            0,
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(1.0),
                Amf0Value::Object(vec![
                    ("app".into(), Amf0Value::String(app.into())),
                    ("flashVer".into(), Amf0Value::String("MAC 22,0,0,192".into())),
                    ("tcUrl".into(), Amf0Value::String(tc_url)),
                    ("fpad".into(), Amf0Value::Boolean(false)),
                    ("capabilities".into(), Amf0Value::Number(15.0)),
                    ("audioCodecs".into(), Amf0Value::Number(4071.0)),
                    ("videoCodecs".into(), Amf0Value::Number(252.0)),
                    ("videoFunction".into(), Amf0Value::Number(1.0)),
                ]),
            ],
        )
        .await?;
        self.flush_write().await?;

        loop {
            self.poll_msg().await?;
            if self.got_command {
                if self.command_name == "_result" {
                    let code = self
                        .command_params
                        .first()
                        .and_then(|v| v.as_object())
                        .and_then(|o| amf0::object_get(o, "code"))
                        .and_then(|v| v.as_str());
                    if code != Some("NetConnection.Connect.Success") {
                        return Err(StreamerError::Protocol(format!(
                            "connect failed: code={code:?}"
                        )));
                    }
                    return Ok(());
                }
            } else if self.msg_type_id == MSG_TYPE_WINDOW_ACK_SIZE {
                self.write_window_ack_size(0xffff_ffff).await?;
            }
        }
    }

    /// Client role: connect, createStream, publish; leaves the
    /// connection writing.
    pub async fn connect_publish(&mut self) -> Result<()> {
        let (connect_path, publish_path) = self
            .url
            .as_ref()
            .map(urlutil::split_path)
            .unwrap_or_default();

        self.write_connect(&connect_path).await?;

        let mut transid = 2.0;
        tracing::debug!(id = %self.info.id, "rtmp > createStream");
        self.write_command_msg(
            3,
            0,
            &[
                Amf0Value::String("createStream".into()),
                Amf0Value::Number(transid),
                Amf0Value::Null,
            ],
        )
        .await?;
        transid += 1.0;
        self.flush_write().await?;

        loop {
            self.poll_msg().await?;
            if self.got_command && self.command_name == "_result" {
                self.av_msg_sid = self
                    .command_params
                    .first()
                    .and_then(|v| v.as_number())
                    .map(|n| n as u32)
                    .ok_or_else(|| StreamerError::Protocol("createStream failed".into()))?;
                break;
            }
        }

        tracing::debug!(id = %self.info.id, path = %publish_path, "rtmp > publish");
        let av_msg_sid = self.av_msg_sid;
        self.write_command_msg(
            8,
            av_msg_sid,
            &[
                Amf0Value::String("publish".into()),
                Amf0Value::Number(transid),
                Amf0Value::Null,
                Amf0Value::String(publish_path),
            ],
        )
        .await?;
        self.flush_write().await?;

        loop {
            self.poll_msg().await?;
            if self.got_command && self.command_name == "onStatus" {
                let code = self
                    .command_params
                    .first()
                    .and_then(|v| v.as_object())
                    .and_then(|o| amf0::object_get(o, "code"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match code {
                    "NetStream.Publish.Start" => break,
                    "NetStream.Publish.StreamDuplicated" => {
                        return Err(StreamerError::duplicate_stream(&self.info.stream_name));
                    }
                    other => {
                        return Err(StreamerError::Protocol(format!("publish failed: code={other}")));
                    }
                }
            }
        }

        self.writing = true;
        self.publishing = true;
        self.stage = STAGE_COMMAND_DONE;
        Ok(())
    }

    /// Client role: connect, createStream, play; leaves the connection
    /// reading.
    pub async fn connect_play(&mut self) -> Result<()> {
        let (connect_path, play_path) = self
            .url
            .as_ref()
            .map(urlutil::split_path)
            .unwrap_or_default();

        self.write_connect(&connect_path).await?;

        tracing::debug!(id = %self.info.id, "rtmp > createStream");
        self.write_command_msg(
            3,
            0,
            &[
                Amf0Value::String("createStream".into()),
                Amf0Value::Number(2.0),
                Amf0Value::Null,
            ],
        )
        .await?;
        self.write_set_buffer_length(0, 100).await?;
        self.flush_write().await?;

        loop {
            self.poll_msg().await?;
            if self.got_command && self.command_name == "_result" {
                self.av_msg_sid = self
                    .command_params
                    .first()
                    .and_then(|v| v.as_number())
                    .map(|n| n as u32)
                    .ok_or_else(|| StreamerError::Protocol("createStream failed".into()))?;
                break;
            }
        }

        tracing::debug!(path = %play_path, "rtmp > play");
        let av_msg_sid = self.av_msg_sid;
        self.write_command_msg(
            8,
            av_msg_sid,
            &[
                Amf0Value::String("play".into()),
                Amf0Value::Number(0.0),
                Amf0Value::Null,
                Amf0Value::String(play_path),
            ],
        )
        .await?;
        self.flush_write().await?;

        self.reading = true;
        self.playing = true;
        self.stage = STAGE_COMMAND_DONE;
        Ok(())
    }

    // ---- stage machine ----

    async fn probe(&mut self) -> Result<()> {
        while !self.prober.probed() {
            let (t, ts) = self.poll_av_tag().await?;
            self.prober.push_tag(t, ts as i32)?;
        }
        self.streams = self.prober.streams.clone();
        self.stage = STAGE_CODEC_DATA_DONE;
        Ok(())
    }

    async fn prepare(&mut self, stage: u8, flags: Option<Prepare>) -> Result<()> {
        while self.stage < stage {
            match self.stage {
                0 => {
                    if self.opts.is_server {
                        self.handshake_server().await?;
                    } else {
                        self.handshake_client().await?;
                    }
                }
                STAGE_HANDSHAKE_DONE => {
                    if self.opts.is_server {
                        self.read_connect().await?;
                    } else if flags == Some(Prepare::Reading) {
                        self.connect_play().await?;
                    } else {
                        self.connect_publish().await?;
                    }
                }
                STAGE_COMMAND_DONE => {
                    if flags == Some(Prepare::Reading) {
                        self.probe().await?;
                    } else {
                        return Err(StreamerError::Protocol(
                            "call write_header() before write_packet()".into(),
                        ));
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Runs the connection through handshake and command exchange
    /// without touching codec data.
    pub async fn prepare_command_done(&mut self) -> Result<()> {
        self.prepare(STAGE_COMMAND_DONE, None).await
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

/// Builds the connection [`Info`] from the connect/publish paths the
/// way the server command flow sees them.
fn create_info(tc_url: &str, cpath: &str, ppath: &str) -> Result<Info> {
    // some encoders append backslash-delimited junk to the path
    let ppath = ppath.split('\\').next().unwrap_or(ppath);

    let cpath_segs: Vec<&str> = cpath.split('/').filter(|s| !s.is_empty()).collect();
    let (cpath_domain, app) = match cpath_segs[..] {
        [domain, app] => (Some(domain), app),
        [app] => (None, app),
        _ => (None, cpath),
    };

    let mut info = Info {
        app: app.to_string(),
        ..Default::default()
    };

    if let Ok(tu) = Url::parse(tc_url) {
        if let Some(host) = tu.host_str() {
            info.domain = host.to_string();
            if let Some(port) = tu.port() {
                info.domain = format!("{}:{}", info.domain, port);
            }
        }
    }

    let spe_host = ppath
        .split_once('?')
        .map(|(_, q)| q)
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("speHost=").map(|v| v.to_string()))
        })
        .unwrap_or_default();
    if !spe_host.is_empty() {
        info.domain = spe_host;
    } else if let Some(domain) = cpath_domain {
        info.domain = domain.to_string();
    }
    info.domain = urlutil::peel_off_port_1935(&info.domain).to_string();

    info.stream_name = urlutil::resolve_stream_name(ppath);
    info.id = urlutil::extract_stream_id(&info.stream_name);
    info.raw_url = format!("rtmp://{}/{}/{}", info.domain, info.app, ppath);
    Ok(info)
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> av::Demuxer for Conn<S> {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        self.prepare(STAGE_CODEC_DATA_DONE, Some(Prepare::Reading)).await?;
        Ok(self.streams.clone())
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        self.prepare(STAGE_CODEC_DATA_DONE, Some(Prepare::Reading)).await?;

        if let Some(pkt) = self.prober.pop_packet() {
            return Ok(pkt);
        }

        loop {
            let (t, ts) = self.poll_av_tag().await?;
            let Some(mut pkt) = self.prober.tag_to_packet(&t, ts as i32) else {
                continue;
            };

            if pkt.is_sequence_header() {
                // a sequence-header tag carries codec config; emit it
                // only when the bytes actually moved
                let changed = self.prober.header_changed(&t).map_err(|e| {
                    StreamerError::Protocol(format!("failed to resolve sequence header: {e}"))
                })?;
                if changed {
                    self.streams = self.prober.streams.clone();
                    pkt.header_changed = true;
                    tracing::info!(
                        task_id = %self.prober.task_id,
                        tag_type = t.tag_type,
                        "sequence header changed"
                    );
                    return Ok(pkt);
                }
                tracing::info!(
                    task_id = %self.prober.task_id,
                    tag_type = t.tag_type,
                    "same sequence header, ignored"
                );
                continue;
            }

            if pkt.is_script_data() {
                // only used to make the sink refresh its headers
                pkt.header_changed = true;
                return Ok(pkt);
            }

            if pkt.is_key_frame {
                self.prober.dig_key_frame(&pkt.data);
            }
            return Ok(pkt);
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> av::Muxer for Conn<S> {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<()> {
        self.prepare(STAGE_COMMAND_DONE, Some(Prepare::Writing)).await?;

        if streams.is_empty() {
            return Ok(());
        }

        let metadata = flv::new_metadata_by_streams(streams)?;
        let av_msg_sid = self.av_msg_sid;
        self.write_data_msg(
            5,
            av_msg_sid,
            &[
                Amf0Value::String("onMetaData".into()),
                Amf0Value::EcmaArray(metadata),
            ],
        )
        .await?;

        tracing::info!(
            id = %self.info.id,
            domain = %self.info.domain,
            streams = streams.len(),
            "rtmp write header"
        );

        for stream in streams {
            let t = flv::codec_data_to_tag(stream)?;
            self.write_av_tag(&t, 0).await?;
        }
        self.flush_write().await?;

        self.streams = streams.to_vec();
        self.stage = STAGE_CODEC_DATA_DONE;
        Ok(())
    }

    async fn write_packet(&mut self, pkt: Packet) -> Result<()> {
        self.prepare(STAGE_CODEC_DATA_DONE, Some(Prepare::Writing)).await?;

        if pkt.idx >= self.streams.len() {
            return Err(StreamerError::InvalidData(format!(
                "packet idx {} out of range for {} streams",
                pkt.idx,
                self.streams.len()
            )));
        }

        let stream = &self.streams[pkt.idx];
        if self.opts.video_header_check && pkt.is_video() && !stream.is_video() {
            return Err(StreamerError::InvalidData(
                "video packet type does not match codec data".into(),
            ));
        }
        if pkt.is_audio() && !stream.is_audio() {
            return Err(StreamerError::InvalidData(
                "audio packet type does not match codec data".into(),
            ));
        }

        let (t, ts) = flv::packet_to_tag(&pkt, stream);
        self.write_av_tag(&t, ts).await?;
        self.flush_write().await?;
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<()> {
        self.flush_write().await
    }
}
