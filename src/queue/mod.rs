//! The live buffer queue: a GOP-aware ring of packets written by one
//! producer and read by any number of independent cursors.
//!
//! ```text
//!        time
//! ----------------->
//!
//! V-A-V-V-A-V-V-A-V-V
//! |                 |
//! head             tail
//! oldest          latest
//! ```
//!
//! Eviction keeps at most `max_gop_count` complete GOPs (a GOP is always
//! dropped wholly, so the head never dangles mid-GOP) and at most
//! `max_pkt_count` packets. A parallel list of codec-header checkpoints
//! records every header write; each packet remembers the checkpoint that
//! was active when it was queued so cursors can re-emit headers at the
//! right position.

pub mod buf;
pub mod cursor;

pub use buf::{Buf, BufPos};
pub use cursor::QueueCursor;

use crate::av::{self, CodecData, Packet};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Default number of GOPs retained.
pub const DEFAULT_GOP_COUNT: usize = 6;
/// Default number of packets retained.
pub const DEFAULT_PKT_COUNT: usize = 2000;
/// Audio-only windows longer than this make confirmed-packet seeks fall
/// back to the audio path.
pub const MIN_PURE_AUDIO_DURATION: Duration = Duration::from_secs(10);

/// A codec-configuration checkpoint: the stream set that became active
/// at ring position `begin_at`.
#[derive(Clone)]
pub struct Header {
    pub datas: Vec<CodecData>,
    pub begin_at: BufPos,
}

/// A point-in-time snapshot of queue state.
#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    pub pkt_count: u32,
    pub loss_pkt_count: u64,
    pub gop_count: u32,
    pub video_count: u32,
    pub audio_count: u32,
    pub head_pos: i64,
    pub tail_pos: i64,
    pub closed: bool,
}

pub(crate) struct QueueInner {
    pub(crate) buf: Buf,
    pub(crate) headers: Vec<Header>,
    pub(crate) videoidx: Option<usize>,
    pub(crate) closed: bool,

    pub(crate) max_gop_count: usize,
    pub(crate) max_pkt_count: usize,
    pub(crate) cur_gop_count: usize,
    pub(crate) cur_video_count: usize,
    pub(crate) cur_audio_count: usize,
    pub(crate) loss_pkt_count: u64,

    pub(crate) sid: String,
}

impl QueueInner {
    fn account_pop(&mut self, pkt: &Packet) {
        if pkt.is_video() {
            self.cur_video_count -= 1;
            if pkt.is_key_frame {
                self.cur_gop_count -= 1;
            }
        } else if pkt.is_audio() {
            self.cur_audio_count -= 1;
        }
    }

    fn head_is_gop_start(&self) -> bool {
        self.buf
            .get(self.buf.head())
            .map(|p| p.is_video() && p.is_key_frame)
            .unwrap_or(false)
    }
}

/// The live buffer queue. Shared through an `Arc`; the producer writes,
/// cursors created by the `cursor_by_*` constructors read.
pub struct Queue {
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) notify: Notify,
}

impl Queue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                buf: Buf::new(),
                headers: Vec::new(),
                videoidx: None,
                closed: false,
                max_gop_count: DEFAULT_GOP_COUNT,
                max_pkt_count: DEFAULT_PKT_COUNT,
                cur_gop_count: 0,
                cur_video_count: 0,
                cur_audio_count: 0,
                loss_pkt_count: 0,
                sid: String::new(),
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    pub fn set_max_gop_count(&self, n: usize) {
        self.lock().max_gop_count = n;
    }

    pub fn set_max_pkt_count(&self, n: usize) {
        self.lock().max_pkt_count = n;
    }

    pub fn set_sid(&self, sid: impl Into<String>) {
        self.lock().sid = sid.into();
    }

    pub fn pkt_count(&self) -> usize {
        let inner = self.lock();
        inner.cur_video_count + inner.cur_audio_count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Records a codec-configuration checkpoint at the current tail.
    ///
    /// Consecutive writes at the same tail (video and audio headers are
    /// often written separately) replace each other. When only one
    /// family is supplied but a previous checkpoint had the other, the
    /// missing family is carried forward so late joiners always get a
    /// complete set.
    pub fn write_header(&self, streams: &[CodecData]) -> Result<()> {
        let mut inner = self.lock();

        let mut datas = streams.to_vec();
        if datas.len() == 1 {
            if let Some(prev) = inner.headers.last() {
                let have_video = datas[0].is_video();
                if let Some(carried) = prev
                    .datas
                    .iter()
                    .find(|d| d.is_video() != have_video)
                    .cloned()
                {
                    tracing::info!(
                        sid = %inner.sid,
                        lost_header = if have_video { "audio" } else { "video" },
                        "repairing lost header family"
                    );
                    datas.push(carried);
                }
            }
        }

        let tail = inner.buf.tail();
        match inner.headers.iter().position(|h| h.begin_at == tail) {
            Some(i) => inner.headers[i].datas = datas.clone(),
            None => inner.headers.push(Header {
                datas: datas.clone(),
                begin_at: tail,
            }),
        }

        inner.videoidx = av::video_stream_index(&datas);

        drop(inner);
        self.notify.notify_waiters();
        tracing::debug!("queue header written");
        Ok(())
    }

    /// Pushes a packet at the tail and evicts from the head while the
    /// GOP or packet budget is exceeded. Old packets are discarded a
    /// whole GOP at a time.
    pub fn write_packet(&self, mut pkt: Packet) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }

        if let Some(last) = inner.headers.last() {
            pkt.header_begin_at = last.begin_at.0;
        }

        if pkt.is_video() {
            inner.cur_video_count += 1;
            if pkt.is_key_frame {
                inner.cur_gop_count += 1;
            }
        } else if pkt.is_audio() {
            inner.cur_audio_count += 1;
        }
        inner.buf.push(pkt);

        while inner.buf.count() > 1
            && (inner.cur_gop_count > inner.max_gop_count || inner.buf.count() >= inner.max_pkt_count)
        {
            let popped = inner.buf.pop();
            inner.account_pop(&popped);

            // drop the remainder of the GOP so the head lands on the
            // next keyframe
            while inner.buf.count() > 1 && inner.cur_gop_count > 0 && !inner.head_is_gop_start() {
                let popped = inner.buf.pop();
                inner.account_pop(&popped);
            }
        }

        // headers preceding the window are dropped, except the one still
        // active for the packet at head
        let head = inner.buf.head();
        let mut clear_point = inner.headers.len() as i64 - 1;
        while clear_point >= 0 {
            if head.ge(inner.headers[clear_point as usize].begin_at) {
                break;
            }
            clear_point -= 1;
        }
        if clear_point > 0 {
            inner.headers.drain(..clear_point as usize);
        }

        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Closes the queue: writes become no-ops and every cursor's next
    /// read, once drained, reports end-of-stream.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn stat(&self) -> Stat {
        let inner = self.lock();
        Stat {
            pkt_count: inner.buf.count() as u32,
            loss_pkt_count: inner.loss_pkt_count,
            gop_count: inner.cur_gop_count as u32,
            video_count: inner.cur_video_count as u32,
            audio_count: inner.cur_audio_count as u32,
            head_pos: inner.buf.head().0,
            tail_pos: inner.buf.tail().0,
            closed: inner.closed,
        }
    }
}

impl Queue {
    /// A muxer handle writing into this queue; a transport can pump any
    /// demuxer through it.
    pub fn writer(self: &Arc<Self>) -> QueueWriter {
        QueueWriter(self.clone())
    }
}

/// Muxer adapter over a shared queue.
pub struct QueueWriter(Arc<Queue>);

#[async_trait]
impl av::Muxer for QueueWriter {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<()> {
        self.0.write_header(streams)
    }

    async fn write_packet(&mut self, pkt: Packet) -> Result<()> {
        self.0.write_packet(pkt)
    }

    async fn write_trailer(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::DataType;
    use pretty_assertions::assert_eq;

    pub(crate) fn video_pkt(i: u64, key: bool) -> Packet {
        Packet::new(vec![i as u8])
            .with_idx(0)
            .with_data_type(DataType::Video)
            .with_key_flag(key)
            .with_time(Duration::from_millis(i * 33))
    }

    pub(crate) fn audio_pkt(i: u64) -> Packet {
        Packet::new(vec![i as u8])
            .with_idx(1)
            .with_data_type(DataType::Audio)
            .with_time(Duration::from_millis(i * 23))
    }

    #[test]
    fn gop_eviction_drops_whole_gops() {
        let q = Queue::new();
        q.set_max_gop_count(2);

        // 3 GOPs of 60 frames, one keyframe each
        for i in 0..180u64 {
            q.write_packet(video_pkt(i, i % 60 == 0)).unwrap();
        }

        let stat = q.stat();
        assert_eq!(stat.gop_count, 2);
        assert_eq!(stat.pkt_count, 120);
        assert_eq!(stat.head_pos, 60);
        assert_eq!(stat.tail_pos, 180);

        // the head is the second keyframe, not a dangling inter frame
        let inner = q.lock();
        let head_pkt = inner.buf.get(inner.buf.head()).unwrap();
        assert!(head_pkt.is_key_frame);
    }

    #[test]
    fn pkt_count_eviction_for_audio_only() {
        let q = Queue::new();
        q.set_max_pkt_count(100);
        for i in 0..500u64 {
            q.write_packet(audio_pkt(i)).unwrap();
        }
        let stat = q.stat();
        assert!(stat.pkt_count < 100);
        assert_eq!(stat.tail_pos, 500);
    }

    #[test]
    fn header_gc_keeps_active_header() {
        let q = Queue::new();
        q.set_max_gop_count(1);

        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        for i in 0..10u64 {
            q.write_packet(video_pkt(i, i % 5 == 0)).unwrap();
        }
        // a later header checkpoint
        q.write_header(&streams).unwrap();
        for i in 10..20u64 {
            q.write_packet(video_pkt(i, i % 5 == 0)).unwrap();
        }

        let inner = q.lock();
        assert!(!inner.headers.is_empty());
        // every retained packet can still resolve its header
        let min_begin = inner.headers.first().unwrap().begin_at;
        let mut pos = inner.buf.head();
        while inner.buf.is_valid_pos(pos) {
            let pkt = inner.buf.get(pos).unwrap();
            assert!(pkt.header_begin_at >= min_begin.0);
            pos += 1;
        }
    }

    #[test]
    fn header_family_repair() {
        let q = Queue::new();
        let video = crate::format::flv::tests::test_h264_codec_data();
        let audio = crate::format::flv::tests::test_aac_codec_data();

        q.write_header(&[video.clone(), audio.clone()]).unwrap();
        q.write_packet(video_pkt(0, true)).unwrap();
        // only video supplied: audio is carried forward
        q.write_header(&[video]).unwrap();

        let inner = q.lock();
        let last = inner.headers.last().unwrap();
        assert_eq!(last.datas.len(), 2);
        assert!(last.datas.iter().any(|d| d.is_audio()));
    }

    #[test]
    fn writes_after_close_are_noops() {
        let q = Queue::new();
        q.write_packet(video_pkt(0, true)).unwrap();
        q.close();
        q.write_packet(video_pkt(1, false)).unwrap();
        assert_eq!(q.stat().pkt_count, 1);
        assert!(q.stat().closed);
    }
}
