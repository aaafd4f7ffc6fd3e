//! Queue cursors: independent read positions over the live buffer with
//! pluggable initial-positioning strategies.

use super::buf::{Buf, BufPos};
use super::{Queue, QueueInner, MIN_PURE_AUDIO_DURATION};
use crate::av::{self, CodecData, Packet};
use crate::error::{Result, StreamerError};
use crate::utils::time_to_ts;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

enum Step {
    Ready(Packet),
    Eof,
    Wait,
}

/// A cursor over a [`Queue`].
///
/// Reading never consumes queue contents; each cursor owns its position
/// and skips forward (counting losses) when the window moves past it.
pub struct QueueCursor {
    que: Arc<Queue>,
    id: String,
    sid: String,

    pos: BufPos,
    got_pos: bool,
    pre_inited: bool,
    read_count: u64,
    loss_pkt_count: u64,

    start_offset: usize,
    skip_frame_threshold: usize,
    time_offset_ms: i64,
    start_pts_ms: i64,

    enable_slice: bool,
    slice_start_id: u64,
    substream_id: u8,
    stream_base: u8,
    cur_at_slice_id: u64,
    last_send_slice_id: u64,

    cur_header_begin_at: i64,
}

impl Queue {
    fn new_cursor(self: &Arc<Self>, id: impl Into<String>, sid: impl Into<String>) -> QueueCursor {
        QueueCursor {
            que: self.clone(),
            id: id.into(),
            sid: sid.into(),
            pos: BufPos(0),
            got_pos: false,
            pre_inited: false,
            read_count: 0,
            loss_pkt_count: 0,
            start_offset: 0,
            skip_frame_threshold: 0,
            time_offset_ms: 0,
            start_pts_ms: 0,
            enable_slice: false,
            slice_start_id: 0,
            substream_id: 0,
            stream_base: 0,
            cur_at_slice_id: 0,
            last_send_slice_id: 0,
            cur_header_begin_at: -1,
        }
    }

    /// A cursor that starts `start_offset` video frames behind the tail,
    /// aligned to a keyframe, and re-initializes whenever it falls more
    /// than `skip_frame_threshold` frames behind.
    pub fn cursor_by_delayed_frame(
        self: &Arc<Self>,
        id: impl Into<String>,
        sid: impl Into<String>,
        start_offset: usize,
        skip_frame_threshold: usize,
    ) -> QueueCursor {
        let mut cursor = self.new_cursor(id, sid);
        cursor.start_offset = start_offset;
        cursor.skip_frame_threshold = skip_frame_threshold;
        cursor
    }

    /// A cursor positioned by slice id: the newest complete slice for
    /// `start_id` 0 or beyond the window, the oldest when the window has
    /// moved past `start_id`, otherwise the slice holding `start_id`.
    /// With a nonzero `stream_base`, reads are filtered to slices whose
    /// id is congruent to `substream_id`.
    pub fn cursor_by_slice_req(
        self: &Arc<Self>,
        id: impl Into<String>,
        sid: impl Into<String>,
        slice_start_id: u64,
        substream_id: u8,
        stream_base: u8,
    ) -> QueueCursor {
        let mut cursor = self.new_cursor(id, sid);
        cursor.enable_slice = true;
        cursor.slice_start_id = slice_start_id;
        cursor.substream_id = substream_id;
        cursor.stream_base = stream_base;
        cursor
    }
}

fn init_delayed_frame(buf: &Buf, videoidx: Option<usize>, start_offset: usize, adjust_to_last_keyframe: bool) -> BufPos {
    let mut i = buf.tail() - 1;
    let mut delayed = 0usize;
    let mut last_keyframe_pos = buf.tail();

    if let Some(vidx) = videoidx {
        while buf.is_valid_pos(i) {
            let pkt = buf.get(i).expect("valid pos");
            if pkt.idx == vidx && pkt.is_key_frame {
                if delayed >= start_offset {
                    break;
                }
                last_keyframe_pos = i;
            }
            delayed += 1;
            i = i - 1;
        }
    }

    if adjust_to_last_keyframe {
        if buf.is_valid_pos(i) {
            return i;
        }
        // still invalid when no keyframe is in the window yet; the
        // caller keeps waiting
        return last_keyframe_pos;
    }
    i
}

fn init_by_time_offset(buf: &Buf, videoidx: Option<usize>, time_offset_ms: i64, adjust_to_last_keyframe: bool) -> BufPos {
    let mut i = buf.tail() - 1;
    let mut last_keyframe_pos = buf.tail();

    if let (Some(vidx), true) = (videoidx, buf.is_valid_pos(i)) {
        let latest_pts = time_to_ts(buf.get(i).expect("valid pos").time) as i64;
        while buf.is_valid_pos(i) {
            let pkt = buf.get(i).expect("valid pos");
            if pkt.idx == vidx && pkt.is_key_frame {
                if latest_pts - time_to_ts(pkt.time) as i64 >= time_offset_ms {
                    break;
                }
                last_keyframe_pos = i;
            }
            i = i - 1;
        }
    }

    if adjust_to_last_keyframe {
        if buf.is_valid_pos(i) {
            return i;
        }
        return last_keyframe_pos;
    }
    i
}

fn init_by_start_pts(buf: &Buf, videoidx: Option<usize>, start_pts_ms: i64, adjust_to_last_keyframe: bool) -> BufPos {
    let mut i = buf.head();
    let mut last_keyframe_pos = buf.tail();

    if videoidx.is_some() && buf.is_valid_pos(i) {
        let vidx = videoidx.expect("videoidx");
        while buf.is_valid_pos(i) {
            let pkt = buf.get(i).expect("valid pos");
            if pkt.idx == vidx && pkt.is_key_frame {
                if time_to_ts(pkt.time) as i64 >= start_pts_ms {
                    break;
                }
                last_keyframe_pos = i;
            }
            i += 1;
        }
    }

    if adjust_to_last_keyframe {
        if buf.is_valid_pos(i) {
            return i;
        }
        return last_keyframe_pos;
    }
    i
}

fn init_slice(buf: &Buf, slice_start_id: u64) -> (BufPos, u64) {
    let mut max_slice_id = 0u64;
    let mut max_slice_pos: Option<BufPos> = None;
    let mut i = buf.tail() - 1;
    while buf.is_valid_pos(i) {
        let pkt = buf.get(i).expect("valid pos");
        if pkt.is_video() {
            max_slice_id = pkt.slice_id;
            // the slice starts right after the preceding video frame
            let mut j = i - 1;
            while buf.is_valid_pos(j) {
                if buf.get(j).expect("valid pos").is_video() {
                    max_slice_pos = Some(j + 1);
                    break;
                }
                j = j - 1;
            }
            if max_slice_pos.is_none() {
                max_slice_pos = Some(buf.head());
            }
            break;
        }
        i = i - 1;
    }
    let max_slice_pos = max_slice_pos.unwrap_or_else(|| buf.tail());

    // the second-oldest video frame bounds the oldest complete slice
    // (the very oldest may have lost its leading audio)
    let mut min_slice_id = 0u64;
    let mut min_slice_pos = buf.head();
    let mut i = buf.head();
    while buf.is_valid_pos(i) {
        let pkt = buf.get(i).expect("valid pos");
        if pkt.is_video() {
            min_slice_id = pkt.slice_id + 1;
            min_slice_pos = i + 1;
            break;
        }
        i += 1;
    }

    if slice_start_id == 0 || slice_start_id >= max_slice_id {
        return (max_slice_pos, max_slice_id);
    }
    if slice_start_id <= min_slice_id {
        return (min_slice_pos, min_slice_id);
    }

    let mut pos = min_slice_pos;
    let mut slice_id = slice_start_id;
    let mut i = min_slice_pos;
    while buf.is_valid_pos(i) {
        let pkt = buf.get(i).expect("valid pos");
        if pkt.is_video() {
            if slice_start_id - 1 == pkt.slice_id {
                pos = i + 1;
                break;
            }
            // the requested id was skipped; resume at the next slice
            if slice_start_id < pkt.slice_id {
                pos = i + 1;
                slice_id = pkt.slice_id;
                break;
            }
        }
        i += 1;
    }
    (pos, slice_id)
}

impl QueueCursor {
    /// Switches the initial positioning to a time offset (milliseconds
    /// behind the live edge).
    pub fn set_time_offset(&mut self, time_offset_ms: i64) {
        self.time_offset_ms = time_offset_ms;
    }

    /// Positions by absolute PTS: 0 keeps the default behavior, a
    /// negative value caches `|start_pts|` milliseconds, a positive one
    /// starts at the first keyframe at or after that timestamp.
    pub fn set_start_pts(&mut self, start_pts_ms: i64) {
        if start_pts_ms == 0 {
            return;
        }
        if start_pts_ms < 0 {
            self.set_time_offset(-start_pts_ms);
            return;
        }
        self.start_pts_ms = start_pts_ms;
    }

    pub fn update_option(&mut self, start_offset: usize, skip_frame_threshold: usize) {
        self.start_offset = start_offset;
        self.skip_frame_threshold = skip_frame_threshold;
    }

    /// Packets this cursor skipped because the window moved past them.
    pub fn loss_pkt_count(&self) -> u64 {
        self.loss_pkt_count
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub(crate) fn position(&self) -> BufPos {
        self.pos
    }

    /// Reads the next packet, waiting while the cursor is at the tail.
    /// Returns `EndOfStream` once the queue closes and the position is
    /// no longer serviceable.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            // register as a waiter before inspecting state so a
            // broadcast between the check and the await is not lost
            let que = self.que.clone();
            let notified = que.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut inner = que.lock();
                if self.enable_slice {
                    self.try_read_slice(&mut inner)
                } else {
                    self.try_read_whole(&mut inner)
                }
            };
            match step {
                Step::Ready(pkt) => return Ok(pkt),
                Step::Eof => return Err(StreamerError::EndOfStream),
                Step::Wait => notified.await,
            }
        }
    }

    /// The codec data this cursor should emit next: the checkpoint it is
    /// currently inside, falling back to the newest one before the first
    /// read. Waits until any header exists; `EndOfStream` when the queue
    /// closes first.
    pub async fn headers(&mut self) -> Result<Vec<CodecData>> {
        loop {
            let notified = self.que.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.que.lock();
                if !inner.headers.is_empty() {
                    let chosen = if self.cur_header_begin_at >= 0 {
                        inner
                            .headers
                            .iter()
                            .find(|h| h.begin_at.0 == self.cur_header_begin_at)
                    } else {
                        None
                    };
                    let header = chosen.or_else(|| inner.headers.last()).expect("non-empty");
                    tracing::info!(
                        id = %self.id,
                        sid = %self.sid,
                        cur_header_begin_at = self.cur_header_begin_at,
                        begin_at = header.begin_at.0,
                        streams = header.datas.len(),
                        "cursor read headers"
                    );
                    return Ok(header.datas.clone());
                }
                if inner.closed {
                    return Err(StreamerError::EndOfStream);
                }
            }
            notified.await;
        }
    }

    fn account_loss(&mut self, inner: &mut QueueInner) {
        if self.pos.lt(inner.buf.head()) {
            let lost = (inner.buf.head() - self.pos) as u64;
            self.loss_pkt_count += lost;
            inner.loss_pkt_count += lost;
        }
        if self.pos.gt(inner.buf.tail()) {
            self.pos = inner.buf.tail();
        }
    }

    fn mark_header_change(&mut self, pkt: &mut Packet) {
        if pkt.header_begin_at > self.cur_header_begin_at {
            pkt.header_changed = true;
            tracing::info!(
                id = %self.id,
                sid = %self.sid,
                cur_header_begin_at = self.cur_header_begin_at,
                pkt_header_begin_at = pkt.header_begin_at,
                "cursor resends header"
            );
            self.cur_header_begin_at = pkt.header_begin_at;
        }
    }

    fn pre_init(&mut self, inner: &QueueInner) -> Option<Step> {
        let buf = &inner.buf;
        self.pos = if self.start_pts_ms > 0 {
            init_by_start_pts(buf, inner.videoidx, self.start_pts_ms, true)
        } else if self.time_offset_ms > 0 {
            init_by_time_offset(buf, inner.videoidx, self.time_offset_ms, true)
        } else {
            init_delayed_frame(buf, inner.videoidx, self.start_offset, false)
        };

        tracing::info!(
            id = %self.id,
            sid = %self.sid,
            pos = self.pos.0,
            head = buf.head().0,
            tail = buf.tail().0,
            start_offset = self.start_offset,
            time_offset = self.time_offset_ms,
            start_pts = self.start_pts_ms,
            "cursor pre-init"
        );

        if buf.is_valid_pos(self.pos) {
            self.got_pos = true;
            self.pre_inited = true;
            return None;
        }
        if inner.closed {
            return Some(Step::Eof);
        }
        Some(Step::Wait)
    }

    fn pre_init_slice(&mut self, inner: &QueueInner) -> Option<Step> {
        let buf = &inner.buf;
        let (pos, slice_id) = init_slice(buf, self.slice_start_id);
        self.pos = pos;
        self.cur_at_slice_id = slice_id;

        tracing::info!(
            id = %self.id,
            sid = %self.sid,
            pos = self.pos.0,
            head = buf.head().0,
            tail = buf.tail().0,
            slice_start_id = self.slice_start_id,
            cur_at_slice_id = self.cur_at_slice_id,
            substream_id = self.substream_id,
            stream_base = self.stream_base,
            "cursor pre-init slice"
        );

        if buf.is_valid_pos(self.pos) {
            self.got_pos = true;
            self.pre_inited = true;
            return None;
        }
        if inner.closed {
            return Some(Step::Eof);
        }
        Some(Step::Wait)
    }

    fn try_read_whole(&mut self, inner: &mut QueueInner) -> Step {
        if !self.pre_inited {
            if let Some(step) = self.pre_init(inner) {
                return step;
            }
        }

        self.account_loss(inner);

        let behind = inner.buf.tail() - self.pos;
        let need_reinit = !self.got_pos
            || self.pos.lt(inner.buf.head())
            || (self.skip_frame_threshold > 0 && behind > self.skip_frame_threshold as i64);
        if need_reinit {
            let old_pos = self.pos;
            self.pos = init_delayed_frame(&inner.buf, inner.videoidx, self.start_offset, true);
            tracing::info!(
                id = %self.id,
                sid = %self.sid,
                old_pos = old_pos.0,
                pos = self.pos.0,
                head = inner.buf.head().0,
                tail = inner.buf.tail().0,
                threshold = self.skip_frame_threshold,
                "cursor re-init"
            );
            if inner.buf.is_valid_pos(self.pos) && self.pos.gt(old_pos) {
                self.got_pos = true;
            } else {
                self.got_pos = false;
                if inner.closed {
                    return Step::Eof;
                }
                tracing::warn!(
                    id = %self.id,
                    sid = %self.sid,
                    pos = self.pos.0,
                    "cursor re-init position invalid"
                );
                return Step::Wait;
            }
        }

        if inner.buf.is_valid_pos(self.pos) {
            let mut pkt = inner.buf.get(self.pos).expect("valid pos").clone();
            self.pos += 1;
            self.read_count += 1;
            self.mark_header_change(&mut pkt);
            return Step::Ready(pkt);
        }
        if inner.closed {
            return Step::Eof;
        }
        Step::Wait
    }

    fn try_read_slice(&mut self, inner: &mut QueueInner) -> Step {
        if !self.pre_inited {
            if let Some(step) = self.pre_init_slice(inner) {
                return step;
            }
        }

        loop {
            self.account_loss(inner);

            if self.pos.lt(inner.buf.head()) {
                // fell out of the window: resume just past the newest
                // video frame
                let mut found = None;
                let mut i = inner.buf.tail() - 1;
                while inner.buf.is_valid_pos(i) {
                    let pkt = inner.buf.get(i).expect("valid pos");
                    if pkt.is_video() {
                        found = Some((i + 1, pkt.slice_id + 1));
                        break;
                    }
                    i = i - 1;
                }
                match found {
                    Some((pos, slice_id)) if inner.buf.is_valid_pos(pos) => {
                        self.pos = pos;
                        self.cur_at_slice_id = slice_id;
                        self.got_pos = true;
                    }
                    _ => {
                        self.got_pos = false;
                        if inner.closed {
                            return Step::Eof;
                        }
                        tracing::warn!(
                            id = %self.id,
                            sid = %self.sid,
                            pos = self.pos.0,
                            "slice cursor re-init position invalid"
                        );
                        return Step::Wait;
                    }
                }
            }

            if inner.buf.is_valid_pos(self.pos) {
                let (slice_id, is_video, taken) = {
                    let pkt = inner.buf.get(self.pos).expect("valid pos");
                    let taken = self.stream_base == 0
                        || self.cur_at_slice_id % self.stream_base as u64 == self.substream_id as u64;
                    (pkt.slice_id, pkt.is_video(), taken)
                };

                let pkt = if taken {
                    let mut pkt = inner.buf.get(self.pos).expect("valid pos").clone();
                    self.read_count += 1;
                    if is_video {
                        let base = if self.stream_base == 0 { 1 } else { self.stream_base };
                        if self.last_send_slice_id != 0
                            && self.cur_at_slice_id != self.last_send_slice_id + base as u64
                        {
                            tracing::warn!(
                                id = %self.id,
                                sid = %self.sid,
                                last_send_slice_id = self.last_send_slice_id,
                                cur_at_slice_id = self.cur_at_slice_id,
                                "slice jump"
                            );
                        }
                        self.last_send_slice_id = self.cur_at_slice_id;
                    }
                    self.mark_header_change(&mut pkt);
                    Some(pkt)
                } else {
                    None
                };

                if is_video {
                    self.cur_at_slice_id = slice_id + 1;
                }
                self.pos += 1;

                match pkt {
                    Some(pkt) => return Step::Ready(pkt),
                    None => continue,
                }
            }

            if inner.closed {
                return Step::Eof;
            }
            return Step::Wait;
        }
    }

    /// Repositions at the latest video keyframe earlier than `t` (by
    /// wall-clock anchor); an audio-only window longer than 10 seconds
    /// seeks by audio instead.
    pub fn seek_to_confirmed_pkt(&mut self, confirmed_pkt_time: Duration) {
        enum Seek {
            Pos(BufPos),
            Audio,
            None,
        }

        let que = self.que.clone();
        let action = {
            let inner = que.lock();
            let buf = &inner.buf;

            let mut action = Seek::None;
            let mut idx = buf.tail() - 1;
            while idx.gt(buf.head()) {
                if let Some(pkt) = buf.get(idx) {
                    if pkt.earlier_than(confirmed_pkt_time) && pkt.is_video() && pkt.is_key_frame {
                        // a long pure-audio window would replay too much
                        // audio from here; seek by audio instead
                        action = if confirmed_pkt_time.saturating_sub(pkt.absolute_time)
                            > MIN_PURE_AUDIO_DURATION
                        {
                            Seek::Audio
                        } else {
                            Seek::Pos(idx)
                        };
                        break;
                    }
                }
                idx = idx - 1;
            }

            if matches!(action, Seek::None) {
                // fall back to the earliest keyframe in the window
                let mut idx = buf.head();
                while buf.is_valid_pos(idx) {
                    if let Some(pkt) = buf.get(idx) {
                        if pkt.is_video() && pkt.is_key_frame {
                            action = Seek::Pos(idx);
                            break;
                        }
                    }
                    idx += 1;
                }
            }
            action
        };

        match action {
            Seek::Pos(pos) => self.pos = pos,
            Seek::Audio => self.seek_to_confirmed_audio_pkt(confirmed_pkt_time),
            Seek::None => {}
        }
    }

    /// Repositions at the latest audio packet earlier than `t`, or the
    /// head when none qualifies.
    pub fn seek_to_confirmed_audio_pkt(&mut self, confirmed_pkt_time: Duration) {
        let que = self.que.clone();
        let inner = que.lock();
        let buf = &inner.buf;

        let mut idx = buf.tail() - 1;
        while idx.gt(buf.head()) {
            if let Some(pkt) = buf.get(idx) {
                if pkt.earlier_than(confirmed_pkt_time) && pkt.is_audio() {
                    self.pos = idx;
                    return;
                }
            }
            idx = idx - 1;
        }
        self.pos = buf.head();
    }
}

/// A cursor is a demuxer: headers come from the active checkpoint and
/// packets from the ring.
#[async_trait]
impl av::Demuxer for QueueCursor {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        self.headers().await
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        QueueCursor::read_packet(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{audio_pkt, video_pkt};
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn default_cursor_starts_at_latest_keyframe() {
        let q = Queue::new();
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        for i in 0..30u64 {
            q.write_packet(video_pkt(i, i % 10 == 0)).unwrap();
        }

        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 0, 0);
        let pkt = cursor.read_packet().await.unwrap();
        // start offset 0: latest keyframe (frame 20)
        assert!(pkt.is_key_frame);
        assert_eq!(pkt.time, Duration::from_millis(20 * 33));
    }

    #[tokio::test]
    async fn cursor_reads_in_order_and_sees_close() {
        let q = Queue::new();
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        // 150 frames, keyframe every 10
        for i in 0..150u64 {
            q.write_packet(video_pkt(i, i % 10 == 0)).unwrap();
        }
        q.close();

        // 100 frames behind the tail, aligned back to the keyframe at 40
        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 100, 0);
        let mut last = BufPos(-1);
        let mut n = 0;
        loop {
            match cursor.read_packet().await {
                Ok(_) => {
                    let pos = cursor.position();
                    assert!(pos.gt(last));
                    last = pos;
                    n += 1;
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(n, 110);
    }

    #[tokio::test]
    async fn start_pts_cursor_finds_keyframe_at_or_after() {
        let q = Queue::new();
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        // keyframes at 0ms, 330ms, 660ms
        for i in 0..30u64 {
            q.write_packet(video_pkt(i, i % 10 == 0)).unwrap();
        }

        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 0, 0);
        cursor.set_start_pts(300);
        let pkt = cursor.read_packet().await.unwrap();
        assert!(pkt.is_key_frame);
        assert_eq!(pkt.time, Duration::from_millis(330));
    }

    #[tokio::test]
    async fn header_changed_fires_once_per_checkpoint() {
        let q = Queue::new();
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        for i in 0..5u64 {
            q.write_packet(video_pkt(i, i == 0)).unwrap();
        }
        q.write_header(&streams).unwrap();
        for i in 5..10u64 {
            // no keyframe after the second checkpoint, so the cursor
            // starts at frame 0 and crosses both checkpoints
            q.write_packet(video_pkt(i, false)).unwrap();
        }
        q.close();

        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 0, 0);
        let mut changes = 0;
        loop {
            match cursor.read_packet().await {
                Ok(pkt) => {
                    if pkt.header_changed {
                        changes += 1;
                    }
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(changes, 2);
    }

    #[tokio::test]
    async fn lagging_cursor_counts_losses_and_reinits() {
        let q = Queue::new();
        q.set_max_gop_count(2);
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();

        for i in 0..10u64 {
            q.write_packet(video_pkt(i, i % 5 == 0)).unwrap();
        }

        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 0, 0);
        // initializes at the latest keyframe (frame 5)
        let first = cursor.read_packet().await.unwrap();
        assert!(first.is_key_frame);
        assert_eq!(first.time, Duration::from_millis(5 * 33));

        // the window slides far past the cursor while it sleeps
        for i in 10..40u64 {
            q.write_packet(video_pkt(i, i % 5 == 0)).unwrap();
        }

        let pkt = cursor.read_packet().await.unwrap();
        assert!(cursor.loss_pkt_count() > 0);
        // resumed at a keyframe, never a stale packet
        assert!(pkt.is_key_frame);
        assert!(pkt.time > first.time);
    }

    #[tokio::test]
    async fn slice_cursor_filters_substream() {
        let q = Queue::new();
        let streams = vec![
            crate::format::flv::tests::test_h264_codec_data(),
            crate::format::flv::tests::test_aac_codec_data(),
        ];
        q.write_header(&streams).unwrap();

        // slices: audio then video per slice id
        for i in 1..=40u64 {
            let mut a = audio_pkt(i);
            a.slice_id = i;
            q.write_packet(a).unwrap();
            let mut v = video_pkt(i, i % 8 == 1);
            v.slice_id = i;
            q.write_packet(v).unwrap();
        }
        q.close();

        let mut cursor = q.cursor_by_slice_req("c1", "s1", 2, 0, 4);
        let mut ids = Vec::new();
        loop {
            match cursor.read_packet().await {
                Ok(pkt) => ids.push(pkt.slice_id),
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| id % 4 == 0));
    }

    #[tokio::test]
    async fn seek_to_confirmed_pkt_finds_latest_earlier_keyframe() {
        let q = Queue::new();
        let streams = vec![crate::format::flv::tests::test_h264_codec_data()];
        q.write_header(&streams).unwrap();
        for i in 0..30u64 {
            let mut pkt = video_pkt(i, i % 10 == 0);
            pkt.absolute_time = Duration::from_millis(i * 33);
            q.write_packet(pkt).unwrap();
        }

        let mut cursor = q.cursor_by_delayed_frame("c1", "s1", 0, 0);
        cursor.seek_to_confirmed_pkt(Duration::from_millis(500));
        let inner = q.lock();
        let pkt = inner.buf.get(cursor.position()).unwrap();
        assert!(pkt.is_key_frame);
        assert_eq!(pkt.absolute_time, Duration::from_millis(330));
    }
}
