//! Sliding cache of TS segments with M3U8 playlist generation and
//! optional on-disk dumps.

use crate::error::{Result, StreamerError};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Minimum number of segments kept regardless of the window.
pub const TS_CACHE_NUM_MIN: usize = 3;

/// One cached segment.
#[derive(Debug, Clone)]
pub struct TsItem {
    pub name: String,
    pub seq_num: u64,
    /// Segment duration in milliseconds.
    pub duration_ms: u32,
    pub data: Vec<u8>,
}

impl TsItem {
    pub fn new(name: impl Into<String>, duration_ms: u32, seq_num: u64, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            seq_num,
            duration_ms,
            data: data.to_vec(),
        }
    }
}

/// A per-stream TS segment cache.
///
/// With a nonzero `hls_window` (milliseconds) it keeps a sliding live
/// window and serves a live playlist; with a window of zero it records:
/// every segment is dumped to disk as it arrives and a VOD playlist is
/// produced by [`TsCache::dump_m3u8_playlist`].
pub struct TsCache {
    id: String,
    path: Option<PathBuf>,
    hls_window_ms: u32,

    order: VecDeque<String>,
    items: HashMap<String, TsItem>,

    first_ts_seq: u64,
    first_ts_timestamp: i64,
    ts_duration_max_ms: u32,

    m3u8_body: String,
}

impl TsCache {
    pub fn new(id: impl Into<String>, path: Option<PathBuf>, hls_window_ms: u32) -> Self {
        Self {
            id: id.into(),
            path,
            hls_window_ms,
            order: VecDeque::new(),
            items: HashMap::new(),
            first_ts_seq: 0,
            first_ts_timestamp: 0,
            ts_duration_max_ms: 0,
            m3u8_body: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record mode keeps nothing in memory and appends to the VOD
    /// playlist instead.
    pub fn is_record(&self) -> bool {
        self.hls_window_ms == 0
    }

    /// The current playlist body; empty until enough segments arrived.
    pub fn m3u8_playlist(&self) -> Result<&str> {
        if self.m3u8_body.is_empty() {
            return Err(StreamerError::InvalidData("m3u8 is empty".into()));
        }
        Ok(&self.m3u8_body)
    }

    /// Inserts one finished segment, evicting segments that fall out of
    /// the window and regenerating the playlist.
    pub fn set_item(&mut self, key: impl Into<String>, item: TsItem) {
        let key = key.into();

        if self.is_record() {
            if self.ts_duration_max_ms < item.duration_ms {
                self.ts_duration_max_ms = item.duration_ms;
            }
            if self.first_ts_seq == 0 {
                self.first_ts_seq = item.seq_num;
                self.first_ts_timestamp = chrono::Utc::now().timestamp();
            }
            self.dump_ts_file(&key, &item);
            let _ = write!(
                self.m3u8_body,
                "#EXTINF:{:.3},\n{}\n",
                item.duration_ms as f64 / 1000.0,
                item.name
            );
            return;
        }

        self.order.push_back(key.clone());
        self.items.insert(key, item);

        let mut total: u64 = self.items.values().map(|i| i.duration_ms as u64).sum();
        while total > self.hls_window_ms as u64 && self.items.len() > TS_CACHE_NUM_MIN {
            if let Some(old) = self.order.pop_front() {
                if let Some(item) = self.items.remove(&old) {
                    total -= item.duration_ms as u64;
                    tracing::info!(ts_file = %old, "evicting TS segment");
                }
            } else {
                break;
            }
        }

        self.gen_m3u8_playlist();
    }

    pub fn get_item(&self, key: &str) -> Result<&TsItem> {
        self.items
            .get(key)
            .ok_or_else(|| StreamerError::InvalidData(format!("no ts cached under {key}")))
    }

    /// Enough segments for a player to start.
    pub fn is_ready(&self) -> bool {
        self.items.len() >= TS_CACHE_NUM_MIN
    }

    fn gen_m3u8_playlist(&mut self) {
        self.m3u8_body.clear();
        if self.order.len() < 2 {
            return;
        }

        let mut max_duration = 0u32;
        let mut first_seq = None;
        let mut entries = String::new();
        // skip the first segment: it may already be evicted by the time
        // a player requests it
        for key in self.order.iter().skip(1) {
            if let Some(item) = self.items.get(key) {
                max_duration = max_duration.max(item.duration_ms);
                if first_seq.is_none() {
                    first_seq = Some(item.seq_num);
                }
                let _ = write!(entries, "#EXTINF:{:.3},\n{}\n", item.duration_ms as f64 / 1000.0, item.name);
            }
        }

        let _ = write!(
            self.m3u8_body,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-ALLOW-CACHE:NO\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n\n",
            max_duration / 1000 + 1,
            first_seq.unwrap_or(0)
        );
        self.m3u8_body.push_str(&entries);
    }

    /// Flushes the VOD playlist for a recording and resets the cache.
    pub fn dump_m3u8_playlist(&mut self) {
        let path = match &self.path {
            Some(p) if !self.m3u8_body.is_empty() => p.clone(),
            _ => return,
        };

        let mut out = String::new();
        let _ = write!(
            out,
            "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-VERSION:3\n#EXT-X-ALLOW-CACHE:YES\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n\n",
            self.ts_duration_max_ms / 1000 + 1,
            self.first_ts_seq
        );
        out.push_str(&self.m3u8_body);
        out.push_str("#EXT-X-ENDLIST\n");

        let m3u8_path = path.join(format!("{}_{}.m3u8", self.id, self.first_ts_timestamp));
        if let Err(e) = std::fs::write(&m3u8_path, out) {
            tracing::error!(stream_id = %self.id, path = %m3u8_path.display(), error = %e, "m3u8 dump failed");
        }
        self.reset();
    }

    fn dump_ts_file(&self, key: &str, item: &TsItem) {
        let path = match &self.path {
            Some(p) => p.join(&self.id),
            None => return,
        };
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::error!(stream_id = %self.id, error = %e, "ts dir create failed");
            return;
        }
        let ts_file = path.join(key);
        if let Err(e) = std::fs::write(&ts_file, &item.data) {
            tracing::error!(stream_id = %self.id, path = %ts_file.display(), error = %e, "ts dump failed");
        }
    }

    /// Drops every cached segment and the playlist state.
    pub fn reset(&mut self) {
        self.order.clear();
        self.items.clear();
        self.m3u8_body.clear();
        self.first_ts_seq = 0;
        self.ts_duration_max_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn live_playlist_fields() {
        let mut cache = TsCache::new("s1", None, 12_000);
        for i in 0..5u64 {
            let item = TsItem::new(format!("s1-{i}.ts"), 4_000, i, &[0x47]);
            cache.set_item(format!("s1-{i}.ts"), item);
        }

        // window 12s keeps at least TS_CACHE_NUM_MIN segments
        assert!(cache.is_ready());
        let body = cache.m3u8_playlist().unwrap();
        assert!(body.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-ALLOW-CACHE:NO\n"));
        assert!(body.contains("#EXT-X-TARGETDURATION:5\n"));
        assert!(body.contains("#EXTINF:4.000,\n"));
        // first listed segment is skipped
        assert!(!body.contains("s1-2.ts") || !body.contains("s1-1.ts"));
    }

    #[test]
    fn window_evicts_but_keeps_minimum() {
        let mut cache = TsCache::new("s1", None, 1_000);
        for i in 0..10u64 {
            let item = TsItem::new(format!("s1-{i}.ts"), 4_000, i, &[]);
            cache.set_item(format!("s1-{i}.ts"), item);
        }
        assert_eq!(cache.items.len(), TS_CACHE_NUM_MIN);
        assert!(cache.get_item("s1-9.ts").is_ok());
        assert!(cache.get_item("s1-0.ts").is_err());
    }

    #[test]
    fn record_mode_builds_vod_entries() {
        let mut cache = TsCache::new("rec", None, 0);
        assert!(cache.is_record());
        cache.set_item("rec-0.ts", TsItem::new("rec-0.ts", 5_200, 7, &[]));
        cache.set_item("rec-1.ts", TsItem::new("rec-1.ts", 4_100, 8, &[]));

        assert!(cache.m3u8_body.contains("#EXTINF:5.200,\nrec-0.ts\n"));
        assert_eq!(cache.first_ts_seq, 7);
        assert_eq!(cache.ts_duration_max_ms, 5_200);
    }
}
