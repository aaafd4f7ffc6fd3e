//! Packet filters applied between a demuxer and its consumer.
//!
//! The file pusher loops its source, so timestamps restart from zero on
//! every pass; [`FixTime`] splices the passes into one monotonic
//! timeline and [`Walltime`] paces delivery to real time.

use super::{CodecData, Demuxer, Packet};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

const FORWARD_JUMP_LIMIT: Duration = Duration::from_millis(500);

/// A mutation applied to each packet read from a demuxer.
#[async_trait]
pub trait Filter: Send {
    async fn filter(&mut self, streams: &[CodecData], pkt: &mut Packet) -> Result<()>;
}

/// Repairs discontinuous timestamps: a backward jump or a forward jump
/// larger than 500 ms continues from the previous timestamp instead.
#[derive(Default)]
pub struct FixTime {
    pub make_increment: bool,
    offset_ms: i64,
    last_time: Option<Duration>,
}

impl FixTime {
    pub fn new(make_increment: bool) -> Self {
        Self {
            make_increment,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Filter for FixTime {
    async fn filter(&mut self, _streams: &[CodecData], pkt: &mut Packet) -> Result<()> {
        if !self.make_increment {
            return Ok(());
        }

        let raw_ms = pkt.time.as_millis() as i64 + self.offset_ms;
        let mut t = Duration::from_millis(raw_ms.max(0) as u64);

        if let Some(last) = self.last_time {
            if t < last || t > last + FORWARD_JUMP_LIMIT {
                self.offset_ms += last.as_millis() as i64 - raw_ms;
                t = last;
            }
        }

        self.last_time = Some(t);
        pkt.time = t;
        Ok(())
    }
}

/// Delays each packet until its timestamp has elapsed on the wall clock,
/// anchored at the first packet seen.
#[derive(Default)]
pub struct Walltime {
    base: Option<Instant>,
}

impl Walltime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Filter for Walltime {
    async fn filter(&mut self, _streams: &[CodecData], pkt: &mut Packet) -> Result<()> {
        let base = *self.base.get_or_insert_with(Instant::now);
        let target = base + pkt.time;
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        Ok(())
    }
}

/// Wraps a demuxer and runs every packet through a filter chain.
pub struct FilterDemuxer<D: Demuxer> {
    pub demuxer: D,
    pub filters: Vec<Box<dyn Filter>>,
    streams: Vec<CodecData>,
}

impl<D: Demuxer> FilterDemuxer<D> {
    pub fn new(demuxer: D, filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            demuxer,
            filters,
            streams: Vec::new(),
        }
    }

    /// Replaces the wrapped demuxer, keeping filter state (used when the
    /// pusher reopens a looping file).
    pub fn set_demuxer(&mut self, demuxer: D) {
        self.demuxer = demuxer;
    }
}

#[async_trait]
impl<D: Demuxer> Demuxer for FilterDemuxer<D> {
    async fn streams(&mut self) -> Result<Vec<CodecData>> {
        self.streams = self.demuxer.streams().await?;
        Ok(self.streams.clone())
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        let mut pkt = self.demuxer.read_packet().await?;
        for f in &mut self.filters {
            f.filter(&self.streams, &mut pkt).await?;
        }
        Ok(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn fix_time_splices_loops() {
        let mut fix = FixTime::new(true);
        let streams = vec![];

        let mut times = Vec::new();
        // two passes over a 3-frame file: 0, 40, 80, then 0, 40, 80 again
        for ms in [0u64, 40, 80, 0, 40, 80] {
            let mut pkt = Packet::new(vec![]).with_time(Duration::from_millis(ms));
            fix.filter(&streams, &mut pkt).await.unwrap();
            times.push(pkt.time.as_millis() as u64);
        }

        assert_eq!(times, vec![0, 40, 80, 80, 120, 160]);
    }

    #[tokio::test]
    async fn fix_time_absorbs_large_forward_jump() {
        let mut fix = FixTime::new(true);
        let streams = vec![];

        let mut pkt = Packet::new(vec![]).with_time(Duration::from_millis(100));
        fix.filter(&streams, &mut pkt).await.unwrap();
        let mut pkt2 = Packet::new(vec![]).with_time(Duration::from_millis(5_000));
        fix.filter(&streams, &mut pkt2).await.unwrap();

        assert_eq!(pkt2.time, pkt.time);
    }
}
