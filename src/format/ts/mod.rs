//! MPEG-TS container: 188-byte packetization, PAT/PMT tables, PES
//! framing, muxer/demuxer, and the HLS-style segment cache.

pub mod cache;
pub mod demuxer;
pub mod muxer;
pub mod pes;
pub mod types;

pub use cache::{TsCache, TsItem};
pub use demuxer::Demuxer;
pub use muxer::Muxer;
pub use types::{TsWriter, TS_PACKET_SIZE};
