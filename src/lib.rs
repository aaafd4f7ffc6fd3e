//! # streamer - live-streaming relay toolkit
//!
//! A library (with a thin push/pull CLI) that ingests a live
//! audio/video stream in one container or protocol, buffers it in a
//! GOP-aware live-window queue, and re-emits it while preserving
//! timing, codec configuration, and keyframe semantics.
//!
//! ## Subsystems
//!
//! - [`codec`]: H.264 (NALU splitting, SPS/PPS/SEI decode,
//!   AVCDecoderConfigurationRecord) and AAC (ADTS, AudioSpecificConfig)
//!   parsing
//! - [`format::flv`] / [`format::ts`]: container muxers/demuxers with
//!   bidirectional tag/codec-data conversion
//! - [`format::rtmp`]: the RTMP engine - digest handshake, chunk
//!   stream, AMF0 commands, and the publish/play state machine
//! - [`queue`]: the live buffer queue with GOP-count retention and
//!   independent cursors (skip-to-keyframe, time-offset, start-PTS,
//!   slice subsets)
//! - [`av`]: packet/codec-data model, transport pumps, packet filters
//! - [`relay`]: push/pull runners and their lifecycle manager
//!
//! ## Pushing a file
//!
//! ```rust,no_run
//! use streamer::relay::{Manager, RtmpPusher};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> streamer::Result<()> {
//!     let manager = Manager::new();
//!     let mut pusher = RtmpPusher::new("rtmp://example.com/live/demo", "/data/demo.flv");
//!     manager.launch("demo", &mut pusher, Duration::from_secs(60)).await
//! }
//! ```
//!
//! ## Relaying through the live queue
//!
//! ```rust,no_run
//! use streamer::av::Transport;
//! use streamer::queue::Queue;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn relay(mut src: impl streamer::av::Demuxer) -> streamer::Result<()> {
//! let queue = Queue::new();
//! let cancel = CancellationToken::new();
//!
//! // one producer fills the queue...
//! let mut writer = queue.writer();
//! Transport::new().copy_av(&cancel, &mut writer, &mut src).await?;
//!
//! // ...while any number of cursors feed sinks independently
//! let mut cursor = queue.cursor_by_delayed_frame("viewer-1", "demo", 0, 0);
//! # let _ = cursor.read_packet().await?;
//! # Ok(())
//! # }
//! ```

/// Audio/Video base types and transport utilities.
pub mod av;

/// Codec parsers for H.264 and AAC.
pub mod codec;

/// Error types and utilities.
pub mod error;

/// Container and protocol implementations (FLV, MPEG-TS, RTMP, slice).
pub mod format;

/// HTTP push-hook dispatch.
pub mod hooks;

/// The live buffer queue and its cursors.
pub mod queue;

/// Push/pull relay runners and lifecycle management.
pub mod relay;

/// Common utilities: bit reader, CRC, URL helpers.
pub mod utils;

pub use error::{Result, StreamerError};
