//! Connection options for RTMP clients and server-side sessions.

use super::Info;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when a peer issues `publish` or `play`; an error
/// rejects the request with `NetStream.Publish.StreamDuplicated`.
pub trait Hook: Send + Sync {
    fn on_play_or_publish(&self, info: &Info) -> Result<()>;
}

/// RTMP connection options.
#[derive(Clone)]
pub struct Options {
    pub dial_timeout: Duration,
    /// Every socket read and write must complete within this deadline.
    pub read_write_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Outgoing chunk size announced after the handshake.
    pub chunk_size: usize,
    pub role_id: String,
    pub is_server: bool,
    /// Reject packets whose type does not match their stream's codec.
    pub video_header_check: bool,
    pub tc_url: String,
    pub hook: Option<Arc<dyn Hook>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            read_write_timeout: Duration::from_secs(10),
            read_buffer_size: 4 * 1024,
            write_buffer_size: 4 * 1024,
            chunk_size: 9 * 1024 * 1024,
            role_id: String::new(),
            is_server: true,
            video_header_check: true,
            tc_url: String::new(),
            hook: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dial_timeout(mut self, d: Duration) -> Self {
        self.dial_timeout = d;
        self
    }

    pub fn with_read_write_timeout(mut self, d: Duration) -> Self {
        self.read_write_timeout = d;
        self
    }

    pub fn with_read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    pub fn with_write_buffer_size(mut self, n: usize) -> Self {
        self.write_buffer_size = n;
        self
    }

    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn with_role_id(mut self, role: impl Into<String>) -> Self {
        self.role_id = role.into();
        self
    }

    pub fn with_server(mut self, is_server: bool) -> Self {
        self.is_server = is_server;
        self
    }

    pub fn with_video_header_check(mut self, check: bool) -> Self {
        self.video_header_check = check;
        self
    }

    pub fn with_tc_url(mut self, url: impl Into<String>) -> Self {
        self.tc_url = url.into();
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = Some(hook);
        self
    }
}
