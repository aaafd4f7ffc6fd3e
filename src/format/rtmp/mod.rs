//! RTMP protocol engine: handshake, chunk stream, AMF0 command
//! dispatch, and the publish/play state machine.

pub mod chunk;
pub mod conn;
pub mod handshake;
pub mod options;

pub use conn::{dial, Conn};
pub use options::{Hook, Options};

use crate::format::flv::amf0::{Amf0Object, Amf0Value};
use lazy_static::lazy_static;

/// Default RTMP listen port.
pub const DEFAULT_PORT: u16 = 1935;

/// Connection identity derived from the connect/publish/play exchange.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub domain: String,
    pub app: String,
    pub stream_name: String,
    /// Stream name with the domain-specific prefix trimmed.
    pub id: String,
    pub raw_url: String,
    pub is_publishing: bool,
    pub is_playing: bool,
}

fn on_status(code: &str, description: &str) -> Amf0Object {
    vec![
        ("level".into(), Amf0Value::String("status".into())),
        ("code".into(), Amf0Value::String(code.into())),
        ("description".into(), Amf0Value::String(description.into())),
    ]
}

lazy_static! {
    /// `onStatus` body accepting a publish.
    pub static ref AMF_ON_STATUS_PUBLISH_START: Amf0Object =
        on_status("NetStream.Publish.Start", "Start publishing");
    /// `onStatus` body rejecting a publish with a bad name.
    pub static ref AMF_ON_STATUS_PUBLISH_BAD_NAME: Amf0Object =
        on_status("NetStream.Publish.BadName", "Failed publishing");
    /// `onStatus` body rejecting a duplicated stream.
    pub static ref AMF_ON_STATUS_PUBLISH_STREAM_DUPLICATED: Amf0Object =
        on_status("NetStream.Publish.StreamDuplicated", "Stream duplicated");
}
