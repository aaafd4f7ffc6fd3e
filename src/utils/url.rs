//! URL helpers for RTMP and HTTP-FLV addresses.
//!
//! Live URLs come in two path shapes: `/app/stream` and `/host/app/stream`
//! (the leading segment promotes to the host). A `speHost` query parameter,
//! when present, overrides the host, and a `:1935` port suffix is peeled off
//! for display and matching purposes.

use crate::error::{Result, StreamerError};
use url::Url;

/// The domain-specific stream-name prefix trimmed by [`extract_stream_id`].
pub const DEFAULT_STREAM_PREFIX: &str = "33872_";

/// The pieces of a live URL relevant to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveAddr {
    pub host: String,
    pub app: String,
    pub stream_name: String,
    pub raw_query: String,
}

/// Parses `rtmp://host[:port]/app/stream?query` (or the 4-segment
/// `/group/app/stream` form) into its host/app/stream parts.
pub fn parse_url_detail(uri: &str) -> Result<(Url, LiveAddr)> {
    let u = Url::parse(uri).map_err(|e| StreamerError::connect_url(format!("{uri}: {e}")))?;

    let mut addr = LiveAddr {
        host: u.host_str().unwrap_or_default().to_string(),
        raw_query: u.query().unwrap_or_default().to_string(),
        ..Default::default()
    };
    if let Some(port) = u.port() {
        if port != 1935 {
            addr.host = format!("{}:{}", addr.host, port);
        }
    }

    let segs: Vec<&str> = u.path().split('/').collect();
    match segs.len() {
        3 => {
            // "/app/stream"
            addr.app = segs[1].to_string();
            addr.stream_name = segs[2].to_string();
        }
        4 => {
            // "/host/app/stream"
            addr.host = segs[1].to_string();
            addr.app = segs[2].to_string();
            addr.stream_name = segs[3].to_string();
        }
        _ => {
            return Err(StreamerError::connect_url(format!("invalid path {}", u.path())));
        }
    }

    if let Some((_, spe_host)) = u.query_pairs().find(|(k, _)| k == "speHost") {
        if !spe_host.is_empty() {
            addr.host = spe_host.into_owned();
        }
    }
    addr.host = peel_off_port_1935(&addr.host).to_string();

    Ok((u, addr))
}

/// Splits an already-parsed URL path into connect path (app) and
/// publish/play path (stream), accepting both path shapes.
pub fn split_path(u: &Url) -> (String, String) {
    let path = match u.query() {
        Some(q) if !q.is_empty() => format!("{}?{}", u.path(), q),
        _ => u.path().to_string(),
    };
    let segs: Vec<&str> = path.split('/').collect();
    match segs.len() {
        3 => (segs[1].to_string(), segs[2].to_string()),
        4 => (segs[2].to_string(), segs[3].to_string()),
        _ => (String::new(), String::new()),
    }
}

/// Strips a trailing `:1935` from a host.
pub fn peel_off_port_1935(host: &str) -> &str {
    host.strip_suffix(":1935").unwrap_or(host)
}

/// Appends `:1935` when the host carries no port.
pub fn repair_host_with_port_1935(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:1935")
    }
}

/// Derives the stream ID from a stream name by trimming the configured
/// prefix. The query string, if present, is not part of the ID.
pub fn extract_stream_id(stream_name: &str) -> String {
    let name = stream_name.split('?').next().unwrap_or(stream_name);
    name.strip_prefix(DEFAULT_STREAM_PREFIX)
        .unwrap_or(name)
        .to_string()
}

/// Trims the query from a publish/play path.
pub fn resolve_stream_name(path: &str) -> String {
    path.split('?').next().unwrap_or_default().to_string()
}

/// Swaps the host of a live URL, collapsing a 4-segment path back to
/// `/app/stream`.
pub fn replace_url_host(raw_url: &str, host: &str) -> Result<String> {
    let mut u = Url::parse(raw_url).map_err(|e| StreamerError::connect_url(format!("{raw_url}: {e}")))?;
    u.set_host(Some(host))
        .map_err(|e| StreamerError::connect_url(format!("{host}: {e}")))?;
    let segs: Vec<String> = u.path().split('/').map(str::to_string).collect();
    if segs.len() == 4 {
        u.set_path(&format!("/{}/{}", segs[2], segs[3]));
    }
    Ok(u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple() {
        let (_, addr) = parse_url_detail("rtmp://example.com/live/abc").unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.app, "live");
        assert_eq!(addr.stream_name, "abc");
    }

    #[test]
    fn test_parse_group_path_promotes_host() {
        let (_, addr) = parse_url_detail("rtmp://1.2.3.4/cdn.example.com/live/abc").unwrap();
        assert_eq!(addr.host, "cdn.example.com");
        assert_eq!(addr.app, "live");
        assert_eq!(addr.stream_name, "abc");
    }

    #[test]
    fn test_spe_host_override_and_port_peel() {
        let (_, addr) =
            parse_url_detail("rtmp://a.com:1935/live/abc?speHost=b.com:1935").unwrap();
        assert_eq!(addr.host, "b.com");
        assert_eq!(addr.raw_query, "speHost=b.com:1935");
    }

    #[test]
    fn test_extract_stream_id() {
        assert_eq!(extract_stream_id("33872_room-1"), "room-1");
        assert_eq!(extract_stream_id("room-1?a=b"), "room-1");
    }

    #[test]
    fn test_repair_host() {
        assert_eq!(repair_host_with_port_1935("a.com"), "a.com:1935");
        assert_eq!(repair_host_with_port_1935("a.com:80"), "a.com:80");
    }

    #[test]
    fn test_replace_url_host() {
        let out = replace_url_host("rtmp://a.com/edge.b.com/live/s1", "c.com").unwrap();
        assert_eq!(out, "rtmp://c.com/live/s1");
    }
}
