//! AMF0 value codec used by RTMP command/data messages and FLV script
//! tags.

use crate::error::{Result, StreamerError};
use bytes::{BufMut, BytesMut};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0a;
const MARKER_LONG_STRING: u8 = 0x0c;

/// An AMF0 object: ordered key/value pairs. Ordering keeps serialized
/// output deterministic.
pub type Amf0Object = Vec<(String, Amf0Value)>;

/// One AMF0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Amf0Object),
    EcmaArray(Amf0Object),
    StrictArray(Vec<Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Amf0Object> {
        match self {
            Amf0Value::Object(o) | Amf0Value::EcmaArray(o) => Some(o),
            _ => None,
        }
    }
}

/// Looks a key up in an object.
pub fn object_get<'a>(obj: &'a Amf0Object, key: &str) -> Option<&'a Amf0Value> {
    obj.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Serialized length of a value in bytes.
pub fn len_amf0_val(v: &Amf0Value) -> usize {
    match v {
        Amf0Value::Number(_) => 9,
        Amf0Value::Boolean(_) => 2,
        Amf0Value::String(s) => {
            if s.len() <= u16::MAX as usize {
                3 + s.len()
            } else {
                5 + s.len()
            }
        }
        Amf0Value::Object(o) => 1 + obj_body_len(o) + 3,
        Amf0Value::EcmaArray(o) => 5 + obj_body_len(o) + 3,
        Amf0Value::StrictArray(items) => 5 + items.iter().map(len_amf0_val).sum::<usize>(),
        Amf0Value::Null | Amf0Value::Undefined => 1,
    }
}

fn obj_body_len(o: &Amf0Object) -> usize {
    o.iter().map(|(k, v)| 2 + k.len() + len_amf0_val(v)).sum()
}

/// Appends the serialized value to `buf`.
pub fn fill_amf0_val(buf: &mut BytesMut, v: &Amf0Value) {
    match v {
        Amf0Value::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(*b as u8);
        }
        Amf0Value::String(s) => {
            if s.len() <= u16::MAX as usize {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            } else {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            }
            buf.put_slice(s.as_bytes());
        }
        Amf0Value::Object(o) => {
            buf.put_u8(MARKER_OBJECT);
            fill_obj_body(buf, o);
        }
        Amf0Value::EcmaArray(o) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(o.len() as u32);
            fill_obj_body(buf, o);
        }
        Amf0Value::StrictArray(items) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                fill_amf0_val(buf, item);
            }
        }
        Amf0Value::Null => buf.put_u8(MARKER_NULL),
        Amf0Value::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

fn fill_obj_body(buf: &mut BytesMut, o: &Amf0Object) {
    for (k, v) in o {
        buf.put_u16(k.len() as u16);
        buf.put_slice(k.as_bytes());
        fill_amf0_val(buf, v);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

/// Parses one value from the front of `b`, returning it and the bytes
/// consumed.
pub fn parse_amf0_val(b: &[u8]) -> Result<(Amf0Value, usize)> {
    if b.is_empty() {
        return Err(StreamerError::Parser("AMF0 value truncated".into()));
    }

    let marker = b[0];
    let b = &b[1..];
    match marker {
        MARKER_NUMBER => {
            if b.len() < 8 {
                return Err(StreamerError::Parser("AMF0 number truncated".into()));
            }
            let n = f64::from_be_bytes(b[..8].try_into().unwrap());
            Ok((Amf0Value::Number(n), 9))
        }
        MARKER_BOOLEAN => {
            if b.is_empty() {
                return Err(StreamerError::Parser("AMF0 boolean truncated".into()));
            }
            Ok((Amf0Value::Boolean(b[0] != 0), 2))
        }
        MARKER_STRING => {
            let (s, n) = parse_short_string(b)?;
            Ok((Amf0Value::String(s), 1 + n))
        }
        MARKER_LONG_STRING => {
            if b.len() < 4 {
                return Err(StreamerError::Parser("AMF0 long string truncated".into()));
            }
            let len = u32::from_be_bytes(b[..4].try_into().unwrap()) as usize;
            if b.len() < 4 + len {
                return Err(StreamerError::Parser("AMF0 long string truncated".into()));
            }
            let s = String::from_utf8_lossy(&b[4..4 + len]).into_owned();
            Ok((Amf0Value::String(s), 5 + len))
        }
        MARKER_OBJECT => {
            let (obj, n) = parse_obj_body(b)?;
            Ok((Amf0Value::Object(obj), 1 + n))
        }
        MARKER_ECMA_ARRAY => {
            if b.len() < 4 {
                return Err(StreamerError::Parser("AMF0 ecma array truncated".into()));
            }
            let (obj, n) = parse_obj_body(&b[4..])?;
            Ok((Amf0Value::EcmaArray(obj), 5 + n))
        }
        MARKER_STRICT_ARRAY => {
            if b.len() < 4 {
                return Err(StreamerError::Parser("AMF0 strict array truncated".into()));
            }
            let count = u32::from_be_bytes(b[..4].try_into().unwrap()) as usize;
            let mut items = Vec::with_capacity(count.min(64));
            let mut off = 4;
            for _ in 0..count {
                let (item, n) = parse_amf0_val(&b[off..])?;
                items.push(item);
                off += n;
            }
            Ok((Amf0Value::StrictArray(items), 1 + off))
        }
        MARKER_NULL => Ok((Amf0Value::Null, 1)),
        MARKER_UNDEFINED => Ok((Amf0Value::Undefined, 1)),
        other => Err(StreamerError::Parser(format!("AMF0 marker {other:#04x} unsupported"))),
    }
}

fn parse_short_string(b: &[u8]) -> Result<(String, usize)> {
    if b.len() < 2 {
        return Err(StreamerError::Parser("AMF0 string truncated".into()));
    }
    let len = u16::from_be_bytes([b[0], b[1]]) as usize;
    if b.len() < 2 + len {
        return Err(StreamerError::Parser("AMF0 string truncated".into()));
    }
    let s = String::from_utf8_lossy(&b[2..2 + len]).into_owned();
    Ok((s, 2 + len))
}

fn parse_obj_body(b: &[u8]) -> Result<(Amf0Object, usize)> {
    let mut obj = Amf0Object::new();
    let mut off = 0;
    loop {
        let (key, n) = parse_short_string(&b[off..])?;
        off += n;
        if key.is_empty() {
            if off >= b.len() || b[off] != MARKER_OBJECT_END {
                return Err(StreamerError::Parser("AMF0 object missing end marker".into()));
            }
            off += 1;
            return Ok((obj, off));
        }
        let (val, n) = parse_amf0_val(&b[off..])?;
        off += n;
        obj.push((key, val));
    }
}

/// Parses every value in `b` back to back.
pub fn parse_amf0_vals(b: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut vals = Vec::new();
    let mut off = 0;
    while off < b.len() {
        let (v, n) = parse_amf0_val(&b[off..])?;
        vals.push(v);
        off += n;
    }
    Ok(vals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(v: Amf0Value) {
        let mut buf = BytesMut::new();
        fill_amf0_val(&mut buf, &v);
        assert_eq!(buf.len(), len_amf0_val(&v));
        let (back, n) = parse_amf0_val(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(back, v);
    }

    #[test]
    fn test_scalars() {
        round_trip(Amf0Value::Number(1935.5));
        round_trip(Amf0Value::Boolean(true));
        round_trip(Amf0Value::String("NetConnection.Connect.Success".into()));
        round_trip(Amf0Value::Null);
        round_trip(Amf0Value::Undefined);
    }

    #[test]
    fn test_object() {
        round_trip(Amf0Value::Object(vec![
            ("app".into(), Amf0Value::String("live".into())),
            ("capabilities".into(), Amf0Value::Number(31.0)),
            ("fpad".into(), Amf0Value::Boolean(false)),
        ]));
    }

    #[test]
    fn test_ecma_array_and_nested() {
        round_trip(Amf0Value::EcmaArray(vec![
            ("width".into(), Amf0Value::Number(640.0)),
            (
                "inner".into(),
                Amf0Value::Object(vec![("x".into(), Amf0Value::Null)]),
            ),
        ]));
        round_trip(Amf0Value::StrictArray(vec![
            Amf0Value::Number(1.0),
            Amf0Value::String("two".into()),
        ]));
    }

    #[test]
    fn test_command_sequence() {
        let mut buf = BytesMut::new();
        fill_amf0_val(&mut buf, &Amf0Value::String("connect".into()));
        fill_amf0_val(&mut buf, &Amf0Value::Number(1.0));
        fill_amf0_val(
            &mut buf,
            &Amf0Value::Object(vec![("app".into(), Amf0Value::String("live".into()))]),
        );

        let vals = parse_amf0_vals(&buf).unwrap();
        assert_eq!(vals.len(), 3);
        assert_eq!(vals[0].as_str(), Some("connect"));
        assert_eq!(vals[1].as_number(), Some(1.0));
        let obj = vals[2].as_object().unwrap();
        assert_eq!(object_get(obj, "app").unwrap().as_str(), Some("live"));
    }

    #[test]
    fn test_truncated_input() {
        assert!(parse_amf0_val(&[]).is_err());
        assert!(parse_amf0_val(&[MARKER_NUMBER, 1, 2]).is_err());
        assert!(parse_amf0_val(&[MARKER_STRING, 0, 5, b'a']).is_err());
    }
}
