//! FLV tag and file-header byte codecs.

use crate::error::{Result, StreamerError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Audio tag type.
pub const TAG_AUDIO: u8 = 8;
/// Video tag type.
pub const TAG_VIDEO: u8 = 9;
/// Script-data (metadata) tag type.
pub const TAG_SCRIPTDATA: u8 = 18;

/// Fixed tag header length (type + size + timestamp + stream id).
pub const TAG_HEADER_LENGTH: usize = 11;
/// Largest codec sub-header: video frame/codec byte + packet type +
/// 24-bit composition time.
pub const MAX_TAG_SUB_HEADER_LENGTH: usize = 5;
/// FLV file header plus the first back-pointer.
pub const FILE_HEADER_LENGTH: usize = 13;

pub const SOUND_MP3: u8 = 2;
pub const SOUND_AAC: u8 = 10;

pub const SOUND_5_5KHZ: u8 = 0;
pub const SOUND_11KHZ: u8 = 1;
pub const SOUND_22KHZ: u8 = 2;
pub const SOUND_44KHZ: u8 = 3;

pub const SOUND_8BIT: u8 = 0;
pub const SOUND_16BIT: u8 = 1;

pub const SOUND_MONO: u8 = 0;
pub const SOUND_STEREO: u8 = 1;

pub const AAC_SEQHDR: u8 = 0;
pub const AAC_RAW: u8 = 1;

pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;

pub const VIDEO_H264: u8 = 7;

pub const AVC_SEQHDR: u8 = 0;
pub const AVC_NALU: u8 = 1;
pub const AVC_EOS: u8 = 2;

/// File-header flag: stream carries video.
pub const FILE_HAS_VIDEO: u8 = 0x01;
/// File-header flag: stream carries audio.
pub const FILE_HAS_AUDIO: u8 = 0x04;

/// One FLV tag: the type, decoded codec sub-header fields, and the
/// payload after the sub-header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    pub tag_type: u8,

    // audio
    pub sound_format: u8,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    pub aac_packet_type: u8,

    // video
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    /// pts − dts in milliseconds.
    pub composition_time: i32,

    pub data: Bytes,
}

impl Tag {
    pub fn is_key_frame(&self) -> bool {
        self.tag_type == TAG_VIDEO && self.frame_type == FRAME_KEY
    }

    /// True for AVC/AAC sequence-header tags.
    pub fn is_seq_header(&self) -> bool {
        match self.tag_type {
            TAG_VIDEO => self.avc_packet_type == AVC_SEQHDR,
            TAG_AUDIO => self.sound_format == SOUND_AAC && self.aac_packet_type == AAC_SEQHDR,
            _ => false,
        }
    }

    /// Parses the codec sub-header from the front of a tag body,
    /// returning the bytes it occupied. The payload is not copied.
    pub fn parse_header(&mut self, b: &[u8]) -> Result<usize> {
        match self.tag_type {
            TAG_AUDIO => {
                if b.is_empty() {
                    return Err(StreamerError::Parser("audio tag body empty".into()));
                }
                self.sound_format = b[0] >> 4;
                self.sound_rate = (b[0] >> 2) & 0x3;
                self.sound_size = (b[0] >> 1) & 0x1;
                self.sound_type = b[0] & 0x1;
                if self.sound_format == SOUND_AAC {
                    if b.len() < 2 {
                        return Err(StreamerError::Parser("AAC tag missing packet type".into()));
                    }
                    self.aac_packet_type = b[1];
                    Ok(2)
                } else {
                    Ok(1)
                }
            }
            TAG_VIDEO => {
                if b.len() < 5 {
                    return Err(StreamerError::Parser("video tag body too short".into()));
                }
                self.frame_type = b[0] >> 4;
                self.codec_id = b[0] & 0x0f;
                self.avc_packet_type = b[1];
                let cts = ((b[2] as u32) << 16) | ((b[3] as u32) << 8) | b[4] as u32;
                // 24-bit signed
                self.composition_time = if cts & 0x80_0000 != 0 {
                    (cts | 0xff00_0000) as i32
                } else {
                    cts as i32
                };
                Ok(5)
            }
            TAG_SCRIPTDATA => Ok(0),
            other => Err(StreamerError::Parser(format!("unknown tag type {other}"))),
        }
    }

    /// Writes the codec sub-header into `b`, returning its length.
    pub fn fill_header(&self, b: &mut [u8]) -> usize {
        match self.tag_type {
            TAG_AUDIO => {
                b[0] = (self.sound_format << 4)
                    | ((self.sound_rate & 0x3) << 2)
                    | ((self.sound_size & 0x1) << 1)
                    | (self.sound_type & 0x1);
                if self.sound_format == SOUND_AAC {
                    b[1] = self.aac_packet_type;
                    2
                } else {
                    1
                }
            }
            TAG_VIDEO => {
                b[0] = (self.frame_type << 4) | (self.codec_id & 0x0f);
                b[1] = self.avc_packet_type;
                let cts = self.composition_time as u32;
                b[2] = (cts >> 16) as u8;
                b[3] = (cts >> 8) as u8;
                b[4] = cts as u8;
                5
            }
            _ => 0,
        }
    }
}

/// Builds the 9-byte FLV file header plus the zero back-pointer.
pub fn fill_file_header(flags: u8) -> Bytes {
    let mut b = BytesMut::with_capacity(FILE_HEADER_LENGTH);
    b.put_slice(b"FLV");
    b.put_u8(1);
    b.put_u8(flags);
    b.put_u32(9);
    b.put_u32(0); // PreviousTagSize0
    b.freeze()
}

/// Serializes one tag (header, sub-header, payload, back-pointer) into a
/// buffer.
pub fn marshal_tag(tag: &Tag, ts: i32) -> Bytes {
    let mut sub = [0u8; MAX_TAG_SUB_HEADER_LENGTH];
    let sublen = tag.fill_header(&mut sub);
    let data_size = sublen + tag.data.len();

    let mut b = BytesMut::with_capacity(TAG_HEADER_LENGTH + data_size + 4);
    b.put_u8(tag.tag_type);
    b.put_u8((data_size >> 16) as u8);
    b.put_u8((data_size >> 8) as u8);
    b.put_u8(data_size as u8);
    let ts = ts as u32;
    b.put_u8((ts >> 16) as u8);
    b.put_u8((ts >> 8) as u8);
    b.put_u8(ts as u8);
    b.put_u8((ts >> 24) as u8); // timestamp extension
    b.put_slice(&[0, 0, 0]); // stream id
    b.put_slice(&sub[..sublen]);
    b.put_slice(&tag.data);
    b.put_u32((TAG_HEADER_LENGTH + data_size) as u32);
    b.freeze()
}

/// Writes one tag to an async writer.
pub async fn write_tag<W: AsyncWrite + Unpin>(w: &mut W, tag: &Tag, ts: i32) -> Result<()> {
    let b = marshal_tag(tag, ts);
    w.write_all(&b).await?;
    Ok(())
}

/// Parses the 11-byte tag header, returning tag type, payload size and
/// timestamp.
pub fn parse_tag_header(b: &[u8]) -> Result<(u8, usize, i32)> {
    if b.len() < TAG_HEADER_LENGTH {
        return Err(StreamerError::Parser("FLV tag header truncated".into()));
    }
    let tag_type = b[0];
    match tag_type {
        TAG_AUDIO | TAG_VIDEO | TAG_SCRIPTDATA => {}
        other => return Err(StreamerError::Parser(format!("FLV tag type {other} invalid"))),
    }
    let data_size = ((b[1] as usize) << 16) | ((b[2] as usize) << 8) | b[3] as usize;
    let ts = ((b[7] as u32) << 24) | ((b[4] as u32) << 16) | ((b[5] as u32) << 8) | b[6] as u32;
    Ok((tag_type, data_size, ts as i32))
}

/// Reads one tag and its back-pointer from an async reader.
pub async fn read_tag<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Tag, i32)> {
    let mut hdr = [0u8; TAG_HEADER_LENGTH];
    if let Err(e) = r.read_exact(&mut hdr).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(StreamerError::EndOfStream);
        }
        return Err(e.into());
    }
    let (tag_type, data_size, ts) = parse_tag_header(&hdr)?;

    let mut body = vec![0u8; data_size];
    r.read_exact(&mut body).await?;

    let mut tag = Tag {
        tag_type,
        ..Default::default()
    };
    let sublen = tag.parse_header(&body)?;
    tag.data = Bytes::from(body).slice(sublen..);

    let mut back = [0u8; 4];
    r.read_exact(&mut back).await?;

    Ok((tag, ts))
}

/// Reads and validates the FLV file header, returning its flags.
pub async fn read_file_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8> {
    let mut hdr = [0u8; FILE_HEADER_LENGTH];
    if let Err(e) = r.read_exact(&mut hdr).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(StreamerError::EndOfStream);
        }
        return Err(e.into());
    }
    if &hdr[..3] != b"FLV" {
        return Err(StreamerError::Parser("FLV signature mismatch".into()));
    }
    Ok(hdr[4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[tokio::test]
    async fn tag_round_trip_video() {
        let tag = Tag {
            tag_type: TAG_VIDEO,
            frame_type: FRAME_KEY,
            codec_id: VIDEO_H264,
            avc_packet_type: AVC_NALU,
            composition_time: 33,
            data: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x88]),
            ..Default::default()
        };

        let mut buf = Vec::new();
        write_tag(&mut buf, &tag, 0x12345).await.unwrap();
        let (back, ts) = read_tag(&mut Cursor::new(buf)).await.unwrap();

        assert_eq!(back, tag);
        assert_eq!(ts, 0x12345);
    }

    #[tokio::test]
    async fn tag_round_trip_audio_large_ts() {
        let tag = Tag {
            tag_type: TAG_AUDIO,
            sound_format: SOUND_AAC,
            sound_rate: SOUND_44KHZ,
            sound_size: SOUND_16BIT,
            sound_type: SOUND_STEREO,
            aac_packet_type: AAC_RAW,
            data: Bytes::from_static(&[1, 2, 3, 4]),
            ..Default::default()
        };

        // above the 24-bit boundary, exercises the timestamp extension
        let ts = 0x0100_0001;
        let mut buf = Vec::new();
        write_tag(&mut buf, &tag, ts).await.unwrap();
        let (back, read_ts) = read_tag(&mut Cursor::new(buf)).await.unwrap();

        assert_eq!(back, tag);
        assert_eq!(read_ts, ts);
    }

    #[tokio::test]
    async fn tag_round_trip_max_i32_ts() {
        let tag = Tag {
            tag_type: TAG_VIDEO,
            frame_type: FRAME_INTER,
            codec_id: VIDEO_H264,
            avc_packet_type: AVC_NALU,
            data: Bytes::from_static(&[9]),
            ..Default::default()
        };
        let ts = i32::MAX;
        let mut buf = Vec::new();
        write_tag(&mut buf, &tag, ts).await.unwrap();
        let (_, read_ts) = read_tag(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(read_ts, ts);
    }

    #[test]
    fn negative_composition_time() {
        let tag = Tag {
            tag_type: TAG_VIDEO,
            frame_type: FRAME_INTER,
            codec_id: VIDEO_H264,
            avc_packet_type: AVC_NALU,
            composition_time: -5,
            data: Bytes::new(),
            ..Default::default()
        };
        let mut b = [0u8; 5];
        tag.fill_header(&mut b);
        let mut back = Tag {
            tag_type: TAG_VIDEO,
            ..Default::default()
        };
        back.parse_header(&b).unwrap();
        assert_eq!(back.composition_time, -5);
    }

    #[tokio::test]
    async fn file_header_flags() {
        let hdr = fill_file_header(FILE_HAS_VIDEO | FILE_HAS_AUDIO);
        assert_eq!(hdr.len(), FILE_HEADER_LENGTH);
        let flags = read_file_header(&mut Cursor::new(hdr.to_vec())).await.unwrap();
        assert_eq!(flags, FILE_HAS_VIDEO | FILE_HAS_AUDIO);

        let bad = b"FLX\x01\x05\x00\x00\x00\x09\x00\x00\x00\x00".to_vec();
        assert!(read_file_header(&mut Cursor::new(bad)).await.is_err());
    }
}
