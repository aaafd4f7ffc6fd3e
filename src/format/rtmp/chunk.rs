//! Chunk-stream state and the type-0 chunk header writer.

/// Protocol control: set chunk size.
pub const MSG_TYPE_SET_CHUNK_SIZE: u8 = 1;
/// Protocol control: acknowledgement.
pub const MSG_TYPE_ACK: u8 = 3;
/// Protocol control: user control event.
pub const MSG_TYPE_USER_CONTROL: u8 = 4;
/// Protocol control: window acknowledgement size.
pub const MSG_TYPE_WINDOW_ACK_SIZE: u8 = 5;
/// Protocol control: set peer bandwidth.
pub const MSG_TYPE_SET_PEER_BANDWIDTH: u8 = 6;
/// Audio message.
pub const MSG_TYPE_AUDIO: u8 = 8;
/// Video message.
pub const MSG_TYPE_VIDEO: u8 = 9;
/// AMF3 data message.
pub const MSG_TYPE_DATA_AMF3: u8 = 15;
/// AMF3 command message.
pub const MSG_TYPE_COMMAND_AMF3: u8 = 17;
/// AMF0 data message.
pub const MSG_TYPE_DATA_AMF0: u8 = 18;
/// AMF0 command message.
pub const MSG_TYPE_COMMAND_AMF0: u8 = 20;

/// User-control event: stream begin.
pub const EVENT_STREAM_BEGIN: u16 = 0;
/// User-control event: set buffer length.
pub const EVENT_SET_BUFFER_LENGTH: u16 = 3;
/// User-control event: stream is recorded.
pub const EVENT_STREAM_IS_RECORDED: u16 = 4;

/// One-byte basic header plus the 11-byte type-0 message header. The
/// writer allocates csids <= 63 only, so the basic header is always one
/// byte.
pub const CHUNK_HEADER_LENGTH: usize = 12;
/// Timestamps above this go through the 4-byte extended field.
pub const FLV_TIMESTAMP_MAX: u32 = 0x00ff_ffff;

/// Per-csid receive state: the in-progress message and the header
/// fields type-1/2/3 chunks inherit.
#[derive(Default)]
pub struct ChunkStream {
    pub time_now: u32,
    pub time_delta: u32,
    pub has_time_ext: bool,
    pub msg_sid: u32,
    pub msg_type_id: u8,
    pub msg_hdr_type: u8,
    pub msg_data_len: u32,
    pub msg_data_left: u32,
    pub msg_data: Vec<u8>,
}

impl ChunkStream {
    /// Begins accumulating a new message of the current declared length.
    pub fn start(&mut self) {
        self.msg_data_left = self.msg_data_len;
        self.msg_data = vec![0; self.msg_data_len as usize];
    }
}

/// Fills a type-0 chunk header, returning its length. Timestamps beyond
/// [`FLV_TIMESTAMP_MAX`] write the sentinel plus the 4-byte extension.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   timestamp                   |message length |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     message length (cont)     |message type id| msg stream id |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           message stream id (cont)            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn fill_chunk_header(b: &mut [u8], csid: u32, timestamp: u32, msg_type_id: u8, msg_sid: u32, msg_data_len: usize) -> usize {
    let mut n = 0;
    b[n] = (csid as u8) & 0x3f;
    n += 1;

    let ts_field = timestamp.min(FLV_TIMESTAMP_MAX);
    b[n] = (ts_field >> 16) as u8;
    b[n + 1] = (ts_field >> 8) as u8;
    b[n + 2] = ts_field as u8;
    n += 3;

    b[n] = (msg_data_len >> 16) as u8;
    b[n + 1] = (msg_data_len >> 8) as u8;
    b[n + 2] = msg_data_len as u8;
    n += 3;

    b[n] = msg_type_id;
    n += 1;

    b[n..n + 4].copy_from_slice(&msg_sid.to_le_bytes());
    n += 4;

    if timestamp > FLV_TIMESTAMP_MAX {
        b[n..n + 4].copy_from_slice(&timestamp.to_be_bytes());
        n += 4;
    }

    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_header() {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 4];
        let n = fill_chunk_header(&mut b, 3, 0x1234, MSG_TYPE_COMMAND_AMF0, 0, 64);
        assert_eq!(n, CHUNK_HEADER_LENGTH);
        assert_eq!(b[0], 3); // type 0, csid 3
        assert_eq!(&b[1..4], &[0x00, 0x12, 0x34]);
        assert_eq!(&b[4..7], &[0, 0, 64]);
        assert_eq!(b[7], MSG_TYPE_COMMAND_AMF0);
        assert_eq!(&b[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn extended_timestamp_at_boundary() {
        let mut b = [0u8; CHUNK_HEADER_LENGTH + 4];

        // exactly at the sentinel: no extension
        let n = fill_chunk_header(&mut b, 7, FLV_TIMESTAMP_MAX, MSG_TYPE_VIDEO, 1, 10);
        assert_eq!(n, CHUNK_HEADER_LENGTH);

        // one past: sentinel in the 24-bit field, real value appended
        let ts = FLV_TIMESTAMP_MAX + 1;
        let n = fill_chunk_header(&mut b, 7, ts, MSG_TYPE_VIDEO, 1, 10);
        assert_eq!(n, CHUNK_HEADER_LENGTH + 4);
        assert_eq!(&b[1..4], &[0xff, 0xff, 0xff]);
        assert_eq!(&b[12..16], &ts.to_be_bytes());
    }
}
