use bytes::Bytes;
use std::time::Duration;

/// FLV-aligned payload categories carried by a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Video,
    Audio,
    ScriptData,
}

/// `avc_packet_type` / `aac_packet_type` value for a sequence header.
pub const PKT_SEQ_HEADER: u8 = 0;
/// `avc_packet_type` value for AVC NALU payloads (also AAC raw frames).
pub const PKT_AV_PAYLOAD: u8 = 1;
/// `avc_packet_type` value for AVC end-of-sequence.
pub const PKT_AVC_END_OF_SEQ: u8 = 2;

/// The unit of audio/video payload flowing between demuxers, the live
/// buffer queue, and muxers.
///
/// `data` holds AVCC-wrapped NALUs for video and a raw AAC frame for
/// audio; `idx` indexes the owning stream's codec-data list. A packet
/// with `avc_packet_type == PKT_SEQ_HEADER` carries codec configuration
/// only and has no timeline position.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Index into the stream's codec-data array.
    pub idx: usize,
    /// True for IDR video frames only.
    pub is_key_frame: bool,
    /// Payload category (FLV tag family).
    pub data_type: DataType,
    /// AVC packet type for video, AAC packet type for audio.
    pub avc_packet_type: u8,
    /// Decode timestamp relative to the stream origin.
    pub time: Duration,
    /// pts − dts for B-frame reordering; zero when absent.
    pub composition_time: Duration,
    /// Wall-clock-anchored time used by live-latency seeks; zero when
    /// unset.
    pub absolute_time: Duration,
    /// Payload bytes, shared by reference once queued.
    pub data: Bytes,
    /// Set by demuxers and cursors to make the transport re-emit headers
    /// before this packet.
    pub header_changed: bool,
    /// Ring-buffer coordinate of the codec header active when this packet
    /// was queued; -1 before queueing.
    pub header_begin_at: i64,
    /// Slice-framing id, when the stream carries slice metadata.
    pub slice_id: u64,
    /// Slices per frame, when the stream carries slice metadata.
    pub slice_frame_cnt: u16,
    /// Transport drops the packet without writing it.
    pub drop: bool,
}

impl Packet {
    /// Creates a packet with the given payload; all other fields take
    /// their defaults.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            idx: 0,
            is_key_frame: false,
            data_type: DataType::Video,
            avc_packet_type: PKT_AV_PAYLOAD,
            time: Duration::ZERO,
            composition_time: Duration::ZERO,
            absolute_time: Duration::ZERO,
            data: data.into(),
            header_changed: false,
            header_begin_at: -1,
            slice_id: 0,
            slice_frame_cnt: 0,
            drop: false,
        }
    }

    /// Sets the stream index, returning self for chaining.
    pub fn with_idx(mut self, idx: usize) -> Self {
        self.idx = idx;
        self
    }

    /// Sets the payload category, returning self for chaining.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Sets the key-frame flag, returning self for chaining.
    pub fn with_key_flag(mut self, is_key: bool) -> Self {
        self.is_key_frame = is_key;
        self
    }

    /// Sets the decode timestamp, returning self for chaining.
    pub fn with_time(mut self, time: Duration) -> Self {
        self.time = time;
        self
    }

    /// Sets the composition-time offset, returning self for chaining.
    pub fn with_composition_time(mut self, cts: Duration) -> Self {
        self.composition_time = cts;
        self
    }

    /// Sets the AVC/AAC packet type, returning self for chaining.
    pub fn with_avc_packet_type(mut self, t: u8) -> Self {
        self.avc_packet_type = t;
        self
    }

    pub fn is_video(&self) -> bool {
        self.data_type == DataType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.data_type == DataType::Audio
    }

    pub fn is_script_data(&self) -> bool {
        self.data_type == DataType::ScriptData
    }

    /// True when this packet carries codec configuration rather than
    /// samples.
    pub fn is_sequence_header(&self) -> bool {
        match self.data_type {
            DataType::Video | DataType::Audio => self.avc_packet_type == PKT_SEQ_HEADER,
            DataType::ScriptData => false,
        }
    }

    /// True when the packet's wall-clock anchor precedes `t`.
    pub fn earlier_than(&self, t: Duration) -> bool {
        self.absolute_time < t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_header_detection() {
        let pkt = Packet::new(vec![0u8; 4])
            .with_data_type(DataType::Video)
            .with_avc_packet_type(PKT_SEQ_HEADER);
        assert!(pkt.is_sequence_header());

        let pkt = Packet::new(vec![0u8; 4])
            .with_data_type(DataType::Audio)
            .with_avc_packet_type(PKT_AV_PAYLOAD);
        assert!(!pkt.is_sequence_header());

        let pkt = Packet::new(vec![]).with_data_type(DataType::ScriptData);
        assert!(!pkt.is_sequence_header());
    }
}
