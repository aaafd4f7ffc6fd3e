//! End-to-end relay scenarios over in-memory transports.

use bytes::Bytes;
use std::time::Duration;
use streamer::av::{CodecData, DataType, Demuxer, Muxer, Packet, Transport};
use streamer::codec::aac::{AacCodecData, Mpeg4AudioConfig};
use streamer::codec::h264::H264CodecData;
use streamer::error::StreamerError;
use streamer::format::rtmp::{Conn, Options};
use streamer::format::{flv, ts};
use streamer::queue::Queue;
use tokio_util::sync::CancellationToken;

fn h264_stream() -> CodecData {
    let sps = Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1e, 0xa9, 0x18, 0x3c, 0x1f]);
    let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
    CodecData::H264(H264CodecData::from_sps_and_pps(sps, pps).unwrap())
}

fn aac_stream() -> CodecData {
    CodecData::AAC(AacCodecData::from_config(Mpeg4AudioConfig {
        object_type: 2,
        sample_rate_index: 4,
        sample_rate: 44100,
        channel_config: 2,
    }))
}

fn video_pkt(i: u64, key_every: u64) -> Packet {
    let mut pkt = Packet::new(vec![0, 0, 0, 2, 0x41, i as u8])
        .with_idx(0)
        .with_data_type(DataType::Video)
        .with_time(Duration::from_millis(i * 33));
    pkt.is_key_frame = i % key_every == 0;
    if pkt.is_key_frame {
        pkt.data = Bytes::from(vec![0, 0, 0, 2, 0x65, i as u8]);
    }
    pkt
}

fn audio_pkt(i: u64) -> Packet {
    Packet::new(vec![0x21, i as u8])
        .with_idx(1)
        .with_data_type(DataType::Audio)
        .with_time(Duration::from_millis(i * 23))
}

/// FLV source published over RTMP: the server side of the duplex pipe
/// receives the same codec config and packet timeline the client sent.
#[tokio::test]
async fn rtmp_publish_delivers_packets_bit_faithfully() {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);

    let frames: u64 = 60;

    let server = tokio::spawn(async move {
        let mut conn = Conn::new(server_end, Options::default().with_server(true));
        let streams = conn.streams().await.expect("server probe");

        let mut video = Vec::new();
        let mut audio = Vec::new();
        loop {
            match conn.read_packet().await {
                Ok(pkt) => {
                    if pkt.is_video() {
                        video.push(pkt);
                    } else if pkt.is_audio() {
                        audio.push(pkt);
                    }
                }
                Err(StreamerError::EndOfStream) => break,
                Err(e) => panic!("server read: {e}"),
            }
        }
        (conn.info(), streams, video, audio)
    });

    // client: handshake, publish, headers, packets
    let mut conn = Conn::new(client_end, Options::default().with_server(false));
    conn.set_tc_url("rtmp://relay.example.com/live/33872_room-9").unwrap();
    conn.handshake_client().await.expect("handshake");
    conn.connect_publish().await.expect("publish");

    let streams = vec![h264_stream(), aac_stream()];
    conn.write_header(&streams).await.expect("write header");
    for i in 0..frames {
        conn.write_packet(video_pkt(i, 30)).await.expect("write video");
        conn.write_packet(audio_pkt(i)).await.expect("write audio");
    }
    conn.write_trailer().await.expect("trailer");
    drop(conn);

    let (info, probed, video, audio) = server.await.expect("server task");

    assert_eq!(info.app, "live");
    assert_eq!(info.stream_name, "33872_room-9");
    assert_eq!(info.id, "room-9");
    assert!(info.is_publishing);

    assert_eq!(probed.len(), 2);
    assert_eq!(
        probed[0].sequence_header_bytes(),
        streams[0].sequence_header_bytes()
    );
    assert_eq!(
        probed[1].sequence_header_bytes(),
        streams[1].sequence_header_bytes()
    );

    assert_eq!(video.len() as u64, frames);
    assert_eq!(audio.len() as u64, frames);

    let mut last = Duration::ZERO;
    for (i, pkt) in video.iter().enumerate() {
        assert!(pkt.time >= last, "video timestamps must be monotonic");
        last = pkt.time;
        assert_eq!(pkt.time, Duration::from_millis(i as u64 * 33));
        assert_eq!(pkt.is_key_frame, i % 30 == 0);
    }
    for (i, pkt) in audio.iter().enumerate() {
        assert_eq!(pkt.time, Duration::from_millis(i as u64 * 23));
    }
}

/// RTMP play: the server pushes a header and packets, the playing
/// client receives them through its own probe.
#[tokio::test]
async fn rtmp_play_roundtrip() {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);

    let server = tokio::spawn(async move {
        let mut conn = Conn::new(server_end, Options::default().with_server(true));
        conn.prepare_command_done().await.expect("server command flow");
        assert!(conn.is_playing());

        let streams = vec![h264_stream(), aac_stream()];
        conn.write_header(&streams).await.expect("server header");
        for i in 0..20u64 {
            conn.write_packet(video_pkt(i, 10)).await.expect("server video");
            conn.write_packet(audio_pkt(i)).await.expect("server audio");
        }
        conn.write_trailer().await.expect("server trailer");
    });

    let mut conn = Conn::new(client_end, Options::default().with_server(false));
    conn.set_tc_url("rtmp://relay.example.com/live/room-7").unwrap();
    conn.handshake_client().await.expect("handshake");
    conn.connect_play().await.expect("play");

    let streams = conn.streams().await.expect("client probe");
    assert_eq!(streams.len(), 2);

    let mut received = 0;
    loop {
        match conn.read_packet().await {
            Ok(_) => received += 1,
            Err(StreamerError::EndOfStream) => break,
            Err(e) => panic!("client read: {e}"),
        }
    }
    // everything except the sequence headers arrives as packets
    assert_eq!(received, 40);

    server.await.expect("server task");
}

/// TS segment relayed into FLV through the transport: packet counts and
/// codec configuration survive the container switch.
#[tokio::test]
async fn ts_demux_to_flv_mux() {
    // build a TS segment: 1 IDR + 29 P frames
    let streams = vec![h264_stream()];
    let mut segment = Vec::new();
    {
        let mut muxer = ts::Muxer::new(std::io::Cursor::new(&mut segment));
        muxer.write_header(&streams).await.unwrap();
        for i in 0..30u64 {
            muxer.write_packet(video_pkt(i, 30)).await.unwrap();
        }
        muxer.write_trailer().await.unwrap();
    }

    let mut demuxer = ts::Demuxer::new(std::io::Cursor::new(segment));
    let mut flv_out = Vec::new();
    {
        let mut muxer = flv::Muxer::new(std::io::Cursor::new(&mut flv_out));
        let cancel = CancellationToken::new();
        Transport::new()
            .copy_av(&cancel, &mut muxer, &mut demuxer)
            .await
            .unwrap();
    }

    // read the FLV back and count
    let mut demuxer = flv::Demuxer::new(std::io::Cursor::new(flv_out));
    let probed = demuxer.streams().await.unwrap();
    assert_eq!(probed.len(), 1);
    assert_eq!(
        probed[0].sequence_header_bytes(),
        streams[0].sequence_header_bytes()
    );

    let mut count = 0;
    loop {
        match demuxer.read_packet().await {
            Ok(pkt) => {
                assert!(pkt.is_video());
                count += 1;
            }
            Err(StreamerError::EndOfStream) => break,
            Err(e) => panic!("flv read: {e}"),
        }
    }
    assert_eq!(count, 30);
}

/// Multiple cursors attached to one live queue each see the full stream
/// independently, and a slice cursor only its substream.
#[tokio::test]
async fn concurrent_cursors_over_live_queue() {
    let queue = Queue::new();
    queue.set_sid("room-1");
    queue.write_header(&[h264_stream(), aac_stream()]).unwrap();

    // cursors attach before the stream starts
    let mut default_cursor = queue.cursor_by_delayed_frame("default", "room-1", 0, 0);
    let mut offset_cursor = queue.cursor_by_delayed_frame("offset", "room-1", 0, 0);
    offset_cursor.set_time_offset(1_000);
    let mut slice_cursor = queue.cursor_by_slice_req("slice", "room-1", 0, 0, 4);

    let frames: u64 = 100;
    let is_key = |i: u64| i == 1 || i % 25 == 0;

    let readers = vec![
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                match default_cursor.read_packet().await {
                    Ok(_) => n += 1,
                    Err(StreamerError::EndOfStream) => break,
                    Err(e) => panic!("default cursor: {e}"),
                }
            }
            n
        }),
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                match offset_cursor.read_packet().await {
                    Ok(_) => n += 1,
                    Err(StreamerError::EndOfStream) => break,
                    Err(e) => panic!("offset cursor: {e}"),
                }
            }
            n
        }),
        tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                match slice_cursor.read_packet().await {
                    Ok(pkt) => ids.push(pkt.slice_id),
                    Err(StreamerError::EndOfStream) => break,
                    Err(e) => panic!("slice cursor: {e}"),
                }
            }
            assert!(!ids.is_empty());
            assert!(ids.iter().all(|id| id % 4 == 0));
            ids.len() as u64
        }),
    ];

    let writer_queue = queue.clone();
    let writer = tokio::spawn(async move {
        for i in 1..=frames {
            let mut a = audio_pkt(i);
            a.slice_id = i;
            writer_queue.write_packet(a).unwrap();
            let mut v = video_pkt(i, u64::MAX);
            v.is_key_frame = is_key(i);
            v.slice_id = i;
            writer_queue.write_packet(v).unwrap();
            // yield so cursors interleave with the writer
            if i % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        writer_queue.close();
    });

    writer.await.unwrap();
    let counts: Vec<u64> = futures::future::join_all(readers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    // whole-stream cursors initialize at a keyframe near the live edge
    // and then see every packet; with the writer at most a few frames
    // ahead they read the bulk of the stream
    assert!(counts[0] >= 150 && counts[0] <= frames * 2, "default read {}", counts[0]);
    assert!(counts[1] >= 150 && counts[1] <= frames * 2, "offset read {}", counts[1]);
    // the slice cursor saw only every 4th slice (audio + video each)
    assert!(counts[2] > 0 && counts[2] <= frames / 2 + 2);
}

/// Header checkpoints written mid-stream reach cursors as
/// `header_changed` packets exactly once, and the transport re-copies
/// headers at that point.
#[tokio::test]
async fn header_change_propagates_through_transport() {
    let queue = Queue::new();
    let first = vec![h264_stream(), aac_stream()];
    queue.write_header(&first).unwrap();
    // a single keyframe at the start keeps the cursor reading from the
    // head across both checkpoints
    for i in 0..10u64 {
        queue.write_packet(video_pkt(i, 100)).unwrap();
    }

    // new codec config mid-stream
    let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40]);
    let pps = Bytes::from_static(&[0x68, 0xeb, 0xe3, 0xcb]);
    let second = vec![
        CodecData::H264(H264CodecData::from_sps_and_pps(sps, pps).unwrap()),
        aac_stream(),
    ];
    queue.write_header(&second).unwrap();
    for i in 10..20u64 {
        queue.write_packet(video_pkt(i, 100)).unwrap();
    }
    queue.close();

    let mut cursor = queue.cursor_by_delayed_frame("viewer", "room-1", 0, 0);
    let mut changes = 0;
    let mut received = 0;
    loop {
        match cursor.read_packet().await {
            Ok(pkt) => {
                received += 1;
                if pkt.header_changed {
                    changes += 1;
                    let headers = cursor.headers().await.unwrap();
                    assert_eq!(headers.len(), 2);
                }
            }
            Err(StreamerError::EndOfStream) => break,
            Err(e) => panic!("cursor read: {e}"),
        }
    }

    assert_eq!(received, 20);
    assert_eq!(changes, 2);

    // after crossing the second checkpoint the cursor serves the new
    // codec bytes
    let headers = cursor.headers().await.unwrap();
    assert_eq!(
        headers[0].sequence_header_bytes(),
        second[0].sequence_header_bytes()
    );
}
