//! End-to-end decode and encode scenarios against the reference device.
#![cfg(feature = "sim")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use qsvbridge_codec::mfx::QsvDecoder;
use qsvbridge_codec::mfx::QsvEncoder;
use qsvbridge_codec::sim::{SequenceHeader, SimConfig, SimLoader, SimStream};
use qsvbridge_codec::{
    errno, Codec, CodecError, DecoderConfig, EncodedPacket, EncoderConfig, ErrorKind, Packet, PicStruct,
    SystemAllocator, VideoDecoder, VideoEncoder, VideoFrame,
};

fn header() -> SequenceHeader {
    SequenceHeader::new(64, 48)
}

fn open_decoder(loader: SimLoader, config: DecoderConfig) -> QsvDecoder<SimLoader> {
    let extradata = SimStream::header_unit(header());
    QsvDecoder::open(loader, config, &extradata, Arc::new(SystemAllocator)).unwrap()
}

fn picture(fill: u8, pts: i64, dts: i64) -> Packet {
    Packet::new(SimStream::picture_unit(fill), Some(pts), Some(dts))
}

fn drain(decoder: &mut QsvDecoder<SimLoader>) -> Vec<VideoFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode(None).unwrap().frame {
        frames.push(frame);
    }
    frames
}

#[test]
fn test_frames_in_order_at_depth_one() {
    let mut decoder = open_decoder(
        SimLoader::new(SimConfig::default()),
        DecoderConfig::new(Codec::H264).async_depth(1),
    );
    for ts in 0..3 {
        let packet = picture(ts as u8 + 10, ts, ts);
        let output = decoder.decode(Some(&packet)).unwrap();
        assert_eq!(output.consumed, packet.data.len());
        let frame = output.frame.unwrap();
        assert_eq!(frame.pts, Some(ts));
        assert_eq!(frame.dts, Some(ts));
        assert_eq!(frame.buffer.luma()[0], ts as u8 + 10);
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }
    assert_eq!(decoder.pending(), 0);
}

#[test]
fn test_end_of_stream_drains_buffered_frame() {
    let mut decoder = open_decoder(
        SimLoader::new(SimConfig::default()),
        DecoderConfig::new(Codec::H264).async_depth(2),
    );
    let output = decoder.decode(Some(&picture(1, 0, 0))).unwrap();
    assert!(!output.got_frame());

    let output = decoder.decode(None).unwrap();
    assert_eq!(output.consumed, 0);
    assert_eq!(output.frame.unwrap().pts, Some(0));

    assert!(!decoder.decode(None).unwrap().got_frame());
}

#[test]
fn test_reordered_stream_restores_decode_timestamps() {
    let loader = SimLoader::new(SimConfig {
        reorder_depth: 1,
        ..Default::default()
    });
    let mut decoder = open_decoder(loader, DecoderConfig::new(Codec::H264).async_depth(1));

    // decode order I0 P2 B1 P4 B3
    let pts = [0i64, 2, 1, 4, 3];
    let mut submitted = HashMap::new();
    let mut frames = Vec::new();
    for (dts, pts) in pts.iter().enumerate() {
        let dts = dts as i64 - 1;
        submitted.insert(*pts, dts);
        if let Some(frame) = decoder.decode(Some(&picture(*pts as u8, *pts, dts))).unwrap().frame {
            frames.push(frame);
        }
    }
    frames.extend(drain(&mut decoder));

    let out: Vec<i64> = frames.iter().map(|frame| frame.pts.unwrap()).collect();
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
    for frame in &frames {
        let pts = frame.pts.unwrap();
        assert_eq!(frame.dts, Some(submitted[&pts]));
        assert_eq!(frame.buffer.luma()[0], pts as u8);
    }
}

#[test]
fn test_busy_device_is_retried() {
    let loader = SimLoader::new(SimConfig {
        busy_polls: 5,
        ..Default::default()
    });
    let config = DecoderConfig::new(Codec::H264)
        .async_depth(1)
        .busy_timeout(Duration::from_millis(50))
        .busy_poll_interval(Duration::from_millis(1));
    let mut decoder = open_decoder(loader, config);

    let frame = decoder.decode(Some(&picture(4, 7, 7))).unwrap().frame.unwrap();
    assert_eq!(frame.pts, Some(7));
}

#[test]
fn test_busy_timeout_is_an_io_error() {
    let loader = SimLoader::new(SimConfig {
        busy_polls: u32::MAX,
        ..Default::default()
    });
    let config = DecoderConfig::new(Codec::H264)
        .busy_timeout(Duration::from_millis(20))
        .busy_poll_interval(Duration::from_millis(1));
    let mut decoder = open_decoder(loader, config);

    let err = decoder.decode(Some(&picture(4, 0, 0))).unwrap_err();
    assert!(matches!(err, CodecError::BusyTimeout { .. }));
    assert_eq!(err.errno(), -errno::EIO);
}

#[test]
fn test_stalled_completion_times_out() {
    let loader = SimLoader::new(SimConfig {
        stall_sync: true,
        ..Default::default()
    });
    let config = DecoderConfig::new(Codec::H264)
        .async_depth(1)
        .sync_timeout(Duration::from_millis(10));
    let mut decoder = open_decoder(loader, config);

    let err = decoder.decode(Some(&picture(4, 0, 0))).unwrap_err();
    assert!(matches!(err, CodecError::SyncTimeout { timeout_ms: 10 }));
    assert_eq!(err.kind(), ErrorKind::DeviceFault);
}

#[test]
fn test_compatible_change_is_absorbed() {
    let loader = SimLoader::new(SimConfig::default());
    let mut decoder = open_decoder(loader.clone(), DecoderConfig::new(Codec::H264).async_depth(1));

    let mut stream = SimStream::new();
    stream.sequence_header(header()).picture(PicStruct::PROGRESSIVE, 5);
    let packet = Packet::new(stream.split(), Some(0), Some(0));

    let frame = decoder.decode(Some(&packet)).unwrap().frame.unwrap();
    assert_eq!(frame.buffer.luma()[0], 5);
    assert!(!decoder.reinit_pending());
    assert_eq!(loader.opened(), 1);
}

#[test]
fn test_incompatible_change_drains_then_reinitializes() {
    let loader = SimLoader::new(SimConfig::default());
    let mut decoder = open_decoder(loader.clone(), DecoderConfig::new(Codec::H264).async_depth(1));

    let frame = decoder.decode(Some(&picture(1, 0, 0))).unwrap().frame.unwrap();
    assert_eq!(frame.pts, Some(0));

    // new geometry arrives together with the first picture that uses it
    let mut stream = SimStream::new();
    stream
        .sequence_header(SequenceHeader::new(128, 96))
        .picture(PicStruct::PROGRESSIVE, 7);
    let changed = Packet::new(stream.split(), Some(1), Some(1));
    let output = decoder.decode(Some(&changed)).unwrap();
    assert_eq!(output.consumed, changed.data.len());
    assert!(!output.got_frame());
    assert!(decoder.reinit_pending());
    assert_eq!(loader.opened(), 1);

    let output = decoder.decode(Some(&picture(8, 2, 2))).unwrap();
    assert_eq!(loader.opened(), 2);
    assert!(!decoder.reinit_pending());
    let info = decoder.stream_info().unwrap();
    assert_eq!((info.width, info.height), (128, 96));

    let frame = output.frame.unwrap();
    assert_eq!((frame.pts, frame.dts), (Some(1), Some(1)));
    assert_eq!(frame.buffer.luma()[0], 7);
    assert_eq!(frame.width(), 128);

    let frames = drain(&mut decoder);
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].pts, frames[0].dts), (Some(2), Some(2)));
}

#[test]
fn test_flush_during_pending_reinit_keeps_session_usable() {
    let loader = SimLoader::new(SimConfig::default());
    let mut decoder = open_decoder(loader.clone(), DecoderConfig::new(Codec::H264).async_depth(1));
    decoder.decode(Some(&picture(1, 0, 0))).unwrap();

    let mut stream = SimStream::new();
    stream
        .sequence_header(SequenceHeader::new(128, 96))
        .picture(PicStruct::PROGRESSIVE, 7);
    decoder.decode(Some(&Packet::new(stream.split(), Some(1), Some(1)))).unwrap();
    assert!(decoder.reinit_pending());

    decoder.flush().unwrap();
    assert!(!decoder.reinit_pending());
    assert_eq!(loader.opened(), 2);
    assert_eq!(decoder.pending(), 0);

    let frame = decoder.decode(Some(&picture(3, 10, 10))).unwrap().frame.unwrap();
    assert_eq!((frame.pts, frame.dts), (Some(10), Some(10)));
    assert_eq!(frame.buffer.luma()[0], 3);
    assert_eq!(frame.width(), 128);
    assert!(drain(&mut decoder).is_empty());
}

#[test]
fn test_device_derived_timestamps() {
    let mut decoder = open_decoder(
        SimLoader::new(SimConfig::default()),
        DecoderConfig::new(Codec::Mpeg2).async_depth(1),
    );
    assert!(decoder.config().timestamps_from_device);

    let mut out = Vec::new();
    for (i, pts) in [100i64, 500, 900].iter().enumerate() {
        let packet = Packet::new(SimStream::picture_unit(i as u8), Some(*pts), None);
        let frame = decoder.decode(Some(&packet)).unwrap().frame.unwrap();
        assert_eq!(frame.dts, frame.pts);
        out.push(frame.pts.unwrap());
    }
    assert_eq!(out, vec![100, 101, 102]);
}

#[test]
fn test_interlaced_flags_reach_the_frame() {
    let mut decoder = open_decoder(
        SimLoader::new(SimConfig::default()),
        DecoderConfig::new(Codec::H264).async_depth(1),
    );
    let mut stream = SimStream::new();
    stream.picture(PicStruct::FIELD_TFF | PicStruct::FRAME_DOUBLING, 3);
    let packet = Packet::new(stream.split(), Some(0), Some(0));

    let frame = decoder.decode(Some(&packet)).unwrap().frame.unwrap();
    assert!(frame.interlaced);
    assert!(frame.top_field_first);
    assert_eq!(frame.repeat_pict, 2);
}

fn test_frame(fill: u8, pts: i64) -> VideoFrame {
    let mut data = vec![fill; 64 * 48];
    data.extend(std::iter::repeat(128).take(64 * 24));
    VideoFrame::from_nv12(64, 48, data, Some(pts)).unwrap()
}

fn encode_all(encoder: &mut QsvEncoder<qsvbridge_codec::sim::SimDevice>, frames: usize) -> Vec<EncodedPacket> {
    let mut packets = Vec::new();
    for pts in 0..frames as i64 {
        if let Some(packet) = encoder.encode(Some(&test_frame(pts as u8, pts))).unwrap() {
            packets.push(packet);
        }
    }
    while let Some(packet) = encoder.encode(None).unwrap() {
        packets.push(packet);
    }
    packets
}

#[test]
fn test_encoder_orders_b_frames_with_valid_dts() {
    let loader = SimLoader::new(SimConfig::default());
    let config = EncoderConfig::new(64, 48).gop(30, 2);
    let mut encoder = QsvEncoder::open(&loader, config, Arc::new(SystemAllocator)).unwrap();

    let packets = encode_all(&mut encoder, 6);
    let coded: Vec<i64> = packets.iter().map(|packet| packet.pts.unwrap()).collect();
    assert_eq!(coded, vec![0, 3, 1, 2, 5, 4]);

    assert!(packets[0].is_keyframe);
    assert!(packets[2].frame_type.contains(qsvbridge_codec::FrameType::B));
    assert!(!packets[2].is_keyframe);

    let mut last_dts = i64::MIN;
    for packet in &packets {
        let dts = packet.dts.unwrap();
        assert!(dts <= packet.pts.unwrap(), "{packet:?}");
        assert!(dts > last_dts);
        last_dts = dts;
    }
    assert_eq!(packets[0].dts, Some(-1));
}

#[test]
fn test_encode_then_decode_roundtrip() {
    let loader = SimLoader::new(SimConfig::default());
    let mut encoder =
        QsvEncoder::open(&loader, EncoderConfig::new(64, 48).gop(30, 2), Arc::new(SystemAllocator)).unwrap();
    let packets = encode_all(&mut encoder, 6);

    let loader = SimLoader::new(SimConfig {
        reorder_depth: 2,
        ..Default::default()
    });
    let mut decoder = QsvDecoder::open(
        loader,
        DecoderConfig::new(Codec::H264).async_depth(1),
        encoder.extradata(),
        Arc::new(SystemAllocator),
    )
    .unwrap();

    let mut frames = Vec::new();
    for packet in &packets {
        let input = Packet::new(packet.data.clone(), packet.pts, packet.dts);
        if let Some(frame) = decoder.decode(Some(&input)).unwrap().frame {
            frames.push(frame);
        }
    }
    frames.extend(drain(&mut decoder));

    assert_eq!(frames.len(), 6);
    for (pts, frame) in frames.iter().enumerate() {
        assert_eq!(frame.pts, Some(pts as i64));
        assert_eq!(frame.buffer.luma()[0], pts as u8);
        let packet = packets.iter().find(|packet| packet.pts == frame.pts).unwrap();
        assert_eq!(frame.dts, packet.dts);
    }
    assert_eq!(decoder.stream_info().unwrap().width, 64);
}

#[test]
fn test_trait_objects_drive_sessions() {
    let loader = SimLoader::new(SimConfig::default());
    let mut encoder: Box<dyn VideoEncoder> = Box::new(
        QsvEncoder::open(&loader, EncoderConfig::new(64, 48).for_low_latency(), Arc::new(SystemAllocator))
            .unwrap(),
    );
    let packet = encoder.encode(Some(&test_frame(9, 0))).unwrap().unwrap();

    let mut decoder: Box<dyn VideoDecoder> = Box::new(open_decoder(
        SimLoader::new(SimConfig::default()),
        DecoderConfig::new(Codec::H264).async_depth(1),
    ));
    let input = Packet::new(packet.data, packet.pts, packet.dts);
    let frame = decoder.decode(Some(&input)).unwrap().frame.unwrap();
    assert_eq!(frame.buffer.luma()[0], 9);
    assert_eq!(decoder.codec(), Codec::H264);
}
