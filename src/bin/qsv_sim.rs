//! qsv-sim - encode and decode a synthetic clip on the software reference device.
//!
//! Encodes a gradient clip, then decodes the packets through the
//! frame-parallel front-end with several workers and checks that every frame
//! comes back in presentation order with the decode timestamp its packet
//! carried.
//!
//! Usage:
//!   qsv-sim [OPTIONS]
//!
//! Options:
//!   --frames <n>          Number of frames to encode (default: 30)
//!   --size <WxH>          Frame size (default: 320x240)
//!   --b-frames <n>        B-frames between references (default: 2)
//!   --async-depth <n>     Decoder async depth (default: 4)
//!   --reorder-depth <n>   Decode delay of the reference device (default: 2)
//!   --busy-polls <n>      Busy answers before the decoder device accepts work (default: 0)
//!   --workers <n>         Concurrent decode workers (default: 4)
//!
//! Examples:
//!   qsv-sim
//!   RUST_LOG=qsvbridge_codec=trace qsv-sim --frames 8 --b-frames 0

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use qsvbridge::codec::mfx::{QsvDecoder, QsvEncoder};
use qsvbridge::codec::sim::{SimConfig, SimLoader};
use qsvbridge::codec::{
    Codec, DecoderConfig, EncodedPacket, EncoderConfig, Packet, SystemAllocator, VideoEncoder, VideoFrame,
};
use qsvbridge::ParallelDecoder;

struct Args {
    frames: usize,
    width: u32,
    height: u32,
    b_frames: i32,
    async_depth: u16,
    reorder_depth: usize,
    busy_polls: u32,
    workers: usize,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        frames: 30,
        width: 320,
        height: 240,
        b_frames: 2,
        async_depth: 4,
        reorder_depth: 2,
        busy_polls: 0,
        workers: 4,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--frames", Some(v)) => result.frames = v.parse().context("--frames")?,
            ("--size", Some(v)) => {
                let (w, h) = v.split_once('x').context("--size expects WxH")?;
                result.width = w.parse().context("--size width")?;
                result.height = h.parse().context("--size height")?;
            }
            ("--b-frames", Some(v)) => result.b_frames = v.parse().context("--b-frames")?,
            ("--async-depth", Some(v)) => result.async_depth = v.parse().context("--async-depth")?,
            ("--reorder-depth", Some(v)) => result.reorder_depth = v.parse().context("--reorder-depth")?,
            ("--busy-polls", Some(v)) => result.busy_polls = v.parse().context("--busy-polls")?,
            ("--workers", Some(v)) => result.workers = v.parse().context("--workers")?,
            ("--help" | "-h", _) => {
                print_usage();
                std::process::exit(0);
            }
            (other, _) => bail!("unknown or incomplete option {other}"),
        }
        i += 2;
    }

    if result.frames > usize::from(u8::MAX) + 1 {
        bail!("--frames is limited to 256");
    }
    Ok(result)
}

fn print_usage() {
    println!("qsv-sim - Quick Sync session round trip on the software reference device");
    println!();
    println!("Usage: qsv-sim [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --frames <n>          Number of frames to encode (default: 30)");
    println!("  --size <WxH>          Frame size (default: 320x240)");
    println!("  --b-frames <n>        B-frames between references (default: 2)");
    println!("  --async-depth <n>     Decoder async depth (default: 4)");
    println!("  --reorder-depth <n>   Decode delay of the reference device (default: 2)");
    println!("  --busy-polls <n>      Busy answers before the decoder device accepts work (default: 0)");
    println!("  --workers <n>         Concurrent decode workers (default: 4)");
}

/// Flat luma plane filled with the frame index, neutral chroma.
fn synthetic_frame(width: u32, height: u32, index: usize) -> Result<VideoFrame> {
    let luma = (width * height) as usize;
    let mut data = vec![index as u8; luma];
    data.resize(luma + luma / 2, 128);
    Ok(VideoFrame::from_nv12(width, height, data, Some(index as i64))?)
}

fn encode_clip(args: &Args) -> Result<(Vec<u8>, Vec<EncodedPacket>)> {
    let loader = SimLoader::new(SimConfig::default());
    let config = EncoderConfig::new(args.width, args.height)
        .codec(Codec::H264)
        .gop(30, args.b_frames);
    let mut encoder = QsvEncoder::open(&loader, config, Arc::new(SystemAllocator))?;

    let mut packets = Vec::with_capacity(args.frames);
    for index in 0..args.frames {
        let frame = synthetic_frame(args.width, args.height, index)?;
        if let Some(packet) = encoder.encode(Some(&frame))? {
            packets.push(packet);
        }
    }
    while let Some(packet) = encoder.encode(None)? {
        packets.push(packet);
    }

    let keyframes = packets.iter().filter(|packet| packet.is_keyframe).count();
    tracing::info!(packets = packets.len(), keyframes, "encoded clip");
    let extradata = encoder.extradata().to_vec();
    encoder.close()?;
    Ok((extradata, packets))
}

async fn decode_clip(args: &Args, extradata: &[u8], packets: Vec<EncodedPacket>) -> Result<()> {
    let loader = SimLoader::new(SimConfig {
        reorder_depth: args.reorder_depth,
        busy_polls: args.busy_polls,
        ..Default::default()
    });
    let config = DecoderConfig::new(Codec::H264).async_depth(args.async_depth);
    let session = QsvDecoder::open(loader, config, extradata, Arc::new(SystemAllocator))?;
    let decoder = ParallelDecoder::spawn(session, args.workers);

    let expected: Vec<(Option<i64>, Option<i64>)> = packets.iter().map(|packet| (packet.pts, packet.dts)).collect();

    // Calls take their place in the sequence here, in packet order.
    let worker = decoder.worker();
    let mut calls: Vec<_> = packets
        .into_iter()
        .map(|packet| worker.decode(Some(Packet::new(packet.data, packet.pts, packet.dts))))
        .collect();
    calls.extend((0..=args.reorder_depth + usize::from(args.async_depth)).map(|_| worker.decode(None)));

    let mut handles = Vec::new();
    for chunk in chunks(calls, args.workers.max(1)) {
        handles.push(tokio::spawn(async move {
            let mut frames = Vec::new();
            for call in chunk {
                if let Some(frame) = call.await?.frame {
                    frames.push(frame);
                }
            }
            anyhow::Ok(frames)
        }));
    }

    let mut frames = Vec::new();
    for handle in handles {
        frames.extend(handle.await??);
    }
    decoder.shutdown().await?;

    frames.sort_by_key(|frame| frame.pts);
    if frames.len() != expected.len() {
        bail!("decoded {} frames from {} packets", frames.len(), expected.len());
    }
    for (index, frame) in frames.iter().enumerate() {
        if frame.pts != Some(index as i64) || frame.buffer.luma()[0] != index as u8 {
            bail!("frame {index} came back as pts {:?}", frame.pts);
        }
        if !expected.contains(&(frame.pts, frame.dts)) {
            bail!("frame {index} lost its decode timestamp");
        }
    }
    tracing::info!(frames = frames.len(), "decoded clip");
    Ok(())
}

/// Split `calls` round-robin into `n` lists, each keeping ticket order.
fn chunks<T>(calls: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let mut out: Vec<Vec<T>> = (0..n).map(|_| Vec::new()).collect();
    for (index, call) in calls.into_iter().enumerate() {
        out[index % n].push(call);
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("qsvbridge=info".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = parse_args()?;
    let started = Instant::now();

    let (extradata, packets) = encode_clip(&args)?;
    decode_clip(&args, &extradata, packets).await?;

    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "round trip complete");
    Ok(())
}
