//! Quick Sync video session layer for qsvbridge.
//!
//! This crate drives decode and encode sessions on an Intel Quick Sync style
//! device: it stages compressed input, keeps a pool of frame surfaces shared
//! with the device, pipelines asynchronous operations and restores decode
//! timestamps on output.
//!
//! - **Device abstraction** ([`mfx::Device`], [`mfx::DeviceLoader`]): the runtime interface the sessions drive
//! - **Reference device** (`sim` feature): a software device over a synthetic stream, used by tests and `qsv-sim`
//!
//! # Quick Start (Decoding)
//!
//! ```ignore
//! use std::sync::Arc;
//! use qsvbridge_codec::mfx::QsvDecoder;
//! use qsvbridge_codec::sim::{SimConfig, SimLoader};
//! use qsvbridge_codec::{Codec, DecoderConfig, SystemAllocator, VideoDecoder};
//!
//! let loader = SimLoader::new(SimConfig::default());
//! let config = DecoderConfig::new(Codec::H264).for_low_latency();
//! let mut decoder = QsvDecoder::open(loader, config, &extradata, Arc::new(SystemAllocator))?;
//!
//! let output = decoder.decode(Some(&packet))?;
//! if let Some(frame) = output.frame {
//!     // frame.pts / frame.dts restored from the packet
//! }
//! ```
//!
//! # Quick Start (Encoding)
//!
//! ```ignore
//! use qsvbridge_codec::mfx::QsvEncoder;
//! use qsvbridge_codec::{EncoderConfig, VideoEncoder, VideoFrame};
//!
//! let config = EncoderConfig::new(1280, 720).gop(30, 2);
//! let mut encoder = QsvEncoder::open(&loader, config, Arc::new(SystemAllocator))?;
//!
//! let frame = VideoFrame::from_nv12(1280, 720, nv12_data, Some(0))?;
//! if let Some(packet) = encoder.encode(Some(&frame))? {
//!     // packet.data is one coded picture
//! }
//! while let Some(packet) = encoder.encode(None)? {
//!     // drained packets
//! }
//! ```
//!
//! # Architecture
//!
//! The session drivers in [`mfx`] are built from four components:
//! [`Bitstream`] (compressed input staging), [`BufferPool`] (surfaces),
//! [`PendingQueue`] (completions awaiting synchronization) and
//! [`TimestampLedger`] (pts to dts association). The drivers implement
//! [`VideoDecoder`] and [`VideoEncoder`].

mod bitstream;
mod error;
mod frame;
mod ledger;
mod pending;
mod pool;
mod traits;
mod types;

pub mod mfx;

#[cfg(feature = "sim")]
pub mod sim;

pub use bitstream::Bitstream;
pub use error::{errno, CodecError, ErrorKind};
pub use frame::{expected_frame_size, storage_size, FrameBuffer, VideoFrame};
pub use ledger::{grow_target, TimestampLedger, TimestampPair};
pub use pending::{PendingCompletion, PendingQueue};
pub use pool::{BufferPool, SlotState};
pub use traits::{
    DecodeOutput, EncodedPacket, FrameAllocator, Packet, SystemAllocator, VideoDecoder, VideoEncoder,
};
pub use types::{
    align_up, ApiVersion, Codec, DecoderConfig, EncoderConfig, FrameInfo, FrameType, Implementation, PicStruct,
    PixelFormat, RateControlMode, Rational, StreamInfo, ASYNC_DEPTH_DEFAULT, BUSY_TIMEOUT_DEFAULT,
    REORDER_WINDOW_DEFAULT, SYNC_TIMEOUT_DEFAULT,
};
