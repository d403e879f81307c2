//! Typed view of the Quick Sync runtime interface.
//!
//! A [`Device`] is one open session on the runtime. The session layer only
//! talks to the runtime through this trait, so a real binding and the
//! software reference device in [`crate::sim`] are interchangeable.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bitstream::Bitstream;
use crate::frame::FrameBuffer;
use crate::types::{ApiVersion, FrameInfo, FrameType, Implementation};
use crate::CodecError;

/// Status codes returned by runtime calls.
///
/// Negative values are errors, positive values are warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MfxStatus {
    NoError,
    Unknown,
    NullPtr,
    Unsupported,
    MemoryAlloc,
    NotEnoughBuffer,
    InvalidHandle,
    LockMemory,
    NotInitialized,
    NotFound,
    MoreData,
    MoreSurface,
    Aborted,
    DeviceLost,
    IncompatibleVideoParam,
    InvalidVideoParam,
    UndefinedBehavior,
    DeviceFailed,
    MoreBitstream,
    InExecution,
    DeviceBusy,
    VideoParamChanged,
    PartialAcceleration,
}

impl MfxStatus {
    /// Raw runtime status code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::Unknown => -1,
            Self::NullPtr => -2,
            Self::Unsupported => -3,
            Self::MemoryAlloc => -4,
            Self::NotEnoughBuffer => -5,
            Self::InvalidHandle => -6,
            Self::LockMemory => -7,
            Self::NotInitialized => -8,
            Self::NotFound => -9,
            Self::MoreData => -10,
            Self::MoreSurface => -11,
            Self::Aborted => -12,
            Self::DeviceLost => -13,
            Self::IncompatibleVideoParam => -14,
            Self::InvalidVideoParam => -15,
            Self::UndefinedBehavior => -16,
            Self::DeviceFailed => -17,
            Self::MoreBitstream => -18,
            Self::InExecution => 1,
            Self::DeviceBusy => 2,
            Self::VideoParamChanged => 3,
            Self::PartialAcceleration => 4,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    /// Convert to a `Result`. Warnings count as success.
    pub fn result(self) -> Result<(), CodecError> {
        match self {
            Self::NoError
            | Self::InExecution
            | Self::DeviceBusy
            | Self::VideoParamChanged
            | Self::PartialAcceleration => Ok(()),
            Self::MemoryAlloc | Self::NotEnoughBuffer => Err(CodecError::OutOfMemory),
            Self::InvalidHandle => Err(CodecError::InvalidHandle),
            Self::DeviceFailed | Self::DeviceLost | Self::LockMemory => {
                Err(CodecError::device_fault(format!("{self:?}")))
            }
            Self::NullPtr | Self::UndefinedBehavior | Self::NotInitialized => {
                Err(CodecError::bug(format!("runtime reported {self:?}")))
            }
            Self::Unsupported | Self::NotFound => Err(CodecError::unsupported(format!("{self:?}"))),
            Self::MoreData | Self::MoreSurface | Self::MoreBitstream => Err(CodecError::Again),
            Self::IncompatibleVideoParam | Self::InvalidVideoParam => {
                Err(CodecError::invalid_param(format!("{self:?}")))
            }
            Self::Aborted | Self::Unknown => Err(CodecError::Unknown(format!("{self:?}"))),
        }
    }
}

impl From<MfxStatus> for CodecError {
    fn from(status: MfxStatus) -> Self {
        match status.result() {
            Err(err) => err,
            Ok(()) => CodecError::bug(format!("{status:?} reported as a failure")),
        }
    }
}

/// Completion handle for one asynchronous operation.
///
/// Indexes a device-side token table. The generation makes a token issued
/// for a recycled table entry distinguishable from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken {
    pub index: u32,
    pub generation: u32,
}

/// Hardware lock count of a surface.
///
/// Cloned between the pool and the device. Only the device changes the count.
#[derive(Debug, Clone, Default)]
pub struct SurfaceLock(Arc<AtomicU16>);

impl SurfaceLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    #[must_use]
    pub fn count(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.count() > 0
    }
}

/// Index of a surface inside its owning pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub usize);

/// Per-picture data the device writes into a surface.
#[derive(Debug, Default)]
pub struct SurfaceData {
    /// Pixel storage. `None` once handed to a caller.
    pub frame: Option<FrameBuffer>,
    pub timestamp: Option<i64>,
}

/// A frame buffer descriptor exchanged with the device.
#[derive(Debug)]
pub struct Surface {
    pub id: SurfaceId,
    pub info: FrameInfo,
    pub data: SurfaceData,
    pub lock: SurfaceLock,
}

impl Surface {
    #[must_use]
    pub fn new(id: SurfaceId, info: FrameInfo) -> Self {
        Self {
            id,
            info,
            data: SurfaceData::default(),
            lock: SurfaceLock::new(),
        }
    }
}

/// Surface counts a configuration needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceRequest {
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
}

/// Encoder speed/quality trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetUsage {
    BestQuality,
    #[default]
    Balanced,
    BestSpeed,
}

/// Rate control with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    ConstQp { qpi: u8, qpp: u8, qpb: u8 },
    Cbr { target_kbps: u32 },
    Vbr { target_kbps: u32, max_kbps: u32 },
}

impl Default for RateControl {
    fn default() -> Self {
        Self::Vbr {
            target_kbps: 0,
            max_kbps: 0,
        }
    }
}

/// Encoder controls of a [`VideoParams`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeParams {
    pub target_usage: TargetUsage,
    pub gop_pic_size: u32,
    /// Distance between reference frames; 1 means no B-frames.
    pub gop_ref_dist: u16,
    pub closed_gop: bool,
    pub idr_interval: u16,
    pub num_slice: u16,
    pub num_ref_frame: u16,
    pub rate_control: RateControl,
    /// Output buffer size hint, filled by the device after init.
    pub buffer_size_kb: u32,
    pub cavlc: bool,
}

/// Session parameter block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoParams {
    /// Device codec identifier, see [`crate::Codec::fourcc`]. Zero when unset.
    pub codec_id: u32,
    pub async_depth: u16,
    pub frame_info: FrameInfo,
    pub encode: EncodeParams,
}

/// Output of one decode submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStep {
    pub status: MfxStatus,
    /// Surface that will hold a finished picture once `token` signals.
    pub output: Option<(SurfaceId, SyncToken)>,
}

impl DecodeStep {
    #[must_use]
    pub fn status(status: MfxStatus) -> Self {
        Self { status, output: None }
    }
}

/// Output buffer the encoder writes one compressed picture into.
#[derive(Debug, Default)]
pub struct OutputBitstream {
    pub data: Vec<u8>,
    pub timestamp: Option<i64>,
    pub frame_type: FrameType,
}

impl OutputBitstream {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.timestamp = None;
        self.frame_type = FrameType::empty();
    }
}

/// One open runtime session.
pub trait Device: Send {
    /// Which implementation the runtime picked.
    fn query_implementation(&self) -> Implementation;

    /// Parse a sequence header at the head of `bitstream`.
    fn decode_header(&mut self, bitstream: &mut Bitstream, params: &mut VideoParams) -> MfxStatus;

    /// Surface counts needed to decode with `params`.
    fn query_io_surfaces(&mut self, params: &VideoParams) -> Result<SurfaceRequest, MfxStatus>;

    fn decode_init(&mut self, params: &VideoParams) -> MfxStatus;

    /// Submit compressed data (or `None` to drain) with a free work surface.
    fn decode_frame_async(&mut self, bitstream: Option<&mut Bitstream>, work: &mut Surface) -> DecodeStep;

    /// Drop all decoder state, keeping the session.
    fn decode_reset(&mut self, params: &VideoParams) -> MfxStatus;

    /// Surface counts needed to encode with `params`.
    fn encode_query_io_surfaces(&mut self, params: &VideoParams) -> Result<SurfaceRequest, MfxStatus>;

    fn encode_init(&mut self, params: &VideoParams) -> MfxStatus;

    /// Effective encoder parameters and stream headers.
    fn encode_video_param(&mut self, params: &mut VideoParams) -> Result<Vec<u8>, MfxStatus>;

    /// Submit a raw picture (or `None` to drain).
    fn encode_frame_async(
        &mut self,
        surface: Option<&Surface>,
        output: &mut OutputBitstream,
    ) -> (MfxStatus, Option<SyncToken>);

    /// Wait up to `timeout` for `token` to signal.
    fn sync_operation(&mut self, token: SyncToken, timeout: Duration) -> MfxStatus;

    /// Close the session.
    fn close(&mut self) -> MfxStatus;
}

/// Opens runtime sessions.
pub trait DeviceLoader: Send + Sync {
    type Device: Device;

    fn open(&self, implementation: Implementation, version: ApiVersion) -> Result<Self::Device, MfxStatus>;
}
