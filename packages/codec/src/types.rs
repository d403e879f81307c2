//! Core types for Quick Sync decoding/encoding.

use std::time::Duration;

use bitflags::bitflags;

use crate::CodecError;

/// Default number of submitted-but-unsynchronized operations.
pub const ASYNC_DEPTH_DEFAULT: u16 = 4;

/// Default busy-retry budget.
pub const BUSY_TIMEOUT_DEFAULT: Duration = Duration::from_millis(3000);

/// Default wait on a completion token.
pub const SYNC_TIMEOUT_DEFAULT: Duration = Duration::from_millis(60_000);

/// Default ledger lookahead after the first output frame.
///
/// Sized for I[31]P[30]B[29]..B[0] style reordering. Codec profiles with
/// deeper pyramids need a larger value.
pub const REORDER_WINDOW_DEFAULT: usize = 32;

/// Video codec type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// H.264/AVC codec.
    H264,
    /// H.265/HEVC codec.
    Hevc,
    /// MPEG-1/MPEG-2 video.
    Mpeg2,
    /// SMPTE VC-1.
    Vc1,
}

impl Default for Codec {
    fn default() -> Self {
        Self::H264
    }
}

impl Codec {
    /// Device-side codec identifier (a FourCC).
    #[must_use]
    pub fn fourcc(&self) -> u32 {
        match self {
            Self::H264 => u32::from_le_bytes(*b"AVC "),
            Self::Hevc => u32::from_le_bytes(*b"HEVC"),
            Self::Mpeg2 => u32::from_le_bytes(*b"MPG2"),
            Self::Vc1 => u32::from_le_bytes(*b"VC1 "),
        }
    }

    /// Maps a device codec identifier back to a codec.
    pub fn from_fourcc(fourcc: u32) -> Result<Self, CodecError> {
        match &fourcc.to_le_bytes() {
            b"AVC " => Ok(Self::H264),
            b"HEVC" => Ok(Self::Hevc),
            b"MPG2" => Ok(Self::Mpeg2),
            b"VC1 " => Ok(Self::Vc1),
            other => Err(CodecError::unsupported(format!(
                "codec id {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Bytes appended after the codec configuration record so the device can
    /// parse a complete header before the first real packet arrives.
    #[must_use]
    pub fn priming_trailer(&self) -> &'static [u8] {
        match self {
            // Start of an IDR slice.
            Self::H264 => &[0x00, 0x00, 0x01, 0x65],
            // Picture start code of an I-picture.
            Self::Mpeg2 => &[0x00, 0x00, 0x01, 0x00, 0x00, 0x0F, 0xFF, 0xF8],
            Self::Hevc | Self::Vc1 => &[],
        }
    }

    /// Whether the device should derive output timestamps on its own.
    #[must_use]
    pub fn device_timestamps_by_default(&self) -> bool {
        matches!(self, Self::Mpeg2)
    }
}

/// Pixel format for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// NV12 (YUV 4:2:0, planar Y + interleaved UV).
    Nv12,
    /// I420/YUV420P (YUV 4:2:0, planar Y + U + V).
    I420,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Nv12
    }
}

/// Which device implementation a session asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Implementation {
    /// Let the runtime choose.
    Auto,
    /// Hardware accelerated implementation.
    Hardware,
    /// Software implementation.
    Software,
}

impl Default for Implementation {
    fn default() -> Self {
        Self::Auto
    }
}

/// API version requested from the device runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    /// Minimum runtime version this crate talks to.
    pub const REQUIRED: ApiVersion = ApiVersion { major: 1, minor: 1 };
}

/// Rate control mode for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateControlMode {
    /// Constant QP - fixed quality, variable bitrate.
    ConstQp,
    /// Variable Bitrate - targets average bitrate.
    Vbr,
    /// Constant Bitrate - strict bitrate control.
    Cbr,
    /// Average variable bitrate. Not implemented by the session layer.
    Avbr,
    /// Look-ahead rate control. Not implemented by the session layer.
    LookAhead,
}

impl Default for RateControlMode {
    fn default() -> Self {
        Self::Vbr
    }
}

/// A rational number (frame rate, aspect ratio).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    #[must_use]
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

bitflags! {
    /// Picture structure reported by the device for a surface.
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct PicStruct: u16 {
        const PROGRESSIVE = 0x01;
        const FIELD_TFF = 0x02;
        const FIELD_BFF = 0x04;
        const FIELD_REPEATED = 0x10;
        const FRAME_DOUBLING = 0x20;
        const FRAME_TRIPLING = 0x40;
    }
}

impl Default for PicStruct {
    fn default() -> Self {
        Self::empty()
    }
}

impl PicStruct {
    /// How many extra field periods the frame should be displayed for.
    #[must_use]
    pub fn repeat_pict(&self) -> u8 {
        if self.contains(Self::FRAME_TRIPLING) {
            4
        } else if self.contains(Self::FRAME_DOUBLING) {
            2
        } else if self.contains(Self::FIELD_REPEATED) {
            1
        } else {
            0
        }
    }

    #[must_use]
    pub fn top_field_first(&self) -> bool {
        self.contains(Self::FIELD_TFF)
    }

    #[must_use]
    pub fn interlaced(&self) -> bool {
        !self.contains(Self::PROGRESSIVE)
    }

    /// Builds the structure an encoder input surface should carry.
    #[must_use]
    pub fn for_frame(interlaced: bool, top_field_first: bool, repeat_pict: u8) -> Self {
        let mut pic_struct = if !interlaced {
            Self::PROGRESSIVE
        } else if top_field_first {
            Self::FIELD_TFF
        } else {
            Self::FIELD_BFF
        };
        match repeat_pict {
            1 => pic_struct |= Self::FIELD_REPEATED,
            2 => pic_struct |= Self::FRAME_DOUBLING,
            4 => pic_struct |= Self::FRAME_TRIPLING,
            _ => {}
        }
        pic_struct
    }
}

bitflags! {
    /// Frame type of an encoded picture. The `X*` flags describe the second field.
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct FrameType: u16 {
        const I = 0x0001;
        const P = 0x0002;
        const B = 0x0004;
        const S = 0x0008;
        const REF = 0x0040;
        const IDR = 0x0080;
        const XI = 0x0100;
        const XP = 0x0200;
        const XB = 0x0400;
        const XS = 0x0800;
        const XREF = 0x4000;
        const XIDR = 0x8000;
    }
}

impl Default for FrameType {
    fn default() -> Self {
        Self::empty()
    }
}

impl FrameType {
    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.intersects(Self::I | Self::XI | Self::IDR | Self::XIDR)
    }
}

/// Geometry and timing of a surface as understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub fourcc: PixelFormat,
    /// Allocated (coded) width.
    pub width: u32,
    /// Allocated (coded) height.
    pub height: u32,
    pub crop_w: u32,
    pub crop_h: u32,
    pub frame_rate: Rational,
    pub aspect_ratio: Rational,
    pub pic_struct: PicStruct,
}

/// Stream properties published after a successful header parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub frame_rate: Rational,
    pub sample_aspect_ratio: Rational,
}

impl From<&FrameInfo> for StreamInfo {
    fn from(info: &FrameInfo) -> Self {
        Self {
            width: info.crop_w,
            height: info.crop_h,
            coded_width: info.width,
            coded_height: info.height,
            frame_rate: info.frame_rate,
            sample_aspect_ratio: info.aspect_ratio,
        }
    }
}

/// Configuration for creating a decode session.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Video codec to decode.
    pub codec: Codec,
    /// Outstanding completions tolerated before a sync is forced.
    pub async_depth: u16,
    /// Give up when the device stays busy for longer than this.
    pub busy_timeout: Duration,
    /// Sleep between busy retries.
    pub busy_poll_interval: Duration,
    /// Bounded wait on a completion token.
    pub sync_timeout: Duration,
    /// Ledger lookahead once the first frame has been produced.
    pub reorder_window: usize,
    /// Let the device derive presentation timestamps (ledger bypassed).
    pub timestamps_from_device: bool,
    /// Requested device implementation.
    pub implementation: Implementation,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            async_depth: ASYNC_DEPTH_DEFAULT,
            busy_timeout: BUSY_TIMEOUT_DEFAULT,
            busy_poll_interval: Duration::from_millis(1),
            sync_timeout: SYNC_TIMEOUT_DEFAULT,
            reorder_window: REORDER_WINDOW_DEFAULT,
            timestamps_from_device: false,
            implementation: Implementation::Auto,
        }
    }
}

impl DecoderConfig {
    /// Create a new decoder configuration for the given codec.
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            timestamps_from_device: codec.device_timestamps_by_default(),
            ..Default::default()
        }
    }

    /// Set the async pipeline depth.
    #[must_use]
    pub fn async_depth(mut self, depth: u16) -> Self {
        self.async_depth = depth;
        self
    }

    /// Set the busy-retry timeout.
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the sleep between busy retries.
    #[must_use]
    pub fn busy_poll_interval(mut self, interval: Duration) -> Self {
        self.busy_poll_interval = interval;
        self
    }

    /// Set the completion wait bound.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the ledger lookahead used after the first output frame.
    #[must_use]
    pub fn reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    /// Let the device derive timestamps.
    #[must_use]
    pub fn timestamps_from_device(mut self, enable: bool) -> Self {
        self.timestamps_from_device = enable;
        self
    }

    /// Request a specific implementation.
    #[must_use]
    pub fn implementation(mut self, implementation: Implementation) -> Self {
        self.implementation = implementation;
        self
    }

    /// Configure for low latency decoding.
    #[must_use]
    pub fn for_low_latency(mut self) -> Self {
        self.async_depth = 1;
        self
    }

    /// Depth at which the driver forces a synchronization.
    #[must_use]
    pub fn sync_threshold(&self) -> usize {
        usize::from(self.async_depth.max(1))
    }
}

/// Configuration for creating an encode session.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Video codec to use.
    pub codec: Codec,
    /// Framerate as (numerator, denominator).
    pub framerate: (u32, u32),
    /// Sample aspect ratio.
    pub sample_aspect_ratio: Rational,
    /// Target bitrate in bits per second (for VBR/CBR).
    pub bitrate: u32,
    /// Maximum bitrate in bits per second (for VBR).
    pub max_bitrate: u32,
    /// Rate control mode.
    pub rate_control: RateControlMode,
    /// Base quantizer for constant-QP mode.
    pub quality: f32,
    /// Scale applied to `quality` for I-frames.
    pub i_quant_factor: f32,
    /// Offset added to the I-frame quantizer.
    pub i_quant_offset: f32,
    /// Scale applied to `quality` for B-frames.
    pub b_quant_factor: f32,
    /// Offset added to the B-frame quantizer.
    pub b_quant_offset: f32,
    /// GOP (Group of Pictures) length. 0 for infinite.
    pub gop_length: u32,
    /// Number of B-frames between I and P frames.
    pub b_frames: i32,
    /// Number of reference frames, 0 lets the device decide.
    pub ref_frames: u16,
    /// Number of slices per picture, 0 lets the device decide.
    pub slices: u16,
    /// Use CAVLC entropy coding instead of CABAC.
    pub cavlc: bool,
    /// Outstanding operations the device may pipeline.
    pub async_depth: u16,
    /// Give up when the device stays busy for longer than this.
    pub busy_timeout: Duration,
    /// Bounded wait on a completion token.
    pub sync_timeout: Duration,
    /// Requested device implementation.
    pub implementation: Implementation,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            codec: Codec::H264,
            framerate: (30, 1),
            sample_aspect_ratio: Rational::new(1, 1),
            bitrate: 5_000_000,
            max_bitrate: 8_000_000,
            rate_control: RateControlMode::Vbr,
            quality: 23.0,
            i_quant_factor: -0.96,
            i_quant_offset: -1.0,
            b_quant_factor: 1.04,
            b_quant_offset: 1.0,
            gop_length: 30,
            b_frames: 0,
            ref_frames: 0,
            slices: 0,
            cavlc: false,
            async_depth: ASYNC_DEPTH_DEFAULT,
            busy_timeout: BUSY_TIMEOUT_DEFAULT,
            sync_timeout: SYNC_TIMEOUT_DEFAULT,
            implementation: Implementation::Auto,
        }
    }
}

impl EncoderConfig {
    /// Create a new encoder configuration with the given dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the codec.
    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the framerate.
    #[must_use]
    pub fn framerate(mut self, num: u32, den: u32) -> Self {
        self.framerate = (num, den);
        self
    }

    /// Set the target bitrate in bits per second.
    #[must_use]
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the maximum bitrate in bits per second.
    #[must_use]
    pub fn max_bitrate(mut self, max_bitrate: u32) -> Self {
        self.max_bitrate = max_bitrate;
        self
    }

    /// Set the rate control mode.
    #[must_use]
    pub fn rate_control(mut self, mode: RateControlMode) -> Self {
        self.rate_control = mode;
        self
    }

    /// Use constant QP with the given base quantizer.
    #[must_use]
    pub fn constant_qp(mut self, quality: f32) -> Self {
        self.rate_control = RateControlMode::ConstQp;
        self.quality = quality;
        self
    }

    /// Set GOP length and number of B-frames.
    #[must_use]
    pub fn gop(mut self, gop_length: u32, b_frames: i32) -> Self {
        self.gop_length = gop_length;
        self.b_frames = b_frames;
        self
    }

    /// Set the busy-retry timeout.
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Configure for low latency streaming.
    #[must_use]
    pub fn for_low_latency(mut self) -> Self {
        self.b_frames = 0;
        self.gop_length = 30;
        self.async_depth = 1;
        self
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}
