//! Core traits for video encoding/decoding.

use bytes::Bytes;

use crate::frame::{storage_size, FrameBuffer, VideoFrame};
use crate::types::{align_up, Codec, FrameType, PixelFormat, StreamInfo};
use crate::CodecError;

/// External provider of pixel storage for decode surfaces and aligned
/// encoder input copies.
pub trait FrameAllocator: Send + Sync {
    /// Allocate storage for a `width` x `height` picture in `format`.
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> Result<FrameBuffer, CodecError>;
}

/// Heap allocator producing buffers with a 32-byte aligned luma pitch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl FrameAllocator for SystemAllocator {
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> Result<FrameBuffer, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::invalid_param(format!("cannot allocate {width}x{height} frame")));
        }
        let pitch = align_up(width, 32) as usize;
        let rows = align_up(height, 2) as usize;
        let size = storage_size(format, pitch, rows);

        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| CodecError::OutOfMemory)?;
        data.resize(size, 0);

        FrameBuffer::from_parts(format, width, height, pitch, rows, data)
    }
}

/// A compressed input unit for the decoder.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Elementary stream bytes.
    pub data: Bytes,
    /// Presentation timestamp, `None` when unknown.
    pub pts: Option<i64>,
    /// Decode timestamp, `None` when unknown.
    pub dts: Option<i64>,
}

impl Packet {
    /// Create a new packet.
    #[must_use]
    pub fn new(data: impl Into<Bytes>, pts: Option<i64>, dts: Option<i64>) -> Self {
        Self {
            data: data.into(),
            pts,
            dts,
        }
    }
}

/// Result of encoding a frame.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Encoded bitstream data (e.g., H.264 NAL units).
    pub data: Bytes,
    /// Presentation timestamp.
    pub pts: Option<i64>,
    /// Decode timestamp.
    pub dts: Option<i64>,
    /// Frame type reported by the device.
    pub frame_type: FrameType,
    /// Whether this packet contains a keyframe.
    pub is_keyframe: bool,
}

/// Outcome of one decode call.
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// Bytes of the input packet taken by the session (0 when flushing).
    pub consumed: usize,
    /// Frame completed by this call, if any.
    pub frame: Option<VideoFrame>,
}

impl DecodeOutput {
    #[must_use]
    pub fn got_frame(&self) -> bool {
        self.frame.is_some()
    }
}

/// Trait for video encoders.
///
/// Implementors encode raw frames into a compressed bitstream. Output is
/// delayed relative to input when the encoder reorders frames.
///
/// # Example
///
/// ```ignore
/// let config = EncoderConfig::new(1280, 720).codec(Codec::H264).gop(30, 2);
/// let mut encoder = QsvEncoder::open(&loader, config, Arc::new(SystemAllocator))?;
///
/// for frame in frames {
///     if let Some(packet) = encoder.encode(Some(&frame))? {
///         sink.write(packet);
///     }
/// }
/// while let Some(packet) = encoder.encode(None)? {
///     sink.write(packet);
/// }
/// ```
pub trait VideoEncoder: Send {
    /// Submit `frame` (or `None` to drain) and return at most one packet.
    fn encode(&mut self, frame: Option<&VideoFrame>) -> Result<Option<EncodedPacket>, CodecError>;

    /// Stream headers (parameter sets) produced at open.
    fn extradata(&self) -> &[u8];

    /// Returns the codec being used.
    fn codec(&self) -> Codec;

    /// Returns the configured dimensions (width, height).
    fn dimensions(&self) -> (u32, u32);

    /// Release the device session. Later calls fail.
    fn close(&mut self) -> Result<(), CodecError>;
}

/// Trait for video decoders.
///
/// # Example
///
/// ```ignore
/// let mut decoder = QsvDecoder::open(loader, DecoderConfig::new(Codec::H264), &extradata, allocator)?;
///
/// let out = decoder.decode(Some(&packet))?;
/// if let Some(frame) = out.frame {
///     // frame.buffer holds NV12 pixels
/// }
///
/// // Drain
/// while let Some(frame) = decoder.decode(None)?.frame {
///     // ...
/// }
/// ```
pub trait VideoDecoder: Send {
    /// Decode `packet`, or drain buffered frames when `None`.
    ///
    /// Due to B-frame reordering there may be a delay between submitting a
    /// packet and receiving its frame.
    fn decode(&mut self, packet: Option<&Packet>) -> Result<DecodeOutput, CodecError>;

    /// Drop all in-flight state (seek).
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Returns the codec being used.
    fn codec(&self) -> Codec;

    /// Stream geometry from the last header parse.
    fn stream_info(&self) -> Option<StreamInfo>;

    /// Release the device session. Later calls fail.
    fn close(&mut self) -> Result<(), CodecError>;
}
