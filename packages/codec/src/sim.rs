//! Software reference device.
//!
//! [`SimDevice`] implements [`Device`] over a synthetic elementary stream.
//! Each unit is a 4-byte big-endian length followed by a kind byte and its
//! payload:
//!
//! - sequence header: width, height, frame rate num/den, aspect num/den (all `u16`)
//! - picture: picture structure (`u16`) and a fill byte for every luma sample
//!
//! The encoder side emits picture units, so its output decodes again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::bitstream::Bitstream;
use crate::mfx::{
    DecodeStep, Device, DeviceLoader, MfxStatus, OutputBitstream, Surface, SurfaceId, SurfaceLock,
    SurfaceRequest, SyncToken, VideoParams,
};
use crate::types::{align_up, ApiVersion, Codec, FrameInfo, FrameType, Implementation, PicStruct, PixelFormat, Rational};

/// Newest runtime version the reference device speaks.
pub const SIM_API_VERSION: ApiVersion = ApiVersion { major: 1, minor: 8 };

const KIND_SEQUENCE_HEADER: u8 = 0x01;
const KIND_PICTURE: u8 = 0x02;
const UNIT_PREFIX: usize = 4;

/// Stream geometry carried by a sequence header unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub width: u16,
    pub height: u16,
    pub frame_rate: (u16, u16),
    pub aspect_ratio: (u16, u16),
}

impl SequenceHeader {
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            frame_rate: (30, 1),
            aspect_ratio: (1, 1),
        }
    }

    fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            fourcc: PixelFormat::Nv12,
            width: align_up(u32::from(self.width), 16),
            height: align_up(u32::from(self.height), 16),
            crop_w: u32::from(self.width),
            crop_h: u32::from(self.height),
            frame_rate: Rational::new(u32::from(self.frame_rate.0), u32::from(self.frame_rate.1)),
            aspect_ratio: Rational::new(u32::from(self.aspect_ratio.0), u32::from(self.aspect_ratio.1)),
            pic_struct: PicStruct::PROGRESSIVE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Header(SequenceHeader),
    Picture { pic_struct: PicStruct, fill: u8 },
    Other,
}

/// Parse the unit at the head of `data`. Returns it with its total size, or
/// `None` when the unit is not complete yet.
fn parse_unit(data: &[u8]) -> Option<(Unit, usize)> {
    let mut buf = data;
    if buf.remaining() < UNIT_PREFIX {
        return None;
    }
    let len = buf.get_u32() as usize;
    if len == 0 || buf.remaining() < len {
        return None;
    }
    let mut body = &buf[..len];
    let kind = body.get_u8();
    let unit = match kind {
        KIND_SEQUENCE_HEADER if body.remaining() >= 12 => Unit::Header(SequenceHeader {
            width: body.get_u16(),
            height: body.get_u16(),
            frame_rate: (body.get_u16(), body.get_u16()),
            aspect_ratio: (body.get_u16(), body.get_u16()),
        }),
        KIND_PICTURE if body.remaining() >= 3 => Unit::Picture {
            pic_struct: PicStruct::from_bits_truncate(body.get_u16()),
            fill: body.get_u8(),
        },
        _ => Unit::Other,
    };
    Some((unit, UNIT_PREFIX + len))
}

/// Writer for synthetic elementary streams.
#[derive(Debug, Default)]
pub struct SimStream {
    buf: BytesMut,
}

impl SimStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sequence header unit.
    pub fn sequence_header(&mut self, header: SequenceHeader) -> &mut Self {
        self.buf.put_u32(13);
        self.buf.put_u8(KIND_SEQUENCE_HEADER);
        self.buf.put_u16(header.width);
        self.buf.put_u16(header.height);
        self.buf.put_u16(header.frame_rate.0);
        self.buf.put_u16(header.frame_rate.1);
        self.buf.put_u16(header.aspect_ratio.0);
        self.buf.put_u16(header.aspect_ratio.1);
        self
    }

    /// Append a picture unit.
    pub fn picture(&mut self, pic_struct: PicStruct, fill: u8) -> &mut Self {
        self.buf.put_u32(4);
        self.buf.put_u8(KIND_PICTURE);
        self.buf.put_u16(pic_struct.bits());
        self.buf.put_u8(fill);
        self
    }

    /// Take everything written so far.
    pub fn split(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Single header unit.
    #[must_use]
    pub fn header_unit(header: SequenceHeader) -> Bytes {
        Self::new().sequence_header(header).split()
    }

    /// Single progressive picture unit.
    #[must_use]
    pub fn picture_unit(fill: u8) -> Bytes {
        Self::new().picture(PicStruct::PROGRESSIVE, fill).split()
    }
}

/// Behaviour knobs of the reference device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Implementation reported when the caller asks for `Auto`.
    pub implementation: Implementation,
    /// Decoded pictures held back for reordering before output starts.
    pub reorder_depth: usize,
    /// Number of submissions answered with `DeviceBusy` before work is accepted.
    pub busy_polls: u32,
    /// Never signal completions.
    pub stall_sync: bool,
    /// Increment used when the device derives timestamps itself.
    pub timestamp_step: i64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            implementation: Implementation::Hardware,
            reorder_depth: 0,
            busy_polls: 0,
            stall_sync: false,
            timestamp_step: 1,
        }
    }
}

/// Opens [`SimDevice`] sessions and counts them.
#[derive(Debug, Clone, Default)]
pub struct SimLoader {
    config: SimConfig,
    opened: Arc<AtomicUsize>,
}

impl SimLoader {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sessions opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl DeviceLoader for SimLoader {
    type Device = SimDevice;

    fn open(&self, implementation: Implementation, version: ApiVersion) -> Result<SimDevice, MfxStatus> {
        if version > SIM_API_VERSION {
            return Err(MfxStatus::Unsupported);
        }
        let implementation = match implementation {
            Implementation::Auto => self.config.implementation,
            other => other,
        };
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(SimDevice::new(SimConfig {
            implementation,
            ..self.config.clone()
        }))
    }
}

#[derive(Debug)]
struct HeldPicture {
    surface: SurfaceId,
    lock: SurfaceLock,
    pts: Option<i64>,
    order: u64,
}

#[derive(Debug)]
struct DecodeState {
    info: FrameInfo,
    held: Vec<HeldPicture>,
    decoded: u64,
    last_pts: Option<i64>,
}

#[derive(Debug)]
struct EncodeInput {
    lock: SurfaceLock,
    pts: Option<i64>,
    pic_struct: PicStruct,
    fill: u8,
    display_index: u64,
}

#[derive(Debug)]
struct EncodeState {
    params: VideoParams,
    held: Vec<EncodeInput>,
    ready: VecDeque<(EncodeInput, FrameType)>,
    received: u64,
}

#[derive(Debug, Default)]
struct TokenSlot {
    generation: u32,
    release: Option<SurfaceLock>,
}

/// Software implementation of [`Device`].
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    busy_polls: u32,
    decode: Option<DecodeState>,
    encode: Option<EncodeState>,
    tokens: Vec<TokenSlot>,
    closed: bool,
}

impl SimDevice {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            busy_polls: config.busy_polls,
            config,
            decode: None,
            encode: None,
            tokens: Vec::new(),
            closed: false,
        }
    }

    /// Completions issued but not yet synchronized.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tokens.iter().filter(|slot| slot.release.is_some()).count()
    }

    fn issue_token(&mut self, lock: SurfaceLock) -> SyncToken {
        let index = match self.tokens.iter().position(|slot| slot.release.is_none()) {
            Some(index) => index,
            None => {
                self.tokens.push(TokenSlot::default());
                self.tokens.len() - 1
            }
        };
        let slot = &mut self.tokens[index];
        slot.release = Some(lock);
        SyncToken {
            index: index as u32,
            generation: slot.generation,
        }
    }

    fn cancel_tokens(&mut self) {
        for slot in &mut self.tokens {
            if let Some(lock) = slot.release.take() {
                lock.decrement();
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    fn take_busy_poll(&mut self) -> bool {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return true;
        }
        false
    }

    /// Hand out the held picture that comes first in presentation order.
    fn emit_decoded(&mut self) -> Option<(SurfaceId, SyncToken)> {
        let state = self.decode.as_mut()?;
        let next = state
            .held
            .iter()
            .enumerate()
            .min_by_key(|(_, picture)| (picture.pts.unwrap_or(i64::MIN), picture.order))
            .map(|(index, _)| index)?;
        let picture = state.held.swap_remove(next);
        let token = self.issue_token(picture.lock);
        Some((picture.surface, token))
    }

    fn emit_encoded(&mut self, output: &mut OutputBitstream) -> (MfxStatus, Option<SyncToken>) {
        let Some((input, frame_type)) = self.encode.as_mut().and_then(|state| state.ready.pop_front()) else {
            return (MfxStatus::MoreData, None);
        };
        output.reset();
        output.data.extend_from_slice(&SimStream::new().picture(input.pic_struct, input.fill).split());
        output.timestamp = input.pts;
        output.frame_type = frame_type;
        trace!(display_index = input.display_index, ?frame_type, "sim encoded picture");
        let token = self.issue_token(input.lock);
        (MfxStatus::NoError, Some(token))
    }
}

fn write_picture(surface: &mut Surface, fill: u8) -> bool {
    let Some(frame) = surface.data.frame.as_mut() else {
        return false;
    };
    let luma_len = frame.pitch() * frame.rows();
    frame.modify(|data| {
        data[..luma_len].fill(fill);
        data[luma_len..].fill(128);
    });
    true
}

impl Device for SimDevice {
    fn query_implementation(&self) -> Implementation {
        self.config.implementation
    }

    fn decode_header(&mut self, bitstream: &mut Bitstream, params: &mut VideoParams) -> MfxStatus {
        if self.closed {
            return MfxStatus::InvalidHandle;
        }
        loop {
            match parse_unit(bitstream.data()) {
                None => return MfxStatus::MoreData,
                Some((Unit::Header(header), _)) => {
                    params.frame_info = header.frame_info();
                    return MfxStatus::NoError;
                }
                Some((_, len)) => bitstream.advance(len),
            }
        }
    }

    fn query_io_surfaces(&mut self, params: &VideoParams) -> Result<SurfaceRequest, MfxStatus> {
        if params.frame_info.width == 0 || params.frame_info.height == 0 {
            return Err(MfxStatus::InvalidVideoParam);
        }
        let min = self.config.reorder_depth as u16 + 1;
        Ok(SurfaceRequest {
            num_frame_min: min,
            num_frame_suggested: min + params.async_depth.max(1),
        })
    }

    fn decode_init(&mut self, params: &VideoParams) -> MfxStatus {
        if self.closed {
            return MfxStatus::InvalidHandle;
        }
        if Codec::from_fourcc(params.codec_id).is_err() {
            return MfxStatus::Unsupported;
        }
        if params.frame_info.width == 0 {
            return MfxStatus::InvalidVideoParam;
        }
        self.decode = Some(DecodeState {
            info: params.frame_info,
            held: Vec::new(),
            decoded: 0,
            last_pts: None,
        });
        MfxStatus::NoError
    }

    fn decode_frame_async(&mut self, bitstream: Option<&mut Bitstream>, work: &mut Surface) -> DecodeStep {
        if self.closed {
            return DecodeStep::status(MfxStatus::InvalidHandle);
        }
        if self.take_busy_poll() {
            return DecodeStep::status(MfxStatus::DeviceBusy);
        }
        if work.lock.is_locked() {
            return DecodeStep::status(MfxStatus::UndefinedBehavior);
        }
        let reorder_depth = self.config.reorder_depth;
        let step = self.config.timestamp_step;
        let Some(state) = self.decode.as_mut() else {
            return DecodeStep::status(MfxStatus::NotInitialized);
        };

        let Some(bs) = bitstream else {
            return match self.emit_decoded() {
                Some(output) => DecodeStep {
                    status: MfxStatus::NoError,
                    output: Some(output),
                },
                None => DecodeStep::status(MfxStatus::MoreData),
            };
        };

        loop {
            match parse_unit(bs.data()) {
                None => return DecodeStep::status(MfxStatus::MoreData),
                Some((Unit::Header(header), len)) => {
                    let info = header.frame_info();
                    if info.width != state.info.width
                        || info.height != state.info.height
                        || info.crop_w != state.info.crop_w
                        || info.crop_h != state.info.crop_h
                    {
                        debug!(width = header.width, height = header.height, "sim saw incompatible header");
                        return DecodeStep::status(MfxStatus::IncompatibleVideoParam);
                    }
                    bs.advance(len);
                    return DecodeStep::status(MfxStatus::VideoParamChanged);
                }
                Some((Unit::Picture { pic_struct, fill }, len)) => {
                    if !write_picture(work, fill) {
                        return DecodeStep::status(MfxStatus::NullPtr);
                    }
                    let pts = match bs.timestamp() {
                        Some(pts) => Some(pts),
                        None => state.last_pts.map(|last| last + step),
                    };
                    state.last_pts = pts;
                    work.data.timestamp = pts;
                    work.info.pic_struct = pic_struct;
                    work.lock.increment();
                    state.held.push(HeldPicture {
                        surface: work.id,
                        lock: work.lock.clone(),
                        pts,
                        order: state.decoded,
                    });
                    state.decoded += 1;
                    bs.advance(len);
                    break;
                }
                Some((Unit::Other, len)) => bs.advance(len),
            }
        }

        let held = state.held.len();
        let more_units = parse_unit(bs.data()).is_some();
        if held > reorder_depth {
            if let Some(output) = self.emit_decoded() {
                return DecodeStep {
                    status: MfxStatus::NoError,
                    output: Some(output),
                };
            }
        }
        if more_units {
            DecodeStep::status(MfxStatus::MoreSurface)
        } else {
            DecodeStep::status(MfxStatus::MoreData)
        }
    }

    fn decode_reset(&mut self, params: &VideoParams) -> MfxStatus {
        let Some(state) = self.decode.as_mut() else {
            return MfxStatus::NotInitialized;
        };
        for picture in state.held.drain(..) {
            picture.lock.decrement();
        }
        state.info = params.frame_info;
        state.last_pts = None;
        self.cancel_tokens();
        MfxStatus::NoError
    }

    fn encode_query_io_surfaces(&mut self, params: &VideoParams) -> Result<SurfaceRequest, MfxStatus> {
        if params.frame_info.width == 0 || params.frame_info.height == 0 {
            return Err(MfxStatus::InvalidVideoParam);
        }
        let min = params.encode.gop_ref_dist.max(1);
        Ok(SurfaceRequest {
            num_frame_min: min,
            num_frame_suggested: min + params.async_depth.max(1),
        })
    }

    fn encode_init(&mut self, params: &VideoParams) -> MfxStatus {
        if self.closed {
            return MfxStatus::InvalidHandle;
        }
        let info = &params.frame_info;
        if Codec::from_fourcc(params.codec_id).is_err() {
            return MfxStatus::Unsupported;
        }
        if info.width % 16 != 0 || info.height % 32 != 0 || info.crop_w > info.width {
            return MfxStatus::InvalidVideoParam;
        }
        self.encode = Some(EncodeState {
            params: params.clone(),
            held: Vec::new(),
            ready: VecDeque::new(),
            received: 0,
        });
        MfxStatus::NoError
    }

    fn encode_video_param(&mut self, params: &mut VideoParams) -> Result<Vec<u8>, MfxStatus> {
        let Some(state) = self.encode.as_ref() else {
            return Err(MfxStatus::NotInitialized);
        };
        *params = state.params.clone();
        let info = &params.frame_info;
        let picture_bytes = info.width as usize * info.height as usize * 3 / 2;
        params.encode.buffer_size_kb = (picture_bytes / 1000).max(1) as u32;

        let header = SequenceHeader {
            width: info.crop_w as u16,
            height: info.crop_h as u16,
            frame_rate: (info.frame_rate.num as u16, info.frame_rate.den as u16),
            aspect_ratio: (info.aspect_ratio.num as u16, info.aspect_ratio.den as u16),
        };
        Ok(SimStream::header_unit(header).to_vec())
    }

    fn encode_frame_async(
        &mut self,
        surface: Option<&Surface>,
        output: &mut OutputBitstream,
    ) -> (MfxStatus, Option<SyncToken>) {
        if self.closed {
            return (MfxStatus::InvalidHandle, None);
        }
        if self.take_busy_poll() {
            return (MfxStatus::DeviceBusy, None);
        }
        let Some(state) = self.encode.as_mut() else {
            return (MfxStatus::NotInitialized, None);
        };

        let ref_dist = usize::from(state.params.encode.gop_ref_dist.max(1));
        let gop = u64::from(state.params.encode.gop_pic_size);

        match surface {
            Some(surface) => {
                let Some(fill) = surface.data.frame.as_ref().map(|frame| frame.luma()[0]) else {
                    return (MfxStatus::NullPtr, None);
                };
                surface.lock.increment();
                state.held.push(EncodeInput {
                    lock: surface.lock.clone(),
                    pts: surface.data.timestamp,
                    pic_struct: surface.info.pic_struct,
                    fill,
                    display_index: state.received,
                });
                state.received += 1;
                let first = state.held.len() == 1 && state.held[0].display_index == 0;
                if first || state.held.len() >= ref_dist {
                    release_group(state, gop);
                }
            }
            None => {
                if !state.held.is_empty() {
                    release_group(state, gop);
                }
            }
        }

        self.emit_encoded(output)
    }

    fn sync_operation(&mut self, token: SyncToken, _timeout: Duration) -> MfxStatus {
        let Some(slot) = self.tokens.get_mut(token.index as usize) else {
            return MfxStatus::InvalidHandle;
        };
        if slot.generation != token.generation || slot.release.is_none() {
            return MfxStatus::InvalidHandle;
        }
        if self.config.stall_sync {
            return MfxStatus::InExecution;
        }
        if let Some(lock) = slot.release.take() {
            lock.decrement();
        }
        slot.generation = slot.generation.wrapping_add(1);
        MfxStatus::NoError
    }

    fn close(&mut self) -> MfxStatus {
        if self.closed {
            return MfxStatus::InvalidHandle;
        }
        if let Some(state) = self.decode.take() {
            for picture in state.held {
                picture.lock.decrement();
            }
        }
        if let Some(state) = self.encode.take() {
            for input in state.held.into_iter().chain(state.ready.into_iter().map(|(input, _)| input)) {
                input.lock.decrement();
            }
        }
        self.cancel_tokens();
        self.closed = true;
        MfxStatus::NoError
    }
}

/// Move the held inputs to the output queue in coded order: the anchor
/// (last held picture) first, then the pictures it closes as B-frames.
fn release_group(state: &mut EncodeState, gop: u64) {
    let Some(anchor) = state.held.pop() else {
        return;
    };
    let anchor_type = if anchor.display_index == 0 || (gop > 0 && anchor.display_index % gop == 0) {
        FrameType::I | FrameType::REF | FrameType::IDR
    } else {
        FrameType::P | FrameType::REF
    };
    state.ready.push_back((anchor, anchor_type));
    for input in state.held.drain(..) {
        state.ready.push_back((input, FrameType::B));
    }
}
