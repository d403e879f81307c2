//! Encode session driver.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, trace};

use super::api::{
    Device, DeviceLoader, EncodeParams, MfxStatus, OutputBitstream, RateControl, SurfaceId, TargetUsage,
    VideoParams,
};
use super::{log_implementation, BusyWait};
use crate::frame::{FrameBuffer, VideoFrame};
use crate::pending::PendingQueue;
use crate::pool::BufferPool;
use crate::traits::{EncodedPacket, FrameAllocator, VideoEncoder};
use crate::types::{
    align_up, ApiVersion, Codec, EncoderConfig, FrameInfo, PicStruct, PixelFormat, RateControlMode, Rational,
};
use crate::CodecError;

const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Quick Sync encoder.
///
/// Frames go in in presentation order. Packets come out in coded order with
/// a decode timestamp derived from the queued presentation timestamps.
pub struct QsvEncoder<D: Device> {
    device: Option<D>,
    config: EncoderConfig,
    params: VideoParams,
    allocator: Arc<dyn FrameAllocator>,
    extradata: Vec<u8>,
    surfaces: BufferPool,
    outputs: Vec<OutputSlot>,
    pending: PendingQueue<usize>,
    inputs: VecDeque<InputFrame>,
    /// Presentation timestamps in submission order.
    pts_queue: VecDeque<Option<i64>>,
    first_pts: Option<i64>,
    /// Interval between the first two input timestamps.
    pts_delay: Option<i64>,
    frames_in: u64,
}

#[derive(Debug)]
struct OutputSlot {
    buffer: OutputBitstream,
    in_use: bool,
}

#[derive(Debug)]
struct InputFrame {
    buffer: FrameBuffer,
    pts: Option<i64>,
    pic_struct: PicStruct,
}

impl<D: Device> QsvEncoder<D> {
    /// Open an encode session.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration asks for an unimplemented rate control or codec
    /// - The runtime cannot be loaded
    /// - The device rejects the parameters
    pub fn open<L>(loader: &L, mut config: EncoderConfig, allocator: Arc<dyn FrameAllocator>) -> Result<Self, CodecError>
    where
        L: DeviceLoader<Device = D>,
    {
        if config.async_depth == 0 {
            debug!("async depth 0 clamped to 1");
            config.async_depth = 1;
        }
        let mut params = video_params(&config)?;

        let mut device = loader
            .open(config.implementation, ApiVersion::REQUIRED)
            .map_err(|status| {
                error!(?status, "error initializing an internal session");
                CodecError::from(status)
            })?;
        log_implementation(device.query_implementation());

        info!(
            codec = ?config.codec,
            width = config.width,
            height = config.height,
            gop = params.encode.gop_pic_size,
            ref_dist = params.encode.gop_ref_dist,
            rate_control = ?params.encode.rate_control,
            "encoder parameters"
        );

        let request = match device.encode_query_io_surfaces(&params) {
            Ok(request) => request,
            Err(status) => {
                error!(?status, "error querying encoder surfaces");
                let _ = device.close();
                return Err(status.into());
            }
        };
        if let Err(err) = device.encode_init(&params).result() {
            error!(%err, "error initializing the encoder");
            let _ = device.close();
            return Err(err);
        }
        let extradata = match device.encode_video_param(&mut params) {
            Ok(extradata) => extradata,
            Err(status) => {
                error!(?status, "error retrieving encoding parameters");
                let _ = device.close();
                return Err(status.into());
            }
        };
        debug!(
            buffer_size_kb = params.encode.buffer_size_kb,
            extradata = extradata.len(),
            "encoder initialized"
        );

        let surfaces = BufferPool::new(
            params.frame_info,
            usize::from(request.num_frame_suggested),
            allocator.clone(),
        );

        Ok(Self {
            device: Some(device),
            config,
            params,
            allocator,
            extradata,
            surfaces,
            outputs: Vec::new(),
            pending: PendingQueue::new(),
            inputs: VecDeque::new(),
            pts_queue: VecDeque::new(),
            first_pts: None,
            pts_delay: None,
            frames_in: 0,
        })
    }

    /// Encode `frame`, or drain buffered frames when `None`.
    ///
    /// Returns at most one packet per call. Keep calling with `None` until it
    /// returns `Ok(None)` to drain the encoder.
    pub fn encode(&mut self, frame: Option<&VideoFrame>) -> Result<Option<EncodedPacket>, CodecError> {
        let flushing = frame.is_none();
        if let Some(frame) = frame {
            let buffer = self.prepare_input(frame)?;
            self.note_pts(frame.pts);
            self.inputs.push_back(InputFrame {
                buffer,
                pts: frame.pts,
                pic_struct: frame.pic_struct(),
            });
        }

        let mut status = if flushing {
            MfxStatus::NoError
        } else {
            MfxStatus::MoreData
        };
        let mut surface: Option<SurfaceId> = None;
        let mut busy = BusyWait::new(self.config.busy_timeout, BUSY_POLL_INTERVAL);

        loop {
            if status == MfxStatus::MoreData {
                let Some(input) = self.inputs.pop_front() else {
                    break;
                };
                surface = Some(self.load_surface(input)?);
            }

            let slot = self.acquire_output()?;
            let device = self.device.as_mut().ok_or(CodecError::InvalidHandle)?;
            let input = surface.map(|id| self.surfaces.surface(id)).transpose()?;
            let (result, token) = device.encode_frame_async(input, &mut self.outputs[slot].buffer);
            status = result;

            match token {
                Some(token) => self.pending.push(slot, token),
                None => self.outputs[slot].in_use = false,
            }

            if status == MfxStatus::DeviceBusy {
                busy.wait()?;
            } else {
                busy.reset();
            }

            if !matches!(status, MfxStatus::MoreData | MfxStatus::DeviceBusy) {
                break;
            }
        }

        if status != MfxStatus::MoreData {
            status.result().map_err(|err| {
                error!(%err, "error during encoding");
                err
            })?;
        }

        let threshold = usize::from(self.config.async_depth.max(1));
        if self.pending.reached(threshold) || (flushing && !self.pending.is_empty()) {
            return self.sync_oldest().map(Some);
        }
        Ok(None)
    }

    /// Copy `frame` into storage the device can read in place.
    fn prepare_input(&self, frame: &VideoFrame) -> Result<FrameBuffer, CodecError> {
        let buffer = &frame.buffer;
        if buffer.format() == PixelFormat::Nv12 && buffer.is_encode_aligned() {
            return Ok(buffer.clone());
        }
        let info = &self.params.frame_info;
        let mut aligned = self.allocator.allocate(info.width, info.height, PixelFormat::Nv12)?;
        buffer.copy_into(&mut aligned)?;
        Ok(aligned)
    }

    fn note_pts(&mut self, pts: Option<i64>) {
        match self.frames_in {
            0 => self.first_pts = pts,
            1 => {
                if let (Some(first), Some(second)) = (self.first_pts, pts) {
                    self.pts_delay = Some(second - first);
                }
            }
            _ => {}
        }
        self.frames_in += 1;
        self.pts_queue.push_back(pts);
    }

    fn load_surface(&mut self, input: InputFrame) -> Result<SurfaceId, CodecError> {
        let id = self.surfaces.acquire_with(input.buffer)?;
        let surface = self.surfaces.surface_mut(id)?;
        surface.info.pic_struct = input.pic_struct;
        surface.data.timestamp = input.pts;
        Ok(id)
    }

    /// Index of an output buffer no pending operation writes into.
    fn acquire_output(&mut self) -> Result<usize, CodecError> {
        if let Some(index) = self.outputs.iter().position(|slot| !slot.in_use) {
            let slot = &mut self.outputs[index];
            slot.in_use = true;
            slot.buffer.reset();
            return Ok(index);
        }
        let capacity = self.params.encode.buffer_size_kb as usize * 1000;
        self.outputs.try_reserve(1).map_err(|_| CodecError::OutOfMemory)?;
        self.outputs.push(OutputSlot {
            buffer: OutputBitstream::with_capacity(capacity),
            in_use: true,
        });
        Ok(self.outputs.len() - 1)
    }

    fn sync_oldest(&mut self) -> Result<EncodedPacket, CodecError> {
        let entry = *self
            .pending
            .front()
            .ok_or_else(|| CodecError::bug("sync with nothing pending"))?;
        let device = self.device.as_mut().ok_or(CodecError::InvalidHandle)?;
        match device.sync_operation(entry.token, self.config.sync_timeout) {
            MfxStatus::NoError => {}
            MfxStatus::InExecution => {
                error!("timed out waiting for an encoded packet");
                return Err(CodecError::SyncTimeout {
                    timeout_ms: self.config.sync_timeout.as_millis() as u64,
                });
            }
            status => return Err(status.into()),
        }
        self.pending.pop();

        let dts = self.next_dts();
        let slot = self
            .outputs
            .get_mut(entry.item)
            .ok_or_else(|| CodecError::bug(format!("output buffer {} missing", entry.item)))?;
        let frame_type = slot.buffer.frame_type;
        let pts = slot.buffer.timestamp;
        trace!(?pts, ?dts, ?frame_type, "encoded packet");

        let packet = EncodedPacket {
            data: Bytes::copy_from_slice(&slot.buffer.data),
            pts,
            dts,
            frame_type,
            is_keyframe: frame_type.is_keyframe(),
        };
        slot.buffer.reset();
        slot.in_use = false;
        Ok(packet)
    }

    /// Next queued pts shifted back by the reorder delay.
    fn next_dts(&mut self) -> Option<i64> {
        let pts = self.pts_queue.pop_front().flatten()?;
        let delay = i64::from(self.params.encode.gop_ref_dist > 1);
        Some(pts - delay * self.pts_delay.unwrap_or(0))
    }

    /// Effective session parameters after the device adjusted them.
    #[must_use]
    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    /// Close the device and drop buffered frames.
    pub fn close(&mut self) -> Result<(), CodecError> {
        self.pending.clear();
        self.inputs.clear();
        self.pts_queue.clear();
        match self.device.take() {
            Some(mut device) => device.close().result(),
            None => Ok(()),
        }
    }
}

impl<D: Device> Drop for QsvEncoder<D> {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            let _ = device.close();
        }
    }
}

impl<D: Device> VideoEncoder for QsvEncoder<D> {
    fn encode(&mut self, frame: Option<&VideoFrame>) -> Result<Option<EncodedPacket>, CodecError> {
        QsvEncoder::encode(self, frame)
    }

    fn extradata(&self) -> &[u8] {
        &self.extradata
    }

    fn codec(&self) -> Codec {
        self.config.codec
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn close(&mut self) -> Result<(), CodecError> {
        QsvEncoder::close(self)
    }
}

/// Quantizer for one frame type in constant-QP mode.
fn quantizer(quality: f32, factor: f32, offset: f32) -> u8 {
    let mut quant = quality;
    if factor != 0.0 {
        quant *= factor.abs();
    }
    quant += offset;
    (quant as i32).clamp(0, 51) as u8
}

/// Translate an encoder configuration into a session parameter block.
fn video_params(config: &EncoderConfig) -> Result<VideoParams, CodecError> {
    if config.width == 0 || config.height == 0 {
        return Err(CodecError::invalid_param(format!(
            "invalid dimensions {}x{}",
            config.width, config.height
        )));
    }
    if config.codec == Codec::Vc1 {
        return Err(CodecError::unsupported("VC-1 encoding"));
    }

    let rate_control = match config.rate_control {
        RateControlMode::Cbr => RateControl::Cbr {
            target_kbps: config.bitrate / 1000,
        },
        RateControlMode::Vbr => RateControl::Vbr {
            target_kbps: config.bitrate / 1000,
            max_kbps: config.max_bitrate / 1000,
        },
        RateControlMode::ConstQp => RateControl::ConstQp {
            qpi: quantizer(config.quality, config.i_quant_factor, config.i_quant_offset),
            qpp: quantizer(config.quality, 0.0, 0.0),
            qpb: quantizer(config.quality, config.b_quant_factor, config.b_quant_offset),
        },
        mode @ (RateControlMode::Avbr | RateControlMode::LookAhead) => {
            error!(?mode, "rate control method is not implemented");
            return Err(CodecError::invalid_param(format!("{mode:?} rate control")));
        }
    };

    let (num, den) = config.framerate;
    Ok(VideoParams {
        codec_id: config.codec.fourcc(),
        async_depth: config.async_depth,
        frame_info: FrameInfo {
            fourcc: PixelFormat::Nv12,
            width: align_up(config.width, 16),
            height: align_up(config.height, 32),
            crop_w: config.width,
            crop_h: config.height,
            frame_rate: Rational::new(num, den),
            aspect_ratio: config.sample_aspect_ratio,
            pic_struct: PicStruct::empty(),
        },
        encode: EncodeParams {
            target_usage: TargetUsage::Balanced,
            gop_pic_size: config.gop_length,
            gop_ref_dist: (config.b_frames.clamp(-1, 16) + 1) as u16,
            closed_gop: true,
            idr_interval: 0,
            num_slice: config.slices,
            num_ref_frame: config.ref_frames,
            rate_control,
            buffer_size_kb: 0,
            cavlc: config.cavlc,
        },
    })
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimDevice, SimLoader};
    use crate::traits::SystemAllocator;

    fn open(config: EncoderConfig) -> QsvEncoder<SimDevice> {
        let loader = SimLoader::new(SimConfig::default());
        QsvEncoder::open(&loader, config, Arc::new(SystemAllocator)).unwrap()
    }

    fn frame(fill: u8, pts: i64) -> VideoFrame {
        let mut data = vec![fill; 64 * 48];
        data.extend(std::iter::repeat(128).take(64 * 24));
        VideoFrame::from_nv12(64, 48, data, Some(pts)).unwrap()
    }

    #[test]
    fn test_constant_qp_quantizers() {
        let params = video_params(&EncoderConfig::new(64, 48).constant_qp(23.0)).unwrap();
        assert_eq!(
            params.encode.rate_control,
            RateControl::ConstQp {
                qpi: 21,
                qpp: 23,
                qpb: 24
            }
        );

        let params = video_params(&EncoderConfig::new(64, 48).constant_qp(60.0)).unwrap();
        assert!(matches!(params.encode.rate_control, RateControl::ConstQp { qpp: 51, .. }));
    }

    #[test]
    fn test_frame_info_alignment() {
        let params = video_params(&EncoderConfig::new(1920, 1080).gop(60, 2)).unwrap();
        let info = params.frame_info;
        assert_eq!((info.width, info.height), (1920, 1088));
        assert_eq!((info.crop_w, info.crop_h), (1920, 1080));
        assert_eq!(params.encode.gop_ref_dist, 3);
        assert_eq!(
            params.encode.rate_control,
            RateControl::Vbr {
                target_kbps: 5000,
                max_kbps: 8000
            }
        );

        let params = video_params(&EncoderConfig::new(64, 48).gop(30, -5)).unwrap();
        assert_eq!(params.encode.gop_ref_dist, 0);
    }

    #[test]
    fn test_rejects_unimplemented_configs() {
        for mode in [RateControlMode::Avbr, RateControlMode::LookAhead] {
            let err = video_params(&EncoderConfig::new(64, 48).rate_control(mode)).unwrap_err();
            assert!(matches!(err, CodecError::InvalidParam(_)));
        }
        assert!(video_params(&EncoderConfig::new(0, 48)).is_err());
        let err = video_params(&EncoderConfig::new(64, 48).codec(Codec::Vc1)).unwrap_err();
        assert!(matches!(err, CodecError::Unsupported(_)));
    }

    #[test]
    fn test_open_reports_extradata() {
        let encoder = open(EncoderConfig::new(64, 48));
        assert!(!encoder.extradata().is_empty());
        assert!(encoder.params().encode.buffer_size_kb > 0);
        assert_eq!(encoder.dimensions(), (64, 48));
    }

    #[test]
    fn test_low_latency_packet_per_frame() {
        let mut encoder = open(EncoderConfig::new(64, 48).for_low_latency());
        for pts in 0..3 {
            let packet = encoder.encode(Some(&frame(pts as u8, pts))).unwrap().unwrap();
            assert_eq!(packet.pts, Some(pts));
            assert_eq!(packet.dts, Some(pts));
        }
        assert!(encoder.encode(None).unwrap().is_none());
    }

    #[test]
    fn test_unaligned_input_is_copied() {
        let mut encoder = open(EncoderConfig::new(64, 48).for_low_latency());
        // 50 columns: pitch not a multiple of 16
        let mut data = vec![9u8; 50 * 48];
        data.extend(std::iter::repeat(128).take(50 * 24));
        let input = VideoFrame::from_nv12(50, 48, data, Some(0)).unwrap();
        assert!(!input.buffer.is_encode_aligned());

        let packet = encoder.encode(Some(&input)).unwrap().unwrap();
        assert!(packet.is_keyframe);
    }

    #[test]
    fn test_aligned_input_is_not_copied() {
        let encoder = open(EncoderConfig::new(64, 48).for_low_latency());
        let input = VideoFrame::from_nv12(64, 48, vec![3u8; 64 * 72], Some(0)).unwrap();
        assert!(input.buffer.is_encode_aligned());

        let buffer = encoder.prepare_input(&input).unwrap();
        assert_eq!(buffer.data().as_ptr(), input.buffer.data().as_ptr());
    }
}
