//! Decode session driver.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use super::api::{Device, DeviceLoader, MfxStatus, SurfaceId, SurfaceRequest, VideoParams};
use super::{log_implementation, BusyWait};
use crate::bitstream::Bitstream;
use crate::frame::VideoFrame;
use crate::ledger::TimestampLedger;
use crate::pending::PendingQueue;
use crate::pool::BufferPool;
use crate::traits::{DecodeOutput, FrameAllocator, Packet, VideoDecoder};
use crate::types::{ApiVersion, Codec, DecoderConfig, StreamInfo};
use crate::CodecError;

/// Quick Sync decoder.
///
/// One call to [`QsvDecoder::decode`] takes at most one packet and returns at
/// most one frame. Frames come out in presentation order carrying the decode
/// timestamp their packet was submitted with.
///
/// When the device reports a parameter change it cannot absorb, the decoder
/// drains everything in flight and then rebuilds the session through the
/// loader. Queued packets and their timestamps survive the rebuild.
pub struct QsvDecoder<L: DeviceLoader> {
    loader: L,
    device: Option<L::Device>,
    config: DecoderConfig,
    allocator: Arc<dyn FrameAllocator>,
    params: VideoParams,
    request: SurfaceRequest,
    stream_info: Option<StreamInfo>,
    bitstream: Bitstream,
    pool: BufferPool,
    pending: PendingQueue<SurfaceId>,
    ledger: TimestampLedger,
    /// Packets received but not yet staged for the device.
    packets: VecDeque<Packet>,
    last_status: MfxStatus,
    need_reinit: bool,
    /// Units staged since the session started, for device-derived timestamps.
    staged: u64,
}

impl<L: DeviceLoader> QsvDecoder<L> {
    /// Open a decode session.
    ///
    /// `extradata` is the codec configuration record. It must contain a
    /// sequence header the device can parse.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be loaded, the header cannot be
    /// parsed or the device rejects the parameters.
    pub fn open(
        loader: L,
        mut config: DecoderConfig,
        extradata: &[u8],
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self, CodecError> {
        if config.async_depth == 0 {
            debug!("async depth 0 clamped to 1");
            config.async_depth = 1;
        }

        let mut bitstream = Bitstream::new();
        bitstream.enqueue(extradata)?;
        bitstream.enqueue(config.codec.priming_trailer())?;

        let ledger = TimestampLedger::new(0, config.reorder_window);
        let pool = BufferPool::new(Default::default(), 0, allocator.clone());

        let mut decoder = Self {
            loader,
            device: None,
            config,
            allocator,
            params: VideoParams::default(),
            request: SurfaceRequest::default(),
            stream_info: None,
            bitstream,
            pool,
            pending: PendingQueue::new(),
            ledger,
            packets: VecDeque::new(),
            last_status: MfxStatus::MoreData,
            need_reinit: false,
            staged: 0,
        };
        decoder.init_session()?;
        Ok(decoder)
    }

    /// Open the device, parse the staged header and initialize decoding.
    fn init_session(&mut self) -> Result<(), CodecError> {
        let mut device = self
            .loader
            .open(self.config.implementation, ApiVersion::REQUIRED)
            .map_err(|status| {
                error!(?status, "error initializing an internal session");
                CodecError::from(status)
            })?;
        log_implementation(device.query_implementation());

        let mut params = VideoParams {
            codec_id: self.config.codec.fourcc(),
            async_depth: self.config.async_depth,
            ..Default::default()
        };
        match device.decode_header(&mut self.bitstream, &mut params) {
            MfxStatus::NoError => {}
            MfxStatus::MoreData => {
                let _ = device.close();
                return Err(CodecError::invalid_param("no sequence header in the staged data"));
            }
            status => {
                error!(?status, "error decoding stream header");
                let _ = device.close();
                return Err(status.into());
            }
        }

        let info = StreamInfo::from(&params.frame_info);
        info!(
            width = info.width,
            height = info.height,
            coded_width = info.coded_width,
            coded_height = info.coded_height,
            "decoding stream"
        );

        // On a rebuild the staged data starts with the new header and the
        // pictures that follow it.
        if !self.need_reinit {
            self.bitstream.clear();
        }

        let request = match device.query_io_surfaces(&params) {
            Ok(request) => request,
            Err(status) => {
                let _ = device.close();
                return Err(status.into());
            }
        };
        if let Err(err) = device.decode_init(&params).result() {
            error!(%err, "error initializing the decoder");
            let _ = device.close();
            return Err(err);
        }

        let suggested = usize::from(request.num_frame_suggested);
        if self.ledger.capacity() == 0 {
            self.ledger = TimestampLedger::new(suggested, self.config.reorder_window);
        }
        self.pool = BufferPool::new(params.frame_info, suggested, self.allocator.clone());
        self.pending.clear();
        self.last_status = MfxStatus::MoreData;
        self.request = request;
        self.stream_info = Some(info);
        self.params = params;
        self.device = Some(device);
        Ok(())
    }

    /// Tear the session down and build it again from the staged header.
    fn reinit(&mut self) -> Result<(), CodecError> {
        info!("reinitializing decode session");
        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.close().result() {
                warn!(%err, "closing session before rebuild failed");
            }
        }
        self.pending.clear();
        self.staged = 0;
        let result = self.init_session();
        self.need_reinit = false;
        // Submit the staged remainder before staging another packet, so the
        // pictures in it keep their own timestamp.
        if result.is_ok() && !self.bitstream.is_empty() {
            self.last_status = MfxStatus::NoError;
        }
        result
    }

    /// Move one queued packet into the staging buffer.
    fn stage(&mut self, packet: Packet) -> Result<(), CodecError> {
        self.staged += 1;
        if self.config.timestamps_from_device {
            // The device derives timestamps after the first unit.
            let timestamp = if self.staged > 1 { None } else { packet.pts };
            self.bitstream.set_timestamp(timestamp);
        } else {
            self.ledger.record(packet.pts, packet.dts)?;
            self.bitstream.set_timestamp(packet.pts);
        }
        self.bitstream.enqueue(&packet.data)
    }

    /// Decode one packet, or drain buffered frames when `packet` is `None`.
    ///
    /// # Errors
    ///
    /// Any device failure other than "needs more data/surfaces" or a busy
    /// device that recovers within the configured timeout.
    pub fn decode(&mut self, packet: Option<&Packet>) -> Result<DecodeOutput, CodecError> {
        if self.need_reinit && self.last_status == MfxStatus::MoreData && self.pending.is_empty() {
            self.reinit()?;
        }

        let size = packet.map_or(0, |packet| packet.data.len());
        if let Some(packet) = packet {
            if !packet.data.is_empty() {
                self.packets.push_back(packet.clone());
            }
        }

        let mut flushing = self.need_reinit;
        let mut status = self.last_status;
        let mut busy = BusyWait::new(self.config.busy_timeout, self.config.busy_poll_interval);

        loop {
            match status {
                MfxStatus::MoreData => {
                    if flushing {
                        break;
                    } else if let Some(next) = self.packets.pop_front() {
                        self.stage(next)?;
                    } else if size == 0 {
                        flushing = true;
                    } else {
                        break;
                    }
                }
                MfxStatus::VideoParamChanged => {
                    debug!("compatible parameter change absorbed");
                }
                MfxStatus::IncompatibleVideoParam => {
                    info!("detected new video parameters in the bitstream");
                    if flushing {
                        return Err(CodecError::bug("video parameters changed again while draining"));
                    }
                    flushing = true;
                    self.need_reinit = true;
                }
                _ => {}
            }

            let work = self.pool.acquire()?;
            let device = self.device.as_mut().ok_or(CodecError::InvalidHandle)?;
            let bitstream = if flushing { None } else { Some(&mut self.bitstream) };
            let step = device.decode_frame_async(bitstream, self.pool.surface_mut(work)?);
            status = step.status;

            if let Some((surface, token)) = step.output {
                trace!(surface = surface.0, "decode submitted");
                self.pool.mark_sync_pending(surface)?;
                self.pending.push(surface, token);
            }

            if status == MfxStatus::DeviceBusy {
                busy.wait()?;
            } else {
                busy.reset();
            }

            if !matches!(
                status,
                MfxStatus::MoreSurface
                    | MfxStatus::MoreData
                    | MfxStatus::DeviceBusy
                    | MfxStatus::VideoParamChanged
                    | MfxStatus::IncompatibleVideoParam
            ) {
                break;
            }
        }

        self.last_status = status;
        if status != MfxStatus::MoreData {
            status.result().map_err(|err| {
                error!(%err, "error during decoding");
                err
            })?;
        }

        let mut output = DecodeOutput {
            consumed: size,
            frame: None,
        };
        if self.pending.reached(self.config.sync_threshold())
            || (!self.pending.is_empty() && (size == 0 || self.need_reinit))
        {
            output.frame = Some(self.sync_oldest()?);
        }
        Ok(output)
    }

    /// Wait for the oldest pending completion and hand its frame out.
    fn sync_oldest(&mut self) -> Result<VideoFrame, CodecError> {
        let entry = *self
            .pending
            .front()
            .ok_or_else(|| CodecError::bug("sync with nothing pending"))?;
        let device = self.device.as_mut().ok_or(CodecError::InvalidHandle)?;
        match device.sync_operation(entry.token, self.config.sync_timeout) {
            MfxStatus::NoError => {}
            MfxStatus::InExecution => {
                error!("timed out waiting for a decoded frame");
                return Err(CodecError::SyncTimeout {
                    timeout_ms: self.config.sync_timeout.as_millis() as u64,
                });
            }
            status => return Err(status.into()),
        }
        self.pending.pop();

        let surface = self.pool.surface(entry.item)?;
        let pts = surface.data.timestamp;
        let pic_struct = surface.info.pic_struct;
        let sample_aspect_ratio = surface.info.aspect_ratio;

        let dts = if self.config.timestamps_from_device {
            pts
        } else {
            self.ledger.resolve(pts)?
        };

        let buffer = self.pool.take_frame(entry.item)?;
        self.pool.release(entry.item);
        self.ledger.note_output();

        let mut frame = VideoFrame::new(buffer, pts);
        frame.dts = dts;
        frame.apply_pic_struct(pic_struct);
        frame.sample_aspect_ratio = sample_aspect_ratio;
        Ok(frame)
    }

    /// Drop everything buffered and reset the device, keeping the session.
    ///
    /// Used when seeking. Frames in flight are discarded.
    pub fn flush(&mut self) -> Result<(), CodecError> {
        if self.need_reinit {
            // The new sequence header only exists in the staged data.
            self.reinit()?;
        }
        let device = self.device.as_mut().ok_or(CodecError::InvalidHandle)?;
        let status = device.decode_reset(&self.params);
        self.last_status = MfxStatus::MoreData;
        self.bitstream.clear();
        self.pool = BufferPool::new(
            self.params.frame_info,
            usize::from(self.request.num_frame_suggested),
            self.allocator.clone(),
        );
        self.pending.clear();
        self.ledger.clear();
        self.packets.clear();
        self.staged = 0;
        status.result()
    }

    /// Close the device and release every buffer.
    pub fn close(&mut self) -> Result<(), CodecError> {
        self.pending.clear();
        self.packets.clear();
        self.ledger.clear();
        self.bitstream.clear();
        match self.device.take() {
            Some(mut device) => device.close().result(),
            None => Ok(()),
        }
    }

    /// Stream properties from the most recent header parse.
    #[must_use]
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info
    }

    /// Completions submitted but not yet handed out.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether a rebuild is scheduled once in-flight work drains.
    #[must_use]
    pub fn reinit_pending(&self) -> bool {
        self.need_reinit
    }

    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}

impl<L: DeviceLoader> Drop for QsvDecoder<L> {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            let _ = device.close();
        }
    }
}

impl<L: DeviceLoader> VideoDecoder for QsvDecoder<L> {
    fn decode(&mut self, packet: Option<&Packet>) -> Result<DecodeOutput, CodecError> {
        QsvDecoder::decode(self, packet)
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        QsvDecoder::flush(self)
    }

    fn codec(&self) -> Codec {
        self.config.codec
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info
    }

    fn close(&mut self) -> Result<(), CodecError> {
        QsvDecoder::close(self)
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::{SequenceHeader, SimConfig, SimLoader, SimStream};
    use crate::traits::SystemAllocator;

    fn open(config: SimConfig, decoder: DecoderConfig) -> QsvDecoder<SimLoader> {
        let extradata = SimStream::header_unit(SequenceHeader::new(64, 48));
        QsvDecoder::open(SimLoader::new(config), decoder, &extradata, Arc::new(SystemAllocator)).unwrap()
    }

    fn picture(fill: u8, ts: i64) -> Packet {
        Packet::new(SimStream::picture_unit(fill), Some(ts), Some(ts))
    }

    #[test]
    fn test_open_publishes_stream_info() {
        let decoder = open(SimConfig::default(), DecoderConfig::new(Codec::H264));
        let info = decoder.stream_info().unwrap();
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!((info.coded_width, info.coded_height), (64, 48));
    }

    #[test]
    fn test_open_without_header_fails() {
        let loader = SimLoader::new(SimConfig::default());
        let err = QsvDecoder::open(
            loader,
            DecoderConfig::new(Codec::Hevc),
            &[],
            Arc::new(SystemAllocator),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CodecError::InvalidParam(_)));
    }

    #[test]
    fn test_zero_async_depth_clamped() {
        let mut decoder = open(
            SimConfig::default(),
            DecoderConfig::new(Codec::H264).async_depth(0),
        );
        assert_eq!(decoder.config().async_depth, 1);
        let output = decoder.decode(Some(&picture(3, 0))).unwrap();
        assert!(output.got_frame());
    }

    #[test]
    fn test_async_depth_delays_output() {
        let mut decoder = open(SimConfig::default(), DecoderConfig::new(Codec::H264).async_depth(3));
        assert!(!decoder.decode(Some(&picture(1, 0))).unwrap().got_frame());
        assert!(!decoder.decode(Some(&picture(2, 1))).unwrap().got_frame());
        assert_eq!(decoder.pending(), 2);

        let frame = decoder.decode(Some(&picture(3, 2))).unwrap().frame.unwrap();
        assert_eq!(frame.pts, Some(0));
        assert_eq!(frame.buffer.luma()[0], 1);

        let frame = decoder.decode(None).unwrap().frame.unwrap();
        assert_eq!(frame.pts, Some(1));
        let frame = decoder.decode(None).unwrap().frame.unwrap();
        assert_eq!(frame.pts, Some(2));
        assert!(!decoder.decode(None).unwrap().got_frame());
    }

    #[test]
    fn test_flush_discards_in_flight() {
        let mut decoder = open(SimConfig::default(), DecoderConfig::new(Codec::H264).async_depth(4));
        decoder.decode(Some(&picture(1, 0))).unwrap();
        decoder.decode(Some(&picture(2, 1))).unwrap();
        decoder.flush().unwrap();
        assert_eq!(decoder.pending(), 0);

        // timestamps recorded before the flush are gone
        let output = decoder.decode(Some(&picture(5, 10))).unwrap();
        assert!(!output.got_frame());
        let frame = decoder.decode(None).unwrap().frame.unwrap();
        assert_eq!((frame.pts, frame.dts), (Some(10), Some(10)));
    }

    #[test]
    fn test_closed_session_rejects_calls() {
        let mut decoder = open(SimConfig::default(), DecoderConfig::new(Codec::H264));
        decoder.close().unwrap();
        let err = decoder.decode(Some(&picture(1, 0))).unwrap_err();
        assert!(matches!(err, CodecError::InvalidHandle));
        assert!(decoder.close().is_ok());
    }
}
