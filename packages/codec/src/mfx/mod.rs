//! Quick Sync session layer.
//!
//! Drives decode and encode sessions on a [`Device`]: staging compressed data,
//! handing free surfaces to the device, retrying while it is busy, and
//! synchronizing completions in submission order.
//!
//! # Decoding Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use qsvbridge_codec::mfx::QsvDecoder;
//! use qsvbridge_codec::{Codec, DecoderConfig, SystemAllocator, VideoDecoder};
//!
//! let config = DecoderConfig::new(Codec::H264).for_low_latency();
//! let mut decoder = QsvDecoder::open(loader, config, &extradata, Arc::new(SystemAllocator))?;
//!
//! let output = decoder.decode(Some(&packet))?;
//! if let Some(frame) = output.frame {
//!     // frame.buffer holds NV12 pixels
//! }
//! ```
//!
//! # Encoding Example
//!
//! ```ignore
//! use qsvbridge_codec::mfx::QsvEncoder;
//! use qsvbridge_codec::{EncoderConfig, SystemAllocator, VideoEncoder};
//!
//! let config = EncoderConfig::new(1280, 720).gop(30, 2);
//! let mut encoder = QsvEncoder::open(&loader, config, Arc::new(SystemAllocator))?;
//!
//! if let Some(packet) = encoder.encode(Some(&frame))? {
//!     // packet.dts <= packet.pts
//! }
//! ```

mod api;
mod decoder;
mod encoder;

pub use api::*;
pub use decoder::QsvDecoder;
pub use encoder::QsvEncoder;

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::types::Implementation;
use crate::CodecError;

/// Log which implementation a freshly opened session runs on.
pub(crate) fn log_implementation(implementation: Implementation) {
    match implementation {
        Implementation::Software => info!("using software implementation"),
        Implementation::Hardware => info!("using hardware accelerated implementation"),
        Implementation::Auto => info!("unknown implementation"),
    }
}

/// Tracks how long the device has been answering `DeviceBusy`.
#[derive(Debug)]
pub(crate) struct BusyWait {
    timeout: Duration,
    poll_interval: Duration,
    since: Option<Instant>,
}

impl BusyWait {
    pub(crate) fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            since: None,
        }
    }

    /// Sleep one poll interval, or fail once the device has been busy for
    /// longer than the timeout.
    pub(crate) fn wait(&mut self) -> Result<(), CodecError> {
        let since = *self.since.get_or_insert_with(Instant::now);
        let waited = since.elapsed();
        if waited > self.timeout {
            warn!(waited_ms = waited.as_millis() as u64, "timeout, device is so busy");
            return Err(CodecError::BusyTimeout {
                waited_ms: waited.as_millis() as u64,
            });
        }
        std::thread::sleep(self.poll_interval);
        Ok(())
    }

    /// The device accepted work.
    pub(crate) fn reset(&mut self) {
        self.since = None;
    }
}
