//! Presentation-to-decode timestamp bookkeeping.
//!
//! The device hands back frames in presentation order carrying only their
//! presentation timestamp. The ledger remembers which decode timestamp each
//! submitted unit carried so it can be restored on output.

use tracing::{debug, error};

use crate::CodecError;

/// A pending (pts, dts) association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPair {
    pub pts: i64,
    pub dts: i64,
}

/// Size the table should grow to when `current` slots are all taken.
///
/// Before the first frame comes out the pipeline is still filling, so the
/// table doubles. Right after the first output the reorder depth is known to
/// be bounded by `reorder_window`, so the table grows to hold that many
/// entries beyond what was recorded so far. Later growth doubles again.
#[must_use]
pub fn grow_target(current: usize, recorded: u64, frames_output: u64, reorder_window: usize) -> usize {
    let doubled = current.max(1) * 2;
    let target = if frames_output == 1 {
        usize::try_from(recorded).unwrap_or(usize::MAX).saturating_add(reorder_window)
    } else {
        doubled
    };
    target.max(current + 1)
}

/// Flat table of pending timestamp pairs.
#[derive(Debug)]
pub struct TimestampLedger {
    entries: Vec<Option<TimestampPair>>,
    initial_size: usize,
    reorder_window: usize,
    recorded: u64,
    frames_output: u64,
    /// Units submitted with a pts but no dts. Their outputs resolve to `None`.
    untracked: usize,
}

impl TimestampLedger {
    /// Ledger whose table starts at `initial_size` slots on first use.
    #[must_use]
    pub fn new(initial_size: usize, reorder_window: usize) -> Self {
        Self {
            entries: Vec::new(),
            initial_size: initial_size.max(1),
            reorder_window,
            recorded: 0,
            frames_output: 0,
            untracked: 0,
        }
    }

    /// Remember that the unit presented at `pts` was submitted with `dts`.
    pub fn record(&mut self, pts: Option<i64>, dts: Option<i64>) -> Result<(), CodecError> {
        let (pts, dts) = match (pts, dts) {
            (Some(pts), Some(dts)) => (pts, dts),
            (Some(_), None) => {
                self.untracked += 1;
                return Ok(());
            }
            (None, _) => return Ok(()),
        };

        if self.entries.is_empty() {
            self.resize(self.initial_size)?;
        }

        let slot = match self.entries.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                let current = self.entries.len();
                let target = grow_target(current, self.recorded, self.frames_output, self.reorder_window);
                debug!(from = current, to = target, "growing timestamp ledger");
                self.resize(target)?;
                current
            }
        };

        self.entries[slot] = Some(TimestampPair { pts, dts });
        self.recorded += 1;
        Ok(())
    }

    /// Take the decode timestamp recorded for `pts`.
    ///
    /// A miss means the device returned a timestamp that was never submitted
    /// and is reported as [`CodecError::Bug`].
    pub fn resolve(&mut self, pts: Option<i64>) -> Result<Option<i64>, CodecError> {
        let Some(pts) = pts else {
            return Ok(None);
        };

        let found = self
            .entries
            .iter_mut()
            .find(|entry| matches!(entry, Some(pair) if pair.pts == pts));

        match found {
            Some(entry) => Ok(entry.take().map(|pair| pair.dts)),
            None if self.untracked > 0 => {
                self.untracked -= 1;
                Ok(None)
            }
            None => {
                error!(pts, "requested pts does not match any dts");
                Err(CodecError::bug(format!("pts {pts} does not match any recorded dts")))
            }
        }
    }

    /// Count one frame handed to the caller. Drives the growth policy.
    pub fn note_output(&mut self) {
        self.frames_output += 1;
    }

    /// Drop every entry and forget the growth phase.
    pub fn clear(&mut self) {
        self.entries = Vec::new();
        self.recorded = 0;
        self.frames_output = 0;
        self.untracked = 0;
    }

    /// Pending pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table slots currently allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn resize(&mut self, size: usize) -> Result<(), CodecError> {
        let extra = size.saturating_sub(self.entries.len());
        self.entries
            .try_reserve_exact(extra)
            .map_err(|_| CodecError::OutOfMemory)?;
        self.entries.resize(size, None);
        Ok(())
    }
}
