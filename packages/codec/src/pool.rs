//! Reusable surface slots shared between the caller and the device.

use std::sync::Arc;

use tracing::trace;

use crate::frame::FrameBuffer;
use crate::mfx::{Surface, SurfaceId, SurfaceLock};
use crate::traits::FrameAllocator;
use crate::types::FrameInfo;
use crate::CodecError;

/// Who currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// The device holds a lock on the surface.
    HardwareOwned,
    /// The surface is queued for synchronization.
    SyncPending,
}

#[derive(Debug)]
struct Slot {
    surface: Surface,
    sync_pending: bool,
}

/// Arena of surfaces grown on demand.
///
/// A slot is handed out by [`BufferPool::acquire`] only when the device holds
/// no lock on it and it is not waiting for synchronization. Slots are never
/// removed individually.
pub struct BufferPool {
    slots: Vec<Slot>,
    info: FrameInfo,
    allocator: Arc<dyn FrameAllocator>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("slots", &self.slots.len())
            .field("info", &self.info)
            .finish()
    }
}

impl BufferPool {
    /// Pool for surfaces described by `info`, expecting about `reserve` slots.
    #[must_use]
    pub fn new(info: FrameInfo, reserve: usize, allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            slots: Vec::with_capacity(reserve),
            info,
            allocator,
        }
    }

    /// Find a slot that is neither locked nor sync-pending and make sure it
    /// has pixel storage. Adds a slot when none qualifies.
    pub fn acquire(&mut self) -> Result<SurfaceId, CodecError> {
        let index = self.find_free()?;
        let info = self.info;
        let slot = &mut self.slots[index];
        if slot.surface.data.frame.is_none() {
            let buffer = self.allocator.allocate(info.width, info.height, info.fourcc)?;
            slot.surface.data.frame = Some(buffer);
        }
        slot.surface.info = info;
        slot.surface.data.timestamp = None;
        Ok(SurfaceId(index))
    }

    /// Like [`BufferPool::acquire`], but installs `buffer` as the slot's
    /// storage, dropping whatever it held before.
    pub fn acquire_with(&mut self, buffer: FrameBuffer) -> Result<SurfaceId, CodecError> {
        let index = self.find_free()?;
        let slot = &mut self.slots[index];
        slot.surface.data.frame = Some(buffer);
        slot.surface.info = self.info;
        slot.surface.data.timestamp = None;
        Ok(SurfaceId(index))
    }

    fn find_free(&mut self) -> Result<usize, CodecError> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| !slot.sync_pending && !slot.surface.lock.is_locked())
        {
            return Ok(index);
        }
        let index = self.slots.len();
        self.slots
            .try_reserve(1)
            .map_err(|_| CodecError::OutOfMemory)?;
        self.slots.push(Slot {
            surface: Surface::new(SurfaceId(index), self.info),
            sync_pending: false,
        });
        trace!(slots = self.slots.len(), "surface pool grew");
        Ok(index)
    }

    /// Queue a slot for synchronization.
    pub fn mark_sync_pending(&mut self, id: SurfaceId) -> Result<(), CodecError> {
        self.slot_mut(id)?.sync_pending = true;
        Ok(())
    }

    /// Return a slot to the free set. The hardware lock is left alone.
    pub fn release(&mut self, id: SurfaceId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.sync_pending = false;
        }
    }

    /// Move the pixel storage out of a slot. The slot allocates fresh
    /// storage on its next acquire.
    pub fn take_frame(&mut self, id: SurfaceId) -> Result<FrameBuffer, CodecError> {
        self.slot_mut(id)?
            .surface
            .data
            .frame
            .take()
            .ok_or_else(|| CodecError::bug(format!("surface {} has no frame", id.0)))
    }

    pub fn surface(&self, id: SurfaceId) -> Result<&Surface, CodecError> {
        self.slots
            .get(id.0)
            .map(|slot| &slot.surface)
            .ok_or(CodecError::InvalidHandle)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut Surface, CodecError> {
        Ok(&mut self.slot_mut(id)?.surface)
    }

    /// Lock handle of a slot, for inspection.
    pub fn lock(&self, id: SurfaceId) -> Result<SurfaceLock, CodecError> {
        Ok(self.surface(id)?.lock.clone())
    }

    #[must_use]
    pub fn state(&self, id: SurfaceId) -> Option<SlotState> {
        self.slots.get(id.0).map(|slot| {
            if slot.sync_pending {
                SlotState::SyncPending
            } else if slot.surface.lock.is_locked() {
                SlotState::HardwareOwned
            } else {
                SlotState::Free
            }
        })
    }

    #[must_use]
    pub fn info(&self) -> FrameInfo {
        self.info
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_mut(&mut self, id: SurfaceId) -> Result<&mut Slot, CodecError> {
        self.slots.get_mut(id.0).ok_or(CodecError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SystemAllocator;
    use crate::types::PixelFormat;

    fn pool() -> BufferPool {
        let info = FrameInfo {
            fourcc: PixelFormat::Nv12,
            width: 16,
            height: 16,
            crop_w: 16,
            crop_h: 16,
            ..Default::default()
        };
        BufferPool::new(info, 2, Arc::new(SystemAllocator))
    }

    #[test]
    fn test_acquire_reuses_free_slot() {
        let mut pool = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
        assert!(pool.surface(a).unwrap().data.frame.is_some());
    }

    #[test]
    fn test_acquire_skips_locked_and_pending() {
        let mut pool = pool();
        let locked = pool.acquire().unwrap();
        let device = pool.lock(locked).unwrap();
        device.increment();
        assert_eq!(pool.state(locked), Some(SlotState::HardwareOwned));

        let pending = pool.acquire().unwrap();
        assert_ne!(pending, locked);
        pool.mark_sync_pending(pending).unwrap();

        let third = pool.acquire().unwrap();
        assert_ne!(third, locked);
        assert_ne!(third, pending);
        assert_eq!(pool.len(), 3);

        pool.release(pending);
        assert_eq!(pool.state(pending), Some(SlotState::Free));
        assert_eq!(pool.acquire().unwrap(), pending);

        // release leaves the hardware lock in place
        pool.release(locked);
        assert_eq!(pool.state(locked), Some(SlotState::HardwareOwned));
        device.decrement();
        assert_eq!(pool.acquire().unwrap(), locked);
    }

    #[test]
    fn test_taken_frame_is_reallocated() {
        let mut pool = pool();
        let id = pool.acquire().unwrap();
        let frame = pool.take_frame(id).unwrap();
        assert_eq!(frame.width(), 16);
        assert!(pool.take_frame(id).unwrap_err().is_bug());

        assert_eq!(pool.acquire().unwrap(), id);
        assert!(pool.surface(id).unwrap().data.frame.is_some());
    }

    #[test]
    fn test_acquire_with_installs_buffer() {
        let mut pool = pool();
        let buffer = SystemAllocator.allocate(16, 16, PixelFormat::Nv12).unwrap();
        let id = pool.acquire_with(buffer.clone()).unwrap();
        assert_eq!(pool.surface(id).unwrap().data.frame.as_ref(), Some(&buffer));
    }

    #[test]
    fn test_unknown_slot() {
        let mut pool = pool();
        assert!(matches!(pool.surface(SurfaceId(3)), Err(CodecError::InvalidHandle)));
        assert!(pool.mark_sync_pending(SurfaceId(0)).is_err());
        assert_eq!(pool.state(SurfaceId(0)), None);
    }
}
