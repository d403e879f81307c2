//! Compressed input staging.

use crate::CodecError;

/// Growable byte buffer holding compressed data not yet consumed by the device.
///
/// Unconsumed bytes live in `store[offset..offset + len]`. The device reads
/// from the head and reports progress with [`Bitstream::advance`].
#[derive(Debug, Default)]
pub struct Bitstream {
    store: Vec<u8>,
    offset: usize,
    len: usize,
    timestamp: Option<i64>,
}

impl Bitstream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Staging buffer pre-filled with `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        let mut bs = Self::new();
        bs.enqueue(data)?;
        Ok(bs)
    }

    /// Grow the backing store to at least `size` bytes.
    ///
    /// On allocation failure the previous store is released and the buffer
    /// is left empty.
    pub fn ensure_capacity(&mut self, size: usize) -> Result<(), CodecError> {
        if self.store.len() >= size {
            return Ok(());
        }
        if self.store.try_reserve_exact(size - self.store.len()).is_err() {
            self.store = Vec::new();
            self.offset = 0;
            self.len = 0;
            return Err(CodecError::OutOfMemory);
        }
        self.store.resize(size, 0);
        Ok(())
    }

    /// Append `data` after the unconsumed bytes, compacting to the front of
    /// the store first when the tail has no room.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let needed = self.len + data.len();
        self.ensure_capacity(needed)?;

        if needed > self.store.len() - self.offset {
            self.store.copy_within(self.offset..self.offset + self.len, 0);
            self.offset = 0;
        }

        let tail = self.offset + self.len;
        self.store[tail..tail + data.len()].copy_from_slice(data);
        self.len = needed;
        Ok(())
    }

    /// Unconsumed bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.store[self.offset..self.offset + self.len]
    }

    /// Mark `n` bytes at the head as consumed.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.offset += n;
        self.len -= n;
        if self.len == 0 {
            self.offset = 0;
        }
    }

    /// Drop all unconsumed bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Head offset of the unconsumed bytes inside the store.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Timestamp of the next picture the device takes from this buffer.
    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_appends() {
        let mut bs = Bitstream::new();
        bs.enqueue(b"abc").unwrap();
        bs.enqueue(b"de").unwrap();
        assert_eq!(bs.data(), b"abcde");
        assert_eq!(bs.capacity(), 5);
    }

    #[test]
    fn test_compaction_keeps_unconsumed_bytes() {
        let mut bs = Bitstream::new();
        bs.enqueue(b"0123456789").unwrap();
        bs.advance(7);
        assert_eq!(bs.offset(), 7);

        // 3 left + 5 new fits the store only after moving to the front
        bs.enqueue(b"abcde").unwrap();
        assert_eq!(bs.offset(), 0);
        assert_eq!(bs.capacity(), 10);
        assert_eq!(bs.data(), b"789abcde");
    }

    #[test]
    fn test_growth_preserves_contents() {
        let mut bs = Bitstream::new();
        bs.enqueue(b"xxxx").unwrap();
        bs.advance(1);
        bs.enqueue(b"yyyyyyyy").unwrap();
        assert_eq!(bs.data(), b"xxxyyyyyyyy");
    }

    #[test]
    fn test_advance_past_end_resets() {
        let mut bs = Bitstream::from_slice(b"abc").unwrap();
        bs.advance(10);
        assert!(bs.is_empty());
        assert_eq!(bs.offset(), 0);
    }

    #[test]
    fn test_ensure_capacity_failure_releases_store() {
        let mut bs = Bitstream::from_slice(b"abc").unwrap();
        assert!(matches!(bs.ensure_capacity(usize::MAX), Err(CodecError::OutOfMemory)));
        assert_eq!(bs.capacity(), 0);
        assert!(bs.is_empty());
    }
}
