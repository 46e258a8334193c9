// # Page Buffers
//
// Fixed-size page buffers backed by segment allocations. A buffer's share
// counter encodes its lifecycle state:
//
// - `0`                - free (or a detached single-use buffer)
// - `BUFFER_WRITABLE`  - exclusively owned by one writer
// - `>= 1`            - readable, shared by that many readers
//
// All pool transitions go through `MemoryCache` under its lock; only the
// release decrement is lock-free.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Size of every page on disk and in memory. The unit of all I/O.
pub const PAGE_SIZE: usize = 8192;

/// Share-counter sentinel for a buffer exclusively owned by one writer.
pub const BUFFER_WRITABLE: i32 = -1;

/// Position sentinel for a buffer that has not been placed in a file yet.
pub const POSITION_NOT_SET: u64 = u64::MAX;

/// Coarse logical clock for buffer access timestamps.
static BUFFER_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Which file a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOrigin {
    /// The canonical committed database image.
    Data = 1,
    /// The write-ahead log.
    Log = 2,
}

impl FileOrigin {
    fn to_code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FileOrigin::Data),
            2 => Some(FileOrigin::Log),
            _ => None,
        }
    }
}

/// Key of a readable buffer in the cache: at most one readable buffer exists
/// per `(origin, position)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PositionOrigin {
    pub position: u64,
    pub origin: FileOrigin,
}

impl PositionOrigin {
    pub fn new(position: u64, origin: FileOrigin) -> Self {
        debug_assert!(position != POSITION_NOT_SET, "position must be set");
        Self { position, origin }
    }
}

/// One contiguous allocation of `pages * PAGE_SIZE` bytes. Buffers hand out
/// disjoint windows into it; segments are never freed while the cache lives.
pub(crate) struct Segment {
    bytes: Box<[UnsafeCell<u8>]>,
}

// The segment itself is just storage. Aliasing is governed by the share
// counter of each PageBuffer window; disjoint windows never overlap.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub(crate) fn new(pages: usize) -> Arc<Self> {
        let bytes: Vec<UnsafeCell<u8>> = (0..pages * PAGE_SIZE).map(|_| UnsafeCell::new(0)).collect();
        Arc::new(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    fn page_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset + PAGE_SIZE <= self.bytes.len());
        self.bytes[offset].get()
    }
}

/// In-memory handle to one page: a window into a segment plus the metadata
/// that places the page in a file.
pub struct PageBuffer {
    segment: Arc<Segment>,
    offset: usize,
    index: usize,
    position: AtomicU64,
    origin: AtomicU8,
    share_counter: AtomicI32,
    timestamp: AtomicU64,
}

impl PageBuffer {
    pub(crate) fn new(segment: Arc<Segment>, offset: usize, index: usize) -> Arc<Self> {
        Arc::new(Self {
            segment,
            offset,
            index,
            position: AtomicU64::new(POSITION_NOT_SET),
            origin: AtomicU8::new(0),
            share_counter: AtomicI32::new(0),
            timestamp: AtomicU64::new(0),
        })
    }

    /// A single-use buffer outside any cache segment pool, share counter 0.
    /// Used by sequential full-file reads that must not disturb the cache.
    pub(crate) fn detached() -> Arc<Self> {
        Self::new(Segment::new(1), 0, 0)
    }

    /// 0-based slot index within the owning segment.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn origin(&self) -> Option<FileOrigin> {
        FileOrigin::from_code(self.origin.load(Ordering::SeqCst))
    }

    pub fn share_counter(&self) -> i32 {
        self.share_counter.load(Ordering::SeqCst)
    }

    pub fn is_writable(&self) -> bool {
        self.share_counter() == BUFFER_WRITABLE
    }

    /// Logical clock value of the last access through the cache.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        let now = BUFFER_CLOCK.fetch_add(1, Ordering::Relaxed) + 1;
        self.timestamp.store(now, Ordering::Relaxed);
    }

    /// Place the page in a file. Only the exclusive owner of an unshared
    /// buffer may move it.
    pub fn set_position_origin(&self, position: u64, origin: FileOrigin) {
        debug_assert!(
            self.share_counter() <= 0,
            "cannot reposition a buffer shared by readers"
        );
        debug_assert!(position % PAGE_SIZE as u64 == 0, "page position must be aligned");

        self.position.store(position, Ordering::SeqCst);
        self.origin.store(origin.to_code(), Ordering::SeqCst);
    }

    /// Readable key of this buffer. Panics if position or origin is unset.
    pub(crate) fn key(&self) -> PositionOrigin {
        let origin = self.origin().expect("buffer origin must be set");
        PositionOrigin::new(self.position(), origin)
    }

    /// Shared view of the page bytes.
    ///
    /// Valid while the caller holds a readable reference or exclusive
    /// ownership; the share-counter discipline prevents a writer from
    /// aliasing this view.
    pub fn slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.segment.page_ptr(self.offset), PAGE_SIZE) }
    }

    /// Exclusive view of the page bytes. Requires an unshared buffer
    /// (writable or detached); the caller is the only logical owner.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn slice_mut(&self) -> &mut [u8] {
        debug_assert!(
            self.share_counter() <= 0,
            "mutable access requires an unshared buffer"
        );
        unsafe { std::slice::from_raw_parts_mut(self.segment.page_ptr(self.offset), PAGE_SIZE) }
    }

    /// Overwrite every byte of the page.
    pub fn fill(&self, value: u8) {
        self.slice_mut().fill(value);
    }

    /// Copy `data` into the page starting at `offset`.
    pub fn write_slice(&self, offset: usize, data: &[u8]) {
        self.slice_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Drop one reader reference. The buffer stays in the readable index
    /// until the cache recycles it.
    pub fn release(&self) {
        let prev = self.share_counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "release on a buffer with no readers");
    }

    pub(crate) fn share_ref(&self) -> &AtomicI32 {
        &self.share_counter
    }

    pub(crate) fn mark_writable(&self) {
        self.share_counter.store(BUFFER_WRITABLE, Ordering::SeqCst);
    }

    pub(crate) fn mark_readable(&self, shares: i32) {
        debug_assert!(shares >= 0);
        self.share_counter.store(shares, Ordering::SeqCst);
    }

    /// Reset to the free state: no position, no origin, no owners.
    pub(crate) fn mark_free(&self) {
        self.position.store(POSITION_NOT_SET, Ordering::SeqCst);
        self.origin.store(0, Ordering::SeqCst);
        self.share_counter.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("index", &self.index)
            .field("position", &self.position())
            .field("origin", &self.origin())
            .field("share_counter", &self.share_counter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_free_and_unplaced() {
        let buffer = PageBuffer::detached();
        assert_eq!(buffer.share_counter(), 0);
        assert_eq!(buffer.position(), POSITION_NOT_SET);
        assert_eq!(buffer.origin(), None);
    }

    #[test]
    fn test_fill_and_slice_round_trip() {
        let buffer = PageBuffer::detached();
        buffer.fill(0xAB);
        assert!(buffer.slice().iter().all(|&b| b == 0xAB));

        buffer.write_slice(10, &[1, 2, 3]);
        assert_eq!(&buffer.slice()[10..13], &[1, 2, 3]);
    }

    #[test]
    fn test_set_position_origin() {
        let buffer = PageBuffer::detached();
        buffer.set_position_origin(PAGE_SIZE as u64 * 3, FileOrigin::Log);
        assert_eq!(buffer.position(), PAGE_SIZE as u64 * 3);
        assert_eq!(buffer.origin(), Some(FileOrigin::Log));
        assert_eq!(buffer.key(), PositionOrigin::new(PAGE_SIZE as u64 * 3, FileOrigin::Log));
    }

    #[test]
    fn test_segment_windows_are_disjoint() {
        let segment = Segment::new(2);
        let first = PageBuffer::new(segment.clone(), 0, 0);
        let second = PageBuffer::new(segment, PAGE_SIZE, 1);

        first.fill(0x11);
        second.fill(0x22);

        assert!(first.slice().iter().all(|&b| b == 0x11));
        assert!(second.slice().iter().all(|&b| b == 0x22));
    }
}
