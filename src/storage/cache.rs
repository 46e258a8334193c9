// # Memory Cache
//
// Share-counted page cache. Buffers live in exactly one of three pools:
//
// - free pool        - share counter 0, no identity
// - writable pool    - share counter BUFFER_WRITABLE, owned by one writer
// - readable index   - share counter >= 0, keyed by (origin, position)
//
// Buffers are allocated in segment batches and never returned to the
// allocator. Pressure is applied by recycling readable buffers whose share
// counter has dropped to zero before a new segment is allocated.

use crate::error::Result;
use crate::storage::page::{
    FileOrigin, PageBuffer, PositionOrigin, Segment, PAGE_SIZE, POSITION_NOT_SET,
};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Page counts for successive cache segments. Once the list is exhausted
/// every further segment reuses the last entry.
pub const MEMORY_SEGMENT_SIZES: [usize; 5] = [1000, 1000, 2000, 4000, 8000];

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub segments_allocated: usize,
    pub free_pages: usize,
    pub readable_pages: usize,
    pub orphaned_pages: usize,
    pub pages_in_use: usize,
}

struct CacheInner {
    free: VecDeque<Arc<PageBuffer>>,
    readable: HashMap<PositionOrigin, Arc<PageBuffer>>,
    /// Readable buffers replaced while readers still held them. They rejoin
    /// the free pool once their share counter reaches zero.
    orphans: Vec<Arc<PageBuffer>>,
    segments: Vec<Arc<Segment>>,
}

pub struct MemoryCache {
    inner: Mutex<CacheInner>,
    segment_sizes: Vec<usize>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(&MEMORY_SEGMENT_SIZES)
    }
}

impl MemoryCache {
    pub fn new(segment_sizes: &[usize]) -> Self {
        assert!(!segment_sizes.is_empty(), "at least one segment size is required");
        assert!(segment_sizes.iter().all(|&s| s > 0), "segment sizes must be non-zero");

        Self {
            inner: Mutex::new(CacheInner {
                free: VecDeque::new(),
                readable: HashMap::new(),
                orphans: Vec::new(),
                segments: Vec::new(),
            }),
            segment_sizes: segment_sizes.to_vec(),
        }
    }

    /// Take a writable buffer with zeroed content, no position and no
    /// origin. The caller is its only owner.
    pub fn new_page(&self) -> Arc<PageBuffer> {
        let buffer = self.take_free_buffer(&mut self.inner.lock());
        buffer.fill(0);
        buffer
    }

    /// Borrow the readable buffer for `(origin, position)`, loading it
    /// through `loader` on a miss. Each successful call adds one reader
    /// reference; pair it with `PageBuffer::release`.
    pub fn get_readable_page<F>(
        &self,
        position: u64,
        origin: FileOrigin,
        loader: F,
    ) -> Result<Arc<PageBuffer>>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        let key = PositionOrigin::new(position, origin);

        let buffer = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.readable.get(&key) {
                existing.share_ref().fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                existing.touch();
                return Ok(existing.clone());
            }
            self.take_free_buffer(&mut inner)
        };

        // Load outside the lock; the buffer is exclusively ours.
        if let Err(err) = loader(position, buffer.slice_mut()) {
            let mut inner = self.inner.lock();
            buffer.mark_free();
            inner.free.push_back(buffer);
            return Err(err);
        }

        buffer.set_position_origin(position, origin);

        let mut inner = self.inner.lock();
        match inner.readable.entry(key) {
            // Another reader loaded the same page while we were on disk.
            // Keep theirs, recycle ours.
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                existing.share_ref().fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                existing.touch();
                buffer.mark_free();
                inner.free.push_back(buffer);
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                buffer.mark_readable(1);
                buffer.touch();
                entry.insert(buffer.clone());
                Ok(buffer)
            }
        }
    }

    /// Take a fresh writable buffer pre-loaded with the current content of
    /// `(origin, position)` for read-modify-write. The readable index is not
    /// touched; install the new version with `move_to_readable`.
    pub fn get_writable_page<F>(
        &self,
        position: u64,
        origin: FileOrigin,
        loader: F,
    ) -> Result<Arc<PageBuffer>>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        let key = PositionOrigin::new(position, origin);

        let (buffer, cached) = {
            let mut inner = self.inner.lock();
            let buffer = self.take_free_buffer(&mut inner);

            // Copy from the cached readable version when one exists instead
            // of going back to disk.
            let cached = match inner.readable.get(&key) {
                Some(readable) => {
                    buffer.slice_mut().copy_from_slice(readable.slice());
                    true
                }
                None => false,
            };
            (buffer, cached)
        };

        if !cached {
            if let Err(err) = loader(position, buffer.slice_mut()) {
                let mut inner = self.inner.lock();
                buffer.mark_free();
                inner.free.push_back(buffer);
                return Err(err);
            }
        }

        buffer.set_position_origin(position, origin);
        Ok(buffer)
    }

    /// Install a writable buffer as the readable version of its key,
    /// replacing any previous version. Returns the buffer with one reader
    /// reference held by the caller.
    pub fn move_to_readable(&self, page: &Arc<PageBuffer>) -> Arc<PageBuffer> {
        assert!(page.is_writable(), "only writable buffers can be promoted");
        assert!(page.position() != POSITION_NOT_SET, "page position must be set");
        let key = page.key();

        let mut inner = self.inner.lock();
        page.mark_readable(1);
        page.touch();

        if let Some(old) = inner.readable.insert(key, page.clone()) {
            // Drop the index's reference on the replaced buffer. Readers may
            // still hold it; it parks on the orphan list until they finish.
            let counter = old
                .share_ref()
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| if n > 0 { Some(n - 1) } else { None },
                )
                .map(|prev| prev - 1)
                .unwrap_or(0);

            if counter == 0 {
                old.mark_free();
                inner.free.push_back(old);
            } else {
                inner.orphans.push(old);
            }
        }

        page.clone()
    }

    /// As `move_to_readable`, but refuses when the key already has a
    /// readable entry. On success the buffer is installed with no reader
    /// references, immediately recyclable; the caller forgets it either way.
    pub fn try_move_to_readable(&self, page: &Arc<PageBuffer>) -> bool {
        if !page.is_writable() || page.position() == POSITION_NOT_SET || page.origin().is_none() {
            return false;
        }
        let key = page.key();

        let mut inner = self.inner.lock();
        match inner.readable.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                page.mark_readable(0);
                page.touch();
                entry.insert(page.clone());
                true
            }
        }
    }

    /// Return a buffer to the free pool, removing any readable-index entry
    /// that points at it. No-op for buffers that are already free.
    pub fn discard_page(&self, page: &Arc<PageBuffer>) {
        let mut inner = self.inner.lock();

        if let Some(origin) = page.origin() {
            if page.position() != POSITION_NOT_SET {
                let key = PositionOrigin::new(page.position(), origin);
                if let Entry::Occupied(entry) = inner.readable.entry(key) {
                    if Arc::ptr_eq(entry.get(), page) {
                        entry.remove();
                    }
                }
            }
        }

        if let Some(idx) = inner.orphans.iter().position(|b| Arc::ptr_eq(b, page)) {
            inner.orphans.swap_remove(idx);
        }

        if inner.free.iter().any(|b| Arc::ptr_eq(b, page)) {
            // Idempotent: a second discard of the same buffer does nothing.
            return;
        }

        page.mark_free();
        inner.free.push_back(page.clone());
    }

    /// Sum of reader references across all cached buffers.
    pub fn pages_in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .readable
            .values()
            .chain(inner.orphans.iter())
            .map(|b| b.share_counter().max(0) as usize)
            .sum()
    }

    /// Drop every cached page back to the free pool. Panics if any page is
    /// still borrowed; used by rebuild after all transactions stopped.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let in_use: usize = inner
            .readable
            .values()
            .chain(inner.orphans.iter())
            .map(|b| b.share_counter().max(0) as usize)
            .sum();
        assert_eq!(in_use, 0, "all pages must be released before clearing the cache");

        let buffers: Vec<_> = inner.readable.drain().map(|(_, b)| b).collect();
        for buffer in buffers.into_iter().chain(inner.orphans.drain(..).collect::<Vec<_>>()) {
            buffer.mark_free();
            inner.free.push_back(buffer);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            segments_allocated: inner.segments.len(),
            free_pages: inner.free.len(),
            readable_pages: inner.readable.len(),
            orphaned_pages: inner.orphans.len(),
            pages_in_use: inner
                .readable
                .values()
                .chain(inner.orphans.iter())
                .map(|b| b.share_counter().max(0) as usize)
                .sum(),
        }
    }

    /// Claim a buffer for exclusive use. Source order: free pool, then a
    /// recyclable cached buffer, then a new segment.
    fn take_free_buffer(&self, inner: &mut CacheInner) -> Arc<PageBuffer> {
        if let Some(buffer) = inner.free.pop_front() {
            buffer.mark_writable();
            return buffer;
        }

        if let Some(idx) = inner.orphans.iter().position(|b| b.share_counter() == 0) {
            let buffer = inner.orphans.swap_remove(idx);
            buffer.mark_free();
            buffer.mark_writable();
            return buffer;
        }

        let recyclable = inner
            .readable
            .iter()
            .find(|(_, b)| b.share_counter() == 0)
            .map(|(key, _)| *key);
        if let Some(key) = recyclable {
            let buffer = inner.readable.remove(&key).expect("key located under the same lock");
            buffer.mark_free();
            buffer.mark_writable();
            return buffer;
        }

        self.extend_segment(inner);
        let buffer = inner.free.pop_front().expect("new segment populates the free pool");
        buffer.mark_writable();
        buffer
    }

    fn extend_segment(&self, inner: &mut CacheInner) {
        let next = inner.segments.len().min(self.segment_sizes.len() - 1);
        let pages = self.segment_sizes[next];

        tracing::debug!(
            segment = inner.segments.len(),
            pages,
            bytes = pages * PAGE_SIZE,
            "allocating new cache memory segment"
        );

        let segment = Segment::new(pages);
        for index in 0..pages {
            inner
                .free
                .push_back(PageBuffer::new(segment.clone(), index * PAGE_SIZE, index));
        }
        inner.segments.push(segment);
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("stats", &self.stats()).finish()
    }
}
