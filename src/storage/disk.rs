// # Disk Service
//
// Orchestrates the two file factories, the page cache and the background
// log writer. Owns the virtual length counters: `log_length` is the source
// of truth for the next log offset and may run ahead of the kernel-visible
// file length while the async writer lags.

use crate::error::{DbError, Result};
use crate::settings::{Collation, EngineSettings};
use crate::state::EngineState;
use crate::storage::cache::MemoryCache;
use crate::storage::file::{FileFactory, RandomAccessFile};
use crate::storage::header;
use crate::storage::page::{FileOrigin, PageBuffer, PAGE_SIZE, POSITION_NOT_SET};
use crate::storage::queue::DiskWriterQueue;
use parking_lot::Mutex;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Attempts and backoff for `mark_as_invalid_state` when the datafile is
/// briefly locked by a concurrent closer.
const MARK_INVALID_RETRIES: usize = 60;
const MARK_INVALID_BACKOFF: Duration = Duration::from_millis(50);

pub struct DiskService {
    settings: EngineSettings,
    collation: Collation,
    invalid_state_on_open: bool,
    state: Arc<EngineState>,
    cache: Arc<MemoryCache>,
    data_factory: Arc<FileFactory>,
    log_factory: Arc<FileFactory>,
    /// Created lazily on the first log write.
    queue: Mutex<Option<Arc<DiskWriterQueue>>>,
    /// Highest data page position handed to `write`.
    data_length: AtomicI64,
    /// Last reserved log position; `-PAGE_SIZE` means the log is empty.
    log_length: AtomicI64,
}

impl DiskService {
    pub fn new(settings: EngineSettings, state: Arc<EngineState>) -> Result<Self> {
        Self::with_cache(settings, state, Arc::new(MemoryCache::default()))
    }

    pub fn with_cache(
        settings: EngineSettings,
        state: Arc<EngineState>,
        cache: Arc<MemoryCache>,
    ) -> Result<Self> {
        let data_factory = Arc::new(FileFactory::new(&settings.filename, settings.read_only));
        let log_factory = Arc::new(FileFactory::new(settings.log_path(), settings.read_only));

        let mut collation = settings.collation;
        let mut invalid_state_on_open = false;

        let data_len = data_factory.get_length()?;
        if data_len == 0 {
            if settings.read_only {
                return Err(DbError::Configuration(format!(
                    "cannot create datafile {} in read-only mode",
                    settings.filename.display()
                )));
            }

            let file = data_factory.access()?;
            file.write_at(&header::build_header_page(collation), 0)?;
            file.flush()?;
            tracing::debug!(path = %settings.filename.display(), "created new datafile");
        } else {
            if data_len % PAGE_SIZE as u64 != 0 {
                return Err(DbError::Storage(format!(
                    "datafile size {} is not a multiple of the page size",
                    data_len
                )));
            }

            let file = data_factory.access()?;
            let mut page0 = vec![0u8; PAGE_SIZE];
            let read = file.read_at(&mut page0, 0)?;
            if read != PAGE_SIZE || !header::is_valid_header(&page0) {
                return Err(DbError::Storage(format!(
                    "{} is not a valid datafile",
                    settings.filename.display()
                )));
            }

            collation = header::read_collation(&page0).unwrap_or(collation);
            invalid_state_on_open = header::read_invalid_state(&page0);
        }

        let data_length = data_factory.get_length()? as i64 - PAGE_SIZE as i64;

        let log_length = if log_factory.exists() {
            let log_len = log_factory.get_length()?;
            if log_len % PAGE_SIZE as u64 != 0 {
                return Err(DbError::Storage(format!(
                    "log file size {} is not a multiple of the page size",
                    log_len
                )));
            }
            log_len as i64 - PAGE_SIZE as i64
        } else {
            -(PAGE_SIZE as i64)
        };

        Ok(Self {
            settings,
            collation,
            invalid_state_on_open,
            state,
            cache,
            data_factory,
            log_factory,
            queue: Mutex::new(None),
            data_length: AtomicI64::new(data_length),
            log_length: AtomicI64::new(log_length),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Collation pragma read from the header (or written on creation).
    pub fn collation(&self) -> Collation {
        self.collation
    }

    /// Whether the invalid-state flag was found set when the file opened.
    /// The engine shell decides between refusing to open and rebuilding.
    pub fn invalid_state_on_open(&self) -> bool {
        self.invalid_state_on_open
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// A reader bound to both files and the shared cache. One per executing
    /// transaction; not thread-safe.
    pub fn get_reader(&self) -> DiskReader {
        DiskReader {
            cache: self.cache.clone(),
            data_factory: self.data_factory.clone(),
            log_factory: self.log_factory.clone(),
            _not_sync: PhantomData,
        }
    }

    /// Take a zeroed writable buffer from the cache.
    pub fn new_page(&self) -> Result<Arc<PageBuffer>> {
        if self.settings.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(self.cache.new_page())
    }

    /// Reserve a log position for each writable page, promote it to
    /// readable and hand it to the background writer. Readers observing the
    /// cache see the new version immediately, before it is durable.
    pub fn write_async<I>(&self, pages: I) -> Result<usize>
    where
        I: IntoIterator<Item = Arc<PageBuffer>>,
    {
        if self.settings.read_only {
            return Err(DbError::ReadOnly);
        }

        let queue = self.get_queue()?;
        let mut count = 0;

        for page in pages {
            assert!(page.is_writable(), "write_async requires exclusively owned pages");

            let position = self.log_length.fetch_add(PAGE_SIZE as i64, Ordering::SeqCst)
                + PAGE_SIZE as i64;
            page.set_position_origin(position as u64, FileOrigin::Log);

            let readable = self.cache.move_to_readable(&page);
            queue.enqueue_page(readable)?;
            count += 1;
        }

        Ok(count)
    }

    /// Synchronous direct write to the datafile for pages not shared with
    /// the cache, flushing when done. Used by the checkpoint to apply log
    /// pages to their target positions.
    pub fn write<I>(&self, pages: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<PageBuffer>>,
    {
        if self.settings.read_only {
            return Err(DbError::ReadOnly);
        }

        let file = self.data_factory.access()?;

        for page in pages {
            assert_eq!(page.share_counter(), 0, "direct writes require unshared buffers");
            let position = page.position();
            assert!(position != POSITION_NOT_SET, "page position must be set");
            assert!(position % PAGE_SIZE as u64 == 0, "page position must be aligned");

            self.data_length.fetch_max(position as i64, Ordering::SeqCst);
            file.write_at(page.slice(), position)?;
        }

        file.flush()
    }

    /// Truncate or extend a file. For the log this requires the writer
    /// queue to be fully drained.
    pub fn set_length(&self, length: u64, origin: FileOrigin) -> Result<()> {
        if self.settings.read_only {
            return Err(DbError::ReadOnly);
        }
        assert!(length % PAGE_SIZE as u64 == 0, "file length must be page aligned");

        match origin {
            FileOrigin::Log => {
                let queue = self.queue.lock().clone();
                if let Some(queue) = queue {
                    queue.wait()?;
                }

                self.log_length.store(length as i64 - PAGE_SIZE as i64, Ordering::SeqCst);
                self.log_factory.access()?.set_len(length)?;
                tracing::debug!(length, "log file truncated");
            }
            FileOrigin::Data => {
                self.data_length.store(length as i64 - PAGE_SIZE as i64, Ordering::SeqCst);
                self.data_factory.access()?.set_len(length)?;
            }
        }

        Ok(())
    }

    /// Highest reserved byte offset plus one page. May exceed the
    /// kernel-visible length while the async writer lags; readers must use
    /// this, never the physical length.
    pub fn get_virtual_length(&self, origin: FileOrigin) -> u64 {
        let counter = match origin {
            FileOrigin::Data => &self.data_length,
            FileOrigin::Log => &self.log_length,
        };
        (counter.load(Ordering::SeqCst) + PAGE_SIZE as i64) as u64
    }

    /// Conservative ceiling on total item count, used by higher layers to
    /// detect pointer-loop corruption while walking lists.
    pub fn max_items_count(&self) -> u64 {
        let pages = (self.get_virtual_length(FileOrigin::Data)
            + self.get_virtual_length(FileOrigin::Log))
            / PAGE_SIZE as u64;
        (pages + 10) * 255
    }

    /// Read the whole file as a lazy sequence of single-use buffers,
    /// bypassing the cache. Callers should drain the writer queue first
    /// when reading the log.
    pub fn read_full(&self, origin: FileOrigin) -> Result<ReadFull> {
        let factory = match origin {
            FileOrigin::Data => &self.data_factory,
            FileOrigin::Log => &self.log_factory,
        };

        if !factory.exists() {
            return Ok(ReadFull {
                file: None,
                origin,
                pages: 0,
                current: 0,
            });
        }

        let file = factory.access()?;
        let length = file.len()?;
        assert!(length % PAGE_SIZE as u64 == 0, "file length must be page aligned");

        Ok(ReadFull {
            file: Some(file),
            origin,
            pages: length / PAGE_SIZE as u64,
            current: 0,
        })
    }

    /// Rollback path for mutated pages: straight back to the free pool.
    pub fn discard_dirty_pages(&self, pages: &[Arc<PageBuffer>]) {
        for page in pages {
            self.cache.discard_page(page);
        }
    }

    /// Rollback path for unmodified pages: keep the loaded content cached
    /// when no reader raced us, else discard.
    pub fn discard_clean_pages(&self, pages: &[Arc<PageBuffer>]) {
        for page in pages {
            if !self.cache.try_move_to_readable(page) {
                self.cache.discard_page(page);
            }
        }
    }

    /// Set the invalid-state flag in page 0 so the next open triggers
    /// recovery. Retries briefly on sharing violations since this runs
    /// during abnormal close.
    pub fn mark_as_invalid_state(&self) -> Result<()> {
        if self.settings.read_only {
            return Err(DbError::ReadOnly);
        }

        let mut last_error = None;
        for attempt in 0..MARK_INVALID_RETRIES {
            match self.try_mark_invalid() {
                Ok(()) => return Ok(()),
                Err(err @ DbError::Io(_)) => {
                    if attempt + 1 < MARK_INVALID_RETRIES {
                        std::thread::sleep(MARK_INVALID_BACKOFF);
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.expect("loop ran at least once"))
    }

    fn try_mark_invalid(&self) -> Result<()> {
        let file = self.data_factory.access()?;
        file.write_at(&[1], header::P_INVALID_DATAFILE_STATE as u64)?;
        file.flush()
    }

    /// Length of the unflushed writer backlog.
    pub fn queue_length(&self) -> usize {
        self.queue.lock().as_ref().map_or(0, |q| q.queue_length())
    }

    /// Durability barrier: block until every enqueued page is written and
    /// flushed. The caller must hold the engine write lock so no enqueue
    /// races the wait.
    pub fn wait_queue(&self) -> Result<()> {
        let queue = self.queue.lock().clone();
        match queue {
            Some(queue) => queue.wait(),
            None => Ok(()),
        }
    }

    fn get_queue(&self) -> Result<Arc<DiskWriterQueue>> {
        let mut queue = self.queue.lock();

        if let Some(queue) = queue.as_ref() {
            return Ok(queue.clone());
        }

        let file = self.log_factory.access()?;
        let created = Arc::new(DiskWriterQueue::new(file, self.state.clone())?);
        *queue = Some(created.clone());
        Ok(created)
    }

    /// Drain the writer, close both files and remove the log when it holds
    /// no pages. Called on drop; errors are logged, not raised.
    fn dispose(&self) {
        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            if let Err(err) = queue.wait() {
                tracing::warn!(error = %err, "log writer failed before close");
            }
            queue.dispose();
        }

        self.data_factory.close();

        let log_is_empty = self.log_length.load(Ordering::SeqCst) == -(PAGE_SIZE as i64);
        if self.log_factory.exists() && log_is_empty {
            if let Err(err) = self.log_factory.delete() {
                tracing::warn!(error = %err, "could not delete empty log file");
            }
        } else {
            self.log_factory.close();
        }
    }
}

impl Drop for DiskService {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Lazy page-by-page sweep over one file. Buffers are detached single-use
/// allocations with share counter 0, never touching the cache.
pub struct ReadFull {
    file: Option<Arc<dyn RandomAccessFile>>,
    origin: FileOrigin,
    pages: u64,
    current: u64,
}

impl Iterator for ReadFull {
    type Item = Result<Arc<PageBuffer>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.pages {
            return None;
        }

        let file = self.file.as_ref()?;
        let position = self.current * PAGE_SIZE as u64;
        self.current += 1;

        let buffer = PageBuffer::detached();
        match file.read_at(buffer.slice_mut(), position) {
            Ok(read) => {
                assert_eq!(read, PAGE_SIZE, "short read during full file scan");
                buffer.set_position_origin(position, self.origin);
                Some(Ok(buffer))
            }
            Err(err) => {
                self.current = self.pages;
                Some(Err(err))
            }
        }
    }
}

/// Per-transaction page reader. Loads cache misses from the right file;
/// not thread-safe, hand one to each executing transaction.
pub struct DiskReader {
    cache: Arc<MemoryCache>,
    data_factory: Arc<FileFactory>,
    log_factory: Arc<FileFactory>,
    _not_sync: PhantomData<Cell<()>>,
}

impl DiskReader {
    /// Borrow the page at `(origin, position)`. `writable` selects a fresh
    /// exclusively-owned copy for read-modify-write instead of a shared
    /// readable reference.
    pub fn read_page(
        &self,
        position: u64,
        writable: bool,
        origin: FileOrigin,
    ) -> Result<Arc<PageBuffer>> {
        assert!(position % PAGE_SIZE as u64 == 0, "page position must be aligned");

        let factory = match origin {
            FileOrigin::Data => self.data_factory.clone(),
            FileOrigin::Log => self.log_factory.clone(),
        };
        let loader = move |pos: u64, buf: &mut [u8]| load_page(&factory, pos, buf);

        if writable {
            self.cache.get_writable_page(position, origin, loader)
        } else {
            self.cache.get_readable_page(position, origin, loader)
        }
    }
}

/// Fill `buf` from the file at `position`, zeroing any tail past the
/// physical end. A reserved-but-unwritten page reads as zeros.
fn load_page(factory: &FileFactory, position: u64, buf: &mut [u8]) -> Result<()> {
    let file = factory.access()?;
    let read = file.read_at(buf, position)?;
    buf[read..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Result<DiskService> {
        let settings = EngineSettings::new(dir.join("app.db"));
        DiskService::new(settings, Arc::new(EngineState::new()))
    }

    #[test]
    fn test_empty_open_creates_header_only() -> Result<()> {
        let dir = tempdir().unwrap();
        let service = open(dir.path())?;

        assert!(dir.path().join("app.db").exists());
        assert!(!dir.path().join("app-log.db").exists());
        assert_eq!(service.get_virtual_length(FileOrigin::Data), PAGE_SIZE as u64);
        assert_eq!(service.get_virtual_length(FileOrigin::Log), 0);
        assert_eq!(std::fs::metadata(dir.path().join("app.db")).unwrap().len(), PAGE_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_collation_pragma_survives_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut settings = EngineSettings::new(dir.path().join("app.db"));
        settings.collation = Collation::IgnoreCase;

        let service = DiskService::new(settings, Arc::new(EngineState::new()))?;
        assert_eq!(service.collation(), Collation::IgnoreCase);
        drop(service);

        // creation-time pragma wins over the reopen settings
        let service = open(dir.path())?;
        assert_eq!(service.collation(), Collation::IgnoreCase);
        Ok(())
    }

    #[test]
    fn test_write_async_assigns_monotonic_positions() -> Result<()> {
        let dir = tempdir().unwrap();
        let service = open(dir.path())?;

        let mut pages = Vec::new();
        for i in 0..3u8 {
            let page = service.new_page()?;
            page.fill(i + 1);
            pages.push(page);
        }

        assert_eq!(service.write_async(pages.clone())?, 3);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.position(), i as u64 * PAGE_SIZE as u64);
            assert_eq!(page.origin(), Some(FileOrigin::Log));
        }
        assert_eq!(service.get_virtual_length(FileOrigin::Log), 3 * PAGE_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_virtual_length_matches_physical_after_wait() -> Result<()> {
        let dir = tempdir().unwrap();
        let service = open(dir.path())?;

        let page = service.new_page()?;
        page.fill(0xCD);
        service.write_async([page])?;
        service.wait_queue()?;

        let physical = std::fs::metadata(dir.path().join("app-log.db")).unwrap().len();
        assert_eq!(service.get_virtual_length(FileOrigin::Log), physical);
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_mutations() -> Result<()> {
        let dir = tempdir().unwrap();
        open(dir.path())?; // create first

        let mut settings = EngineSettings::new(dir.path().join("app.db"));
        settings.read_only = true;
        let service = DiskService::new(settings, Arc::new(EngineState::new()))?;

        assert!(matches!(service.new_page(), Err(DbError::ReadOnly)));
        assert!(matches!(service.write_async(Vec::new()), Err(DbError::ReadOnly)));
        assert!(matches!(service.write(Vec::new()), Err(DbError::ReadOnly)));
        assert!(matches!(service.set_length(0, FileOrigin::Log), Err(DbError::ReadOnly)));
        assert!(matches!(service.mark_as_invalid_state(), Err(DbError::ReadOnly)));
        Ok(())
    }

    #[test]
    fn test_max_items_count_tracks_file_growth() -> Result<()> {
        let dir = tempdir().unwrap();
        let service = open(dir.path())?;
        let baseline = service.max_items_count();

        let page = service.new_page()?;
        service.write_async([page])?;
        assert!(service.max_items_count() > baseline);
        Ok(())
    }

    #[test]
    fn test_empty_log_is_deleted_on_close() -> Result<()> {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("app-log.db");

        let service = open(dir.path())?;
        let page = service.new_page()?;
        service.write_async([page])?;
        service.set_length(0, FileOrigin::Log)?;
        assert!(log_path.exists());
        drop(service);

        assert!(!log_path.exists());
        Ok(())
    }

    #[test]
    fn test_reader_sees_promoted_page_before_flush() -> Result<()> {
        let dir = tempdir().unwrap();
        let service = open(dir.path())?;

        let page = service.new_page()?;
        page.fill(0xEE);
        service.write_async([page.clone()])?;

        let reader = service.get_reader();
        let seen = reader.read_page(page.position(), false, FileOrigin::Log)?;
        assert!(seen.slice().iter().all(|&b| b == 0xEE));
        seen.release();
        Ok(())
    }
}
