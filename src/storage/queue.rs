// # Disk Writer Queue
//
// Single-consumer background writer for the log file. Producers enqueue
// readable pages whose log positions are already assigned; the consumer
// drains the queue, writes each page at its position, flushes, then signals
// waiters. The first I/O failure poisons the queue: it is recorded on the
// engine state and rethrown from every subsequent enqueue or wait.

use crate::error::{DbError, Result};
use crate::state::EngineState;
use crate::storage::file::RandomAccessFile;
use crate::storage::page::{FileOrigin, PageBuffer, POSITION_NOT_SET};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

struct PendingState {
    /// Pages enqueued but not yet flushed.
    count: usize,
    /// First consumer failure; terminal once set.
    error: Option<Arc<DbError>>,
}

struct Shared {
    pending: Mutex<PendingState>,
    drained: Condvar,
}

pub struct DiskWriterQueue {
    sender: Mutex<Option<Sender<Arc<PageBuffer>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl DiskWriterQueue {
    pub fn new(file: Arc<dyn RandomAccessFile>, state: Arc<EngineState>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingState { count: 0, error: None }),
            drained: Condvar::new(),
        });

        let consumer = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("log-writer".into())
                .spawn(move || consume(receiver, file, state, shared))?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(Some(consumer)),
            shared,
        })
    }

    /// Hand a page to the background writer. The page's share reference is
    /// owned by the queue until the page hits the log file.
    ///
    /// Rethrows a prior writer failure so a poisoned queue fails fast.
    pub fn enqueue_page(&self, page: Arc<PageBuffer>) -> Result<()> {
        assert_eq!(page.origin(), Some(FileOrigin::Log), "only log pages can be enqueued");
        assert!(page.position() != POSITION_NOT_SET, "log position must be preassigned");
        assert!(page.share_counter() >= 1, "the queue needs its own share reference");

        {
            let mut pending = self.shared.pending.lock();
            if let Some(err) = pending.error.as_ref() {
                return Err(DbError::WriterFailed(err.clone()));
            }
            pending.count += 1;
        }

        let sender = self.sender.lock();
        let sent = match sender.as_ref() {
            Some(sender) => sender.send(page).is_ok(),
            None => false,
        };

        if !sent {
            // disposed, or the consumer died between the error check above
            // and the send
            let mut pending = self.shared.pending.lock();
            pending.count -= 1;
            return Err(match pending.error.as_ref() {
                Some(err) => DbError::WriterFailed(err.clone()),
                None => DbError::InvalidOperation("writer queue is disposed".into()),
            });
        }

        Ok(())
    }

    /// Pages enqueued and not yet flushed.
    pub fn queue_length(&self) -> usize {
        self.shared.pending.lock().count
    }

    /// Block until the queue is empty and the last batch's flush completed.
    ///
    /// Callers must prevent concurrent `enqueue_page` (the engine holds its
    /// write lock around checkpoints); otherwise "empty" is a moving target.
    pub fn wait(&self) -> Result<()> {
        let mut pending = self.shared.pending.lock();
        loop {
            if let Some(err) = pending.error.as_ref() {
                return Err(DbError::WriterFailed(err.clone()));
            }
            if pending.count == 0 {
                return Ok(());
            }
            self.shared.drained.wait(&mut pending);
        }
    }

    /// Stop accepting pages, drain and flush what is queued, and join the
    /// consumer. Idempotent.
    pub fn dispose(&self) {
        self.sender.lock().take();

        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            if handle.join().is_err() {
                tracing::error!("log writer thread panicked");
            }
        }
    }
}

impl Drop for DiskWriterQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn consume(
    receiver: Receiver<Arc<PageBuffer>>,
    file: Arc<dyn RandomAccessFile>,
    state: Arc<EngineState>,
    shared: Arc<Shared>,
) {
    let poison = |err: DbError| {
        let err = Arc::new(err);
        state.handle(err.clone());

        let mut pending = shared.pending.lock();
        pending.error = Some(err);
        shared.drained.notify_all();
    };

    // blocks while idle; returns Err once the queue is disposed and empty
    while let Ok(first) = receiver.recv() {
        let mut batch = 0usize;
        let mut next = Some(first);

        while let Some(page) = next.take() {
            if let Err(err) = file.write_at(page.slice(), page.position()) {
                poison(err);
                return;
            }
            page.release();
            batch += 1;

            match receiver.try_recv() {
                Ok(page) => next = Some(page),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }

        if let Err(err) = file.flush() {
            poison(err);
            return;
        }

        let mut pending = shared.pending.lock();
        pending.count -= batch;
        if pending.count == 0 {
            shared.drained.notify_all();
        }
    }

    tracing::debug!("log writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::MemoryCache;
    use crate::storage::file::FileFactory;
    use crate::storage::page::PAGE_SIZE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails every write after the first `ok_writes`.
    struct FaultyFile {
        inner: Arc<dyn RandomAccessFile>,
        ok_writes: usize,
        writes: AtomicUsize,
    }

    impl RandomAccessFile for FaultyFile {
        fn len(&self) -> Result<u64> {
            self.inner.len()
        }

        fn set_len(&self, len: u64) -> Result<()> {
            self.inner.set_len(len)
        }

        fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
            self.inner.read_at(buf, offset)
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
                return Err(DbError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_at(buf, offset)
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn log_page(cache: &MemoryCache, position: u64, value: u8) -> Arc<PageBuffer> {
        let page = cache.new_page();
        page.fill(value);
        page.set_position_origin(position, FileOrigin::Log);
        cache.move_to_readable(&page)
    }

    #[test]
    fn test_pages_written_at_their_positions() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("app-log.db"), false);
        let file = factory.access()?;
        let state = Arc::new(EngineState::new());
        let cache = MemoryCache::default();

        let queue = DiskWriterQueue::new(file.clone(), state)?;
        for i in 0..4u64 {
            queue.enqueue_page(log_page(&cache, i * PAGE_SIZE as u64, i as u8 + 1))?;
        }
        queue.wait()?;
        assert_eq!(queue.queue_length(), 0);

        let mut buf = vec![0u8; PAGE_SIZE];
        for i in 0..4u64 {
            let read = file.read_at(&mut buf, i * PAGE_SIZE as u64)?;
            assert_eq!(read, PAGE_SIZE);
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }

        // the queue dropped its share reference after writing
        assert_eq!(cache.pages_in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_write_failure_poisons_queue_and_reports_once() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("app-log.db"), false);
        let file = Arc::new(FaultyFile {
            inner: factory.access()?,
            ok_writes: 0,
            writes: AtomicUsize::new(0),
        });
        let state = Arc::new(EngineState::new());
        let cache = MemoryCache::default();

        let queue = DiskWriterQueue::new(file, state.clone())?;
        queue.enqueue_page(log_page(&cache, 0, 0xAA))?;

        // the failure surfaces on the durability barrier...
        match queue.wait() {
            Err(DbError::WriterFailed(err)) => assert!(err.to_string().contains("injected")),
            other => panic!("expected poisoned queue, got {:?}", other),
        }

        // ...and every later enqueue rethrows it synchronously
        let second = log_page(&cache, PAGE_SIZE as u64, 0xBB);
        match queue.enqueue_page(second) {
            Err(DbError::WriterFailed(err)) => assert!(err.to_string().contains("injected")),
            other => panic!("expected poisoned queue, got {:?}", other),
        }

        assert_eq!(state.error_count(), 1);
        Ok(())
    }

    #[test]
    fn test_dispose_flushes_pending_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("app-log.db"), false);
        let file = factory.access()?;
        let state = Arc::new(EngineState::new());
        let cache = MemoryCache::default();

        let queue = DiskWriterQueue::new(file.clone(), state)?;
        for i in 0..8u64 {
            queue.enqueue_page(log_page(&cache, i * PAGE_SIZE as u64, 0x5A))?;
        }
        queue.dispose();

        assert_eq!(file.len()?, 8 * PAGE_SIZE as u64);
        match queue.enqueue_page(log_page(&cache, 8 * PAGE_SIZE as u64, 1)) {
            Err(DbError::InvalidOperation(_)) => {}
            other => panic!("expected disposed queue error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_enqueue_order_is_write_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("app-log.db"), false);
        let file = factory.access()?;
        let state = Arc::new(EngineState::new());
        let cache = MemoryCache::default();

        let queue = DiskWriterQueue::new(file.clone(), state)?;

        // two generations of the same position: the later enqueue must win
        let position = 0;
        queue.enqueue_page(log_page(&cache, position, 1))?;
        queue.wait()?;
        let newer = cache.new_page();
        newer.fill(2);
        newer.set_position_origin(position, FileOrigin::Log);
        queue.enqueue_page(cache.move_to_readable(&newer))?;
        queue.wait()?;

        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_at(&mut buf, position)?;
        assert!(buf.iter().all(|&b| b == 2));
        Ok(())
    }
}
