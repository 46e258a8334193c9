use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Positional I/O over one open file handle.
///
/// Concurrent reads and writes to disjoint byte ranges are allowed; callers
/// serialise overlapping writes themselves. `flush` is a barrier against all
/// prior writes on the handle.
pub trait RandomAccessFile: Send + Sync {
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the file.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Read into `buf` at `offset`. Returns the bytes read, short only at
    /// end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Durably persist all prior writes on this handle.
    fn flush(&self) -> Result<()>;

    /// Scatter read of consecutive ranges starting at `offset`.
    fn read_vectored_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut pos = offset;
        let mut total = 0;
        for buf in bufs {
            let read = self.read_at(buf, pos)?;
            total += read;
            if read < buf.len() {
                break;
            }
            pos += read as u64;
        }
        Ok(total)
    }

    /// Gather write of consecutive ranges starting at `offset`.
    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()> {
        let mut pos = offset;
        for buf in bufs {
            self.write_at(buf, pos)?;
            pos += buf.len() as u64;
        }
        Ok(())
    }
}

/// `RandomAccessFile` over a `std::fs::File` using the platform's positional
/// primitives, so no seek state is shared between callers.
pub struct DiskFile {
    file: File,
}

impl DiskFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl RandomAccessFile for DiskFile {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            #[cfg(unix)]
            let read = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            #[cfg(windows)]
            let read = self.file.seek_read(&mut buf[total..], offset + total as u64)?;

            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        self.file.write_all_at(buf, offset)?;

        #[cfg(windows)]
        {
            let mut written = 0;
            while written < buf.len() {
                let n = self.file.seek_write(&buf[written..], offset + written as u64)?;
                written += n;
            }
        }

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Named, lazily-opened, reference-held binding to one file path.
///
/// At most one handle is open at a time; `access` opens it on first use.
/// All methods are serialised by the factory's internal lock.
pub struct FileFactory {
    path: PathBuf,
    read_only: bool,
    handle: Mutex<Option<Arc<dyn RandomAccessFile>>>,
}

impl FileFactory {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Open the handle if needed and return it.
    pub fn access(&self) -> Result<Arc<dyn RandomAccessFile>> {
        let mut handle = self.handle.lock();

        if let Some(file) = handle.as_ref() {
            return Ok(file.clone());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .create(!self.read_only)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => DbError::Configuration(format!(
                    "datafile {} not found",
                    self.path.display()
                )),
                _ => DbError::Io(err),
            })?;

        let file: Arc<dyn RandomAccessFile> = Arc::new(DiskFile::new(file));
        *handle = Some(file.clone());
        Ok(file)
    }

    /// Whether the path exists on disk or a handle is currently open.
    pub fn exists(&self) -> bool {
        self.handle.lock().is_some() || self.path.exists()
    }

    /// File length: size on disk if unopened, else the handle's length.
    pub fn get_length(&self) -> Result<u64> {
        let handle = self.handle.lock();

        match handle.as_ref() {
            Some(file) => file.len(),
            None => match std::fs::metadata(&self.path) {
                Ok(meta) => Ok(meta.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Close the open handle, if any. Idempotent.
    pub fn close(&self) {
        self.handle.lock().take();
    }

    /// Close the handle and remove the file from disk.
    pub fn delete(&self) -> Result<()> {
        self.close();

        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_positional_read_write() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("data.db"), false);
        let file = factory.access()?;

        file.write_at(b"hello", 100)?;
        file.write_at(b"world", 200)?;
        file.flush()?;

        let mut buf = [0u8; 5];
        file.read_at(&mut buf, 200)?;
        assert_eq!(&buf, b"world");

        // short read at end of file
        let mut buf = [0u8; 64];
        let read = file.read_at(&mut buf, 200)?;
        assert_eq!(read, 5);

        Ok(())
    }

    #[test]
    fn test_vectored_write_is_gather_at_base_offset() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("data.db"), false);
        let file = factory.access()?;

        file.write_vectored_at(&[b"ab", b"cd"], 10)?;

        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 10)?;
        assert_eq!(&buf, b"abcd");

        Ok(())
    }

    #[test]
    fn test_factory_lifecycle() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let factory = FileFactory::new(&path, false);

        assert!(!factory.exists());
        assert_eq!(factory.get_length()?, 0);

        let file = factory.access()?;
        file.set_len(4096)?;
        assert!(factory.exists());
        assert_eq!(factory.get_length()?, 4096);

        factory.close();
        factory.close();
        assert_eq!(factory.get_length()?, 4096);

        factory.delete()?;
        assert!(!factory.exists());
        Ok(())
    }

    #[test]
    fn test_read_only_missing_file_is_configuration_error() {
        let dir = tempdir().unwrap();
        let factory = FileFactory::new(dir.path().join("missing.db"), true);

        match factory.access() {
            Err(DbError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }
}
