// Storage and durability layer: page-addressable file I/O, the share-counted
// page cache and the asynchronous log writer. Everything above this module
// (documents, indexes, transactions) consumes the contracts defined here.

pub mod cache;
pub mod disk;
pub mod file;
pub mod header;
pub mod page;
pub mod queue;

pub use cache::{CacheStats, MemoryCache, MEMORY_SEGMENT_SIZES};
pub use disk::{DiskReader, DiskService, ReadFull};
pub use file::{DiskFile, FileFactory, RandomAccessFile};
pub use header::P_INVALID_DATAFILE_STATE;
pub use page::{FileOrigin, PageBuffer, PositionOrigin, BUFFER_WRITABLE, PAGE_SIZE, POSITION_NOT_SET};
pub use queue::DiskWriterQueue;
