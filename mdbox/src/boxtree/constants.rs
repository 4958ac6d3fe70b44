//! Constants for the box tree and backing store.

/// Default event count above which a leaf box splits
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1000;

/// Default maximum recursion depth of the box tree
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Default number of children per dimension on split
pub const DEFAULT_SPLIT_FACTOR: usize = 2;

/// Default disk-buffer budget (64MB of resident event data)
pub const DEFAULT_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Bounded retries for a failed save during eviction before escalating
pub const SAVE_RETRY_LIMIT: usize = 3;

/// Events processed between cancellation checks in long split passes
pub const CANCEL_CHECK_BATCH: usize = 4096;

/// Reserved size of the header page at the start of the backing file
pub const HEADER_SIZE: usize = 4096;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x4D444258; // "MDBX"

/// File format version
pub const VERSION: u32 = 1;
