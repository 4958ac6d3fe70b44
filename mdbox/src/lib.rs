//! # mdbox - out-of-core storage for multidimensional event data
//!
//! This crate provides a box-structured, file-backed storage engine for
//! multidimensional (MD) event data: a recursive spatial partition whose
//! leaves own contiguous event lists, a bounded in-memory cache that pages
//! cold boxes out to a backing file, and the locking discipline that keeps
//! the tree consistent under concurrent readers and writers.
//!
//! ## Features
//!
//! - **Disk-Backed Storage**: event data lives in file extents, loaded on
//!   demand; workspaces hold far more events than fit in memory
//! - **MRU Cache**: a byte-budgeted disk buffer evicts the least recently
//!   used boxes, saving dirty ones first
//! - **Recursive Splitting**: leaves over the split threshold partition
//!   deterministically into a grid of children
//! - **Thread Safe**: a per-workspace reader/writer lock plus a worker
//!   pool for parallel split passes
//! - **Persistent**: a catalog written at close restores the tree on
//!   reopen without scanning the file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mdbox::{Dimension, MdConfig, MdEvent, MdWorkspace};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dims = vec![
//!     Dimension::new("Qx", "qx", "A^-1", 0.0, 10.0, 100)?,
//!     Dimension::new("Qy", "qy", "A^-1", 0.0, 10.0, 100)?,
//! ];
//! let ws = MdWorkspace::create(
//!     "experiment.mdbox".as_ref(),
//!     dims,
//!     MdConfig::new().with_split_threshold(100),
//! )?;
//!
//! ws.insert_events(&[MdEvent::new(vec![1.5, 2.5], 1.0, 1.0)])?;
//!
//! for b in ws.iterate()? {
//!     println!("box {} holds {} events", b.id(), b.event_count());
//! }
//! ws.close()?;
//! # Ok(())
//! # }
//! ```

pub mod boxtree;
pub mod config;
pub mod dimension;
pub mod errors;
pub mod event;
pub mod lock;
pub mod pool;
pub mod workspace;

pub use boxtree::{
    BoxAggregates, BoxController, BoxControllerStats, BoxId, DiskBuffer, EventStore, MdBox,
    Region, Saveable,
};
pub use config::MdConfig;
pub use dimension::Dimension;
pub use errors::{MdError, MdResult};
pub use event::{Coords, MdEvent};
pub use lock::{WorkspaceLock, WorkspaceReadGuard, WorkspaceWriteGuard};
pub use pool::{CancelToken, ThreadPool};
pub use workspace::{BoxIterator, MdWorkspace};
