//! The box-structured spatial index and its out-of-core machinery.
//!
//! Leaves own contiguous event lists; grid nodes own child ids and cached
//! aggregates. The controller owns splitting policy and id allocation, the
//! disk buffer bounds resident memory by evicting least-recently-used
//! boxes to the event store, and the store handles extent allocation and
//! record I/O on the backing file. Unlike an in-memory tree, the working
//! set here is expected to exceed RAM: cold subtrees live on disk until
//! touched.

pub mod box_controller;
pub mod box_node;
pub mod constants;
pub mod disk_buffer;
pub mod event_store;
pub mod region;

/// Unique identifier of a box within one workspace; also the arena index.
pub type BoxId = u64;

pub use box_controller::{BoxController, BoxControllerStats};
pub use box_node::{BoxAggregates, BoxArena, MdBox};
pub use constants::{
    DEFAULT_BUFFER_BYTES, DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_FACTOR, DEFAULT_SPLIT_THRESHOLD,
};
pub use disk_buffer::{DiskBuffer, Saveable};
pub use event_store::{BoxRecord, EventStore, FileExtent, StoreCatalog, StoreHeader};
pub use region::Region;
