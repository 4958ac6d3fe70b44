//! Per-workspace owner of split policy and id allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::disk_buffer::DiskBuffer;
use super::BoxId;

/// Read-only snapshot of tree statistics.
#[derive(Debug, Clone, Default)]
pub struct BoxControllerStats {
    pub total_boxes: u64,
    pub leaf_boxes: u64,
    pub grid_boxes: u64,
    /// Bytes of event data currently resident in the disk buffer.
    pub resident_memory: usize,
    /// Boxes with an on-disk record.
    pub on_disk_boxes: u64,
}

#[derive(Default)]
struct NodeCounts {
    leaves: u64,
    grids: u64,
}

/// Owns the id counter and split policy; all box save/load/evict traffic
/// routes through its disk buffer. The id counter and the statistics set
/// each use their own fine-grained primitive so they are safe to touch
/// without the workspace lock.
pub struct BoxController {
    next_id: AtomicU64,
    split_threshold: usize,
    max_depth: usize,
    split_factor: usize,
    counts: Mutex<NodeCounts>,
    buffer: Arc<DiskBuffer>,
}

impl BoxController {
    pub fn new(
        split_threshold: usize,
        max_depth: usize,
        split_factor: usize,
        buffer: Arc<DiskBuffer>,
    ) -> Self {
        BoxController {
            next_id: AtomicU64::new(0),
            split_threshold,
            max_depth,
            split_factor,
            counts: Mutex::new(NodeCounts::default()),
            buffer,
        }
    }

    /// Rebuilds a controller from persisted state at reopen.
    pub fn restore(
        split_threshold: usize,
        max_depth: usize,
        split_factor: usize,
        buffer: Arc<DiskBuffer>,
        next_id: u64,
        leaves: u64,
        grids: u64,
    ) -> Self {
        BoxController {
            next_id: AtomicU64::new(next_id),
            split_threshold,
            max_depth,
            split_factor,
            counts: Mutex::new(NodeCounts { leaves, grids }),
            buffer,
        }
    }

    /// Allocates the next box id. Ids are never reused while the
    /// workspace is open.
    pub fn allocate_id(&self) -> BoxId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocates `n` consecutive ids and returns the first; used by split
    /// so a box's children are contiguous.
    pub fn allocate_id_block(&self, n: u64) -> BoxId {
        self.next_id.fetch_add(n, Ordering::SeqCst)
    }

    /// Highest id allocated so far plus one.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn split_factor(&self) -> usize {
        self.split_factor
    }

    pub fn buffer(&self) -> &Arc<DiskBuffer> {
        &self.buffer
    }

    /// Registers a newly created leaf (the root, or a restored box).
    pub fn track_new_leaf(&self) {
        self.counts.lock().leaves += 1;
    }

    pub(crate) fn track_restored_grid(&self) {
        self.counts.lock().grids += 1;
    }

    /// Accounts for one leaf turning into a grid with `children` leaves.
    pub fn record_split(&self, children: usize) {
        let mut guard = self.counts.lock();
        let counts = &mut *guard;
        counts.leaves = counts.leaves - 1 + children as u64;
        counts.grids += 1;
    }

    pub fn stats(&self) -> BoxControllerStats {
        let counts = self.counts.lock();
        BoxControllerStats {
            total_boxes: counts.leaves + counts.grids,
            leaf_boxes: counts.leaves,
            grid_boxes: counts.grids,
            resident_memory: self.buffer.resident_bytes(),
            on_disk_boxes: self.buffer.store().on_disk_count() as u64,
        }
    }

    pub(crate) fn leaf_count(&self) -> u64 {
        self.counts.lock().leaves
    }

    pub(crate) fn grid_count(&self) -> u64 {
        self.counts.lock().grids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxtree::event_store::EventStore;
    use crate::dimension::Dimension;
    use tempfile::tempdir;

    fn controller(dir: &std::path::Path) -> BoxController {
        let dims = vec![Dimension::new("x", "x", "", 0.0, 1.0, 1).unwrap()];
        let store = Arc::new(EventStore::create(&dir.join("c.mdbox"), &dims, 100).unwrap());
        BoxController::new(100, 20, 2, Arc::new(DiskBuffer::new(1 << 20, store)))
    }

    #[test]
    fn test_allocate_id_monotonic() {
        let dir = tempdir().unwrap();
        let ctrl = controller(dir.path());
        assert_eq!(ctrl.allocate_id(), 0);
        assert_eq!(ctrl.allocate_id(), 1);
        assert_eq!(ctrl.allocate_id_block(4), 2);
        assert_eq!(ctrl.allocate_id(), 6);
        assert_eq!(ctrl.next_id(), 7);
    }

    #[test]
    fn test_allocate_id_concurrent_unique() {
        let dir = tempdir().unwrap();
        let ctrl = Arc::new(controller(dir.path()));
        let mut handles = vec![];
        for _ in 0..4 {
            let ctrl = ctrl.clone();
            handles.push(std::thread::spawn(move || {
                (0..250).map(|_| ctrl.allocate_id()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<BoxId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_split_bookkeeping() {
        let dir = tempdir().unwrap();
        let ctrl = controller(dir.path());
        ctrl.track_new_leaf();

        let stats = ctrl.stats();
        assert_eq!(stats.total_boxes, 1);
        assert_eq!(stats.leaf_boxes, 1);
        assert_eq!(stats.grid_boxes, 0);

        ctrl.record_split(4);
        let stats = ctrl.stats();
        assert_eq!(stats.total_boxes, 5);
        assert_eq!(stats.leaf_boxes, 4);
        assert_eq!(stats.grid_boxes, 1);
    }

    #[test]
    fn test_restore_preserves_counters() {
        let dir = tempdir().unwrap();
        let dims = vec![Dimension::new("x", "x", "", 0.0, 1.0, 1).unwrap()];
        let store =
            Arc::new(EventStore::create(&dir.path().join("r.mdbox"), &dims, 100).unwrap());
        let ctrl =
            BoxController::restore(100, 20, 2, Arc::new(DiskBuffer::new(1024, store)), 17, 12, 4);
        assert_eq!(ctrl.allocate_id(), 17);
        let stats = ctrl.stats();
        assert_eq!(stats.leaf_boxes, 12);
        assert_eq!(stats.grid_boxes, 4);
    }
}
