//! Box-tree nodes and the id-indexed arena.
//!
//! A box is either a leaf owning a contiguous event list or a grid node
//! owning child box ids. Boxes live in an arena indexed by id; parent and
//! child links are ids, never references, so nodes can be serialized and
//! paged out without touching the rest of the tree. Aggregate
//! signal/error/count are maintained incrementally on insert and split,
//! never by rescanning a subtree.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::box_controller::BoxController;
use super::constants::CANCEL_CHECK_BATCH;
use super::disk_buffer::Saveable;
use super::event_store::EventStore;
use super::region::Region;
use super::BoxId;
use crate::errors::{MdError, MdResult};
use crate::event::MdEvent;
use crate::pool::CancelToken;

/// Cached aggregate over a box's subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoxAggregates {
    pub signal: f64,
    pub error: f64,
    pub count: u64,
}

enum BoxData {
    Leaf {
        events: Vec<MdEvent>,
        resident: bool,
        dirty: bool,
    },
    Grid {
        children: Vec<BoxId>,
    },
}

/// One node of the box tree.
pub struct MdBox {
    id: BoxId,
    depth: usize,
    region: Region,
    data: RwLock<BoxData>,
    totals: Mutex<BoxAggregates>,
}

impl MdBox {
    /// Creates an empty resident leaf (the workspace root, or a fresh
    /// child slot during tests).
    pub(crate) fn new_leaf(id: BoxId, depth: usize, region: Region) -> Arc<Self> {
        Arc::new(MdBox {
            id,
            depth,
            region,
            data: RwLock::new(BoxData::Leaf {
                events: Vec::new(),
                resident: true,
                dirty: false,
            }),
            totals: Mutex::new(BoxAggregates::default()),
        })
    }

    fn new_split_child(
        id: BoxId,
        depth: usize,
        region: Region,
        events: Vec<MdEvent>,
    ) -> Arc<Self> {
        let totals = BoxAggregates {
            signal: events.iter().map(|e| e.signal).sum(),
            error: events.iter().map(|e| e.error).sum(),
            count: events.len() as u64,
        };
        Arc::new(MdBox {
            id,
            depth,
            region,
            data: RwLock::new(BoxData::Leaf {
                events,
                resident: true,
                dirty: true,
            }),
            totals: Mutex::new(totals),
        })
    }

    /// Rebuilds a leaf from the persisted catalog; its events stay on disk
    /// until loaded. An empty leaf has nothing to load and starts resident.
    pub(crate) fn restore_leaf(
        id: BoxId,
        depth: usize,
        region: Region,
        totals: BoxAggregates,
    ) -> Arc<Self> {
        let empty = totals.count == 0;
        Arc::new(MdBox {
            id,
            depth,
            region,
            data: RwLock::new(BoxData::Leaf {
                events: Vec::new(),
                resident: empty,
                dirty: false,
            }),
            totals: Mutex::new(totals),
        })
    }

    /// Rebuilds a grid node from the persisted catalog.
    pub(crate) fn restore_grid(
        id: BoxId,
        depth: usize,
        region: Region,
        totals: BoxAggregates,
        children: Vec<BoxId>,
    ) -> Arc<Self> {
        Arc::new(MdBox {
            id,
            depth,
            region,
            data: RwLock::new(BoxData::Grid { children }),
            totals: Mutex::new(totals),
        })
    }

    pub fn id(&self) -> BoxId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn is_leaf(&self) -> bool {
        matches!(&*self.data.read(), BoxData::Leaf { .. })
    }

    /// Child ids of a grid node, `None` for a leaf.
    pub fn children(&self) -> Option<Vec<BoxId>> {
        match &*self.data.read() {
            BoxData::Grid { children } => Some(children.clone()),
            BoxData::Leaf { .. } => None,
        }
    }

    /// Aggregate over the subtree rooted at this box.
    pub fn totals(&self) -> BoxAggregates {
        *self.totals.lock()
    }

    /// Number of events in the subtree rooted at this box.
    pub fn event_count(&self) -> u64 {
        self.totals.lock().count
    }

    /// Total signal. A resident leaf sums its events; grid nodes and
    /// evicted leaves answer from the cached aggregate.
    pub fn signal(&self) -> f64 {
        match &*self.data.read() {
            BoxData::Leaf {
                events,
                resident: true,
                ..
            } => events.iter().map(|e| e.signal).sum(),
            _ => self.totals.lock().signal,
        }
    }

    /// Total error, same residency rules as [`MdBox::signal`].
    pub fn error(&self) -> f64 {
        match &*self.data.read() {
            BoxData::Leaf {
                events,
                resident: true,
                ..
            } => events.iter().map(|e| e.error).sum(),
            _ => self.totals.lock().error,
        }
    }

    /// Copy of the resident event list, `None` for grid nodes and
    /// evicted leaves.
    pub fn snapshot_events(&self) -> Option<Vec<MdEvent>> {
        match &*self.data.read() {
            BoxData::Leaf {
                events,
                resident: true,
                ..
            } => Some(events.clone()),
            _ => None,
        }
    }

    /// Folds an inserted event's contribution into the cached aggregate;
    /// called on every grid node along the insertion path.
    pub(crate) fn add_to_totals(&self, event: &MdEvent) {
        let mut totals = self.totals.lock();
        totals.signal += event.signal;
        totals.error += event.error;
        totals.count += 1;
    }

    /// Appends events to a resident leaf. The caller must have loaded the
    /// box first; appending to an evicted leaf is a discipline violation.
    pub(crate) fn append_events(&self, new_events: &[MdEvent]) -> MdResult<()> {
        let mut data = self.data.write();
        match &mut *data {
            BoxData::Leaf {
                events,
                resident,
                dirty,
            } => {
                if !*resident {
                    return Err(MdError::concurrency(format!(
                        "append to non-resident box {}; load it first",
                        self.id
                    )));
                }
                events.extend_from_slice(new_events);
                *dirty = true;
                let mut totals = self.totals.lock();
                for e in new_events {
                    totals.signal += e.signal;
                    totals.error += e.error;
                }
                totals.count += new_events.len() as u64;
                Ok(())
            }
            BoxData::Grid { .. } => Err(MdError::concurrency(format!(
                "append directly to grid box {}",
                self.id
            ))),
        }
    }

    /// True when this leaf holds more events than the split threshold and
    /// has depth to spare.
    pub fn needs_split(&self, threshold: usize, max_depth: usize) -> bool {
        self.is_leaf() && self.event_count() as usize > threshold && self.depth < max_depth
    }

    /// Splits a resident leaf into `factor^ndim` children and converts it
    /// into a grid node. Every event lands in exactly one child, keeping
    /// its relative order; the subtree aggregate is unchanged. The
    /// cancellation flag is checked between event batches, before any
    /// structural mutation, so an abort leaves the leaf intact.
    pub(crate) fn split(
        &self,
        ctrl: &BoxController,
        cancel: Option<&CancelToken>,
    ) -> MdResult<Vec<Arc<MdBox>>> {
        let mut data = self.data.write();
        let (events, resident) = match &mut *data {
            BoxData::Leaf {
                events, resident, ..
            } => (events, *resident),
            BoxData::Grid { .. } => {
                return Err(MdError::concurrency(format!(
                    "split of grid box {}",
                    self.id
                )))
            }
        };
        if !resident {
            return Err(MdError::concurrency(format!(
                "split of non-resident box {}; load it first",
                self.id
            )));
        }

        let factor = ctrl.split_factor();
        let regions = self.region.subdivide(factor);

        // Read-only routing pass; cancellation can only abort here.
        let mut slots = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            if i % CANCEL_CHECK_BATCH == 0 {
                if let Some(token) = cancel {
                    token.check()?;
                }
            }
            slots.push(self.region.child_slot(factor, &event.coords)?);
        }

        // Commit: distribute events, allocate child ids, flip to a grid.
        let mut buckets: Vec<Vec<MdEvent>> = (0..regions.len()).map(|_| Vec::new()).collect();
        for (event, slot) in std::mem::take(events).into_iter().zip(slots) {
            buckets[slot].push(event);
        }

        let first_id = ctrl.allocate_id_block(regions.len() as u64);
        let mut children = Vec::with_capacity(regions.len());
        let mut child_ids = Vec::with_capacity(regions.len());
        for (i, (region, bucket)) in regions.into_iter().zip(buckets).enumerate() {
            let id = first_id + i as u64;
            child_ids.push(id);
            children.push(MdBox::new_split_child(id, self.depth + 1, region, bucket));
        }

        *data = BoxData::Grid {
            children: child_ids,
        };
        drop(data);

        ctrl.record_split(children.len());
        // The parent no longer owns events; drop its buffer entry and any
        // stale on-disk record.
        ctrl.buffer().forget(self.id);
        ctrl.buffer().store().invalidate(self.id);

        log::debug!(
            "split box {} (depth {}) into {} children",
            self.id,
            self.depth,
            children.len()
        );
        Ok(children)
    }
}

impl Saveable for MdBox {
    fn id(&self) -> BoxId {
        self.id
    }

    fn is_dirty(&self) -> bool {
        match &*self.data.read() {
            BoxData::Leaf { dirty, .. } => *dirty,
            BoxData::Grid { .. } => false,
        }
    }

    fn is_resident(&self) -> bool {
        match &*self.data.read() {
            BoxData::Leaf { resident, .. } => *resident,
            BoxData::Grid { .. } => true,
        }
    }

    fn save(&self, store: &EventStore) -> MdResult<()> {
        let mut data = self.data.write();
        match &mut *data {
            BoxData::Leaf {
                events,
                resident,
                dirty,
            } => {
                if !*resident || !*dirty {
                    return Ok(());
                }
                store.save_record(self.id, &self.region.bounds_flat(), events)?;
                *dirty = false;
                Ok(())
            }
            // Grid nodes own no events; nothing to write.
            BoxData::Grid { .. } => Ok(()),
        }
    }

    fn load(&self, store: &EventStore) -> MdResult<()> {
        let mut data = self.data.write();
        match &mut *data {
            BoxData::Leaf {
                events,
                resident,
                dirty,
            } => {
                if *resident {
                    return Ok(());
                }
                let expected = self.totals.lock().count;
                if expected == 0 {
                    *resident = true;
                    return Ok(());
                }
                let record = store.load_record(self.id)?;
                if record.events.len() as u64 != expected {
                    return Err(MdError::Serialization(format!(
                        "box {} record holds {} events, expected {}",
                        self.id,
                        record.events.len(),
                        expected
                    )));
                }
                *events = record.events;
                *resident = true;
                *dirty = false;
                Ok(())
            }
            BoxData::Grid { .. } => Ok(()),
        }
    }

    fn release(&self) {
        let mut data = self.data.write();
        if let BoxData::Leaf {
            events,
            resident,
            dirty,
        } = &mut *data
        {
            if *resident && !*dirty {
                *events = Vec::new();
                *resident = false;
            } else if *dirty {
                log::warn!("refusing to release dirty box {}", self.id);
            }
        }
    }

    fn mru_memory(&self) -> usize {
        match &*self.data.read() {
            BoxData::Leaf {
                events,
                resident: true,
                ..
            } => events.len() * MdEvent::footprint(self.region.ndim()),
            _ => 0,
        }
    }
}

/// Id-indexed arena owning every box of a workspace. Ids are allocated
/// monotonically and never reused while the workspace is open, so a slot
/// is written at most once.
pub struct BoxArena {
    slots: RwLock<Vec<Option<Arc<MdBox>>>>,
}

impl BoxArena {
    pub fn new() -> Self {
        BoxArena {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Registers a box under its id. Ids may arrive out of order during
    /// parallel splitting; the arena grows as needed.
    pub fn insert(&self, b: Arc<MdBox>) -> MdResult<()> {
        let id = b.id() as usize;
        let mut slots = self.slots.write();
        if slots.len() <= id {
            slots.resize(id + 1, None);
        }
        if slots[id].is_some() {
            return Err(MdError::concurrency(format!(
                "box id {} registered twice",
                id
            )));
        }
        slots[id] = Some(b);
        Ok(())
    }

    pub fn get(&self, id: BoxId) -> MdResult<Arc<MdBox>> {
        self.slots
            .read()
            .get(id as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| MdError::NotFound(format!("box id {}", id)))
    }

    /// Number of registered boxes.
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All boxes in id order, for catalog building at close.
    pub fn all(&self) -> Vec<Arc<MdBox>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}

impl Default for BoxArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxtree::disk_buffer::DiskBuffer;
    use crate::dimension::Dimension;
    use smallvec::smallvec;
    use tempfile::tempdir;

    fn dims_2d() -> Vec<Dimension> {
        vec![
            Dimension::new("x", "x", "", 0.0, 10.0, 10).unwrap(),
            Dimension::new("y", "y", "", 0.0, 10.0, 10).unwrap(),
        ]
    }

    fn test_controller(dir: &std::path::Path) -> BoxController {
        let store = Arc::new(EventStore::create(&dir.join("t.mdbox"), &dims_2d(), 100).unwrap());
        let buffer = Arc::new(DiskBuffer::new(1 << 20, store));
        BoxController::new(100, 20, 2, buffer)
    }

    fn event_at(x: f64, y: f64) -> MdEvent {
        MdEvent::new(smallvec![x, y], 1.0, 1.0)
    }

    #[test]
    fn test_leaf_append_updates_totals() {
        let root = MdBox::new_leaf(0, 0, Region::from_dimensions(&dims_2d()));
        root.append_events(&[event_at(1.0, 1.0), event_at(2.0, 2.0)])
            .unwrap();

        assert_eq!(root.event_count(), 2);
        assert_eq!(root.signal(), 2.0);
        assert_eq!(root.error(), 2.0);
        assert!(root.is_dirty());
        assert!(root.is_leaf());
    }

    #[test]
    fn test_split_distributes_events_exactly_once() {
        let dir = tempdir().unwrap();
        let ctrl = test_controller(dir.path());
        let root = MdBox::new_leaf(ctrl.allocate_id(), 0, Region::from_dimensions(&dims_2d()));
        ctrl.track_new_leaf();

        let events: Vec<_> = (0..8)
            .map(|i| event_at(i as f64 + 0.5, (7 - i) as f64 + 0.5))
            .collect();
        root.append_events(&events).unwrap();

        let children = root.split(&ctrl, None).unwrap();
        assert_eq!(children.len(), 4);
        assert!(!root.is_leaf());

        // No events lost or duplicated, and each child contains its own.
        let total: u64 = children.iter().map(|c| c.event_count()).sum();
        assert_eq!(total, 8);
        for child in &children {
            for e in child.snapshot_events().unwrap() {
                assert!(child.region().contains(&e.coords));
            }
        }
        // Parent aggregate is unchanged by the split.
        assert_eq!(root.event_count(), 8);
        assert_eq!(root.signal(), 8.0);
    }

    #[test]
    fn test_split_preserves_relative_order_within_child() {
        let dir = tempdir().unwrap();
        let ctrl = test_controller(dir.path());
        let root = MdBox::new_leaf(ctrl.allocate_id(), 0, Region::from_dimensions(&dims_2d()));
        ctrl.track_new_leaf();

        // All events land in the same child; signal encodes insert order.
        let events: Vec<_> = (0..5)
            .map(|i| MdEvent::new(smallvec![1.0, 1.0], i as f64, 0.0))
            .collect();
        root.append_events(&events).unwrap();

        let children = root.split(&ctrl, None).unwrap();
        let owner = children
            .iter()
            .find(|c| c.event_count() == 5)
            .expect("one child owns all events");
        let signals: Vec<f64> = owner
            .snapshot_events()
            .unwrap()
            .iter()
            .map(|e| e.signal)
            .collect();
        assert_eq!(signals, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_split_of_grid_is_concurrency_error() {
        let dir = tempdir().unwrap();
        let ctrl = test_controller(dir.path());
        let root = MdBox::new_leaf(ctrl.allocate_id(), 0, Region::from_dimensions(&dims_2d()));
        ctrl.track_new_leaf();
        root.append_events(&[event_at(1.0, 1.0)]).unwrap();
        root.split(&ctrl, None).unwrap();

        let result = root.split(&ctrl, None);
        assert!(matches!(result, Err(MdError::Concurrency(_))));
    }

    #[test]
    fn test_cancelled_split_leaves_leaf_intact() {
        let dir = tempdir().unwrap();
        let ctrl = test_controller(dir.path());
        let root = MdBox::new_leaf(ctrl.allocate_id(), 0, Region::from_dimensions(&dims_2d()));
        root.append_events(&[event_at(1.0, 1.0), event_at(9.0, 9.0)])
            .unwrap();

        let token = CancelToken::new();
        token.cancel();
        let result = root.split(&ctrl, Some(&token));
        assert!(matches!(result, Err(MdError::Cancelled)));
        // Still an intact leaf holding both events.
        assert!(root.is_leaf());
        assert_eq!(root.snapshot_events().unwrap().len(), 2);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(EventStore::create(&dir.path().join("t.mdbox"), &dims_2d(), 100).unwrap());
        let leaf = MdBox::new_leaf(0, 0, Region::from_dimensions(&dims_2d()));
        let events = vec![event_at(1.5, 2.5), event_at(3.0, 4.0), event_at(9.9, 0.1)];
        leaf.append_events(&events).unwrap();

        leaf.save(&store).unwrap();
        assert!(!leaf.is_dirty());

        leaf.release();
        assert!(!leaf.is_resident());
        assert_eq!(leaf.mru_memory(), 0);
        // Aggregates survive eviction.
        assert_eq!(leaf.event_count(), 3);
        assert_eq!(leaf.signal(), 3.0);

        leaf.load(&store).unwrap();
        assert!(leaf.is_resident());
        assert_eq!(leaf.snapshot_events().unwrap(), events);
    }

    #[test]
    fn test_release_refuses_dirty_leaf() {
        let dir = tempdir().unwrap();
        let _store =
            Arc::new(EventStore::create(&dir.path().join("t.mdbox"), &dims_2d(), 100).unwrap());
        let leaf = MdBox::new_leaf(0, 0, Region::from_dimensions(&dims_2d()));
        leaf.append_events(&[event_at(1.0, 1.0)]).unwrap();

        leaf.release();
        assert!(leaf.is_resident());
        assert_eq!(leaf.snapshot_events().unwrap().len(), 1);
    }

    #[test]
    fn test_load_is_noop_when_resident() {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(EventStore::create(&dir.path().join("t.mdbox"), &dims_2d(), 100).unwrap());
        let leaf = MdBox::new_leaf(0, 0, Region::from_dimensions(&dims_2d()));
        leaf.append_events(&[event_at(1.0, 1.0)]).unwrap();
        // Never saved, but resident: load must not touch the store.
        leaf.load(&store).unwrap();
        assert_eq!(leaf.snapshot_events().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_leaf_starts_unloaded() {
        let region = Region::from_dimensions(&dims_2d());
        let leaf = MdBox::restore_leaf(
            3,
            1,
            region,
            BoxAggregates {
                signal: 5.0,
                error: 2.0,
                count: 5,
            },
        );
        assert!(!leaf.is_resident());
        assert_eq!(leaf.event_count(), 5);
        assert_eq!(leaf.signal(), 5.0);
    }

    #[test]
    fn test_arena_insert_and_get() {
        let arena = BoxArena::new();
        let region = Region::from_dimensions(&dims_2d());
        arena.insert(MdBox::new_leaf(0, 0, region.clone())).unwrap();
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(0).unwrap().id(), 0);
        assert!(matches!(arena.get(7), Err(MdError::NotFound(_))));

        // Out-of-order registration grows the arena.
        arena.insert(MdBox::new_leaf(5, 1, region)).unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(5).unwrap().id(), 5);
    }

    #[test]
    fn test_arena_rejects_duplicate_id() {
        let arena = BoxArena::new();
        let region = Region::from_dimensions(&dims_2d());
        arena.insert(MdBox::new_leaf(0, 0, region.clone())).unwrap();
        let result = arena.insert(MdBox::new_leaf(0, 0, region));
        assert!(matches!(result, Err(MdError::Concurrency(_))));
    }
}
