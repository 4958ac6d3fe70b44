//! The workspace façade exposed to algorithm-layer code.
//!
//! A workspace owns its dimensions, the box arena with its root, one box
//! controller and the structural reader/writer lock. The handle is a thin
//! `Arc` wrapper and clones cheaply; all mutation goes through the
//! workspace write lock, reads through the read lock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::boxtree::box_node::BoxAggregates;
use crate::boxtree::event_store::{BoxMeta, BoxMetaKind, StoreCatalog};
use crate::boxtree::{
    BoxArena, BoxController, BoxControllerStats, BoxId, DiskBuffer, EventStore, MdBox, Region,
    Saveable,
};
use crate::config::MdConfig;
use crate::dimension::Dimension;
use crate::errors::{MdError, MdResult};
use crate::event::MdEvent;
use crate::lock::{WorkspaceLock, WorkspaceReadGuard, WorkspaceWriteGuard};
use crate::pool::{CancelToken, TaskSpawner, ThreadPool};

/// Everything built at initialization time; absent until `initialize`.
struct Engine {
    store: Arc<EventStore>,
    buffer: Arc<DiskBuffer>,
    controller: Arc<BoxController>,
    arena: Arc<BoxArena>,
    root: BoxId,
    pool: ThreadPool,
}

struct WorkspaceInner {
    config: MdConfig,
    dims: RwLock<Vec<Dimension>>,
    engine: OnceLock<Engine>,
    lock: WorkspaceLock,
    closed: AtomicBool,
}

/// Handle to a multidimensional event workspace.
#[derive(Clone)]
pub struct MdWorkspace {
    inner: Arc<WorkspaceInner>,
}

impl MdWorkspace {
    /// Creates an empty, uninitialized workspace. Register dimensions with
    /// [`MdWorkspace::add_dimension`], then call
    /// [`MdWorkspace::initialize`].
    pub fn new(config: MdConfig) -> Self {
        MdWorkspace {
            inner: Arc::new(WorkspaceInner {
                config,
                dims: RwLock::new(Vec::new()),
                engine: OnceLock::new(),
                lock: WorkspaceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Convenience constructor: registers `dims` and initializes against
    /// the given backing file in one call.
    pub fn create(path: &Path, dims: Vec<Dimension>, config: MdConfig) -> MdResult<Self> {
        let ws = MdWorkspace::new(config);
        for dim in dims {
            ws.add_dimension(dim)?;
        }
        ws.initialize(path)?;
        Ok(ws)
    }

    /// Reopens a workspace from a cleanly closed backing file. Tree
    /// structure, dimensions and the extent index are restored from the
    /// persisted catalog; event data stays on disk until touched.
    pub fn open(path: &Path, config: MdConfig) -> MdResult<Self> {
        config.validate()?;
        let (store, catalog) = EventStore::open(path)?;
        let store = Arc::new(store);
        let header = store.header();

        let buffer = Arc::new(DiskBuffer::new(config.buffer_bytes(), store.clone()));
        let arena = Arc::new(BoxArena::new());
        let mut leaves = 0u64;
        let mut grids = 0u64;
        for meta in &catalog.boxes {
            let totals = BoxAggregates {
                signal: meta.signal,
                error: meta.error,
                count: meta.count,
            };
            let b = match &meta.kind {
                BoxMetaKind::Leaf => {
                    leaves += 1;
                    MdBox::restore_leaf(meta.id, meta.depth, meta.region.clone(), totals)
                }
                BoxMetaKind::Grid { children } => {
                    grids += 1;
                    MdBox::restore_grid(
                        meta.id,
                        meta.depth,
                        meta.region.clone(),
                        totals,
                        children.clone(),
                    )
                }
            };
            arena.insert(b)?;
        }
        // The root must be part of the restored skeleton.
        arena.get(catalog.root)?;

        let controller = Arc::new(BoxController::restore(
            header.split_threshold as usize,
            catalog.max_depth,
            catalog.split_factor,
            buffer.clone(),
            catalog.next_id,
            leaves,
            grids,
        ));

        let engine = Engine {
            store,
            buffer,
            controller,
            arena,
            root: catalog.root,
            pool: ThreadPool::new(config.workers()),
        };

        let ws = MdWorkspace::new(config);
        *ws.inner.dims.write() = catalog.dimensions;
        if ws.inner.engine.set(engine).is_err() {
            return Err(MdError::Configuration(
                "workspace already initialized".into(),
            ));
        }
        log::debug!(
            "reopened workspace with {} boxes from {:?}",
            ws.engine()?.arena.len(),
            path
        );
        Ok(ws)
    }

    /// Registers a dimension. Only valid before initialization.
    pub fn add_dimension(&self, dim: Dimension) -> MdResult<()> {
        if self.inner.engine.get().is_some() {
            return Err(MdError::Configuration(
                "dimensions are fixed after initialization".into(),
            ));
        }
        let mut dims = self.inner.dims.write();
        if dims.iter().any(|d| d.name == dim.name) {
            return Err(MdError::Configuration(format!(
                "dimension '{}' registered twice",
                dim.name
            )));
        }
        dims.push(dim);
        Ok(())
    }

    /// Builds the backing store and the root box. Callable exactly once;
    /// a second call fails with a configuration error.
    pub fn initialize(&self, path: &Path) -> MdResult<()> {
        self.inner.config.validate()?;
        let dims = self.inner.dims.read().clone();
        if dims.is_empty() {
            return Err(MdError::Configuration(
                "workspace needs at least one dimension".into(),
            ));
        }

        let store = Arc::new(EventStore::create(
            path,
            &dims,
            self.inner.config.split_threshold() as u64,
        )?);
        let buffer = Arc::new(DiskBuffer::new(
            self.inner.config.buffer_bytes(),
            store.clone(),
        ));
        let controller = Arc::new(BoxController::new(
            self.inner.config.split_threshold(),
            self.inner.config.max_depth(),
            self.inner.config.split_factor(),
            buffer.clone(),
        ));

        let arena = Arc::new(BoxArena::new());
        let root_id = controller.allocate_id();
        let root = MdBox::new_leaf(root_id, 0, Region::from_dimensions(&dims));
        arena.insert(root)?;
        controller.track_new_leaf();

        let engine = Engine {
            store,
            buffer,
            controller,
            arena,
            root: root_id,
            pool: ThreadPool::new(self.inner.config.workers()),
        };
        self.inner.engine.set(engine).map_err(|_| {
            MdError::Configuration("workspace already initialized".into())
        })?;
        log::debug!("initialized {}-dimensional workspace at {:?}", dims.len(), path);
        Ok(())
    }

    fn engine(&self) -> MdResult<&Engine> {
        self.inner
            .engine
            .get()
            .ok_or_else(|| MdError::Configuration("workspace is not initialized".into()))
    }

    fn check_open(&self) -> MdResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(MdError::Closed)
        } else {
            Ok(())
        }
    }

    /// Number of registered dimensions.
    pub fn ndim(&self) -> usize {
        self.inner.dims.read().len()
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        self.inner.dims.read().clone()
    }

    /// Dimension by index.
    pub fn dimension(&self, index: usize) -> MdResult<Dimension> {
        self.inner
            .dims
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| MdError::NotFound(format!("dimension index {}", index)))
    }

    /// Index of a dimension by name.
    pub fn dimension_index_by_name(&self, name: &str) -> MdResult<usize> {
        self.inner
            .dims
            .read()
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| MdError::NotFound(format!("dimension '{}'", name)))
    }

    /// Acquires the structural read lock for a scoped non-mutating block.
    pub fn read_guard(&self) -> WorkspaceReadGuard<'_> {
        self.inner.lock.read()
    }

    /// Acquires the structural write lock.
    pub fn write_guard(&self) -> WorkspaceWriteGuard<'_> {
        self.inner.lock.write()
    }

    /// Inserts events, routing each to the leaf containing its
    /// coordinates and splitting any leaf pushed over the threshold.
    /// Targets that were evicted are synchronously paged back in first.
    pub fn insert_events(&self, events: &[MdEvent]) -> MdResult<()> {
        let engine = self.engine()?;
        self.check_open()?;
        if events.is_empty() {
            return Ok(());
        }

        let ndim = self.ndim();
        let root = engine.arena.get(engine.root)?;
        for event in events {
            if event.ndim() != ndim {
                return Err(MdError::Configuration(format!(
                    "event has {} coordinates, workspace has {} dimensions",
                    event.ndim(),
                    ndim
                )));
            }
            if !root.region().contains(&event.coords) {
                return Err(MdError::Configuration(format!(
                    "event coordinates {:?} outside the workspace extent",
                    &event.coords[..]
                )));
            }
        }

        let _write = self.inner.lock.write();
        self.check_open()?;
        let factor = engine.controller.split_factor();
        let mut touched: Vec<BoxId> = Vec::new();
        for event in events {
            let leaf = self.route_and_append(engine, factor, event)?;
            if !touched.contains(&leaf) {
                touched.push(leaf);
            }
        }
        for id in touched {
            self.split_if_needed_recursive(engine, id, None)?;
        }
        Ok(())
    }

    /// Walks from the root to the owning leaf and appends; grid
    /// aggregates along the path are only folded in once the append
    /// succeeded, so a failed load never skews the cached totals.
    fn route_and_append(
        &self,
        engine: &Engine,
        factor: usize,
        event: &MdEvent,
    ) -> MdResult<BoxId> {
        let mut id = engine.root;
        let mut path: Vec<Arc<MdBox>> = Vec::new();
        loop {
            let b = engine.arena.get(id)?;
            match b.children() {
                Some(children) => {
                    let slot = b.region().child_slot(factor, &event.coords)?;
                    path.push(b);
                    id = children[slot];
                }
                None => {
                    engine.buffer.load(&to_saveable(&b))?;
                    b.append_events(std::slice::from_ref(event))?;
                    engine.buffer.register_access(&to_saveable(&b))?;
                    for grid in &path {
                        grid.add_to_totals(event);
                    }
                    return Ok(id);
                }
            }
        }
    }

    fn split_if_needed_recursive(
        &self,
        engine: &Engine,
        id: BoxId,
        cancel: Option<&CancelToken>,
    ) -> MdResult<()> {
        let b = engine.arena.get(id)?;
        let threshold = engine.controller.split_threshold();
        let max_depth = engine.controller.max_depth();
        if !b.needs_split(threshold, max_depth) {
            return Ok(());
        }
        engine.buffer.load(&to_saveable(&b))?;
        let children = b.split(&engine.controller, cancel)?;
        for child in &children {
            engine.arena.insert(child.clone())?;
            engine.buffer.register_access(&to_saveable(child))?;
        }
        for child in children {
            if child.needs_split(threshold, max_depth) {
                self.split_if_needed_recursive(engine, child.id(), cancel)?;
            }
        }
        Ok(())
    }

    /// Walks the whole tree and splits every over-threshold leaf, fanning
    /// independent subtrees out to the worker pool. Each box is split by
    /// exactly one task; a child task is submitted only after its parent
    /// split produced that child. Cancellation is honored between event
    /// batches and surfaces as `Cancelled`.
    pub fn split_all_if_needed(&self, cancel: &CancelToken) -> MdResult<()> {
        let engine = self.engine()?;
        self.check_open()?;
        let _write = self.inner.lock.write();
        self.check_open()?;

        let ctx = Arc::new(SplitCtx {
            arena: engine.arena.clone(),
            controller: engine.controller.clone(),
            buffer: engine.buffer.clone(),
            cancel: cancel.clone(),
            error: Mutex::new(None),
        });
        let drain = Arc::new(SplitDrain::default());
        let spawner = engine.pool.spawner();

        spawn_split_task(&spawner, &ctx, &drain, engine.root);
        drain.wait();

        if let Some(err) = ctx.error.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Total number of events in the workspace; O(1) from the root
    /// aggregate.
    pub fn n_points(&self) -> MdResult<u64> {
        let engine = self.engine()?;
        Ok(engine.arena.get(engine.root)?.event_count())
    }

    /// Root box of the tree.
    pub fn root_box(&self) -> MdResult<Arc<MdBox>> {
        let engine = self.engine()?;
        engine.arena.get(engine.root)
    }

    /// Box by id.
    pub fn get_box(&self, id: BoxId) -> MdResult<Arc<MdBox>> {
        self.engine()?.arena.get(id)
    }

    /// Synchronously pages a box in and records the access.
    pub fn load_box(&self, id: BoxId) -> MdResult<Arc<MdBox>> {
        let engine = self.engine()?;
        self.check_open()?;
        let b = engine.arena.get(id)?;
        engine.buffer.load(&to_saveable(&b))?;
        Ok(b)
    }

    /// Lazy, finite, restartable iteration over the boxes of the tree in
    /// depth-first order. The snapshot is taken under the read lock; the
    /// yielded boxes are read-only.
    pub fn iterate(&self) -> MdResult<BoxIterator> {
        let engine = self.engine()?;
        self.check_open()?;
        // Recursive read: callers may already hold a scoped read guard.
        let _read = self.inner.lock.read_recursive();

        let mut boxes = Vec::new();
        let mut stack = vec![engine.root];
        while let Some(id) = stack.pop() {
            let b = engine.arena.get(id)?;
            if let Some(children) = b.children() {
                // Reverse push keeps depth-first child order.
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            }
            boxes.push(b);
        }
        Ok(BoxIterator { boxes, pos: 0 })
    }

    /// Tree statistics; safe to call concurrently with readers.
    pub fn box_controller_stats(&self) -> MdResult<BoxControllerStats> {
        Ok(self.engine()?.controller.stats())
    }

    /// Bytes of event data currently resident in the disk buffer.
    pub fn resident_memory(&self) -> MdResult<usize> {
        Ok(self.engine()?.buffer.resident_bytes())
    }

    /// Flushes every dirty box, persists the catalog, and closes the
    /// workspace. Idempotent; subsequent operations fail with `Closed`.
    pub fn close(&self) -> MdResult<()> {
        let engine = self.engine()?;
        let _write = self.inner.lock.write();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        engine.buffer.flush_all()?;
        engine.store.truncate_unused()?;

        let dims = self.inner.dims.read().clone();
        let boxes = engine
            .arena
            .all()
            .into_iter()
            .map(|b| {
                let totals = b.totals();
                BoxMeta {
                    id: b.id(),
                    depth: b.depth(),
                    region: b.region().clone(),
                    signal: totals.signal,
                    error: totals.error,
                    count: totals.count,
                    kind: match b.children() {
                        Some(children) => BoxMetaKind::Grid { children },
                        None => BoxMetaKind::Leaf,
                    },
                }
            })
            .collect();
        let catalog = StoreCatalog {
            dimensions: dims,
            boxes,
            extents: engine.store.extents_snapshot(),
            root: engine.root,
            next_id: engine.controller.next_id(),
            max_depth: engine.controller.max_depth(),
            split_factor: engine.controller.split_factor(),
        };
        engine.store.persist_catalog(&catalog)?;

        self.inner.closed.store(true, Ordering::SeqCst);
        log::debug!("closed workspace ({} boxes)", catalog.boxes.len());
        Ok(())
    }
}

fn to_saveable(b: &Arc<MdBox>) -> Arc<dyn Saveable> {
    b.clone()
}

/// Shared state of one `split_all_if_needed` fan-out.
struct SplitCtx {
    arena: Arc<BoxArena>,
    controller: Arc<BoxController>,
    buffer: Arc<DiskBuffer>,
    cancel: CancelToken,
    error: Mutex<Option<MdError>>,
}

impl SplitCtx {
    fn record_error(&self, err: MdError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// Counts in-flight tasks; `wait` blocks until the fan-out drains.
#[derive(Default)]
struct SplitDrain {
    pending: Mutex<usize>,
    cv: Condvar,
}

impl SplitDrain {
    fn add(&self) {
        *self.pending.lock() += 1;
    }

    fn done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cv.wait(&mut pending);
        }
    }
}

fn spawn_split_task(
    spawner: &TaskSpawner,
    ctx: &Arc<SplitCtx>,
    drain: &Arc<SplitDrain>,
    id: BoxId,
) {
    drain.add();
    let ctx = ctx.clone();
    let drain = drain.clone();
    let next_spawner = spawner.clone();
    spawner.execute(move || {
        run_split_task(&next_spawner, &ctx, &drain, id);
        drain.done();
    });
}

fn run_split_task(spawner: &TaskSpawner, ctx: &Arc<SplitCtx>, drain: &Arc<SplitDrain>, id: BoxId) {
    if ctx.error.lock().is_some() {
        return;
    }
    if ctx.cancel.is_cancelled() {
        ctx.record_error(MdError::Cancelled);
        return;
    }
    let result = split_one_box(spawner, ctx, drain, id);
    if let Err(err) = result {
        ctx.record_error(err);
    }
}

/// Splits one box if needed, then hands its children to fresh tasks.
/// Only this task touches the subtree until those children are submitted,
/// so structural mutation stays single-owner.
fn split_one_box(
    spawner: &TaskSpawner,
    ctx: &Arc<SplitCtx>,
    drain: &Arc<SplitDrain>,
    id: BoxId,
) -> MdResult<()> {
    let b = ctx.arena.get(id)?;
    let threshold = ctx.controller.split_threshold();
    let max_depth = ctx.controller.max_depth();

    if let Some(children) = b.children() {
        for child in children {
            spawn_split_task(spawner, ctx, drain, child);
        }
        return Ok(());
    }

    if !b.needs_split(threshold, max_depth) {
        return Ok(());
    }
    ctx.buffer.load(&to_saveable(&b))?;
    let children = b.split(&ctx.controller, Some(&ctx.cancel))?;
    for child in &children {
        ctx.arena.insert(child.clone())?;
        ctx.buffer.register_access(&to_saveable(child))?;
    }
    for child in children {
        if child.needs_split(threshold, max_depth) {
            spawn_split_task(spawner, ctx, drain, child.id());
        }
    }
    Ok(())
}

/// Snapshot iterator over the boxes of a workspace. Finite, restartable,
/// and read-only; created under the workspace read lock.
pub struct BoxIterator {
    boxes: Vec<Arc<MdBox>>,
    pos: usize,
}

impl BoxIterator {
    /// Rewinds to the first box.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

impl Iterator for BoxIterator {
    type Item = Arc<MdBox>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.boxes.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use tempfile::tempdir;

    fn dims_2d() -> Vec<Dimension> {
        vec![
            Dimension::new("x", "x", "", 0.0, 10.0, 10).unwrap(),
            Dimension::new("y", "y", "", 0.0, 10.0, 10).unwrap(),
        ]
    }

    fn small_config() -> MdConfig {
        MdConfig::new()
            .with_split_threshold(10)
            .with_workers(2)
            .with_buffer_bytes(1 << 20)
    }

    fn event_at(x: f64, y: f64) -> MdEvent {
        MdEvent::new(smallvec![x, y], 1.0, 1.0)
    }

    #[test]
    fn test_create_and_insert() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();

        ws.insert_events(&[event_at(1.0, 1.0), event_at(9.0, 9.0)])
            .unwrap();
        assert_eq!(ws.n_points().unwrap(), 2);

        let root = ws.root_box().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.signal(), 2.0);
    }

    #[test]
    fn test_double_initialize_fails() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::new(small_config());
        for d in dims_2d() {
            ws.add_dimension(d).unwrap();
        }
        ws.initialize(&dir.path().join("ws.mdbox")).unwrap();

        let result = ws.initialize(&dir.path().join("ws2.mdbox"));
        assert!(matches!(result, Err(MdError::Configuration(_))));
    }

    #[test]
    fn test_add_dimension_after_initialize_fails() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        let extra = Dimension::new("z", "z", "", 0.0, 1.0, 1).unwrap();
        assert!(matches!(
            ws.add_dimension(extra),
            Err(MdError::Configuration(_))
        ));
    }

    #[test]
    fn test_dimension_registry_lookup() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();

        assert_eq!(ws.ndim(), 2);
        assert_eq!(ws.dimension(1).unwrap().name, "y");
        assert_eq!(ws.dimension_index_by_name("y").unwrap(), 1);
        assert!(matches!(
            ws.dimension_index_by_name("missing"),
            Err(MdError::NotFound(_))
        ));
        assert!(matches!(ws.dimension(5), Err(MdError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_dimension_name_rejected() {
        let ws = MdWorkspace::new(small_config());
        ws.add_dimension(Dimension::new("x", "x", "", 0.0, 1.0, 1).unwrap())
            .unwrap();
        let result = ws.add_dimension(Dimension::new("x", "x2", "", 0.0, 1.0, 1).unwrap());
        assert!(matches!(result, Err(MdError::Configuration(_))));
    }

    #[test]
    fn test_insert_rejects_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        let bad = MdEvent::new(smallvec![1.0], 1.0, 1.0);
        assert!(matches!(
            ws.insert_events(&[bad]),
            Err(MdError::Configuration(_))
        ));
    }

    #[test]
    fn test_insert_rejects_out_of_extent_event() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        let outside = event_at(11.0, 5.0);
        assert!(matches!(
            ws.insert_events(&[outside]),
            Err(MdError::Configuration(_))
        ));
        // Nothing was applied.
        assert_eq!(ws.n_points().unwrap(), 0);
    }

    #[test]
    fn test_insert_splits_over_threshold() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();

        // 40 events spread over the extent: the 10-event threshold forces
        // at least one split.
        let events: Vec<_> = (0..40)
            .map(|i| event_at((i % 10) as f64 + 0.5, (i / 10) as f64 + 0.5))
            .collect();
        ws.insert_events(&events).unwrap();

        assert_eq!(ws.n_points().unwrap(), 40);
        let root = ws.root_box().unwrap();
        assert!(!root.is_leaf());

        let stats = ws.box_controller_stats().unwrap();
        assert!(stats.total_boxes >= 5);
        assert_eq!(stats.leaf_boxes + stats.grid_boxes, stats.total_boxes);
    }

    #[test]
    fn test_leaf_counts_sum_to_n_points() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        let events: Vec<_> = (0..100)
            .map(|i| event_at((i % 10) as f64 + 0.3, ((i / 10) % 10) as f64 + 0.7))
            .collect();
        ws.insert_events(&events).unwrap();

        let leaf_sum: u64 = ws
            .iterate()
            .unwrap()
            .filter(|b| b.is_leaf())
            .map(|b| b.event_count())
            .sum();
        assert_eq!(leaf_sum, 100);
        assert_eq!(ws.n_points().unwrap(), 100);
    }

    #[test]
    fn test_iterate_is_restartable() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        ws.insert_events(&(0..30).map(|i| event_at((i % 10) as f64, 5.0)).collect::<Vec<_>>())
            .unwrap();

        let mut iter = ws.iterate().unwrap();
        let first_pass: Vec<BoxId> = iter.by_ref().map(|b| b.id()).collect();
        assert!(!first_pass.is_empty());
        assert!(iter.next().is_none());

        iter.restart();
        let second_pass: Vec<BoxId> = iter.map(|b| b.id()).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_split_all_if_needed_matches_inline() {
        let dir = tempdir().unwrap();
        // A huge threshold first so nothing splits during insert.
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            MdConfig::new()
                .with_split_threshold(10)
                .with_max_depth(0) // disable splitting during insert
                .with_workers(2),
        )
        .unwrap();
        let events: Vec<_> = (0..200)
            .map(|i| event_at((i % 10) as f64 + 0.5, ((i / 10) % 10) as f64 + 0.5))
            .collect();
        ws.insert_events(&events).unwrap();
        assert!(ws.root_box().unwrap().is_leaf());
        drop(ws);

        // Same data, splitting enabled: the parallel pass must agree with
        // the counts invariant.
        let ws = MdWorkspace::create(
            &dir.path().join("ws2.mdbox"),
            dims_2d(),
            MdConfig::new()
                .with_split_threshold(10)
                .with_max_depth(20)
                .with_workers(4),
        )
        .unwrap();
        ws.insert_events(&events).unwrap();
        let cancel = CancelToken::new();
        ws.split_all_if_needed(&cancel).unwrap();

        assert_eq!(ws.n_points().unwrap(), 200);
        let leaf_sum: u64 = ws
            .iterate()
            .unwrap()
            .filter(|b| b.is_leaf())
            .map(|b| b.event_count())
            .sum();
        assert_eq!(leaf_sum, 200);
        for b in ws.iterate().unwrap() {
            if let Some(events) = b.snapshot_events() {
                for e in &events {
                    assert!(b.region().contains(&e.coords));
                }
            }
        }
    }

    #[test]
    fn test_split_all_cancelled_surfaces_error() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        ws.insert_events(&(0..50).map(|i| event_at((i % 10) as f64, 5.0)).collect::<Vec<_>>())
            .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = ws.split_all_if_needed(&cancel);
        assert!(matches!(result, Err(MdError::Cancelled)));
        // Counts stay consistent after the abort.
        assert_eq!(ws.n_points().unwrap(), 50);
    }

    #[test]
    fn test_close_then_operations_fail() {
        let dir = tempdir().unwrap();
        let ws = MdWorkspace::create(
            &dir.path().join("ws.mdbox"),
            dims_2d(),
            small_config(),
        )
        .unwrap();
        ws.insert_events(&[event_at(1.0, 1.0)]).unwrap();
        ws.close().unwrap();
        // Idempotent.
        ws.close().unwrap();

        assert!(matches!(
            ws.insert_events(&[event_at(2.0, 2.0)]),
            Err(MdError::Closed)
        ));
        assert!(matches!(ws.iterate(), Err(MdError::Closed)));
    }

    #[test]
    fn test_uninitialized_operations_fail() {
        let ws = MdWorkspace::new(small_config());
        assert!(matches!(
            ws.insert_events(&[event_at(1.0, 1.0)]),
            Err(MdError::Configuration(_))
        ));
        assert!(matches!(ws.n_points(), Err(MdError::Configuration(_))));
    }

    #[test]
    fn test_reopen_restores_workspace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ws.mdbox");
        let events: Vec<_> = (0..60)
            .map(|i| event_at((i % 10) as f64 + 0.5, ((i / 10) % 6) as f64 + 0.5))
            .collect();
        let stats_before;
        {
            let ws = MdWorkspace::create(&path, dims_2d(), small_config()).unwrap();
            ws.insert_events(&events).unwrap();
            stats_before = ws.box_controller_stats().unwrap();
            ws.close().unwrap();
        }

        let ws = MdWorkspace::open(&path, small_config()).unwrap();
        assert_eq!(ws.n_points().unwrap(), 60);
        assert_eq!(ws.ndim(), 2);
        let stats = ws.box_controller_stats().unwrap();
        assert_eq!(stats.total_boxes, stats_before.total_boxes);
        assert_eq!(stats.leaf_boxes, stats_before.leaf_boxes);

        // Events are reloadable and identical in count per leaf.
        let leaf_sum: u64 = ws
            .iterate()
            .unwrap()
            .filter(|b| b.is_leaf())
            .map(|b| {
                let loaded = ws.load_box(b.id()).unwrap();
                loaded.snapshot_events().map(|e| e.len() as u64).unwrap_or(0)
            })
            .sum();
        assert_eq!(leaf_sum, 60);
    }

    #[test]
    fn test_insert_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ws.mdbox");
        {
            let ws = MdWorkspace::create(&path, dims_2d(), small_config()).unwrap();
            ws.insert_events(&[event_at(1.0, 1.0), event_at(2.0, 2.0)])
                .unwrap();
            ws.close().unwrap();
        }

        let ws = MdWorkspace::open(&path, small_config()).unwrap();
        ws.insert_events(&[event_at(3.0, 3.0)]).unwrap();
        assert_eq!(ws.n_points().unwrap(), 3);
        ws.close().unwrap();

        let ws = MdWorkspace::open(&path, small_config()).unwrap();
        assert_eq!(ws.n_points().unwrap(), 3);
    }
}
