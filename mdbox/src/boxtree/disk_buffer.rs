//! Byte-budgeted MRU cache of saveable boxes.
//!
//! The buffer tracks every resident box with a monotonic access counter
//! and evicts the globally least-recently-used entry (ties broken by
//! smallest id) whenever the resident total exceeds the budget. The
//! just-accessed entry is never evicted, so a single box larger than the
//! budget cannot thrash. Bookkeeping lives under its own mutex, distinct
//! from the workspace lock; eviction I/O runs with that mutex released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::constants::SAVE_RETRY_LIMIT;
use super::event_store::EventStore;
use super::BoxId;
use crate::errors::{MdError, MdResult};

/// Capability of being paged in and out of the disk buffer.
///
/// State machine: Unloaded --load--> Resident,Clean --mutate-->
/// Resident,Dirty --save--> Resident,Clean; eviction saves first if dirty,
/// then releases.
pub trait Saveable: Send + Sync {
    fn id(&self) -> BoxId;
    fn is_dirty(&self) -> bool;
    fn is_resident(&self) -> bool;
    /// Serializes the event list into its reserved extent. No-op when
    /// clean or not resident.
    fn save(&self, store: &EventStore) -> MdResult<()>;
    /// Deserializes events into memory. No-op when already resident.
    fn load(&self, store: &EventStore) -> MdResult<()>;
    /// Drops resident events, keeping id, bounds and aggregates. Only
    /// effective on a clean entity.
    fn release(&self);
    /// Current resident footprint in bytes.
    fn mru_memory(&self) -> usize;
}

struct BufferEntry {
    entity: Arc<dyn Saveable>,
    last_access: u64,
    bytes: usize,
}

#[derive(Default)]
struct BufferBook {
    entries: HashMap<BoxId, BufferEntry>,
    counter: u64,
    resident_bytes: usize,
}

/// Bounded in-memory cache of box event data backed by the event store.
pub struct DiskBuffer {
    budget: usize,
    store: Arc<EventStore>,
    book: Mutex<BufferBook>,
}

impl DiskBuffer {
    pub fn new(budget: usize, store: Arc<EventStore>) -> Self {
        DiskBuffer {
            budget,
            store,
            book: Mutex::new(BufferBook::default()),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Bytes of event data currently tracked as resident.
    pub fn resident_bytes(&self) -> usize {
        self.book.lock().resident_bytes
    }

    /// Number of tracked resident entities.
    pub fn resident_count(&self) -> usize {
        self.book.lock().entries.len()
    }

    /// True if the buffer currently tracks this id.
    pub fn contains(&self, id: BoxId) -> bool {
        self.book.lock().entries.contains_key(&id)
    }

    /// Records a touch of `entity`, then brings the resident total back
    /// under budget, never evicting the entity just touched.
    pub fn register_access(&self, entity: &Arc<dyn Saveable>) -> MdResult<()> {
        let id = entity.id();
        {
            let mut guard = self.book.lock();
            let book = &mut *guard;
            book.counter += 1;
            let counter = book.counter;
            let bytes = entity.mru_memory();
            match book.entries.get_mut(&id) {
                Some(entry) => {
                    book.resident_bytes = book.resident_bytes - entry.bytes + bytes;
                    entry.bytes = bytes;
                    entry.last_access = counter;
                }
                None => {
                    book.resident_bytes += bytes;
                    book.entries.insert(
                        id,
                        BufferEntry {
                            entity: entity.clone(),
                            last_access: counter,
                            bytes,
                        },
                    );
                }
            }
        }
        self.ensure_budget(id)
    }

    /// Synchronously pages an entity in (no-op when resident) and records
    /// the access. An entity whose on-disk payload alone exceeds the
    /// whole budget can never be paged in: `BudgetExceeded`.
    pub fn load(&self, entity: &Arc<dyn Saveable>) -> MdResult<()> {
        if !entity.is_resident() {
            if let Some(extent) = self.store.extent_of(entity.id()) {
                if extent.length as usize > self.budget {
                    return Err(MdError::BudgetExceeded {
                        id: entity.id(),
                        bytes: extent.length as usize,
                        budget: self.budget,
                    });
                }
            }
            entity.load(&self.store)?;
        }
        self.register_access(entity)
    }

    /// Evicts least-recently-used entities until the resident total is
    /// within budget or only the protected entry remains. A dirty victim
    /// is saved (with bounded retries) before its memory is released.
    pub fn ensure_budget(&self, protected: BoxId) -> MdResult<()> {
        loop {
            // Pick a victim under the mutex; it is taken out of the map
            // while its eviction I/O is in flight.
            let entry = {
                let mut guard = self.book.lock();
                let book = &mut *guard;
                if book.resident_bytes <= self.budget {
                    return Ok(());
                }
                let victim = book
                    .entries
                    .iter()
                    .filter(|(id, e)| **id != protected && e.entity.is_resident())
                    .min_by_key(|(id, e)| (e.last_access, **id))
                    .map(|(id, _)| *id);
                match victim.and_then(|id| book.entries.remove(&id)) {
                    Some(entry) => entry,
                    None => {
                        log::warn!(
                            "disk buffer over budget ({} > {} bytes) with only the active entry resident",
                            book.resident_bytes,
                            self.budget
                        );
                        return Ok(());
                    }
                }
            };

            if entry.entity.is_dirty() {
                if let Err(err) = save_with_retry(entry.entity.as_ref(), &self.store) {
                    // Put the victim back, still resident and dirty; the
                    // caller sees the storage error.
                    let id = entry.entity.id();
                    self.book.lock().entries.insert(id, entry);
                    return Err(err);
                }
            }
            entry.entity.release();
            log::debug!("evicted box {} ({} bytes)", entry.entity.id(), entry.bytes);

            let mut guard = self.book.lock();
            let book = &mut *guard;
            book.resident_bytes = book.resident_bytes.saturating_sub(entry.bytes);
        }
    }

    /// Forced save of every dirty resident entity. Idempotent; used at
    /// close.
    pub fn flush_all(&self) -> MdResult<()> {
        let entities: Vec<Arc<dyn Saveable>> = {
            let book = self.book.lock();
            book.entries.values().map(|e| e.entity.clone()).collect()
        };
        for entity in entities {
            if entity.is_dirty() {
                save_with_retry(entity.as_ref(), &self.store)?;
            }
        }
        Ok(())
    }

    /// Drops an entity from the bookkeeping without saving; used when a
    /// box stops owning events (leaf-to-grid conversion).
    pub fn forget(&self, id: BoxId) {
        let mut guard = self.book.lock();
        let book = &mut *guard;
        if let Some(entry) = book.entries.remove(&id) {
            book.resident_bytes = book.resident_bytes.saturating_sub(entry.bytes);
        }
    }
}

/// Saves an entity, retrying transient storage failures a bounded number
/// of times before escalating.
fn save_with_retry(entity: &dyn Saveable, store: &EventStore) -> MdResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match entity.save(store) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < SAVE_RETRY_LIMIT => {
                log::warn!(
                    "save of box {} failed (attempt {}/{}): {}",
                    entity.id(),
                    attempt,
                    SAVE_RETRY_LIMIT,
                    err
                );
            }
            Err(err) => return Err(err),
        }
    }
}
