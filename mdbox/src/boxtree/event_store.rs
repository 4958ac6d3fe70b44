//! Backing-file store for box event data.
//!
//! The file starts with a fixed-size header page (magic, version,
//! per-dimension extents, split threshold, catalog offset) followed by
//! variable-length box records. Records are written into reserved extents;
//! a record that outgrows its reservation gets a fresh extent at the end of
//! the file and the old one is invalidated. The id-to-extent index lives in
//! memory and is persisted, together with the box-tree skeleton, as a
//! catalog blob behind the header's catalog offset at close.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::constants::{HEADER_SIZE, MAGIC, VERSION};
use super::region::Region;
use super::BoxId;
use crate::dimension::Dimension;
use crate::errors::{MdError, MdResult};
use crate::event::MdEvent;

/// A reserved byte range in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtent {
    pub offset: u64,
    pub length: u64,
}

impl FileExtent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Per-dimension extent as persisted in the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimExtent {
    pub min: f64,
    pub max: f64,
    pub bins: u64,
}

/// File header stored in the reserved page at offset zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub dims: Vec<DimExtent>,
    pub split_threshold: u64,
    /// Offset of the persisted catalog blob; zero while the store is open.
    pub catalog_offset: u64,
}

impl StoreHeader {
    pub fn new(dims: &[Dimension], split_threshold: u64) -> Self {
        StoreHeader {
            magic: MAGIC,
            version: VERSION,
            dims: dims
                .iter()
                .map(|d| DimExtent {
                    min: d.min,
                    max: d.max,
                    bins: d.bins as u64,
                })
                .collect(),
            split_threshold,
            catalog_offset: 0,
        }
    }

    pub fn validate(&self) -> MdResult<()> {
        if self.magic != MAGIC {
            return Err(MdError::Serialization(
                "invalid file format (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(MdError::Serialization(format!(
                "unsupported file format version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Serialize-only view of a box record; field order matches [`BoxRecord`]
/// so the two encode identically.
#[derive(Serialize)]
struct BoxRecordOut<'a> {
    box_id: u64,
    bounds: &'a [f64],
    events: &'a [MdEvent],
}

/// A box's event payload as read back from the file. The event count of
/// the layout is carried by the vector length prefix.
#[derive(Debug, Deserialize)]
pub struct BoxRecord {
    pub box_id: u64,
    pub bounds: Vec<f64>,
    pub events: Vec<MdEvent>,
}

/// Skeleton entry for one box, persisted in the catalog so a workspace can
/// reopen without scanning the data records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxMeta {
    pub id: BoxId,
    pub depth: usize,
    pub region: Region,
    pub signal: f64,
    pub error: f64,
    pub count: u64,
    pub kind: BoxMetaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BoxMetaKind {
    Leaf,
    Grid { children: Vec<BoxId> },
}

/// Everything needed to rebuild a workspace from its file: dimensions,
/// the box skeleton, the extent index, and the controller state.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreCatalog {
    pub dimensions: Vec<Dimension>,
    pub boxes: Vec<BoxMeta>,
    pub extents: Vec<(BoxId, FileExtent)>,
    pub root: BoxId,
    pub next_id: u64,
    pub max_depth: usize,
    pub split_factor: usize,
}

/// Handles extent allocation and record I/O on the backing file.
///
/// Reads and writes go through one file handle behind a mutex; extent
/// allocation is a plain high-water mark so concurrent savers never
/// overlap. Invalidated extents are remembered and trailing ones are
/// reclaimed by `truncate_unused`.
pub struct EventStore {
    file: Mutex<File>,
    #[allow(dead_code)]
    path: PathBuf,
    end: AtomicU64,
    index: Mutex<HashMap<BoxId, FileExtent>>,
    freed: Mutex<Vec<FileExtent>>,
    header: Mutex<StoreHeader>,
}

impl EventStore {
    /// Creates a new backing file, truncating any existing one.
    pub fn create(path: &Path, dims: &[Dimension], split_threshold: u64) -> MdResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let store = EventStore {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            end: AtomicU64::new(HEADER_SIZE as u64),
            index: Mutex::new(HashMap::new()),
            freed: Mutex::new(Vec::new()),
            header: Mutex::new(StoreHeader::new(dims, split_threshold)),
        };
        store.write_header()?;
        store.sync()?;
        Ok(store)
    }

    /// Opens an existing backing file and restores the persisted catalog.
    /// Fails if the store was not closed cleanly (no catalog present).
    pub fn open(path: &Path) -> MdResult<(Self, StoreCatalog)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        file.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buffer)?;
        let header: StoreHeader =
            bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
                .map(|(h, _)| h)
                .map_err(|e| MdError::Serialization(e.to_string()))?;
        header.validate()?;

        if header.catalog_offset == 0 {
            return Err(MdError::Serialization(
                "store was not closed cleanly: no catalog present".into(),
            ));
        }

        let file_len = file.metadata()?.len();
        let catalog_offset = header.catalog_offset;
        file.seek(SeekFrom::Start(catalog_offset))?;
        let mut blob = vec![0u8; (file_len - catalog_offset) as usize];
        file.read_exact(&mut blob)?;
        let catalog: StoreCatalog =
            bincode::serde::decode_from_slice(&blob, bincode::config::legacy())
                .map(|(c, _)| c)
                .map_err(|e| MdError::Serialization(e.to_string()))?;

        let store = EventStore {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            // New extents overwrite the stale catalog blob.
            end: AtomicU64::new(catalog_offset),
            index: Mutex::new(catalog.extents.iter().copied().collect()),
            freed: Mutex::new(Vec::new()),
            header: Mutex::new(StoreHeader {
                catalog_offset: 0,
                ..header
            }),
        };
        // Invalidate the on-disk catalog pointer until the next clean close.
        store.write_header()?;
        store.sync()?;
        Ok((store, catalog))
    }

    pub fn header(&self) -> StoreHeader {
        self.header.lock().clone()
    }

    /// Reserves `size` bytes at the end of the file.
    pub fn allocate_extent(&self, size: u64) -> u64 {
        self.end.fetch_add(size, Ordering::SeqCst)
    }

    /// Writes raw bytes at an absolute offset. The header page is
    /// write-protected.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> MdResult<()> {
        if offset < HEADER_SIZE as u64 {
            return Err(MdError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot write into the reserved header page",
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Reads `size` bytes at an absolute offset.
    pub fn read_at(&self, offset: u64, size: u64) -> MdResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Serializes a box's events into its reserved extent, allocating a new
    /// extent if the record outgrew the old reservation. The index is
    /// repointed only after the write succeeds, so a failed or cancelled
    /// save never leaves a half-written record visible.
    pub fn save_record(
        &self,
        id: BoxId,
        bounds: &[f64],
        events: &[MdEvent],
    ) -> MdResult<FileExtent> {
        let record = BoxRecordOut {
            box_id: id,
            bounds,
            events,
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::legacy())
            .map_err(|e| MdError::Serialization(e.to_string()))?;

        let prev = self.extent_of(id);
        let extent = match prev {
            Some(extent) if bytes.len() as u64 <= extent.length => extent,
            _ => FileExtent {
                offset: self.allocate_extent(bytes.len() as u64),
                length: bytes.len() as u64,
            },
        };

        self.write_at(extent.offset, &bytes)?;

        let mut index = self.index.lock();
        let old = index.insert(id, extent);
        if let Some(old) = old {
            if old.offset != extent.offset {
                self.freed.lock().push(old);
            }
        }
        Ok(extent)
    }

    /// Reads a box record back. Unknown ids fail with `NotFound`.
    pub fn load_record(&self, id: BoxId) -> MdResult<BoxRecord> {
        let extent = self
            .extent_of(id)
            .ok_or_else(|| MdError::NotFound(format!("box {} has no on-disk record", id)))?;
        let bytes = self.read_at(extent.offset, extent.length)?;
        let record: BoxRecord =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map(|(r, _)| r)
                .map_err(|e| MdError::Serialization(e.to_string()))?;
        if record.box_id != id {
            return Err(MdError::Serialization(format!(
                "record at offset {} belongs to box {}, expected {}",
                extent.offset, record.box_id, id
            )));
        }
        Ok(record)
    }

    /// Drops a box's extent from the index (the box no longer owns events,
    /// e.g. after a split turned it into a grid node).
    pub fn invalidate(&self, id: BoxId) {
        let removed = self.index.lock().remove(&id);
        if let Some(extent) = removed {
            self.freed.lock().push(extent);
        }
    }

    pub fn extent_of(&self, id: BoxId) -> Option<FileExtent> {
        self.index.lock().get(&id).copied()
    }

    /// Snapshot of the live id-to-extent index, for catalog building.
    pub fn extents_snapshot(&self) -> Vec<(BoxId, FileExtent)> {
        let mut extents: Vec<_> = self.index.lock().iter().map(|(k, v)| (*k, *v)).collect();
        extents.sort_unstable_by_key(|(id, _)| *id);
        extents
    }

    /// Number of boxes with an on-disk record.
    pub fn on_disk_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Reclaims trailing file space no live extent reaches into.
    pub fn truncate_unused(&self) -> MdResult<()> {
        let index = self.index.lock();
        let used_end = index
            .values()
            .map(FileExtent::end)
            .max()
            .unwrap_or(HEADER_SIZE as u64);
        drop(index);

        let current = self.end.load(Ordering::SeqCst);
        if used_end < current {
            let file = self.file.lock();
            file.set_len(used_end)?;
            self.end.store(used_end, Ordering::SeqCst);
            self.freed.lock().retain(|e| e.end() <= used_end);
            log::debug!(
                "truncated backing file from {} to {} bytes",
                current,
                used_end
            );
        }
        Ok(())
    }

    /// Appends the catalog blob and repoints the header at it. Called at
    /// close, after every dirty box has been flushed.
    pub fn persist_catalog(&self, catalog: &StoreCatalog) -> MdResult<()> {
        let bytes = bincode::serde::encode_to_vec(catalog, bincode::config::legacy())
            .map_err(|e| MdError::Serialization(e.to_string()))?;
        let offset = self.end.load(Ordering::SeqCst);
        self.write_at(offset, &bytes)?;
        {
            let mut file = self.file.lock();
            file.set_len(offset + bytes.len() as u64)?;
        }
        self.header.lock().catalog_offset = offset;
        self.write_header()?;
        self.sync()?;
        Ok(())
    }

    fn write_header(&self) -> MdResult<()> {
        let header = self.header.lock().clone();
        let bytes = bincode::serde::encode_to_vec(&header, bincode::config::legacy())
            .map_err(|e| MdError::Serialization(e.to_string()))?;
        if bytes.len() > HEADER_SIZE {
            return Err(MdError::Serialization(format!(
                "header too large: {} bytes (max {})",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let mut padded = bytes;
        padded.resize(HEADER_SIZE, 0);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&padded)?;
        Ok(())
    }

    /// Sync file contents to disk.
    pub fn sync(&self) -> MdResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
