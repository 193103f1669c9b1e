//! Write-back cache for block saves
//!
//! Saves land here first and reach the database only when the cache is
//! flushed or when an entry is evicted to make room. Repeated saves to the
//! same address overwrite each other in memory, so only the last one is
//! written. Evicted dirty entries are always written before being dropped.
//!
//! Blocks read from the database may also be kept here as clean entries.
//! Clean entries are dropped on eviction or flush without being written.

use crate::core::types::Result;
use crate::storage::address::BlockAddress;
use crate::storage::payload::{InstanceBlockPayload, VoxelBlockPayload};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Default maximum number of cached entries
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Which kind of data an entry holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Voxels,
    Instances,
}

/// Cached block data
#[derive(Clone, Debug, PartialEq)]
pub enum CachedPayload {
    Voxels(VoxelBlockPayload),
    /// `None` is a pending "revert to not authored"
    Instances(Option<InstanceBlockPayload>),
}

impl CachedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            CachedPayload::Voxels(_) => PayloadKind::Voxels,
            CachedPayload::Instances(_) => PayloadKind::Instances,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    address: BlockAddress,
    kind: PayloadKind,
}

/// One cached block
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub address: BlockAddress,
    pub payload: CachedPayload,
    /// Not yet written to the database; `false` for entries filled by reads
    pub dirty: bool,
    /// Sequence number of the last put or hit
    pub last_touched: u64,
}

/// Destination for entries leaving the cache
pub trait WriteBack {
    /// Persist `entries`, all or nothing
    fn write_back(&self, entries: &[CacheEntry]) -> Result<()>;
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    sequence: u64,
    /// Bumped whenever dirty entries reach the database
    write_epoch: u64,
}

impl CacheInner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn oldest_key(&self) -> Option<CacheKey> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_touched)
            .map(|(key, _)| *key)
    }

    fn oldest_clean_key(&self) -> Option<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.dirty)
            .min_by_key(|(_, entry)| entry.last_touched)
            .map(|(key, _)| *key)
    }
}

/// Bounded write-back cache keyed by address and payload kind
///
/// A single lock covers every operation, including the writes triggered by
/// eviction and flushing, so no put can slip in while entries are draining.
pub struct WriteBackCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl WriteBackCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                sequence: 0,
                write_epoch: 0,
            }),
            capacity,
        }
    }

    /// Cache a save, replacing any pending entry for the same key
    ///
    /// When the cache is full the least recently touched entry is written
    /// through `sink` first. If that write fails, the evicted entry is kept,
    /// the new entry is not inserted and the error is returned.
    ///
    /// # Arguments
    /// * `address` - Block being saved
    /// * `payload` - New contents, replacing any cached entry of the same kind
    /// * `sink` - Destination for an entry evicted to make room
    pub fn put(&self, address: BlockAddress, payload: CachedPayload, sink: &dyn WriteBack) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = CacheKey { address, kind: payload.kind() };
        let touched = inner.next_sequence();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.payload = payload;
            entry.dirty = true;
            entry.last_touched = touched;
            return Ok(());
        }

        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.oldest_key() {
                if let Some(evicted) = inner.entries.remove(&oldest) {
                    if evicted.dirty {
                        log::trace!("Evicting {} ({:?}) from write-back cache", evicted.address, oldest.kind);
                        if let Err(e) = sink.write_back(std::slice::from_ref(&evicted)) {
                            inner.entries.insert(oldest, evicted);
                            return Err(e);
                        }
                        inner.write_epoch += 1;
                    }
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                address,
                payload,
                dirty: true,
                last_touched: touched,
            },
        );
        Ok(())
    }

    /// Current write epoch
    ///
    /// Read this before querying the database and pass it to
    /// [`fill`](Self::fill), so a block read while a write-back was in
    /// progress is not cached.
    pub fn write_epoch(&self) -> u64 {
        self.inner.lock().write_epoch
    }

    /// Keep a block just read from the database as a clean entry
    ///
    /// Never overwrites an existing entry and never writes anything: when the
    /// cache is full only a clean entry can make room.
    ///
    /// # Arguments
    /// * `address` - Address the block was read from
    /// * `payload` - Decoded block as stored in the database
    /// * `epoch` - [`write_epoch`](Self::write_epoch) observed before the read
    ///
    /// # Returns
    /// `true` if the block was cached
    pub fn fill(&self, address: BlockAddress, payload: CachedPayload, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.write_epoch != epoch {
            return false;
        }
        let key = CacheKey { address, kind: payload.kind() };
        if inner.entries.contains_key(&key) {
            return false;
        }
        if inner.entries.len() >= self.capacity {
            match inner.oldest_clean_key() {
                Some(victim) => {
                    inner.entries.remove(&victim);
                }
                None => return false,
            }
        }

        let touched = inner.next_sequence();
        inner.entries.insert(
            key,
            CacheEntry {
                address,
                payload,
                dirty: false,
                last_touched: touched,
            },
        );
        true
    }

    /// Look up a cached block; a miss means "ask the database"
    pub fn try_get(&self, address: BlockAddress, kind: PayloadKind) -> Option<CachedPayload> {
        let mut inner = self.inner.lock();
        let touched = inner.next_sequence();
        let entry = inner.entries.get_mut(&CacheKey { address, kind })?;
        entry.last_touched = touched;
        Some(entry.payload.clone())
    }

    /// Write every dirty entry through `sink` and empty the cache
    ///
    /// On failure nothing is removed.
    ///
    /// # Returns
    /// Number of dirty entries written
    pub fn flush(&self, sink: &dyn WriteBack) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return Ok(0);
        }

        let drained: Vec<(CacheKey, CacheEntry)> = inner.entries.drain().collect();
        let dirty: Vec<CacheEntry> = drained
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(_, entry)| entry.clone())
            .collect();

        if !dirty.is_empty() {
            if let Err(e) = sink.write_back(&dirty) {
                inner.entries.extend(drained);
                return Err(e);
            }
            inner.write_epoch += 1;
        }

        log::debug!("Flushed {} cached blocks", dirty.len());
        Ok(dirty.len())
    }

    pub fn contains(&self, address: BlockAddress, kind: PayloadKind) -> bool {
        self.inner.lock().entries.contains_key(&CacheKey { address, kind })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of entries still waiting to be written
    pub fn dirty_len(&self) -> usize {
        self.inner.lock().entries.values().filter(|entry| entry.dirty).count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for WriteBackCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
