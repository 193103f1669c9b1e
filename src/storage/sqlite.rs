//! SQLite-backed block store
//!
//! One database file per volume. Saves are staged in a [`WriteBackCache`] and
//! reach the file on [`flush`](PersistentBlockStore::flush) or eviction;
//! loads consult the cache before querying the database. Each thread doing
//! disk work checks out its own connection from a [`ConnectionPool`].

use crate::core::error::Error;
use crate::core::types::Result;
use crate::storage::address::BlockAddress;
use crate::storage::cache::{CacheEntry, CachedPayload, PayloadKind, WriteBack, WriteBackCache};
use crate::storage::codec::BlockCodec;
use crate::storage::config::StoreConfig;
use crate::storage::connection::{BlockWrite, InstanceRow};
use crate::storage::payload::{InstanceBlockPayload, VoxelBlockPayload};
use crate::storage::pool::ConnectionPool;
use crate::storage::store::{BlockStore, InstanceSave, StoreMeta, StoredBlock, VoxelSave};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Persistent store for one volume, backed by a single SQLite file
pub struct PersistentBlockStore {
    pool: ConnectionPool,
    cache: WriteBackCache,
    codec: BlockCodec,
    meta: RwLock<StoreMeta>,
}

impl PersistentBlockStore {
    /// Open (or create) the database described by `config`
    ///
    /// # Arguments
    /// * `config` - Database path, cache size, compression and busy timeout
    ///
    /// # Returns
    /// The store, with metadata loaded or initialized to defaults
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::open(&config.database_path, config.busy_timeout())?;

        let meta = {
            let conn = pool.acquire()?;
            match conn.load_meta()? {
                Some(meta) => meta,
                None => {
                    let meta = StoreMeta::default();
                    conn.save_meta(&meta)?;
                    meta
                }
            }
        };

        log::info!(
            "Opened block store {} (block size {}, {} lods)",
            config.database_path.display(),
            meta.block_size(),
            meta.lod_count
        );

        Ok(Self {
            pool,
            cache: WriteBackCache::new(config.cache_capacity),
            codec: BlockCodec::new(config.compression),
            meta: RwLock::new(meta),
        })
    }

    pub fn meta(&self) -> StoreMeta {
        *self.meta.read()
    }

    /// Persist new volume metadata immediately
    pub fn set_meta(&self, meta: StoreMeta) -> Result<()> {
        let mut current = self.meta.write();
        self.pool.acquire()?.save_meta(&meta)?;
        *current = meta;
        Ok(())
    }

    /// Whether an instance row exists for `address`, including NULL markers
    pub fn has_instance_row(&self, address: BlockAddress) -> Result<bool> {
        if self.cache.contains(address, PayloadKind::Instances) {
            return Ok(true);
        }
        let row = self.pool.acquire()?.load_instance_row(address)?;
        Ok(row != InstanceRow::Missing)
    }

    /// Number of saves waiting in the write-back cache
    pub fn pending_writes(&self) -> usize {
        self.cache.dirty_len()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Flush pending saves and close the database
    pub fn close(self) -> Result<()> {
        self.flush()
        // The pool closes its connections when dropped
    }

    fn writer(&self) -> DiskWriter<'_> {
        DiskWriter { pool: &self.pool, codec: self.codec }
    }

    fn decode_voxels(address: BlockAddress, blob: &[u8]) -> Option<VoxelBlockPayload> {
        match BlockCodec::decode_voxels(blob) {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!("Voxel block {} unreadable, treating as missing: {}", address, e);
                None
            }
        }
    }

    fn decode_instances(address: BlockAddress, blob: &[u8]) -> Option<InstanceBlockPayload> {
        match BlockCodec::decode_instances(blob) {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!("Instance block {} unreadable, treating as missing: {}", address, e);
                None
            }
        }
    }
}

impl BlockStore for PersistentBlockStore {
    fn load(&self, address: BlockAddress) -> Result<Option<VoxelBlockPayload>> {
        if let Some(CachedPayload::Voxels(payload)) = self.cache.try_get(address, PayloadKind::Voxels) {
            return Ok(Some(payload));
        }

        let epoch = self.cache.write_epoch();
        let blob = self.pool.acquire()?.load_voxel_blob(address)?;
        let payload = blob.and_then(|blob| Self::decode_voxels(address, &blob));
        if let Some(payload) = &payload {
            self.cache.fill(address, CachedPayload::Voxels(payload.clone()), epoch);
        }
        Ok(payload)
    }

    fn save(&self, address: BlockAddress, payload: VoxelBlockPayload) -> Result<()> {
        self.cache.put(address, CachedPayload::Voxels(payload), &self.writer())
    }

    fn load_batch(&self, addresses: &[BlockAddress]) -> Result<Vec<Option<VoxelBlockPayload>>> {
        let mut results = Vec::with_capacity(addresses.len());
        let mut misses = Vec::new();
        let mut miss_slots = Vec::new();

        for (slot, &address) in addresses.iter().enumerate() {
            match self.cache.try_get(address, PayloadKind::Voxels) {
                Some(CachedPayload::Voxels(payload)) => results.push(Some(payload)),
                _ => {
                    results.push(None);
                    misses.push(address);
                    miss_slots.push(slot);
                }
            }
        }

        if !misses.is_empty() {
            let blobs = self.pool.acquire()?.load_voxel_blobs(&misses)?;
            for ((slot, address), blob) in miss_slots.into_iter().zip(misses).zip(blobs) {
                results[slot] = blob.and_then(|blob| Self::decode_voxels(address, &blob));
            }
        }

        Ok(results)
    }

    fn save_batch(&self, saves: Vec<VoxelSave>) -> Result<()> {
        let writer = self.writer();
        for save in saves {
            self.cache.put(save.address, CachedPayload::Voxels(save.payload), &writer)?;
        }
        Ok(())
    }

    fn supports_instances(&self) -> bool {
        true
    }

    fn load_instances(&self, address: BlockAddress) -> Result<Option<InstanceBlockPayload>> {
        if let Some(CachedPayload::Instances(payload)) = self.cache.try_get(address, PayloadKind::Instances) {
            return Ok(payload);
        }

        let row = self.pool.acquire()?.load_instance_row(address)?;
        Ok(match row {
            InstanceRow::Missing | InstanceRow::Cleared => None,
            InstanceRow::Stored(blob) => Self::decode_instances(address, &blob),
        })
    }

    fn save_instances(&self, address: BlockAddress, payload: Option<InstanceBlockPayload>) -> Result<()> {
        self.cache.put(address, CachedPayload::Instances(payload), &self.writer())
    }

    fn save_instances_batch(&self, saves: Vec<InstanceSave>) -> Result<()> {
        let writer = self.writer();
        for save in saves {
            self.cache.put(save.address, CachedPayload::Instances(save.payload), &writer)?;
        }
        Ok(())
    }

    fn supports_full_dump(&self) -> bool {
        true
    }

    fn load_all(&self) -> Result<Vec<StoredBlock>> {
        self.flush()?;

        let (voxel_rows, instance_rows) = {
            let conn = self.pool.acquire()?;
            (conn.all_voxel_blobs()?, conn.all_instance_rows()?)
        };

        let mut blocks: BTreeMap<BlockAddress, StoredBlock> = BTreeMap::new();
        for (address, blob) in voxel_rows {
            if let Some(voxels) = Self::decode_voxels(address, &blob) {
                stored_block(&mut blocks, address).voxels = Some(voxels);
            }
        }
        for (address, blob) in instance_rows {
            if let Some(instances) = blob.and_then(|blob| Self::decode_instances(address, &blob)) {
                stored_block(&mut blocks, address).instances = Some(instances);
            }
        }

        log::debug!("Full dump returned {} blocks", blocks.len());
        Ok(blocks.into_values().collect())
    }

    fn used_channels_mask(&self) -> u8 {
        self.meta.read().channel_mask
    }

    fn flush(&self) -> Result<()> {
        self.cache.flush(&self.writer()).map(|_| ())
    }
}

impl Drop for PersistentBlockStore {
    fn drop(&mut self) {
        if self.cache.dirty_len() > 0 {
            log::debug!("Flushing {} pending blocks on drop", self.cache.dirty_len());
            if let Err(e) = self.flush() {
                log::error!("Failed to flush block store on drop: {}", e);
            }
        }
    }
}

fn stored_block(blocks: &mut BTreeMap<BlockAddress, StoredBlock>, address: BlockAddress) -> &mut StoredBlock {
    blocks.entry(address).or_insert_with(|| StoredBlock {
        address,
        voxels: None,
        instances: None,
    })
}

/// Encodes cache entries and writes them in one transaction
struct DiskWriter<'a> {
    pool: &'a ConnectionPool,
    codec: BlockCodec,
}

impl DiskWriter<'_> {
    fn encode(&self, entries: &[CacheEntry]) -> Result<Vec<BlockWrite>> {
        entries
            .iter()
            .map(|entry| {
                let address = entry.address;
                Ok(match &entry.payload {
                    CachedPayload::Voxels(payload) => BlockWrite::Voxels {
                        address,
                        blob: self.codec.encode_voxels(payload)?,
                    },
                    CachedPayload::Instances(payload) => BlockWrite::Instances {
                        address,
                        blob: payload
                            .as_ref()
                            .map(|p| self.codec.encode_instances(p))
                            .transpose()?,
                    },
                })
            })
            .collect()
    }
}

impl WriteBack for DiskWriter<'_> {
    fn write_back(&self, entries: &[CacheEntry]) -> Result<()> {
        let writes = self.encode(entries)?;

        let mut conn = self.pool.acquire()?;
        let first_error = match conn.write_blocks(&writes) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        log::warn!("Writing {} blocks failed ({}), retrying on a fresh connection", writes.len(), first_error);
        conn.discard();

        let mut fresh = self.pool.acquire_fresh()?;
        fresh
            .write_blocks(&writes)
            .map_err(|e| Error::ConnectionFailure(format!("write failed after retry: {}", e)))
    }
}
