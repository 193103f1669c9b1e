//! A single SQLite connection and the queries run through it
//!
//! A `Connection` is only ever used by one thread at a time. Statements are
//! prepared through rusqlite's per-connection statement cache, so each
//! connection keeps its own compiled queries and no two threads ever bind
//! parameters on the same statement.

use crate::core::types::{IVec3, Result};
use crate::storage::address::BlockAddress;
use crate::storage::store::StoreMeta;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    version INTEGER NOT NULL,
    block_size_po2 INTEGER NOT NULL,
    lod_count INTEGER NOT NULL,
    channel_mask INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS voxel_blocks (
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    z INTEGER NOT NULL,
    lod INTEGER NOT NULL,
    format_version INTEGER NOT NULL,
    flags INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (x, y, z, lod)
);
CREATE TABLE IF NOT EXISTS instance_blocks (
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    z INTEGER NOT NULL,
    lod INTEGER NOT NULL,
    data BLOB,
    PRIMARY KEY (x, y, z, lod)
);
";

const SELECT_VOXELS: &str =
    "SELECT data FROM voxel_blocks WHERE x = ?1 AND y = ?2 AND z = ?3 AND lod = ?4";
const UPSERT_VOXELS: &str = "INSERT OR REPLACE INTO voxel_blocks \
    (x, y, z, lod, format_version, flags, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";
const SELECT_INSTANCES: &str =
    "SELECT data FROM instance_blocks WHERE x = ?1 AND y = ?2 AND z = ?3 AND lod = ?4";
const UPSERT_INSTANCES: &str =
    "INSERT OR REPLACE INTO instance_blocks (x, y, z, lod, data) VALUES (?1, ?2, ?3, ?4, ?5)";

/// State of an instance block row
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceRow {
    /// No row was ever written for this address
    Missing,
    /// A row exists with a NULL blob
    Cleared,
    Stored(Vec<u8>),
}

/// One deferred write, already encoded
#[derive(Clone, Debug)]
pub enum BlockWrite {
    Voxels { address: BlockAddress, blob: Vec<u8> },
    /// `None` writes the NULL marker
    Instances { address: BlockAddress, blob: Option<Vec<u8>> },
}

/// Owned handle to the database file
pub struct Connection {
    conn: rusqlite::Connection,
}

impl Connection {
    /// Open a connection and make sure the schema exists
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        conn.set_prepared_statement_cache_capacity(16);
        Ok(Self { conn })
    }

    pub fn load_voxel_blob(&self, address: BlockAddress) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.conn.prepare_cached(SELECT_VOXELS)?;
        let blob = stmt
            .query_row(key_params(address), |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(blob)
    }

    /// Point-query several addresses inside one read transaction
    pub fn load_voxel_blobs(&mut self, addresses: &[BlockAddress]) -> Result<Vec<Option<Vec<u8>>>> {
        let tx = self.conn.transaction()?;
        let mut blobs = Vec::with_capacity(addresses.len());
        {
            let mut stmt = tx.prepare_cached(SELECT_VOXELS)?;
            for &address in addresses {
                blobs.push(
                    stmt.query_row(key_params(address), |row| row.get::<_, Vec<u8>>(0))
                        .optional()?,
                );
            }
        }
        tx.commit()?;
        Ok(blobs)
    }

    pub fn load_instance_row(&self, address: BlockAddress) -> Result<InstanceRow> {
        let mut stmt = self.conn.prepare_cached(SELECT_INSTANCES)?;
        let row = stmt
            .query_row(key_params(address), |row| row.get::<_, Option<Vec<u8>>>(0))
            .optional()?;
        Ok(match row {
            None => InstanceRow::Missing,
            Some(None) => InstanceRow::Cleared,
            Some(Some(blob)) => InstanceRow::Stored(blob),
        })
    }

    /// Apply a group of writes as a single transaction
    pub fn write_blocks(&mut self, writes: &[BlockWrite]) -> Result<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut voxels = tx.prepare_cached(UPSERT_VOXELS)?;
            let mut instances = tx.prepare_cached(UPSERT_INSTANCES)?;
            for write in writes {
                match write {
                    BlockWrite::Voxels { address, blob } => {
                        let (version, flags) = (blob.first().copied(), blob.get(1).copied());
                        let c = address.coord;
                        voxels.execute(params![
                            c.x, c.y, c.z, address.lod, version, flags, blob
                        ])?;
                    }
                    BlockWrite::Instances { address, blob } => {
                        let c = address.coord;
                        instances.execute(params![c.x, c.y, c.z, address.lod, blob])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every voxel row, for full dumps
    ///
    /// Rows whose key does not fit a [`BlockAddress`] are logged and skipped.
    pub fn all_voxel_blobs(&self) -> Result<Vec<(BlockAddress, Vec<u8>)>> {
        let mut stmt = self.conn.prepare("SELECT x, y, z, lod, data FROM voxel_blocks")?;
        let rows = stmt.query_map([], |row| Ok((read_key(row)?, row.get::<_, Vec<u8>>(4)?)))?;
        collect_valid(rows, "voxel_blocks")
    }

    /// Every instance row, NULL markers included
    ///
    /// Rows whose key does not fit a [`BlockAddress`] are logged and skipped.
    pub fn all_instance_rows(&self) -> Result<Vec<(BlockAddress, Option<Vec<u8>>)>> {
        let mut stmt = self.conn.prepare("SELECT x, y, z, lod, data FROM instance_blocks")?;
        let rows = stmt.query_map([], |row| {
            Ok((read_key(row)?, row.get::<_, Option<Vec<u8>>>(4)?))
        })?;
        collect_valid(rows, "instance_blocks")
    }

    pub fn load_meta(&self) -> Result<Option<StoreMeta>> {
        let meta = self
            .conn
            .query_row(
                "SELECT version, block_size_po2, lod_count, channel_mask FROM meta WHERE id = 0",
                [],
                |row| {
                    Ok(StoreMeta {
                        version: row.get(0)?,
                        block_size_po2: row.get(1)?,
                        lod_count: row.get(2)?,
                        channel_mask: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub fn save_meta(&self, meta: &StoreMeta) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (id, version, block_size_po2, lod_count, channel_mask) \
             VALUES (0, ?1, ?2, ?3, ?4)",
            params![meta.version, meta.block_size_po2, meta.lod_count, meta.channel_mask],
        )?;
        Ok(())
    }

    /// Close the underlying handle, reporting any failure
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e.into())
    }
}

fn key_params(address: BlockAddress) -> (i32, i32, i32, u8) {
    (address.coord.x, address.coord.y, address.coord.z, address.lod)
}

/// Raw key columns, widened so out-of-range values can be reported
fn read_key(row: &Row<'_>) -> rusqlite::Result<[i64; 4]> {
    Ok([row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?])
}

fn address_from_key(key: [i64; 4]) -> Option<BlockAddress> {
    let [x, y, z, lod] = key;
    Some(BlockAddress::from_coord(
        IVec3::new(i32::try_from(x).ok()?, i32::try_from(y).ok()?, i32::try_from(z).ok()?),
        u8::try_from(lod).ok()?,
    ))
}

fn collect_valid<T>(
    rows: impl Iterator<Item = rusqlite::Result<([i64; 4], T)>>,
    table: &str,
) -> Result<Vec<(BlockAddress, T)>> {
    let mut valid = Vec::new();
    for row in rows {
        let (key, data) = row?;
        match address_from_key(key) {
            Some(address) => valid.push((address, data)),
            None => log::warn!("Skipping {} row with invalid key {:?}", table, key),
        }
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(&dir.path().join("blocks.sqlite"), Duration::from_secs(1)).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_missing_rows() {
        let (_dir, conn) = open_temp();
        let addr = BlockAddress::new(0, 0, 0, 0);
        assert_eq!(conn.load_voxel_blob(addr).unwrap(), None);
        assert_eq!(conn.load_instance_row(addr).unwrap(), InstanceRow::Missing);
        assert_eq!(conn.load_meta().unwrap(), None);
    }

    #[test]
    fn test_write_and_read_back() {
        let (_dir, mut conn) = open_temp();
        let a = BlockAddress::new(1, -2, 3, 0);
        let b = BlockAddress::new(1, -2, 3, 1);

        conn.write_blocks(&[
            BlockWrite::Voxels { address: a, blob: vec![1, 0, 1, 0, 0, 0, 42] },
            BlockWrite::Instances { address: a, blob: None },
            BlockWrite::Instances { address: b, blob: Some(vec![7]) },
        ])
        .unwrap();

        assert_eq!(conn.load_voxel_blob(a).unwrap(), Some(vec![1, 0, 1, 0, 0, 0, 42]));
        assert_eq!(conn.load_voxel_blob(b).unwrap(), None);
        assert_eq!(conn.load_instance_row(a).unwrap(), InstanceRow::Cleared);
        assert_eq!(conn.load_instance_row(b).unwrap(), InstanceRow::Stored(vec![7]));

        let batch = conn.load_voxel_blobs(&[b, a]).unwrap();
        assert_eq!(batch[0], None);
        assert!(batch[1].is_some());

        assert_eq!(conn.all_voxel_blobs().unwrap().len(), 1);
        assert_eq!(conn.all_instance_rows().unwrap().len(), 2);
    }

    #[test]
    fn test_dump_skips_rows_with_invalid_keys() {
        let (_dir, mut conn) = open_temp();
        let good = BlockAddress::new(-3, 4, 5, 2);
        conn.write_blocks(&[
            BlockWrite::Voxels { address: good, blob: vec![1, 0, 0, 0, 0, 0] },
            BlockWrite::Instances { address: good, blob: None },
        ])
        .unwrap();
        conn.conn
            .execute_batch(
                "INSERT INTO voxel_blocks VALUES (0, 0, 0, 300, 1, 0, x'01');
                 INSERT INTO voxel_blocks VALUES (4294967296, 0, 0, 0, 1, 0, x'01');
                 INSERT INTO instance_blocks VALUES (0, 0, 0, -1, NULL);",
            )
            .unwrap();

        let voxels = conn.all_voxel_blobs().unwrap();
        assert_eq!(voxels.len(), 1);
        assert_eq!(voxels[0].0, good);

        let instances = conn.all_instance_rows().unwrap();
        assert_eq!(instances, vec![(good, None)]);
    }

    #[test]
    fn test_meta_roundtrip() {
        let (_dir, conn) = open_temp();
        let meta = StoreMeta { version: 1, block_size_po2: 4, lod_count: 8, channel_mask: 0b11 };
        conn.save_meta(&meta).unwrap();
        assert_eq!(conn.load_meta().unwrap(), Some(meta));
    }
}
