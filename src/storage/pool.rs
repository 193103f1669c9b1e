//! Pool of database connections to one file
//!
//! Sharing a single SQLite handle between threads lets one thread rebind a
//! prepared statement while another is about to step it, and statement
//! execution is serialized by SQLite anyway. Instead each active thread checks
//! out a private connection and hands it back when done. Connections are
//! recycled, not closed, until the pool itself is closed.

use crate::core::types::Result;
use crate::storage::connection::Connection;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Lazily growing set of connections to one database file
pub struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    /// Connections not currently checked out
    idle: Mutex<Vec<Connection>>,
    /// Total connections opened over the pool's lifetime
    opened: AtomicUsize,
}

impl ConnectionPool {
    /// Create a pool for `path`
    ///
    /// One connection is opened eagerly so a bad path fails here rather than
    /// on the first load.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let pool = Self {
            path: path.into(),
            busy_timeout,
            idle: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        };
        let first = pool.open_connection()?;
        pool.idle.lock().push(first);
        Ok(pool)
    }

    /// Check out a connection, reusing an idle one when available
    ///
    /// The idle list is locked only while popping; opening a new connection
    /// happens outside the lock.
    ///
    /// # Returns
    /// A guard that hands the connection back to the pool when dropped
    pub fn acquire(&self) -> Result<PooledConnection<'_>> {
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open_connection()?,
        };
        Ok(PooledConnection { pool: self, conn: Some(conn) })
    }

    /// Check out a newly opened connection, bypassing the idle list
    pub fn acquire_fresh(&self) -> Result<PooledConnection<'_>> {
        let conn = self.open_connection()?;
        Ok(PooledConnection { pool: self, conn: Some(conn) })
    }

    fn release(&self, conn: Connection) {
        self.idle.lock().push(conn);
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path, self.busy_timeout)?;
        let n = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Opened connection #{} to {}", n, self.path.display());
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Close every connection
    ///
    /// Checked-out connections borrow the pool, so none can be outstanding
    /// once this can be called. Every connection is closed even if one fails;
    /// the first failure is returned.
    pub fn close(self) -> Result<()> {
        self.close_idle()
    }

    fn close_idle(&self) -> Result<()> {
        let connections = std::mem::take(&mut *self.idle.lock());
        let count = connections.len();
        let mut first_error = None;
        for conn in connections {
            if let Err(e) = conn.close() {
                log::warn!("Failed to close connection to {}: {}", self.path.display(), e);
                first_error.get_or_insert(e);
            }
        }
        if count > 0 {
            log::debug!("Closed {} connections to {}", count, self.path.display());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let _ = self.close_idle();
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Returned to the pool when dropped.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl PooledConnection<'_> {
    /// Close this connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                log::debug!("Error closing discarded connection: {}", e);
            }
        }
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
