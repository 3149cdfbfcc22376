//! SQLite record store
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE records (
//!     peer_id TEXT NOT NULL,
//!     batch_id INTEGER NOT NULL,
//!     sequence INTEGER NOT NULL,
//!     timestamp INTEGER NOT NULL,
//!     data BLOB NOT NULL,
//!     received_at INTEGER NOT NULL,
//!     PRIMARY KEY (peer_id, batch_id, sequence)
//! );
//! CREATE INDEX idx_records_time ON records(timestamp);
//! CREATE INDEX idx_records_peer_time ON records(peer_id, timestamp);
//! ```

use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::core::{PeerId, Result};
use super::{BatchStore, Cursor, StoredRecord, TimeRange};

const RECORD_COLUMNS: &str = "peer_id, batch_id, sequence, timestamp, data, received_at";

/// Record store backed by one SQLite database
///
/// The connection sits behind a mutex; each batch is written in its own
/// transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    page_size: usize,
}

fn to_sql_time(timestamp: u64) -> i64 {
    timestamp.min(i64::MAX as u64) as i64
}

impl SqliteStore {
    /// Opens (or creates) a database file
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened record store");
        Self::with_connection(conn, page_size)
    }

    /// Creates an in-memory store
    pub fn open_in_memory(page_size: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, page_size)
    }

    fn with_connection(conn: Connection, page_size: usize) -> Result<Self> {
        let store = SqliteStore {
            conn: Mutex::new(conn),
            page_size: page_size.max(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                peer_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                data BLOB NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (peer_id, batch_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_records_time ON records(timestamp);
            CREATE INDEX IF NOT EXISTS idx_records_peer_time ON records(peer_id, timestamp);",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StoredRecord> {
        let peer: String = row.get(0)?;
        let peer_id = PeerId::new(peer).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, "peer_id".to_string(), rusqlite::types::Type::Text)
        })?;

        Ok(StoredRecord {
            peer_id,
            batch_id: row.get::<_, i64>(1)? as u32,
            sequence: row.get::<_, i64>(2)? as u32,
            timestamp: row.get::<_, i64>(3)?.max(0) as u64,
            data: row.get(4)?,
            received_at: row.get::<_, i64>(5)?.max(0) as u64,
        })
    }

    /// Removes every record
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM records", [])?;
        Ok(())
    }
}

impl BatchStore for SqliteStore {
    fn store_batch(
        &self,
        peer: &PeerId,
        batch_id: u32,
        received_at: u64,
        records: &[(u64, Bytes)],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO records (peer_id, batch_id, sequence, timestamp, data, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (sequence, (timestamp, data)) in records.iter().enumerate() {
                inserted += stmt.execute(params![
                    peer.as_str(),
                    batch_id as i64,
                    sequence as i64,
                    to_sql_time(*timestamp),
                    &data[..],
                    to_sql_time(received_at),
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            peer = %peer,
            batch_id,
            inserted,
            duplicates = records.len() - inserted,
            "Stored batch"
        );
        Ok(inserted)
    }

    fn fetch_page(
        &self,
        peer: Option<&PeerId>,
        range: TimeRange,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let conn = self.conn.lock();

        // The default cursor sorts before every stored row
        let (after_ts, after_peer, after_batch, after_seq) = match after {
            Some(c) => (to_sql_time(c.timestamp), c.peer_id.as_str(), c.batch_id as i64, c.sequence as i64),
            None => (-1, "", -1, -1),
        };

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {}
             FROM records
             WHERE (?1 IS NULL OR peer_id = ?1)
               AND timestamp BETWEEN ?2 AND ?3
               AND (timestamp, peer_id, batch_id, sequence) > (?4, ?5, ?6, ?7)
             ORDER BY timestamp, peer_id, batch_id, sequence
             LIMIT ?8",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map(
                params![
                    peer.map(PeerId::as_str),
                    to_sql_time(range.start),
                    to_sql_time(range.end),
                    after_ts,
                    after_peer,
                    after_batch,
                    after_seq,
                    limit.min(i64::MAX as usize) as i64,
                ],
                Self::row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn latest_records(&self, peer: Option<&PeerId>, limit: usize) -> Result<Vec<StoredRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {}
             FROM records
             WHERE (?1 IS NULL OR peer_id = ?1)
             ORDER BY timestamp DESC, peer_id DESC, batch_id DESC, sequence DESC
             LIMIT ?2",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map(
                params![peer.map(PeerId::as_str), limit.min(i64::MAX as usize) as i64],
                Self::row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn peer_ids(&self) -> Result<Vec<PeerId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT DISTINCT peer_id FROM records ORDER BY peer_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().filter_map(PeerId::new).collect())
    }

    fn record_count(&self, peer: Option<&PeerId>) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE (?1 IS NULL OR peer_id = ?1)",
            params![peer.map(PeerId::as_str)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn time_span(&self, peer: Option<&PeerId>) -> Result<Option<(u64, u64)>> {
        let conn = self.conn.lock();
        let span = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM records
                 WHERE (?1 IS NULL OR peer_id = ?1)",
                params![peer.map(PeerId::as_str)],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;

        Ok(match span {
            Some((Some(first), Some(last))) => Some((first.max(0) as u64, last.max(0) as u64)),
            _ => None,
        })
    }

    fn delete_before(&self, timestamp: u64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM records WHERE timestamp < ?1",
            params![to_sql_time(timestamp)],
        )?;
        if deleted > 0 {
            info!(deleted, before = timestamp, "Pruned stored records");
        }
        Ok(deleted)
    }

    fn delete_batch(&self, peer: &PeerId, batch_id: u32) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM records WHERE peer_id = ?1 AND batch_id = ?2",
            params![peer.as_str(), batch_id as i64],
        )?;
        Ok(deleted)
    }
}
