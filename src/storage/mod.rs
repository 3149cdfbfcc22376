//! Durable record storage
//!
//! Records from timestamped batches are keyed by `(peer_id, batch_id,
//! sequence)`; storing an existing key is a no-op, so a batch redelivered
//! after a lost ACK is absorbed without duplicates.

mod sqlite;

pub use self::sqlite::SqliteStore;

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::core::{PeerId, Result};

/// A persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub peer_id: PeerId,
    pub batch_id: u32,
    /// Position of the record within its batch
    pub sequence: u32,
    /// Absolute capture time, unix seconds
    pub timestamp: u64,
    #[serde(serialize_with = "crate::core::serde::serialize_hex")]
    pub data: Vec<u8>,
    /// Unix seconds at which the batch was stored
    pub received_at: u64,
}

/// Inclusive range of unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

impl TimeRange {
    pub fn new(start: u64, end: u64) -> Self {
        TimeRange { start, end }
    }

    /// Every representable timestamp
    pub fn all() -> Self {
        TimeRange { start: 0, end: i64::MAX as u64 }
    }

    pub fn since(start: u64) -> Self {
        TimeRange { start, end: i64::MAX as u64 }
    }

    /// The UTC calendar day containing `date`
    pub fn day(date: NaiveDate) -> Self {
        let start = date
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Utc.from_utc_datetime(&midnight).timestamp())
            .unwrap_or(0)
            .max(0) as u64;
        TimeRange { start, end: start + 86_399 }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Position after the last row returned by a page
///
/// Rows are ordered by `(timestamp, peer_id, batch_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: u64,
    pub peer_id: String,
    pub batch_id: u32,
    pub sequence: u32,
}

impl From<&StoredRecord> for Cursor {
    fn from(record: &StoredRecord) -> Self {
        Cursor {
            timestamp: record.timestamp,
            peer_id: record.peer_id.as_str().to_string(),
            batch_id: record.batch_id,
            sequence: record.sequence,
        }
    }
}

/// Storage backend for received records
pub trait BatchStore: Send + Sync {
    /// Stores one batch atomically
    ///
    /// `records` are `(absolute_timestamp, bytes)` pairs in batch order; the
    /// index of each pair is its sequence number. Returns the number of rows
    /// actually inserted.
    fn store_batch(
        &self,
        peer: &PeerId,
        batch_id: u32,
        received_at: u64,
        records: &[(u64, Bytes)],
    ) -> Result<usize>;

    /// Fetches up to `limit` rows strictly after `after`, time ascending
    fn fetch_page(
        &self,
        peer: Option<&PeerId>,
        range: TimeRange,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Rows per page for lazy queries
    fn page_size(&self) -> usize;

    /// Newest records first
    fn latest_records(&self, peer: Option<&PeerId>, limit: usize) -> Result<Vec<StoredRecord>>;

    /// Distinct peers with stored records
    fn peer_ids(&self) -> Result<Vec<PeerId>>;

    fn record_count(&self, peer: Option<&PeerId>) -> Result<usize>;

    /// Earliest and latest record timestamps
    fn time_span(&self, peer: Option<&PeerId>) -> Result<Option<(u64, u64)>>;

    /// Deletes records captured before `timestamp`
    fn delete_before(&self, timestamp: u64) -> Result<usize>;

    fn delete_batch(&self, peer: &PeerId, batch_id: u32) -> Result<usize>;

    /// Lazily iterates a peer's records in time order
    fn query(&self, peer: &PeerId, range: TimeRange) -> RecordQuery<'_, Self>
    where
        Self: Sized,
    {
        RecordQuery::new(self, Some(peer.clone()), range)
    }

    /// Collects records of one peer, or all peers, within `range`
    fn records_in_range(&self, peer: Option<&PeerId>, range: TimeRange) -> Result<Vec<StoredRecord>> {
        RecordQuery::new(self, peer.cloned(), range).collect()
    }

    /// Collects records captured on a UTC calendar day
    fn records_on_day(&self, peer: Option<&PeerId>, date: NaiveDate) -> Result<Vec<StoredRecord>> {
        self.records_in_range(peer, TimeRange::day(date))
    }
}

/// Lazy, restartable, time-ascending record sequence
///
/// Pages are fetched on demand; a failed fetch is yielded once and ends the
/// iteration. `restart` rewinds to the first record.
pub struct RecordQuery<'a, S: BatchStore + ?Sized> {
    store: &'a S,
    peer: Option<PeerId>,
    range: TimeRange,
    cursor: Option<Cursor>,
    buffer: VecDeque<StoredRecord>,
    exhausted: bool,
}

impl<'a, S: BatchStore + ?Sized> RecordQuery<'a, S> {
    pub fn new(store: &'a S, peer: Option<PeerId>, range: TimeRange) -> Self {
        RecordQuery {
            store,
            peer,
            range,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Rewinds to the start of the range
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<()> {
        let limit = self.store.page_size().max(1);
        let page = self
            .store
            .fetch_page(self.peer.as_ref(), self.range, self.cursor.as_ref(), limit)?;
        if page.len() < limit {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(Cursor::from(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<'a, S: BatchStore + ?Sized> Iterator for RecordQuery<'a, S> {
    type Item = Result<StoredRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_day() {
        let range = TimeRange::day(NaiveDate::from_ymd_opt(2023, 11, 14).unwrap());
        assert_eq!(range.start, 1_699_920_000);
        assert_eq!(range.end, 1_699_920_000 + 86_399);
        assert!(range.contains(1_700_000_000));
        assert!(!range.contains(1_700_006_400));
    }

    #[test]
    fn test_stored_record_serializes_hex() {
        let record = StoredRecord {
            peer_id: PeerId::new("!00000001").unwrap(),
            batch_id: 3,
            sequence: 0,
            timestamp: 100,
            data: vec![0xde, 0xad],
            received_at: 101,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data"], "dead");
        assert_eq!(json["peer_id"], "!00000001");
    }
}
