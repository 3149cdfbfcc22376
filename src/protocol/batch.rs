//! Record batch reassembly
//!
//! A plain batch is `[batch_id:4 LE][record_size:1][record_count:1]` followed by
//! `record_size * record_count` bytes. A timestamped batch inserts
//! `[base_ts:4 LE]` after the header and prefixes every record with a 2-byte
//! little-endian offset from that base.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, Result};

const BATCH_HEADER_SIZE: usize = 6;
const TIMESTAMP_SIZE: usize = 4;
const OFFSET_SIZE: usize = 2;

/// A batch of fixed-size records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBatch {
    pub batch_id: u32,
    pub record_size: u8,
    pub records: Vec<Bytes>,
}

/// One record of a timestamped batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedRecord {
    /// Seconds relative to the batch base timestamp
    pub offset: u16,
    pub data: Bytes,
}

/// A batch whose records carry capture times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedBatch {
    pub batch_id: u32,
    pub record_size: u8,
    /// Unix seconds at which the batch was opened on the peer
    pub base_timestamp: u32,
    pub records: Vec<TimestampedRecord>,
}

/// Either batch flavour, as kept in peer history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Plain(DataBatch),
    Timestamped(TimestampedBatch),
}

fn read_header(data: &mut &[u8]) -> Result<(u32, u8, u8)> {
    if data.len() < BATCH_HEADER_SIZE {
        return Err(Error::ShortBatch { needed: BATCH_HEADER_SIZE, available: data.len() });
    }
    let batch_id = data.get_u32_le();
    let record_size = data.get_u8();
    let record_count = data.get_u8();
    if record_size == 0 {
        return Err(Error::InvalidRecordSize(record_size));
    }
    Ok((batch_id, record_size, record_count))
}

fn check_uniform(records: impl Iterator<Item = usize>) -> Result<u8> {
    let mut size = None;
    for len in records {
        if len == 0 || len > u8::MAX as usize {
            return Err(Error::InvalidRecordSize(len.min(u8::MAX as usize) as u8));
        }
        match size {
            None => size = Some(len),
            Some(expected) if expected != len => {
                return Err(Error::malformed(format!(
                    "records must share one size: {} != {}",
                    len, expected
                )));
            }
            Some(_) => {}
        }
    }
    Ok(size.unwrap_or(1) as u8)
}

impl DataBatch {
    /// Decodes a DATA_BATCH payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut data = payload;
        let (batch_id, record_size, record_count) = read_header(&mut data)?;

        let body = record_size as usize * record_count as usize;
        if data.len() < body {
            return Err(Error::ShortBatch {
                needed: BATCH_HEADER_SIZE + body,
                available: payload.len(),
            });
        }

        let records = data[..body]
            .chunks_exact(record_size as usize)
            .map(Bytes::copy_from_slice)
            .collect();

        Ok(DataBatch { batch_id, record_size, records })
    }

    /// Builds a batch, checking that every record has the same size
    pub fn from_records(batch_id: u32, records: Vec<Bytes>) -> Result<Self> {
        if records.len() > u8::MAX as usize {
            return Err(Error::PayloadTooLarge { size: records.len(), max: u8::MAX as usize });
        }
        let record_size = check_uniform(records.iter().map(Bytes::len))?;
        Ok(DataBatch { batch_id, record_size, records })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            BATCH_HEADER_SIZE + self.record_size as usize * self.records.len(),
        );
        buf.put_u32_le(self.batch_id);
        buf.put_u8(self.record_size);
        buf.put_u8(self.records.len() as u8);
        for record in &self.records {
            buf.extend_from_slice(record);
        }
        buf.freeze()
    }
}

impl TimestampedBatch {
    /// Decodes a TIMESTAMPED_BATCH payload
    ///
    /// Offsets may decrease between records; they are kept in arrival order.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut data = payload;
        let (batch_id, record_size, record_count) = read_header(&mut data)?;

        let stride = OFFSET_SIZE + record_size as usize;
        let needed = BATCH_HEADER_SIZE + TIMESTAMP_SIZE + stride * record_count as usize;
        if payload.len() < needed {
            return Err(Error::ShortBatch { needed, available: payload.len() });
        }

        let base_timestamp = data.get_u32_le();
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let offset = data.get_u16_le();
            let record = data.copy_to_bytes(record_size as usize);
            records.push(TimestampedRecord { offset, data: record });
        }

        Ok(TimestampedBatch { batch_id, record_size, base_timestamp, records })
    }

    /// Builds a batch from `(offset, bytes)` pairs
    pub fn from_records(batch_id: u32, base_timestamp: u32, records: Vec<(u16, Bytes)>) -> Result<Self> {
        if records.len() > u8::MAX as usize {
            return Err(Error::PayloadTooLarge { size: records.len(), max: u8::MAX as usize });
        }
        let record_size = check_uniform(records.iter().map(|(_, data)| data.len()))?;
        let records = records
            .into_iter()
            .map(|(offset, data)| TimestampedRecord { offset, data })
            .collect();
        Ok(TimestampedBatch { batch_id, record_size, base_timestamp, records })
    }

    pub fn encode(&self) -> Bytes {
        let stride = OFFSET_SIZE + self.record_size as usize;
        let mut buf = BytesMut::with_capacity(
            BATCH_HEADER_SIZE + TIMESTAMP_SIZE + stride * self.records.len(),
        );
        buf.put_u32_le(self.batch_id);
        buf.put_u8(self.record_size);
        buf.put_u8(self.records.len() as u8);
        buf.put_u32_le(self.base_timestamp);
        for record in &self.records {
            buf.put_u16_le(record.offset);
            buf.extend_from_slice(&record.data);
        }
        buf.freeze()
    }

    /// Absolute unix time of one record
    pub fn absolute_timestamp(&self, record: &TimestampedRecord) -> u64 {
        self.base_timestamp as u64 + record.offset as u64
    }

    /// Projects records to `(absolute_timestamp, bytes)` pairs in arrival order
    pub fn to_storage_format(&self) -> Vec<(u64, Bytes)> {
        self.records
            .iter()
            .map(|r| (self.absolute_timestamp(r), r.data.clone()))
            .collect()
    }

    /// True if offsets never decrease
    pub fn is_monotonic(&self) -> bool {
        self.records.windows(2).all(|w| w[0].offset <= w[1].offset)
    }
}

impl Batch {
    pub fn batch_id(&self) -> u32 {
        match self {
            Batch::Plain(b) => b.batch_id,
            Batch::Timestamped(b) => b.batch_id,
        }
    }

    pub fn record_size(&self) -> u8 {
        match self {
            Batch::Plain(b) => b.record_size,
            Batch::Timestamped(b) => b.record_size,
        }
    }

    pub fn record_count(&self) -> usize {
        match self {
            Batch::Plain(b) => b.records.len(),
            Batch::Timestamped(b) => b.records.len(),
        }
    }

    /// Record bytes in arrival order
    pub fn record_data(&self) -> Vec<Bytes> {
        match self {
            Batch::Plain(b) => b.records.clone(),
            Batch::Timestamped(b) => b.records.iter().map(|r| r.data.clone()).collect(),
        }
    }
}
