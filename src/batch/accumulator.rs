use super::row::Row;
use crate::broker::Record;
use chrono::{DateTime, Utc};
use uuid::Uuid;

struct Pending {
    record: Record,
    /// `None` when the extractor dropped the record.
    row: Option<Row>,
}

/// Per-claim buffer of records waiting for the next flush.
///
/// Dropped records occupy a slot so they count toward the size limit, but
/// they never reach the sink and are never acknowledged.
pub struct BatchAccumulator {
    limit: usize,
    pending: Vec<Pending>,
}

/// Rows handed to the sink writer in one transaction.
#[derive(Debug)]
pub struct Batch<'a> {
    pub id: Uuid,
    pub rows: Vec<&'a Row>,
}

impl Batch<'_> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl BatchAccumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: Vec::with_capacity(limit.min(4096)),
        }
    }

    /// Buffer a record. Returns true once the size limit is reached.
    pub fn push(&mut self, record: Record, row: Option<Row>) -> bool {
        self.pending.push(Pending { record, row });
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Rows to write, or `None` if every buffered record was dropped.
    pub fn batch(&self) -> Option<Batch<'_>> {
        let rows: Vec<&Row> = self.pending.iter().filter_map(|p| p.row.as_ref()).collect();
        if rows.is_empty() {
            return None;
        }
        Some(Batch {
            id: Uuid::new_v4(),
            rows,
        })
    }

    /// Records whose rows belong to the batch, in arrival order.
    pub fn written_records(&self) -> impl Iterator<Item = &Record> {
        self.pending
            .iter()
            .filter(|p| p.row.is_some())
            .map(|p| &p.record)
    }

    /// Latest broker timestamp among the records being written.
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.written_records().filter_map(|r| r.timestamp).max()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
