use std::collections::VecDeque;

use nazar_proto::MetricRecord;

/// Number of records a session keeps.
pub const BUFFER_CAPACITY: usize = 50;

/// Arrival log of the most recent records, newest first.
///
/// No deduplication happens here; the cap is by count, not by time.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingBuffer {
    records: VecDeque<MetricRecord>,
    capacity: usize,
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }
}

impl RollingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Prepend `record`, evicting the oldest entries past capacity.
    pub fn push(&mut self, record: MetricRecord) {
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MetricRecord> + ExactSizeIterator {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
