//! # Sample Store
//!
//! Fixed-capacity sample buffers for a virtual PMU: a live buffer that keeps the
//! most recent `max_store` samples and an independent record buffer that captures
//! samples while recording is on.
//!
//! A sample is a timestamp plus a fixed-width row of values. Each buffer writes at
//! `count % capacity`, so once full it overwrites its oldest sample.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;

pub const DEFAULT_MAX_STORE: usize = 1000;
/// 600 s at 30 frames/s.
pub const DEFAULT_MAX_STORE_RECORD: usize = 18_000;

/// Fixed-capacity ring of `(timestamp, row)` samples.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    width: usize,
    t: Vec<f64>,
    data: Vec<f64>,
    count: usize,
}

impl RingBuffer {
    /// Creates a zeroed buffer. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize, width: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            capacity,
            width,
            t: vec![0.0; capacity],
            data: vec![0.0; capacity * width],
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Samples written since the last reset.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Next write position.
    pub fn cursor(&self) -> usize {
        self.count % self.capacity
    }

    /// Samples currently retained.
    pub fn len(&self) -> usize {
        self.count.min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Writes one sample at the cursor. Extra values are ignored and missing
    /// values are stored as zero.
    pub fn write(&mut self, timestamp: f64, values: &[f64]) {
        let slot = self.cursor();
        self.t[slot] = timestamp;
        let row = &mut self.data[slot * self.width..(slot + 1) * self.width];
        for (i, dst) in row.iter_mut().enumerate() {
            *dst = values.get(i).copied().unwrap_or(0.0);
        }
        self.count += 1;
    }

    /// Zeros the buffer and its cursor.
    pub fn reset(&mut self) {
        self.t.iter_mut().for_each(|v| *v = 0.0);
        self.data.iter_mut().for_each(|v| *v = 0.0);
        self.count = 0;
    }

    fn slot(&self, index: usize) -> usize {
        if self.count > self.capacity {
            (self.cursor() + index) % self.capacity
        } else {
            index
        }
    }

    /// The `index`-th retained sample, oldest first.
    pub fn get(&self, index: usize) -> Option<(f64, &[f64])> {
        if index >= self.len() {
            return None;
        }
        let slot = self.slot(index);
        Some((self.t[slot], &self.data[slot * self.width..(slot + 1) * self.width]))
    }

    /// The most recently written sample.
    pub fn latest(&self) -> Option<(f64, &[f64])> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Exports the retained samples, oldest first, as a `t` column plus one
    /// `Float64` column per entry of `columns`.
    pub fn to_record_batch(&self, columns: &[String]) -> Result<RecordBatch, ArrowError> {
        if columns.len() != self.width {
            return Err(ArrowError::InvalidArgumentError(format!(
                "{} column names for {} stored values",
                columns.len(),
                self.width
            )));
        }
        let mut fields = vec![Field::new("t", DataType::Float64, false)];
        fields.extend(
            columns
                .iter()
                .map(|name| Field::new(name, DataType::Float64, false)),
        );
        let schema = Arc::new(Schema::new(fields));

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.width + 1);
        arrays.push(Arc::new(Float64Array::from_iter_values(
            self.iter().map(|(t, _)| t),
        )));
        for col in 0..self.width {
            arrays.push(Arc::new(Float64Array::from_iter_values(
                self.iter().map(|(_, row)| row[col]),
            )));
        }
        RecordBatch::try_new(schema, arrays)
    }
}

/// Selects one of the two buffers of a `SampleStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Live,
    Record,
}

/// Live and record buffers sharing one row width.
#[derive(Debug, Clone)]
pub struct SampleStore {
    live: RingBuffer,
    record: RingBuffer,
}

impl SampleStore {
    pub fn new(max_store: usize, max_store_record: usize, width: usize) -> Self {
        SampleStore {
            live: RingBuffer::new(max_store, width),
            record: RingBuffer::new(max_store_record, width),
        }
    }

    pub fn buffer(&self, kind: BufferKind) -> &RingBuffer {
        match kind {
            BufferKind::Live => &self.live,
            BufferKind::Record => &self.record,
        }
    }

    fn buffer_mut(&mut self, kind: BufferKind) -> &mut RingBuffer {
        match kind {
            BufferKind::Live => &mut self.live,
            BufferKind::Record => &mut self.record,
        }
    }

    pub fn write(&mut self, kind: BufferKind, timestamp: f64, values: &[f64]) {
        self.buffer_mut(kind).write(timestamp, values);
    }

    pub fn reset(&mut self, kind: BufferKind) {
        self.buffer_mut(kind).reset();
    }

    pub fn live(&self) -> &RingBuffer {
        &self.live
    }

    pub fn record(&self) -> &RingBuffer {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wraps_and_reads_oldest_first() {
        let mut buffer = RingBuffer::new(3, 2);
        for i in 0..5 {
            buffer.write(i as f64, &[i as f64, -(i as f64)]);
        }
        assert_eq!(buffer.count(), 5);
        assert_eq!(buffer.cursor(), 2);
        assert_eq!(buffer.len(), 3);

        let times: Vec<f64> = buffer.iter().map(|(t, _)| t).collect();
        assert_eq!(times, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.latest(), Some((4.0, &[4.0, -4.0][..])));
    }

    #[test]
    fn test_reset_clears_one_buffer() {
        let mut store = SampleStore::new(4, 8, 1);
        store.write(BufferKind::Live, 1.0, &[1.0]);
        store.write(BufferKind::Record, 1.0, &[1.0]);
        store.reset(BufferKind::Record);

        assert_eq!(store.record().count(), 0);
        assert_eq!(store.record().cursor(), 0);
        assert!(store.record().latest().is_none());
        assert_eq!(store.live().count(), 1);
    }

    #[test]
    fn test_short_rows_are_zero_filled() {
        let mut buffer = RingBuffer::new(2, 3);
        buffer.write(0.0, &[1.0]);
        assert_eq!(buffer.get(0).unwrap().1, &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_record_batch_export() {
        let mut buffer = RingBuffer::new(2, 2);
        for i in 0..3 {
            buffer.write(i as f64, &[10.0 * i as f64, 1.0]);
        }
        let batch = buffer
            .to_record_batch(&["vm_1".to_string(), "am_1".to_string()])
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        let vm = batch
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!((vm.value(0), vm.value(1)), (10.0, 20.0));

        assert!(buffer.to_record_batch(&["only".to_string()]).is_err());
    }

    proptest! {
        #[test]
        fn prop_cursor_is_count_mod_capacity(capacity in 1usize..64, writes in 0usize..300) {
            let mut buffer = RingBuffer::new(capacity, 1);
            for i in 0..writes {
                buffer.write(i as f64, &[i as f64]);
                prop_assert_eq!(buffer.cursor(), buffer.count() % capacity);
            }
            prop_assert_eq!(buffer.len(), writes.min(capacity));
            if let Some((t, _)) = buffer.latest() {
                prop_assert_eq!(t, (writes - 1) as f64);
            }
        }
    }
}
