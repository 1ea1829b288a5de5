use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// A stored value together with the version of the write that produced it.
///
/// Versions grow with every write of a key and are never reused, even after
/// the key is removed. Version 0 is reserved for "absent": a transaction that
/// read a missing key records 0 as the version it saw. Each write's version
/// is decided once, by the primary owner for a non-transactional write and
/// by the merged prepare replies for a transaction, so all owners of a key
/// agree on its version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    data: Arc<RecordBatch>,
    version: u64,
}

impl VersionedValue {
    /// Creates a new `VersionedValue`.
    ///
    /// # Arguments
    ///
    /// * `data` - The stored record batch.
    /// * `version` - The version of the write that produced `data`, at least 1.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use std::sync::Arc;
    /// use arrow::record_batch::RecordBatch;
    /// use arrow::array::Int32Array;
    /// use arrow::datatypes::{Schema, Field, DataType};
    ///
    /// let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
    /// let id_array = Int32Array::from(vec![1]);
    /// let record_batch = RecordBatch::try_new(schema, vec![Arc::new(id_array)]).unwrap();
    ///
    /// let versioned_value = VersionedValue::new(Arc::new(record_batch), 1);
    /// assert_eq!(versioned_value.version(), 1);
    /// ```
    pub fn new(data: Arc<RecordBatch>, version: u64) -> Self {
        Self { data, version }
    }

    /// Returns a reference to the stored record batch.
    pub fn data(&self) -> &Arc<RecordBatch> {
        &self.data
    }

    /// Returns the version of the write that produced this value.
    ///
    /// # Returns
    ///
    /// The version a transaction records when it reads this value, and
    /// against which its prepare is validated.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Consumes the value, returning the record batch.
    pub fn into_data(self) -> Arc<RecordBatch> {
        self.data
    }
}
