use crate::errors::Result;
use crate::key::CacheKey;
use arrow::record_batch::RecordBatch;

/// Represents a single mutation a node applied to its data container.
///
/// Mutations are handed to the [`Storage`] hook after the node applied them
/// in memory, so a storage implementation mirrors exactly the entries the
/// node owns. Backup owners receive the same mutations as the primary, in
/// the order the primary applied them.
///
/// # Examples
///
/// ```no_run
/// use seshat::prelude::*;
/// use arrow::array::Int64Array;
/// use arrow::datatypes::{DataType, Field, Schema};
/// use arrow::record_batch::RecordBatch;
/// use std::sync::Arc;
///
/// let schema = Arc::new(Schema::new(vec![Field::new("qty", DataType::Int64, false)]));
/// let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![3]))]).unwrap();
///
/// let mutations = vec![
///     StorageMutation::Insert(CacheKey::from("cart:1"), batch),
///     StorageMutation::Delete(CacheKey::from("cart:0")),
/// ];
/// assert_eq!(mutations.len(), 2);
/// ```
#[derive(Debug)]
pub enum StorageMutation {
    /// Insert or update a record with the given key and `RecordBatch`.
    Insert(CacheKey, RecordBatch),
    /// Delete the record with the given key.
    /// If no record with the key exists, this mutation should be a no-op.
    Delete(CacheKey),
    /// Delete every record.
    Clear,
}

/// Write-behind hook receiving the writes a node applied.
///
/// Implementations must be `Send` and `Sync`: commits from different
/// transactions reach the hook from different threads.
pub trait Storage: Send + Sync {
    /// Atomically applies the given mutations to the storage layer.
    ///
    /// All mutations of one committed transaction (or of one non-transactional
    /// write) arrive in a single call, in the order the node applied them.
    /// The storage implementation must apply the whole list as one unit.
    ///
    /// # Errors
    ///
    /// Returns a `SeshatError::StorageError` if the atomic application of mutations fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use ahash::AHashMap as HashMap;
    /// use arrow::record_batch::RecordBatch;
    /// use parking_lot::Mutex;
    ///
    /// #[derive(Default)]
    /// struct MemoryStorage {
    ///     data: Mutex<HashMap<CacheKey, RecordBatch>>,
    /// }
    ///
    /// impl Storage for MemoryStorage {
    ///     fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()> {
    ///         let mut data = self.data.lock();
    ///         for mutation in mutations {
    ///             match mutation {
    ///                 StorageMutation::Insert(key, record_batch) => {
    ///                     data.insert(key, record_batch);
    ///                 }
    ///                 StorageMutation::Delete(key) => {
    ///                     data.remove(&key);
    ///                 }
    ///                 StorageMutation::Clear => data.clear(),
    ///             }
    ///         }
    ///         Ok(())
    ///     }
    /// }
    /// ```
    fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()>;
}

/// A [`Storage`] that keeps nothing.
///
/// The default for nodes started without a storage hook.
///
/// # Examples
///
/// ```no_run
/// use seshat::prelude::*;
///
/// let storage = NoopStorage;
/// assert!(storage.apply_mutations(vec![StorageMutation::Clear]).is_ok());
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl Storage for NoopStorage {
    fn apply_mutations(&self, _mutations: Vec<StorageMutation>) -> Result<()> {
        Ok(())
    }
}
