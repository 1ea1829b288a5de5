use ahash::AHashMap as HashMap;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::data_store::versioned_value::VersionedValue;
use crate::key::CacheKey;

#[derive(Default)]
struct Entries {
    live: HashMap<CacheKey, VersionedValue>,
    /// One past the highest version ever removed. An absent key continues from
    /// here, so a key that is removed and written again never repeats a
    /// version a reader may have recorded.
    removed_high_water: u64,
}

impl Entries {
    fn last_version(&self, key: &CacheKey) -> u64 {
        match self.live.get(key) {
            Some(value) => value.version(),
            None => self.removed_high_water,
        }
    }

    fn tombstone(&mut self, value: &VersionedValue) {
        self.removed_high_water = self.removed_high_water.max(value.version() + 1);
    }
}

/// The in-memory entries a node owns.
pub struct DataContainer {
    entries: RwLock<Entries>,
}

impl DataContainer {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<VersionedValue> {
        self.entries.read().live.get(key).cloned()
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.read().live.contains_key(key)
    }

    /// Version of the live entry, or 0 when the key is absent.
    pub fn version_of(&self, key: &CacheKey) -> u64 {
        self.entries
            .read()
            .live
            .get(key)
            .map(VersionedValue::version)
            .unwrap_or(0)
    }

    /// The version the next write of `key` will carry.
    pub fn next_version(&self, key: &CacheKey) -> u64 {
        self.entries.read().last_version(key) + 1
    }

    /// Writes `data` with the next version of `key`, returning the previous value.
    pub fn put(&self, key: CacheKey, data: Arc<RecordBatch>) -> Option<VersionedValue> {
        let mut entries = self.entries.write();
        let version = entries.last_version(&key) + 1;
        entries.live.insert(key, VersionedValue::new(data, version))
    }

    /// Writes `data` with a version decided elsewhere (by a validated prepare).
    pub fn put_versioned(
        &self,
        key: CacheKey,
        data: Arc<RecordBatch>,
        version: u64,
    ) -> Option<VersionedValue> {
        self.entries
            .write()
            .live
            .insert(key, VersionedValue::new(data, version))
    }

    pub fn remove(&self, key: &CacheKey) -> Option<VersionedValue> {
        let mut entries = self.entries.write();
        let previous = entries.live.remove(key)?;
        entries.tombstone(&previous);
        Some(previous)
    }

    /// Removes every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let drained: Vec<(CacheKey, VersionedValue)> = entries.live.drain().collect();
        for (_, value) in &drained {
            entries.tombstone(value);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().live.keys().cloned().collect()
    }
}

impl Default for DataContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(value: i64) -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        Arc::new(RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![value]))]).unwrap())
    }

    #[test]
    fn test_versions_increase_per_write() {
        let container = DataContainer::new();
        let key = CacheKey::from("a");
        assert_eq!(container.version_of(&key), 0);
        container.put(key.clone(), batch(1));
        container.put(key.clone(), batch(2));
        assert_eq!(container.version_of(&key), 2);
        assert_eq!(container.next_version(&key), 3);
    }

    #[test]
    fn test_removed_key_does_not_reuse_versions() {
        let container = DataContainer::new();
        let key = CacheKey::from("a");
        container.put(key.clone(), batch(1));
        assert!(container.remove(&key).is_some());
        assert_eq!(container.version_of(&key), 0);
        container.put(key.clone(), batch(2));
        assert_eq!(container.version_of(&key), 3);
    }

    #[test]
    fn test_clear_drops_everything() {
        let container = DataContainer::new();
        container.put(CacheKey::from("a"), batch(1));
        container.put(CacheKey::from("b"), batch(2));
        assert_eq!(container.clear(), 2);
        assert!(container.is_empty());
        assert_eq!(container.next_version(&CacheKey::from("a")), 3);
    }

    #[test]
    fn test_removals_keep_no_per_key_state() {
        let container = DataContainer::new();
        for i in 0..1_000u32 {
            let key = CacheKey::new(i);
            container.put(key.clone(), batch(i as i64));
            container.remove(&key);
        }
        assert!(container.is_empty());

        // Every removed version stays behind the next one handed out.
        assert_eq!(container.entries.read().removed_high_water, 2_000);
        assert_eq!(container.next_version(&CacheKey::new(7u32)), 2_001);
        container.put(CacheKey::from("fresh"), batch(1));
        assert_eq!(container.version_of(&CacheKey::from("fresh")), 2_001);
    }
}
