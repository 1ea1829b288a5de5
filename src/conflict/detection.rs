use ahash::AHashMap as HashMap;

use crate::data_store::container::DataContainer;
use crate::key::CacheKey;
use crate::tx::EntryVersionsMap;

/// Represents the type of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// The key was overwritten after the transaction read it.
    ReadWrite,
    /// The key was removed after the transaction read it.
    ReadDelete,
    /// The key was absent when read and has been written since.
    ReadInsert,
}

/// Compares the versions a transaction saw against the container.
///
/// `versions_seen` must only hold keys this node owns: every owner of a key
/// runs the same check against the same version, so all owners agree.
/// Returns the conflicting keys; an empty map means the reads are still valid.
pub fn detect_write_skew(
    versions_seen: &EntryVersionsMap,
    container: &DataContainer,
) -> HashMap<CacheKey, ConflictType> {
    let mut conflicts = HashMap::new();
    for (key, seen) in versions_seen {
        let current = container.version_of(key);
        if current == *seen {
            continue;
        }
        let conflict = if current == 0 {
            ConflictType::ReadDelete
        } else if *seen == 0 {
            ConflictType::ReadInsert
        } else {
            ConflictType::ReadWrite
        };
        conflicts.insert(key.clone(), conflict);
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn batch() -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        Arc::new(RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap())
    }

    #[test]
    fn test_classifies_conflicts() {
        let container = DataContainer::new();
        let (a, b, c, d) = (
            CacheKey::from("a"),
            CacheKey::from("b"),
            CacheKey::from("c"),
            CacheKey::from("d"),
        );
        container.put(a.clone(), batch());
        container.put(a.clone(), batch());
        container.put(c.clone(), batch());
        container.put(d.clone(), batch());

        let mut seen = EntryVersionsMap::default();
        seen.insert(a.clone(), 1);
        seen.insert(b.clone(), 1);
        seen.insert(c.clone(), 0);
        seen.insert(d.clone(), 1);

        let conflicts = detect_write_skew(&seen, &container);
        assert_eq!(conflicts.get(&a), Some(&ConflictType::ReadWrite));
        assert_eq!(conflicts.get(&b), Some(&ConflictType::ReadDelete));
        assert_eq!(conflicts.get(&c), Some(&ConflictType::ReadInsert));
        assert!(!conflicts.contains_key(&d));
    }
}
