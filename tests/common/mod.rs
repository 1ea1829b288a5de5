//! Common utilities for Seshat integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use arrow::array::{Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use seshat::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- MockStorage ---

/// Records every mutation a node persists, in memory.
#[derive(Debug, Default)]
pub struct MockStorage {
    data: Mutex<HashMap<CacheKey, RecordBatch>>,
    clears: Mutex<usize>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<RecordBatch> {
        let data = self.data.lock().unwrap();
        data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn clears(&self) -> usize {
        *self.clears.lock().unwrap()
    }
}

impl Storage for MockStorage {
    fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        for mutation in mutations {
            match mutation {
                StorageMutation::Insert(key, record_batch) => {
                    data.insert(key, record_batch);
                }
                StorageMutation::Delete(key) => {
                    data.remove(&key);
                }
                StorageMutation::Clear => {
                    data.clear();
                    *self.clears.lock().unwrap() += 1;
                }
            }
        }
        Ok(())
    }
}

// --- Keys ---

/// A key whose group is one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupedKey {
    pub group: String,
    pub id: u32,
}

impl GroupedKey {
    pub fn new(group: &str, id: u32) -> Self {
        Self {
            group: group.to_string(),
            id,
        }
    }

    fn group(&self) -> String {
        self.group.clone()
    }
}

impl GridKey for GroupedKey {
    fn group_accessors() -> Vec<GroupAccessor<Self>> {
        vec![GroupedKey::group as GroupAccessor<Self>]
    }
}

/// A key type that declares two group accessors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AmbiguousKey {
    pub region: String,
    pub tenant: String,
}

impl AmbiguousKey {
    pub fn new(region: &str, tenant: &str) -> Self {
        Self {
            region: region.to_string(),
            tenant: tenant.to_string(),
        }
    }

    fn region(&self) -> String {
        self.region.clone()
    }

    fn tenant(&self) -> String {
        self.tenant.clone()
    }
}

impl GridKey for AmbiguousKey {
    fn group_accessors() -> Vec<GroupAccessor<Self>> {
        vec![
            AmbiguousKey::region as GroupAccessor<Self>,
            AmbiguousKey::tenant as GroupAccessor<Self>,
        ]
    }
}

/// Groups string keys `k<digit>` by parity: "k1", "k3" -> "1", "k2", "k4" -> "0".
pub fn kx_grouper() -> Arc<dyn Grouper> {
    grouper_for::<String, _>(|key, group| {
        match key.strip_prefix('k').and_then(|d| d.parse::<u32>().ok()) {
            Some(digit) => Some((digit % 2).to_string()),
            None => group,
        }
    })
}

// --- Helper Functions ---

/// Node configuration with timeouts short enough for tests.
pub fn test_config(groups_enabled: bool) -> SeshatConfig {
    SeshatConfig::new(0)
        .with_groups_enabled(groups_enabled)
        .with_prepare_timeout(Duration::from_secs(2))
        .with_remote_timeout(Duration::from_secs(2))
}

pub fn setup_cluster(size: usize, groups_enabled: bool) -> LocalCluster {
    LocalCluster::start(size, test_config(groups_enabled), Vec::new()).unwrap()
}

pub fn setup_grouped_cluster(size: usize, groupers: Vec<Arc<dyn Grouper>>) -> LocalCluster {
    LocalCluster::start(size, test_config(true), groupers).unwrap()
}

/// Helper function to create a simple schema.
pub fn create_test_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Utf8, true),
    ]))
}

/// Helper function to create a RecordBatch.
pub fn create_record_batch(ids: Vec<i64>, values: Vec<Option<&str>>) -> RecordBatch {
    let schema = create_test_schema();
    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .unwrap()
}

/// A one-row batch holding `value` in its `id` column.
pub fn counter_batch(value: i64) -> RecordBatch {
    create_record_batch(vec![value], vec![Some("counter")])
}

pub fn read_counter(batch: &RecordBatch) -> i64 {
    let ids = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(ids.len(), 1);
    ids.value(0)
}

/// Counter value and version of `key` on each of its owners, primary first.
/// `None` for an owner that does not hold the key.
pub fn owner_entries(cluster: &LocalCluster, key: &CacheKey) -> Vec<Option<(i64, u64)>> {
    cluster
        .owners_of(key)
        .unwrap()
        .into_iter()
        .map(|owner| {
            cluster
                .node(owner)
                .unwrap()
                .container()
                .get(key)
                .map(|entry| (read_counter(entry.data()), entry.version()))
        })
        .collect()
}

/// First of `key-0`, `key-1`, ... whose owners satisfy `accept`.
pub fn find_key(cluster: &LocalCluster, accept: impl Fn(&[NodeId]) -> bool) -> CacheKey {
    (0..256)
        .map(|i| CacheKey::new(format!("key-{}", i)))
        .find(|key| accept(&cluster.owners_of(key).unwrap()))
        .unwrap()
}
