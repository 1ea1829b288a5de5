use crossbeam_skiplist::SkipMap;
use log::{debug, trace};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::errors::{Result, SeshatError};
use crate::group::grouper::Grouper;
use crate::key::{CacheKey, GridKey};

type ErasedAccessor = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;

/// How the intrinsic group of a key type is obtained.
#[derive(Clone)]
pub(crate) enum GroupMetadata {
    /// The key type declares no group.
    None,
    Accessor(ErasedAccessor),
    /// More than one accessor was declared.
    Ambiguous {
        type_name: &'static str,
        declared: usize,
    },
}

impl GroupMetadata {
    pub(crate) fn declared_by<K: GridKey>() -> Self {
        let accessors = K::group_accessors();
        match accessors.as_slice() {
            [] => GroupMetadata::None,
            [accessor] => {
                let accessor = *accessor;
                GroupMetadata::Accessor(Arc::new(move |key: &dyn Any| {
                    key.downcast_ref::<K>().map(accessor)
                }))
            }
            many => GroupMetadata::Ambiguous {
                type_name: std::any::type_name::<K>(),
                declared: many.len(),
            },
        }
    }

    fn group_of(&self, key: &CacheKey) -> Result<Option<String>> {
        match self {
            GroupMetadata::None => Ok(None),
            GroupMetadata::Accessor(accessor) => Ok(accessor(key.as_any())),
            GroupMetadata::Ambiguous {
                type_name,
                declared,
            } => Err(SeshatError::Configuration(format!(
                "Cannot define more than one group accessor for key type {} ({} declared)",
                type_name, declared
            ))),
        }
    }
}

impl fmt::Debug for GroupMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupMetadata::None => f.write_str("None"),
            GroupMetadata::Accessor(_) => f.write_str("Accessor"),
            GroupMetadata::Ambiguous {
                type_name,
                declared,
            } => write!(f, "Ambiguous({type_name}, {declared})"),
        }
    }
}

/// Resolves keys to groups.
///
/// The resolution strategy of each key type is derived once and cached for
/// the lifetime of the manager. Concurrent first resolutions of the same type
/// may both derive a strategy; only the first one installed is ever used.
pub struct GroupManager {
    metadata_cache: SkipMap<TypeId, Arc<GroupMetadata>>,
    groupers: Vec<Arc<dyn Grouper>>,
}

impl GroupManager {
    pub fn new(groupers: Vec<Arc<dyn Grouper>>) -> Self {
        Self {
            metadata_cache: SkipMap::new(),
            groupers,
        }
    }

    /// Returns the group of `key`, or `None` if neither the key type nor any
    /// grouper assigns one.
    ///
    /// # Errors
    ///
    /// Returns [`SeshatError::Configuration`] when the key type declares more
    /// than one group accessor. The error is raised identically on every call.
    pub fn get_group(&self, key: &CacheKey) -> Result<Option<String>> {
        let metadata = self.metadata(key);
        let intrinsic = metadata.group_of(key)?;
        let group = self.apply_groupers(intrinsic, key);
        trace!("Resolved group {:?} for key {:?}", group, key);
        Ok(group)
    }

    pub fn groupers(&self) -> &[Arc<dyn Grouper>] {
        &self.groupers
    }

    /// Number of key types with a cached strategy.
    pub fn cached_key_types(&self) -> usize {
        self.metadata_cache.len()
    }

    fn apply_groupers(&self, mut group: Option<String>, key: &CacheKey) -> Option<String> {
        for grouper in &self.groupers {
            if grouper.applies_to(key) {
                group = grouper.compute_group(key, group);
            }
        }
        group
    }

    pub(crate) fn metadata(&self, key: &CacheKey) -> Arc<GroupMetadata> {
        let key_type = key.key_type();
        if let Some(entry) = self.metadata_cache.get(&key_type.id()) {
            return Arc::clone(entry.value());
        }

        let derived = Arc::new(key.group_metadata());
        let installed = self.metadata_cache.get_or_insert(key_type.id(), derived);
        debug!(
            "Cached group metadata {:?} for key type {}",
            installed.value(),
            key_type.name()
        );
        Arc::clone(installed.value())
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::GroupAccessor;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Twice(String);

    impl Twice {
        fn first(&self) -> String {
            self.0.clone()
        }
        fn second(&self) -> String {
            format!("{}-2", self.0)
        }
    }

    impl GridKey for Twice {
        fn group_accessors() -> Vec<GroupAccessor<Self>> {
            vec![Twice::first as GroupAccessor<Self>, Twice::second]
        }
    }

    #[test]
    fn test_concurrent_first_resolution_installs_one_strategy() {
        let manager = Arc::new(GroupManager::default());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.metadata(&CacheKey::new(i as u64))
                })
            })
            .collect();

        let seen: Vec<Arc<GroupMetadata>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for metadata in &seen[1..] {
            assert!(Arc::ptr_eq(&seen[0], metadata));
        }
        assert_eq!(manager.cached_key_types(), 1);
    }

    #[test]
    fn test_ambiguous_declaration_is_cached() {
        let manager = GroupManager::default();
        let key = CacheKey::new(Twice("a".to_string()));
        let first = manager.get_group(&key).unwrap_err();
        let second = manager.get_group(&key).unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, SeshatError::Configuration(_)));
        assert_eq!(manager.cached_key_types(), 1);
    }
}
