use std::marker::PhantomData;
use std::sync::Arc;

use crate::key::{CacheKey, GridKey, KeyType};

/// Computes or overrides the group of a key.
///
/// Groupers are registered in order when a node is built. For each key the
/// resolver runs every grouper whose [`key_type`](Grouper::key_type) matches
/// the key, feeding each one the group produced so far.
pub trait Grouper: Send + Sync {
    /// The key type this grouper applies to. `None` applies to every key.
    fn key_type(&self) -> Option<KeyType>;

    /// Returns the group for `key`, given the group computed so far.
    fn compute_group(&self, key: &CacheKey, group: Option<String>) -> Option<String>;

    fn applies_to(&self, key: &CacheKey) -> bool {
        match self.key_type() {
            Some(key_type) => key_type == key.key_type(),
            None => true,
        }
    }
}

/// A [`Grouper`] backed by a closure over a concrete key type.
pub struct FnGrouper<K, F> {
    compute: F,
    _key: PhantomData<fn(&K)>,
}

impl<K, F> Grouper for FnGrouper<K, F>
where
    K: GridKey,
    F: Fn(&K, Option<String>) -> Option<String> + Send + Sync,
{
    fn key_type(&self) -> Option<KeyType> {
        Some(KeyType::of::<K>())
    }

    fn compute_group(&self, key: &CacheKey, group: Option<String>) -> Option<String> {
        match key.downcast_ref::<K>() {
            Some(typed) => (self.compute)(typed, group),
            None => group,
        }
    }
}

/// Builds a grouper for keys of type `K`.
///
/// # Examples
///
/// ```
/// use seshat::prelude::*;
///
/// // "k1", "k3" -> group "1"; "k2", "k4" -> group "0"
/// let kx = grouper_for::<String, _>(|key, group| {
///     match key.strip_prefix('k').and_then(|d| d.parse::<u32>().ok()) {
///         Some(digit) => Some((digit % 2).to_string()),
///         None => group,
///     }
/// });
/// let manager = GroupManager::new(vec![kx]);
/// assert_eq!(manager.get_group(&CacheKey::from("k3")).unwrap(), Some("1".to_string()));
/// ```
pub fn grouper_for<K, F>(compute: F) -> Arc<dyn Grouper>
where
    K: GridKey,
    F: Fn(&K, Option<String>) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(FnGrouper {
        compute,
        _key: PhantomData,
    })
}
