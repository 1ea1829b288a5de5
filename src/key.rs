//! Type-erased cache keys.
//!
//! The grid stores keys of arbitrary user types side by side. A user type
//! becomes a key by implementing [`GridKey`]; the grid then handles it
//! through [`CacheKey`], which compares and hashes by concrete type and value.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crate::group::GroupMetadata;

/// A zero-argument accessor yielding a key's intrinsic group.
pub type GroupAccessor<K> = fn(&K) -> String;

/// A user type that can be stored in the grid.
///
/// A key type declares at most one group accessor. Declaring more than one
/// is a configuration error reported the first time a key of that type is
/// resolved.
///
/// # Examples
///
/// ```
/// use seshat::prelude::*;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct OrderLine {
///     customer: String,
///     line: u32,
/// }
///
/// impl OrderLine {
///     fn customer(&self) -> String {
///         self.customer.clone()
///     }
/// }
///
/// impl GridKey for OrderLine {
///     fn group_accessors() -> Vec<GroupAccessor<Self>> {
///         vec![OrderLine::customer as GroupAccessor<Self>]
///     }
/// }
///
/// let key = CacheKey::new(OrderLine { customer: "acme".into(), line: 1 });
/// assert_eq!(key.key_type().name(), std::any::type_name::<OrderLine>());
/// ```
pub trait GridKey: Any + Clone + fmt::Debug + Eq + Hash + Send + Sync {
    fn group_accessors() -> Vec<GroupAccessor<Self>> {
        Vec::new()
    }
}

macro_rules! plain_keys {
    ($($ty:ty),* $(,)?) => {
        $(impl GridKey for $ty {})*
    };
}

plain_keys!(String, &'static str, u32, u64, i32, i64, usize, Vec<u8>);

/// Runtime identity of a key type.
#[derive(Debug, Clone, Copy)]
pub struct KeyType {
    id: TypeId,
    name: &'static str,
}

impl KeyType {
    pub fn of<K: GridKey>() -> Self {
        Self {
            id: TypeId::of::<K>(),
            name: std::any::type_name::<K>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for KeyType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyType {}

trait ErasedKey: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn key_type(&self) -> KeyType;
    fn dyn_eq(&self, other: &dyn ErasedKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn group_metadata(&self) -> GroupMetadata;
}

impl<K: GridKey> ErasedKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn key_type(&self) -> KeyType {
        KeyType::of::<K>()
    }

    fn dyn_eq(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn group_metadata(&self) -> GroupMetadata {
        GroupMetadata::declared_by::<K>()
    }
}

/// A key of any [`GridKey`] type.
#[derive(Clone)]
pub struct CacheKey(Arc<dyn ErasedKey>);

impl CacheKey {
    pub fn new<K: GridKey>(key: K) -> Self {
        CacheKey(Arc::new(key))
    }

    pub fn downcast_ref<K: GridKey>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }

    pub fn as_any(&self) -> &dyn Any {
        self.0.as_any()
    }

    pub fn key_type(&self) -> KeyType {
        self.0.key_type()
    }

    /// Hash used for routing. Seeded with constants so every node computes
    /// the same value for the same key.
    pub fn routing_hash(&self) -> u64 {
        let state = ahash::RandomState::with_seeds(
            0x5e5a_7000_0000_0001,
            0x9e37_79b9_7f4a_7c15,
            0xc2b2_ae3d_27d4_eb4f,
            0x1656_67b1_9e37_79f9,
        );
        let mut hasher = state.build_hasher();
        self.0.dyn_hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn group_metadata(&self) -> GroupMetadata {
        self.0.group_metadata()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(&*other.0)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl From<&'static str> for CacheKey {
    fn from(key: &'static str) -> Self {
        CacheKey::new(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        CacheKey::new(key)
    }
}
