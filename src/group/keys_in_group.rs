use ahash::AHashSet;
use log::debug;

use crate::data_store::container::DataContainer;
use crate::errors::Result;
use crate::group::manager::GroupManager;
use crate::key::CacheKey;

/// Enumerates the locally stored keys of one group.
///
/// Executed on the primary owner of the group. Every stored key has its
/// group recomputed with the node's resolver, so keys written before a
/// grouper changed its mind are reported under their current group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetKeysInGroupCommand {
    group: String,
}

impl GetKeysInGroupCommand {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn perform(
        &self,
        container: &DataContainer,
        groups: &GroupManager,
    ) -> Result<AHashSet<CacheKey>> {
        let mut matches = AHashSet::new();
        for key in container.keys() {
            if groups.get_group(&key)?.as_deref() == Some(self.group.as_str()) {
                matches.insert(key);
            }
        }
        debug!(
            "Group '{}' holds {} of {} local keys",
            self.group,
            matches.len(),
            container.len()
        );
        Ok(matches)
    }
}
