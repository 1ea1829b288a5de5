//! Key grouping.
//!
//! A group is a string label shared by related keys. Keys of one group are
//! routed by the label instead of by their own hash, so they always share
//! owners. The label comes from the key type's declared accessor, possibly
//! overridden by a chain of [`Grouper`]s.

mod grouper;
mod keys_in_group;
mod manager;
mod router;

pub use grouper::{FnGrouper, Grouper, grouper_for};
pub use keys_in_group::GetKeysInGroupCommand;
pub use manager::GroupManager;
pub(crate) use manager::GroupMetadata;
pub use router::GroupRouter;
