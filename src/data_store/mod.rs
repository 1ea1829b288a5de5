/// The versioned in-memory entry map of a node.
pub mod container;
/// Values paired with their per-key write version.
pub mod versioned_value;
