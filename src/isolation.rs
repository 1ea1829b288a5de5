use serde::{Deserialize, Serialize};

/// Defines the isolation levels of grid transactions.
///
/// Isolation decides what a transaction remembers about its reads and, as a
/// consequence, what the owners check when its prepare is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionIsolation {
    /// **Read Committed:**
    ///
    /// Every read returns the latest committed value on the key's owner. The
    /// same key may yield different values within one transaction, and no
    /// read is validated when the transaction prepares.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// The first read of a key pins the value and its version for the rest of
    /// the transaction. When the prepare is delivered, every owner of a read
    /// key compares the pinned version against its current one and fails the
    /// transaction on a mismatch (write-skew detection).
    #[default]
    RepeatableRead,
}
