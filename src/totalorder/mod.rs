//! Total-order commit protocol.
//!
//! A transaction's prepare is broadcast through a channel that delivers
//! every message to every member in one global order. Each member validates
//! the delivered prepares one at a time in that order, so conflicting
//! transactions reach the same verdict everywhere without distributed locks.
//! The originator collects the verdicts and then commits or rolls back.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::commands::PrepareCommand;
use crate::errors::{Result, SeshatError};
use crate::topology::NodeId;
use crate::tx::EntryVersionsMap;

mod barrier;
pub mod manager;
pub mod sequencer;

pub use manager::TotalOrderManager;
pub use sequencer::TotalOrderSequencer;

/// Verdict of one member on a delivered prepare.
#[derive(Debug, Clone)]
pub enum PrepareOutcome {
    /// Validated; carries the versions the member will assign on commit.
    Validated(EntryVersionsMap),
    Failed(SeshatError),
}

#[derive(Debug, Clone)]
pub struct DeliveryReply {
    pub node: NodeId,
    pub outcome: PrepareOutcome,
}

/// Replies to one broadcast prepare, one per member it was delivered to.
pub struct PendingReplies {
    expected: usize,
    replies: Receiver<DeliveryReply>,
}

impl PendingReplies {
    pub fn new(expected: usize, replies: Receiver<DeliveryReply>) -> Self {
        Self { expected, replies }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Waits for every reply, ordered by node.
    ///
    /// # Errors
    ///
    /// [`SeshatError::Timeout`] when not every member answered within `timeout`.
    pub fn collect(self, timeout: Duration) -> Result<Vec<DeliveryReply>> {
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(self.expected);
        while replies.len() < self.expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) => replies.push(reply),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SeshatError::Timeout(format!(
                        "Received {} of {} prepare replies within {:?}",
                        replies.len(),
                        self.expected,
                        timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SeshatError::IllegalState(format!(
                        "Prepare reply channel closed after {} of {} replies",
                        replies.len(),
                        self.expected
                    )));
                }
            }
        }
        replies.sort_by_key(|reply| reply.node);
        Ok(replies)
    }
}

/// Totally ordered delivery of prepares to every member.
pub trait TotalOrderBroadcast: Send + Sync {
    fn broadcast(&self, prepare: PrepareCommand) -> Result<PendingReplies>;
}

/// A member receiving delivered prepares, one at a time, in delivery order.
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, prepare: PrepareCommand) -> PrepareOutcome;
}
