use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{Sender, unbounded};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::Weak;
use std::thread;

use crate::commands::PrepareCommand;
use crate::errors::{Result, SeshatError};
use crate::topology::NodeId;
use crate::totalorder::{
    DeliveryHandler, DeliveryReply, PendingReplies, PrepareOutcome, TotalOrderBroadcast,
};

struct Delivery {
    seqno: u64,
    prepare: PrepareCommand,
    reply_to: Sender<DeliveryReply>,
}

struct SequencerState {
    last_seqno: u64,
    members: AHashMap<NodeId, Sender<Delivery>>,
    /// Members cut off from the others. They neither broadcast nor receive.
    partitioned: AHashSet<NodeId>,
}

/// In-process total-order broadcast.
///
/// A single sequencer stamps every broadcast under one lock and appends it to
/// the FIFO queue of every member while still holding the lock, so all
/// members see all prepares in the same order. Each member drains its queue
/// on a dedicated delivery thread, one prepare at a time.
///
/// A member that is partitioned from the originator cannot validate the
/// prepare, so instead of a delivery it contributes a failed reply and the
/// transaction rolls back everywhere.
pub struct TotalOrderSequencer {
    state: Mutex<SequencerState>,
}

impl TotalOrderSequencer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SequencerState {
                last_seqno: 0,
                members: AHashMap::new(),
                partitioned: AHashSet::new(),
            }),
        }
    }

    /// Adds `node` to the delivery group and starts its delivery thread.
    ///
    /// The thread stops once the node leaves or its handler is dropped.
    pub fn join(&self, node: NodeId, handler: Weak<dyn DeliveryHandler>) -> Result<()> {
        let (sender, receiver) = unbounded::<Delivery>();
        thread::Builder::new()
            .name(format!("seshat-delivery-{}", node))
            .spawn(move || {
                while let Ok(delivery) = receiver.recv() {
                    let Some(handler) = handler.upgrade() else {
                        debug!("Delivery handler of node {} dropped, stopping", node);
                        break;
                    };
                    trace!(
                        "Node {} delivering #{} ({})",
                        node, delivery.seqno, delivery.prepare.gtx
                    );
                    let outcome = handler.deliver(delivery.prepare);
                    if delivery.reply_to.send(DeliveryReply { node, outcome }).is_err() {
                        trace!("Originator stopped waiting for reply #{}", delivery.seqno);
                    }
                }
            })
            .map_err(|e| SeshatError::Other(format!("Failed to spawn delivery thread: {}", e)))?;

        self.state.lock().members.insert(node, sender);
        debug!("Node {} joined the total-order group", node);
        Ok(())
    }

    pub fn leave(&self, node: NodeId) {
        if self.state.lock().members.remove(&node).is_some() {
            debug!("Node {} left the total-order group", node);
        }
    }

    /// Cuts `node` off from the other members.
    pub fn disconnect(&self, node: NodeId) {
        if self.state.lock().partitioned.insert(node) {
            warn!("Node {} partitioned from the total-order group", node);
        }
    }

    pub fn reconnect(&self, node: NodeId) {
        if self.state.lock().partitioned.remove(&node) {
            debug!("Node {} rejoined the total-order group", node);
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.state.lock().members.keys().copied().collect();
        members.sort_unstable();
        members
    }

    pub fn last_seqno(&self) -> u64 {
        self.state.lock().last_seqno
    }
}

impl Default for TotalOrderSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl TotalOrderBroadcast for TotalOrderSequencer {
    fn broadcast(&self, prepare: PrepareCommand) -> Result<PendingReplies> {
        let (reply_to, replies) = unbounded();
        let mut state = self.state.lock();
        if state.members.is_empty() {
            return Err(SeshatError::IllegalState(
                "No members to deliver the prepare to".to_string(),
            ));
        }
        let origin = prepare.origin;
        if state.partitioned.contains(&origin) {
            return Err(SeshatError::NodeUnreachable(origin));
        }

        state.last_seqno += 1;
        let seqno = state.last_seqno;
        let mut expected = 0;
        for (node, member) in &state.members {
            if *node != origin && state.partitioned.contains(node) {
                debug!("Node {} is partitioned, failing #{} there", node, seqno);
                let reply = DeliveryReply {
                    node: *node,
                    outcome: PrepareOutcome::Failed(SeshatError::NodeUnreachable(*node)),
                };
                if reply_to.send(reply).is_ok() {
                    expected += 1;
                }
                continue;
            }
            let delivery = Delivery {
                seqno,
                prepare: prepare.clone(),
                reply_to: reply_to.clone(),
            };
            if member.send(delivery).is_ok() {
                expected += 1;
            } else {
                warn!("Delivery thread of node {} is gone, skipping it", node);
            }
        }
        debug!(
            "Broadcast {} as #{} to {} members",
            prepare.gtx, seqno, expected
        );
        Ok(PendingReplies::new(expected, replies))
    }
}
