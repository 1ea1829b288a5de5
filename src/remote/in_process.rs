use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{Result, SeshatError};
use crate::remote::{
    RemoteCommand, RemoteCommandHandler, Response, ResponseMode, RpcManager, RpcOptions,
};
use crate::topology::NodeId;

/// Delivers remote commands between nodes living in one process.
///
/// Nodes register a weak handle, so dropping a node makes it unreachable.
/// A node can also be cut off explicitly with [`disconnect`](Self::disconnect),
/// which fails every call to or from it.
#[derive(Default)]
pub struct InProcessTransport {
    handlers: RwLock<AHashMap<NodeId, Weak<dyn RemoteCommandHandler>>>,
    disconnected: RwLock<AHashSet<NodeId>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, handler: Weak<dyn RemoteCommandHandler>) {
        self.handlers.write().insert(node, handler);
        debug!("Registered node {} on the in-process transport", node);
    }

    pub fn unregister(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    pub fn disconnect(&self, node: NodeId) {
        self.disconnected.write().insert(node);
        warn!("Node {} disconnected from the in-process transport", node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.disconnected.write().remove(&node);
    }

    pub fn is_reachable(&self, node: NodeId) -> bool {
        !self.disconnected.read().contains(&node)
            && self
                .handlers
                .read()
                .get(&node)
                .is_some_and(|handler| handler.strong_count() > 0)
    }

    /// Runs `command` on `target` on the calling thread.
    pub fn dispatch(
        &self,
        origin: NodeId,
        target: NodeId,
        command: RemoteCommand,
    ) -> Result<Response> {
        {
            let disconnected = self.disconnected.read();
            if disconnected.contains(&origin) || disconnected.contains(&target) {
                return Err(SeshatError::NodeUnreachable(target));
            }
        }
        let handler = self
            .handlers
            .read()
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or(SeshatError::NodeUnreachable(target))?;
        trace!("{} -> {}: {:?}", origin, target, command);
        handler.handle(origin, command)
    }
}

/// [`RpcManager`] over an [`InProcessTransport`]. Every call to a target
/// runs on its own thread so a slow target never delays the others.
pub struct InProcessRpcManager {
    local: NodeId,
    transport: Arc<InProcessTransport>,
    timeout: Duration,
}

impl InProcessRpcManager {
    pub fn new(local: NodeId, transport: Arc<InProcessTransport>, timeout: Duration) -> Self {
        Self {
            local,
            transport,
            timeout,
        }
    }

    fn spawn_call(
        &self,
        target: NodeId,
        command: RemoteCommand,
    ) -> Result<crossbeam_channel::Receiver<Result<Response>>> {
        let (sender, receiver) = bounded(1);
        let transport = Arc::clone(&self.transport);
        let origin = self.local;
        thread::Builder::new()
            .name(format!("seshat-rpc-{}-{}", origin, target))
            .spawn(move || {
                let response = transport.dispatch(origin, target, command);
                // The caller may have stopped waiting.
                let _ = sender.send(response);
            })
            .map_err(|e| SeshatError::Other(format!("Failed to spawn RPC thread: {}", e)))?;
        Ok(receiver)
    }
}

impl RpcManager for InProcessRpcManager {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn invoke_remotely(
        &self,
        targets: &[NodeId],
        command: RemoteCommand,
        options: &RpcOptions,
    ) -> Result<AHashMap<NodeId, Response>> {
        let mut pending = Vec::with_capacity(targets.len());
        for target in targets {
            pending.push((*target, self.spawn_call(*target, command.clone())?));
        }

        let mut responses = AHashMap::with_capacity(pending.len());
        if options.mode == ResponseMode::Asynchronous {
            return Ok(responses);
        }

        let deadline = Instant::now() + options.timeout;
        for (target, receiver) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match receiver.recv_timeout(remaining) {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => Response::Exception(error),
                Err(RecvTimeoutError::Timeout) => Response::Exception(SeshatError::Timeout(
                    format!("No response from node {} within {:?}", target, options.timeout),
                )),
                Err(RecvTimeoutError::Disconnected) => {
                    Response::Exception(SeshatError::NodeUnreachable(target))
                }
            };
            responses.insert(target, response);
        }
        Ok(responses)
    }

    fn default_options(&self) -> RpcOptions {
        RpcOptions::synchronous(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ResponseValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl RemoteCommandHandler for Counting {
        fn handle(&self, _origin: NodeId, _command: RemoteCommand) -> Result<Response> {
            thread::sleep(self.delay);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::Success(ResponseValue::None))
        }
    }

    fn handler(delay: Duration) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[test]
    fn test_unregistered_target_is_unreachable() {
        let transport = Arc::new(InProcessTransport::new());
        let rpc = InProcessRpcManager::new(1, transport, Duration::from_secs(1));
        let mut responses = rpc
            .invoke_remotely(
                &[9],
                RemoteCommand::GetKeysInGroup("g".into()),
                &rpc.default_options(),
            )
            .unwrap();
        assert!(matches!(
            responses.remove(&9),
            Some(Response::Exception(SeshatError::NodeUnreachable(9)))
        ));
    }

    #[test]
    fn test_slow_target_times_out() {
        let transport = Arc::new(InProcessTransport::new());
        let slow = handler(Duration::from_millis(500));
        let weak: Weak<Counting> = Arc::downgrade(&slow);
        transport.register(2, weak);
        let rpc = InProcessRpcManager::new(1, transport, Duration::from_millis(50));
        let mut responses = rpc
            .invoke_remotely(
                &[2],
                RemoteCommand::GetKeysInGroup("g".into()),
                &rpc.default_options(),
            )
            .unwrap();
        assert!(matches!(
            responses.remove(&2),
            Some(Response::Exception(SeshatError::Timeout(_)))
        ));
    }

    #[test]
    fn test_asynchronous_calls_return_immediately() {
        let transport = Arc::new(InProcessTransport::new());
        let target = handler(Duration::from_millis(20));
        let weak: Weak<Counting> = Arc::downgrade(&target);
        transport.register(2, weak);
        let rpc = InProcessRpcManager::new(1, transport, Duration::from_secs(1));
        let options = RpcOptions {
            timeout: Duration::from_secs(1),
            mode: ResponseMode::Asynchronous,
        };
        let responses = rpc
            .invoke_remotely(&[2], RemoteCommand::GetKeysInGroup("g".into()), &options)
            .unwrap();
        assert!(responses.is_empty());

        let deadline = Instant::now() + Duration::from_secs(2);
        while target.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnected_node_is_unreachable() {
        let transport = Arc::new(InProcessTransport::new());
        let target = handler(Duration::ZERO);
        let weak: Weak<Counting> = Arc::downgrade(&target);
        transport.register(2, weak);
        assert!(transport.is_reachable(2));
        transport.disconnect(2);
        assert!(!transport.is_reachable(2));
        assert!(matches!(
            transport.dispatch(1, 2, RemoteCommand::GetKeysInGroup("g".into())),
            Err(SeshatError::NodeUnreachable(2))
        ));
    }
}
