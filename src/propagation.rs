//! Buffered propagation of unseen messages.
//!
//! A message that reached fewer than `min_propagation_targets` nodes is
//! kept for a while so that neighbors joining shortly after still get it.

use {
  crate::{
    cache::FifoMapWithTtl,
    rpc::RpcError,
    wire::{MessageId, NodeId, StreamMessage},
  },
  async_trait::async_trait,
  metrics::increment_counter,
  parking_lot::Mutex,
  std::{collections::HashSet, sync::Arc, time::Duration},
  thiserror::Error,
  tracing::{debug, error, trace},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Propagation target {0} not found")]
  TargetNotFound(NodeId),

  #[error("RPC error: {0}")]
  Rpc(#[from] RpcError),
}

/// Delivers one message to one neighbor or proxied client.
#[async_trait]
pub trait SendToNeighbor: Send + Sync + 'static {
  async fn send_to_neighbor(
    &self,
    neighbor: &NodeId,
    message: StreamMessage,
  ) -> Result<(), Error>;
}

#[derive(Debug)]
struct PropagationTask {
  message: StreamMessage,
  source: Option<NodeId>,
  handled_neighbors: HashSet<NodeId>,
}

struct PropagationInner {
  sender: Arc<dyn SendToNeighbor>,
  min_propagation_targets: usize,
  tasks: Mutex<FifoMapWithTtl<MessageId, PropagationTask>>,
}

#[derive(Clone)]
pub struct Propagation {
  inner: Arc<PropagationInner>,
}

impl Propagation {
  pub fn new(
    sender: Arc<dyn SendToNeighbor>,
    min_propagation_targets: usize,
    max_messages: usize,
    ttl: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(PropagationInner {
        sender,
        min_propagation_targets,
        tasks: Mutex::new(
          FifoMapWithTtl::new(ttl, max_messages).with_on_item_dropped(|id| {
            trace!("no longer propagating {id:?}");
          }),
        ),
      }),
    }
  }

  /// Sends a freshly seen message to every target except its source and
  /// buffers it for neighbors that join later.
  pub fn feed_unseen_message(
    &self,
    message: StreamMessage,
    targets: &[NodeId],
    source: Option<NodeId>,
  ) {
    let id = message.message_id.clone();
    self.inner.tasks.lock().set(id, PropagationTask {
      message: message.clone(),
      source,
      handled_neighbors: HashSet::new(),
    });

    for target in targets.iter().filter(|t| Some(**t) != source) {
      self.send_and_mark(message.clone(), *target);
    }
  }

  /// Replays every buffered message the new neighbor has not received.
  pub fn on_neighbor_joined(&self, neighbor: NodeId) {
    let pending: Vec<StreamMessage> = self
      .inner
      .tasks
      .lock()
      .values()
      .filter(|task| {
        task.source != Some(neighbor)
          && !task.handled_neighbors.contains(&neighbor)
      })
      .map(|task| task.message.clone())
      .collect();

    if !pending.is_empty() {
      debug!("replaying {} buffered messages to {neighbor:?}", pending.len());
    }
    for message in pending {
      self.send_and_mark(message, neighbor);
    }
  }

  /// Number of messages still waiting for more targets.
  pub fn pending(&self) -> usize {
    let mut tasks = self.inner.tasks.lock();
    tasks.purge_expired();
    tasks.len()
  }

  fn send_and_mark(&self, message: StreamMessage, target: NodeId) {
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      let id = message.message_id.clone();
      match inner.sender.send_to_neighbor(&target, message).await {
        Ok(()) => {
          increment_counter!("messages_propagated");
          let mut tasks = inner.tasks.lock();
          let done = match tasks.get_mut(&id) {
            Some(task) => {
              task.handled_neighbors.insert(target);
              task.handled_neighbors.len() >= inner.min_propagation_targets
            }
            None => false,
          };
          if done {
            tasks.delete(&id);
          }
        }
        Err(e @ Error::TargetNotFound(_)) => error!("{e}"),
        Err(e) => debug!("failed to propagate message to {target:?}: {e}"),
      }
    });
  }
}
