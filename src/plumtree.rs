//! Push/lazy-push optimization of message delivery.
//!
//! Neighbors that keep delivering duplicates of a chain are asked to pause:
//! they keep sending only message ids (metadata) for that chain. A node
//! that sees metadata run ahead of the data it has received resumes the
//! paused sender and gets the missing suffix replayed from its buffer.

use {
  crate::{
    config::Config,
    node_list::{NodeList, NodeListEvent},
    paused::PausedNeighbors,
    remote::{ContentDeliveryRpcRemote, PlumtreeRpcRemote},
    rpc::{CallContext, RpcCommunicator},
    wire::{
      MessageId,
      NodeId,
      PauseNeighborRequest,
      PeerDescriptor,
      ResumeNeighborRequest,
      StreamMessage,
      StreamPartId,
    },
  },
  metrics::increment_counter,
  parking_lot::Mutex,
  std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
  },
  tokio::{sync::mpsc::UnboundedSender, task::JoinHandle},
  tracing::{debug, trace},
};

pub const MAX_PAUSED_NEIGHBORS_DEFAULT: usize = 3;

#[derive(Debug, Clone)]
pub struct PlumtreeOptions {
  /// Per chain bound of neighbors paused by us and of neighbors that
  /// paused us.
  pub max_paused_neighbors: usize,

  /// How many metadata timestamps may run ahead of received data before
  /// the sender is resumed.
  pub resume_threshold: usize,

  /// Capacity of the per chain replay buffer.
  pub latest_messages: usize,

  pub buffer_while_connecting: bool,
  pub rpc_request_timeout: Duration,
}

impl From<&Config> for PlumtreeOptions {
  fn from(config: &Config) -> Self {
    Self {
      max_paused_neighbors: config.plumtree_max_paused_neighbors,
      resume_threshold: config.plumtree_resume_threshold,
      latest_messages: config.plumtree_latest_messages,
      buffer_while_connecting: config.buffer_while_connecting,
      rpc_request_timeout: config.rpc_request_timeout,
    }
  }
}

#[derive(Debug)]
struct PlumtreeState {
  /// Neighbors we only send metadata to.
  local_paused: PausedNeighbors,

  /// Neighbors we asked to only send us metadata.
  remote_paused: PausedNeighbors,

  latest_messages: HashMap<String, VecDeque<StreamMessage>>,
  metadata_ahead: HashMap<String, HashSet<u64>>,
}

impl PlumtreeState {
  fn latest_timestamp(&self, chain: &str) -> u64 {
    self
      .latest_messages
      .get(chain)
      .and_then(|buffer| buffer.back())
      .map(|msg| msg.timestamp())
      .unwrap_or(0)
  }
}

struct PlumtreeInner {
  stream_part_id: StreamPartId,
  neighbors: NodeList,
  rpc: Arc<dyn RpcCommunicator>,
  options: PlumtreeOptions,
  state: Mutex<PlumtreeState>,
  deliver: UnboundedSender<StreamMessage>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PlumtreeManager {
  inner: Arc<PlumtreeInner>,
}

impl PlumtreeManager {
  /// Creates the manager and starts tracking removals from `neighbors`.
  ///
  /// Every message accepted by [`Self::broadcast`] is also pushed into
  /// `deliver` for local consumption. Must be called within a tokio
  /// runtime.
  pub fn new(
    stream_part_id: StreamPartId,
    neighbors: NodeList,
    rpc: Arc<dyn RpcCommunicator>,
    options: PlumtreeOptions,
    deliver: UnboundedSender<StreamMessage>,
  ) -> Self {
    let inner = Arc::new(PlumtreeInner {
      stream_part_id,
      state: Mutex::new(PlumtreeState {
        local_paused: PausedNeighbors::new(options.max_paused_neighbors),
        remote_paused: PausedNeighbors::new(options.max_paused_neighbors),
        latest_messages: HashMap::new(),
        metadata_ahead: HashMap::new(),
      }),
      neighbors,
      rpc,
      options,
      deliver,
      listener: Mutex::new(None),
    });

    let events = inner.neighbors.subscribe();
    let handle = tokio::spawn(track_removals(Arc::downgrade(&inner), events));
    *inner.listener.lock() = Some(handle);

    Self { inner }
  }

  /// Records the message for replay, delivers it locally and forwards it
  /// to every neighbor except `previous_node`. Paused neighbors only get
  /// the message id.
  pub fn broadcast(
    &self,
    message: StreamMessage,
    previous_node: Option<&NodeId>,
  ) {
    let chain = message.message_chain_id().to_owned();
    let neighbors = self.inner.neighbors.all();

    let targets: Vec<_> = {
      let mut state = self.inner.state.lock();
      let capacity = self.inner.options.latest_messages;
      if capacity > 0 {
        let buffer = state.latest_messages.entry(chain.clone()).or_default();
        while buffer.len() >= capacity {
          buffer.pop_front();
        }
        buffer.push_back(message.clone());
      }
      if let Some(ahead) = state.metadata_ahead.get_mut(&chain) {
        ahead.remove(&message.timestamp());
      }

      neighbors
        .into_iter()
        .filter(|n| previous_node != Some(&n.node_id()))
        .map(|n| {
          let paused = state.local_paused.is_paused(&n.node_id(), &chain);
          (n, paused)
        })
        .collect()
    };

    let _ = self.inner.deliver.send(message.clone());

    for (neighbor, paused) in targets {
      if paused {
        increment_counter!("plumtree_metadata_sent");
        let remote = self.plumtree_remote(neighbor.peer_descriptor());
        let id = message.message_id.clone();
        tokio::spawn(async move {
          if let Err(e) = remote.send_metadata(id).await {
            debug!("failed to send metadata to {:?}: {e}", remote.node_id());
          }
        });
      } else {
        let message = message.clone();
        let buffer = self.inner.options.buffer_while_connecting;
        tokio::spawn(async move {
          if let Err(e) = neighbor.send_stream_message(message, buffer).await {
            debug!("failed to send message to {:?}: {e}", neighbor.node_id());
          }
        });
      }
    }
  }

  /// Asks `node` to stop pushing `chain` to us, within the per chain
  /// bound.
  pub async fn pause_neighbor(&self, node: &PeerDescriptor, chain: &str) {
    let id = node.node_id;
    let is_neighbor = self.inner.neighbors.has(&id);
    let paused = {
      let mut state = self.inner.state.lock();
      is_neighbor
        && !state.remote_paused.is_paused(&id, chain)
        && state.remote_paused.size(chain)
          < self.inner.options.max_paused_neighbors
        && state.remote_paused.add(id, chain)
    };

    if paused {
      debug!("{}: pausing neighbor {id:?}", self.inner.stream_part_id);
      increment_counter!("plumtree_neighbors_paused");
      let remote = self.plumtree_remote(node);
      if let Err(e) = remote.pause_neighbor(chain.to_owned()).await {
        debug!("pause request to {id:?} failed: {e}");
      }
    }
  }

  /// Asks a neighbor we paused to push `chain` again, replaying
  /// everything after `from_timestamp`.
  pub async fn resume_neighbor(
    &self,
    node: &PeerDescriptor,
    chain: &str,
    from_timestamp: u64,
  ) {
    let resumed = self
      .inner
      .state
      .lock()
      .remote_paused
      .delete(&node.node_id, chain);
    if resumed {
      self.send_resume(node, chain.to_owned(), from_timestamp).await;
    }
  }

  /// Timestamp of the newest buffered message of `chain`, zero if none.
  #[cfg(test)]
  pub fn latest_message_timestamp(&self, chain: &str) -> u64 {
    self.inner.state.lock().latest_timestamp(chain)
  }

  /// Whether delivery between us and `node` is paused in either direction.
  pub fn is_neighbor_paused(&self, node: &NodeId, chain: &str) -> bool {
    let state = self.inner.state.lock();
    state.local_paused.is_paused(node, chain)
      || state.remote_paused.is_paused(node, chain)
  }

  pub async fn handle_metadata(&self, id: MessageId, context: &CallContext) {
    self.on_metadata(&id, &context.incoming_source).await;
  }

  /// Pause requests are only honored from current neighbors.
  pub fn handle_pause_neighbor(
    &self,
    request: PauseNeighborRequest,
    context: &CallContext,
  ) {
    let sender = context.source_id();
    if self.inner.neighbors.has(&sender) {
      let mut state = self.inner.state.lock();
      if state.local_paused.add(sender, &request.message_chain_id) {
        trace!("{sender:?} paused chain {}", request.message_chain_id);
      }
    }
  }

  pub async fn handle_resume_neighbor(
    &self,
    request: ResumeNeighborRequest,
    context: &CallContext,
  ) {
    self
      .inner
      .state
      .lock()
      .local_paused
      .delete(&context.source_id(), &request.message_chain_id);
    self
      .send_buffer(
        request.from_timestamp,
        &request.message_chain_id,
        &context.incoming_source,
      )
      .await;
  }

  pub fn stop(&self) {
    if let Some(handle) = self.inner.listener.lock().take() {
      handle.abort();
    }
  }

  async fn on_metadata(&self, id: &MessageId, previous_node: &PeerDescriptor) {
    let chain = &id.message_chain_id;
    let resume_from = {
      let mut state = self.inner.state.lock();
      let latest = state.latest_timestamp(chain);
      if latest >= id.timestamp {
        return;
      }
      let ahead = state.metadata_ahead.entry(chain.clone()).or_default();
      ahead.insert(id.timestamp);
      if ahead.len() < self.inner.options.resume_threshold {
        return;
      }
      ahead.clear();
      latest
    };

    debug!(
      "{}: metadata ahead of data on chain {chain}, resuming {:?}",
      self.inner.stream_part_id, previous_node.node_id
    );
    self.resume_neighbor(previous_node, chain, resume_from).await;
  }

  fn on_neighbor_removed(&self, node: &NodeId) {
    let neighbors = self.inner.neighbors.ids();
    let mut resumes = vec![];
    {
      let mut state = self.inner.state.lock();
      state.local_paused.delete_all(node);
      state.remote_paused.delete_all(node);
      if neighbors.is_empty() {
        return;
      }

      let starved: Vec<String> = state
        .remote_paused
        .chains()
        .filter(|(_, paused)| paused.len() >= neighbors.len())
        .map(|(chain, _)| chain.to_owned())
        .collect();

      for chain in starved {
        if let Some(first) = select_neighbor_to_resume(
          &neighbors,
          &state.remote_paused,
          &chain,
        ) {
          state.remote_paused.delete(&first, &chain);
          resumes.push((first, state.latest_timestamp(&chain), chain));
        }
      }
    }

    for (node, from_timestamp, chain) in resumes {
      let Some(remote) = self.inner.neighbors.get(&node) else {
        continue;
      };
      debug!("all neighbors paused on chain {chain}, resuming {node:?}");
      let this = self.clone();
      tokio::spawn(async move {
        this
          .send_resume(remote.peer_descriptor(), chain, from_timestamp)
          .await;
      });
    }
  }

  async fn send_resume(
    &self,
    node: &PeerDescriptor,
    chain: String,
    from_timestamp: u64,
  ) {
    increment_counter!("plumtree_neighbors_resumed");
    let remote = self.plumtree_remote(node);
    if let Err(e) = remote.resume_neighbor(from_timestamp, chain).await {
      debug!("resume request to {:?} failed: {e}", node.node_id);
    }
  }

  /// Replays buffered messages of `chain` newer than `from_timestamp`,
  /// one after another in chain order.
  async fn send_buffer(
    &self,
    from_timestamp: u64,
    chain: &str,
    neighbor: &PeerDescriptor,
  ) {
    let messages: Vec<_> = self
      .inner
      .state
      .lock()
      .latest_messages
      .get(chain)
      .map(|buffer| {
        buffer
          .iter()
          .filter(|m| m.timestamp() > from_timestamp)
          .cloned()
          .collect()
      })
      .unwrap_or_default();

    let remote = ContentDeliveryRpcRemote::new(
      neighbor.clone(),
      self.inner.stream_part_id.clone(),
      Arc::clone(&self.inner.rpc),
      self.inner.options.rpc_request_timeout,
    );
    for message in messages {
      let buffer = self.inner.options.buffer_while_connecting;
      if let Err(e) = remote.send_stream_message(message, buffer).await {
        debug!("replay to {:?} interrupted: {e}", neighbor.node_id);
        break;
      }
    }
  }

  fn plumtree_remote(&self, node: &PeerDescriptor) -> PlumtreeRpcRemote {
    PlumtreeRpcRemote::new(
      node.clone(),
      self.inner.stream_part_id.clone(),
      Arc::clone(&self.inner.rpc),
      self.inner.options.rpc_request_timeout,
    )
  }
}

/// Picks the neighbor to resume when every neighbor paused a chain: the
/// first paused one in neighbor order.
fn select_neighbor_to_resume(
  neighbors: &[NodeId],
  paused: &PausedNeighbors,
  chain: &str,
) -> Option<NodeId> {
  neighbors
    .iter()
    .find(|n| paused.is_paused(n, chain))
    .copied()
}

async fn track_removals(
  manager: Weak<PlumtreeInner>,
  mut events: tokio::sync::mpsc::UnboundedReceiver<NodeListEvent>,
) {
  while let Some(event) = events.recv().await {
    if let NodeListEvent::NodeRemoved(id, _) = event {
      let Some(inner) = manager.upgrade() else {
        return;
      };
      PlumtreeManager { inner }.on_neighbor_removed(&id);
    }
  }
}
