use {
  crate::{
    channel::Listeners,
    remote::ContentDeliveryRpcRemote,
    wire::{NodeId, PeerDescriptor},
  },
  parking_lot::RwLock,
  rand::seq::IteratorRandom,
  std::{
    collections::{HashMap, HashSet},
    sync::Arc,
  },
  tokio::sync::mpsc::UnboundedReceiver,
  tracing::debug,
};

#[derive(Debug, Clone)]
pub enum NodeListEvent {
  NodeAdded(NodeId, ContentDeliveryRpcRemote),
  NodeRemoved(NodeId, ContentDeliveryRpcRemote),
  /// Follows every net change of membership.
  NodeListUpdated,
}

#[derive(Debug)]
struct NodeListInner {
  own_id: NodeId,
  limit: usize,
  order: Vec<NodeId>,
  nodes: HashMap<NodeId, ContentDeliveryRpcRemote>,
  listeners: Listeners<NodeListEvent>,
}

impl NodeListInner {
  fn iter_filtered<'a>(
    &'a self,
    exclude: &'a [NodeId],
    websocket_only: bool,
  ) -> impl DoubleEndedIterator<Item = &'a ContentDeliveryRpcRemote> + 'a {
    self
      .order
      .iter()
      .filter(move |id| !exclude.contains(id))
      .filter_map(move |id| self.nodes.get(id))
      .filter(move |node| {
        !websocket_only || node.peer_descriptor().is_websocket_reachable()
      })
  }

  fn remove(&mut self, id: &NodeId) -> Option<ContentDeliveryRpcRemote> {
    let removed = self.nodes.remove(id)?;
    self.order.retain(|n| n != id);
    Some(removed)
  }
}

/// Bounded, insertion-ordered collection of remote nodes.
///
/// Used for the neighbor set and for every contact view. Clones share the
/// same underlying list. Mutations are broadcast to subscribers as
/// [`NodeListEvent`]s.
#[derive(Debug, Clone)]
pub struct NodeList {
  inner: Arc<RwLock<NodeListInner>>,
}

impl NodeList {
  pub fn new(own_id: NodeId, limit: usize) -> Self {
    Self {
      inner: Arc::new(RwLock::new(NodeListInner {
        own_id,
        limit,
        order: Vec::new(),
        nodes: HashMap::new(),
        listeners: Listeners::new(),
      })),
    }
  }

  pub fn subscribe(&self) -> UnboundedReceiver<NodeListEvent> {
    self.inner.write().listeners.subscribe()
  }

  /// Adds a node unless it is ourselves or the list is full.
  ///
  /// Adding a node that is already present refreshes its remote handle
  /// in place and emits nothing.
  pub fn add(&self, remote: ContentDeliveryRpcRemote) -> bool {
    let mut inner = self.inner.write();
    let id = remote.node_id();
    if id == inner.own_id || inner.nodes.len() >= inner.limit {
      return false;
    }

    if inner.nodes.insert(id, remote.clone()).is_none() {
      inner.order.push(id);
      inner.listeners.emit(NodeListEvent::NodeAdded(id, remote));
      inner.listeners.emit(NodeListEvent::NodeListUpdated);
    }
    true
  }

  pub fn remove(&self, id: &NodeId) -> bool {
    let mut inner = self.inner.write();
    match inner.remove(id) {
      Some(removed) => {
        inner.listeners.emit(NodeListEvent::NodeRemoved(*id, removed));
        inner.listeners.emit(NodeListEvent::NodeListUpdated);
        true
      }
      None => false,
    }
  }

  /// Clears the list and refills it with at most `limit` of the given
  /// nodes, in order.
  ///
  /// This is a rebuild, not attrition: dropped nodes get no
  /// [`NodeListEvent::NodeRemoved`], only a single
  /// [`NodeListEvent::NodeListUpdated`] is emitted.
  pub fn replace_all(
    &self,
    remotes: impl IntoIterator<Item = ContentDeliveryRpcRemote>,
  ) {
    let mut inner = self.inner.write();
    inner.order.clear();
    inner.nodes.clear();

    for remote in remotes {
      if inner.nodes.len() >= inner.limit {
        break;
      }
      let id = remote.node_id();
      if id == inner.own_id {
        continue;
      }
      if inner.nodes.insert(id, remote).is_none() {
        inner.order.push(id);
      }
    }
    inner.listeners.emit(NodeListEvent::NodeListUpdated);
  }

  pub fn has(&self, id: &NodeId) -> bool {
    self.inner.read().nodes.contains_key(id)
  }

  pub fn get(&self, id: &NodeId) -> Option<ContentDeliveryRpcRemote> {
    self.inner.read().nodes.get(id).cloned()
  }

  pub fn ids(&self) -> Vec<NodeId> {
    self.inner.read().order.clone()
  }

  pub fn all(&self) -> Vec<ContentDeliveryRpcRemote> {
    let inner = self.inner.read();
    inner.iter_filtered(&[], false).cloned().collect()
  }

  pub fn peer_descriptors(&self) -> Vec<PeerDescriptor> {
    let inner = self.inner.read();
    inner
      .iter_filtered(&[], false)
      .map(|n| n.peer_descriptor().clone())
      .collect()
  }

  pub fn size(&self) -> usize {
    self.inner.read().nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.size() == 0
  }

  pub fn size_excluding(&self, exclude: &[NodeId]) -> usize {
    let inner = self.inner.read();
    inner.iter_filtered(exclude, false).count()
  }

  pub fn first(
    &self,
    exclude: &[NodeId],
    websocket_only: bool,
  ) -> Option<ContentDeliveryRpcRemote> {
    let inner = self.inner.read();
    let first = inner.iter_filtered(exclude, websocket_only).next().cloned();
    first
  }

  pub fn last(
    &self,
    exclude: &[NodeId],
    websocket_only: bool,
  ) -> Option<ContentDeliveryRpcRemote> {
    let inner = self.inner.read();
    let last = inner
      .iter_filtered(exclude, websocket_only)
      .next_back()
      .cloned();
    last
  }

  pub fn random(
    &self,
    exclude: &[NodeId],
    websocket_only: bool,
  ) -> Option<ContentDeliveryRpcRemote> {
    let inner = self.inner.read();
    let chosen = inner
      .iter_filtered(exclude, websocket_only)
      .choose(&mut rand::thread_rng())
      .cloned();
    chosen
  }

  /// The first and the last eligible node. A single eligible node is
  /// returned once.
  #[cfg(test)]
  pub fn first_and_last(
    &self,
    exclude: &[NodeId],
    websocket_only: bool,
  ) -> Vec<ContentDeliveryRpcRemote> {
    let first = self.first(exclude, websocket_only);
    let last = self.last(exclude, websocket_only);
    match (first, last) {
      (Some(first), Some(last)) if first.node_id() != last.node_id() => {
        vec![first, last]
      }
      (Some(first), _) => vec![first],
      _ => vec![],
    }
  }

  /// Removes every node, emitting a removal for each, and then detaches
  /// all subscribers.
  pub fn stop(&self) {
    let mut inner = self.inner.write();
    for id in inner.order.clone() {
      if let Some(removed) = inner.remove(&id) {
        inner.listeners.emit(NodeListEvent::NodeRemoved(id, removed));
        inner.listeners.emit(NodeListEvent::NodeListUpdated);
      }
    }
    inner.listeners.clear();
  }
}

/// The neighbor set and the contact views of one stream part.
#[derive(Debug, Clone)]
pub struct NodeViews {
  /// Nodes we exchange stream messages with.
  pub neighbors: NodeList,

  /// Closest ring contacts preceding us.
  pub left: NodeList,

  /// Closest ring contacts following us.
  pub right: NodeList,

  /// Contacts close to us in the DHT keyspace.
  pub nearby: NodeList,

  /// Random samples of the stream part's population.
  pub random: NodeList,
}

impl NodeViews {
  pub fn new(own_id: NodeId, limit: usize) -> Self {
    Self {
      neighbors: NodeList::new(own_id, limit),
      left: NodeList::new(own_id, limit),
      right: NodeList::new(own_id, limit),
      nearby: NodeList::new(own_id, limit),
      random: NodeList::new(own_id, limit),
    }
  }

  fn contact_views(&self) -> [&NodeList; 4] {
    [&self.left, &self.right, &self.nearby, &self.random]
  }

  /// Number of distinct nodes known across all contact views.
  pub fn unique_contact_count(&self) -> usize {
    self
      .contact_views()
      .iter()
      .flat_map(|view| view.ids())
      .collect::<HashSet<_>>()
      .len()
  }

  /// Looks a node up in any contact view.
  pub fn find_contact(&self, id: &NodeId) -> Option<ContentDeliveryRpcRemote> {
    self.contact_views().iter().find_map(|view| view.get(id))
  }

  /// Forgets a node everywhere, for example after it disconnected.
  pub fn remove_everywhere(&self, id: &NodeId) {
    if self.neighbors.remove(id) {
      debug!("removed neighbor {id:?} from all views");
    }
    for view in self.contact_views() {
      view.remove(id);
    }
  }

  pub fn stop(&self) {
    self.neighbors.stop();
    for view in self.contact_views() {
      view.stop();
    }
  }
}
