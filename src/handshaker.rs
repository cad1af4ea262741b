use {
  crate::{
    config::Config,
    node_list::NodeViews,
    remote::{ContentDeliveryRpcRemote, HandshakeRpcRemote},
    rpc::RpcCommunicator,
    wire::{NodeId, PeerDescriptor, StreamPartId},
  },
  futures::future::join_all,
  metrics::increment_counter,
  parking_lot::Mutex,
  std::{collections::HashSet, sync::Arc, time::Duration},
  tracing::{debug, trace},
};

/// Maximum number of targets handshaked with at once.
pub const PARALLEL_HANDSHAKE_COUNT: usize = 2;

/// Ids of nodes we are currently handshaking with.
///
/// An id can only be held by one [`HandshakeGuard`] at a time, so no two
/// handshakes with the same node ever overlap. The id is released when
/// the guard drops, whatever the outcome of the handshake.
#[derive(Debug, Clone, Default)]
pub struct OngoingHandshakes {
  ids: Arc<Mutex<HashSet<NodeId>>>,
}

impl OngoingHandshakes {
  pub fn try_acquire(&self, id: NodeId) -> Option<HandshakeGuard> {
    self.ids.lock().insert(id).then(|| HandshakeGuard {
      id,
      ids: Arc::clone(&self.ids),
    })
  }

  pub fn contains(&self, id: &NodeId) -> bool {
    self.ids.lock().contains(id)
  }

  pub fn len(&self) -> usize {
    self.ids.lock().len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn ids(&self) -> Vec<NodeId> {
    self.ids.lock().iter().copied().collect()
  }
}

#[must_use]
#[derive(Debug)]
pub struct HandshakeGuard {
  id: NodeId,
  ids: Arc<Mutex<HashSet<NodeId>>>,
}

impl Drop for HandshakeGuard {
  fn drop(&mut self) {
    self.ids.lock().remove(&self.id);
  }
}

/// Accumulates handshake targets up to [`PARALLEL_HANDSHAKE_COUNT`],
/// never picking the same node twice.
struct TargetSelection {
  targets: Vec<ContentDeliveryRpcRemote>,
  excluded: Vec<NodeId>,
}

impl TargetSelection {
  fn full(&self) -> bool {
    self.targets.len() >= PARALLEL_HANDSHAKE_COUNT
  }

  fn offer(&mut self, candidate: Option<ContentDeliveryRpcRemote>) -> bool {
    match candidate {
      Some(node) if !self.full() && !self.excluded.contains(&node.node_id()) => {
        self.excluded.push(node.node_id());
        self.targets.push(node);
        true
      }
      _ => false,
    }
  }
}

struct HandshakerInner {
  stream_part_id: StreamPartId,
  views: NodeViews,
  ongoing: OngoingHandshakes,
  rpc: Arc<dyn RpcCommunicator>,
  max_neighbor_count: usize,
  rpc_request_timeout: Duration,
}

/// Initiates handshakes with contacts until the neighbor target is met.
#[derive(Clone)]
pub struct Handshaker {
  inner: Arc<HandshakerInner>,
}

impl Handshaker {
  pub fn new(
    stream_part_id: StreamPartId,
    views: NodeViews,
    ongoing: OngoingHandshakes,
    rpc: Arc<dyn RpcCommunicator>,
    config: &Config,
  ) -> Self {
    Self {
      inner: Arc::new(HandshakerInner {
        stream_part_id,
        views,
        ongoing,
        rpc,
        max_neighbor_count: config.max_neighbor_count(),
        rpc_request_timeout: config.rpc_request_timeout,
      }),
    }
  }

  /// Runs one scheduling pass and returns the ids the next pass should
  /// skip: the given ones, current neighbors, in-flight handshakes and
  /// every target that did not accept us.
  pub async fn attempt_handshakes_on_contacts(
    &self,
    excluded: Vec<NodeId>,
  ) -> Vec<NodeId> {
    let busy = self.inner.views.neighbors.size() + self.inner.ongoing.len();
    let max = self.inner.max_neighbor_count;

    if busy + PARALLEL_HANDSHAKE_COUNT < max {
      trace!("{}: parallel handshakes", self.inner.stream_part_id);
      self.select_parallel_targets_and_handshake(excluded).await
    } else if busy < max {
      trace!("{}: single handshake", self.inner.stream_part_id);
      self.select_new_target_and_handshake(excluded).await
    } else {
      excluded
    }
  }

  /// Handshakes with a node suggested by a full neighbor of ours.
  ///
  /// `interleave_source` is the node that made the suggestion, it lets
  /// the target discount it when deciding whether to make room for us.
  pub async fn handshake_with_interleaving(
    &self,
    target: PeerDescriptor,
    interleave_source: NodeId,
  ) -> bool {
    let id = target.node_id;
    let Some(_guard) = self.inner.ongoing.try_acquire(id) else {
      debug!("interleave target {id:?} is already being handshaked");
      return false;
    };

    let remote = self.handshake_remote(&target);
    let response = remote
      .handshake(self.inner.views.neighbors.ids(), None, Some(interleave_source))
      .await;

    if response.accepted {
      self.inner.views.neighbors.add(self.delivery_remote(&target));
      increment_counter!("handshakes_accepted");
    } else {
      increment_counter!("handshakes_rejected");
    }
    response.accepted
  }

  fn exclusion_list(&self, mut excluded: Vec<NodeId>) -> Vec<NodeId> {
    let busy = self.inner.views.neighbors.ids();
    for id in busy.into_iter().chain(self.inner.ongoing.ids()) {
      if !excluded.contains(&id) {
        excluded.push(id);
      }
    }
    excluded
  }

  async fn select_parallel_targets_and_handshake(
    &self,
    excluded: Vec<NodeId>,
  ) -> Vec<NodeId> {
    let mut excluded = self.exclusion_list(excluded);
    let acquired: Vec<_> = self
      .select_parallel_targets(&excluded)
      .into_iter()
      .filter_map(|target| {
        let guard = self.inner.ongoing.try_acquire(target.node_id())?;
        Some((self.handshake_remote(target.peer_descriptor()), guard))
      })
      .collect();

    let ids: Vec<NodeId> = acquired.iter().map(|(r, _)| r.node_id()).collect();
    let results = join_all(acquired.into_iter().enumerate().map(
      |(i, (remote, guard))| {
        let concurrent = ids
          .iter()
          .enumerate()
          .find(|(j, _)| *j != i)
          .map(|(_, id)| *id);
        self.handshake_with_target(remote, concurrent, guard)
      },
    ))
    .await;

    for (id, accepted) in ids.into_iter().zip(results) {
      if !accepted {
        excluded.push(id);
      }
    }
    excluded
  }

  /// Bootstrap bias first: without neighbors, a websocket reachable
  /// nearby contact needs no NAT traversal. Then ring adjacency, then
  /// proximity, then random fill.
  fn select_parallel_targets(
    &self,
    excluded: &[NodeId],
  ) -> Vec<ContentDeliveryRpcRemote> {
    let views = &self.inner.views;
    let mut selection = TargetSelection {
      targets: Vec::with_capacity(PARALLEL_HANDSHAKE_COUNT),
      excluded: excluded.to_vec(),
    };

    if views.neighbors.is_empty() {
      selection.offer(views.nearby.first(&selection.excluded, true));
    }
    selection.offer(views.left.first(&selection.excluded, false));
    selection.offer(views.right.first(&selection.excluded, false));
    selection.offer(views.nearby.first(&selection.excluded, false));
    while !selection.full() {
      let random = views.random.random(&selection.excluded, false);
      if !selection.offer(random) {
        break;
      }
    }
    selection.targets
  }

  async fn select_new_target_and_handshake(
    &self,
    excluded: Vec<NodeId>,
  ) -> Vec<NodeId> {
    let mut excluded = self.exclusion_list(excluded);
    let views = &self.inner.views;
    let target = views
      .left
      .first(&excluded, false)
      .or_else(|| views.right.first(&excluded, false))
      .or_else(|| views.nearby.first(&excluded, false))
      .or_else(|| views.random.random(&excluded, false));

    if let Some(target) = target {
      let id = target.node_id();
      if let Some(guard) = self.inner.ongoing.try_acquire(id) {
        let remote = self.handshake_remote(target.peer_descriptor());
        if !self.handshake_with_target(remote, None, guard).await {
          excluded.push(id);
        }
      }
    }
    excluded
  }

  /// The guard keeps the target marked as ongoing until the handshake,
  /// including a possible interleave, has settled.
  async fn handshake_with_target(
    &self,
    target: HandshakeRpcRemote,
    concurrent: Option<NodeId>,
    _guard: HandshakeGuard,
  ) -> bool {
    increment_counter!("handshakes_attempted");
    let response = target
      .handshake(self.inner.views.neighbors.ids(), concurrent, None)
      .await;

    if response.accepted {
      debug!(
        "{}: handshake accepted by {:?}",
        self.inner.stream_part_id,
        target.node_id()
      );
      increment_counter!("handshakes_accepted");
      self
        .inner
        .views
        .neighbors
        .add(self.delivery_remote(target.peer_descriptor()));
    } else {
      increment_counter!("handshakes_rejected");
    }

    if let Some(interleave_target) = response.interleave_target_descriptor {
      self
        .handshake_with_interleaving(interleave_target, target.node_id())
        .await;
    }
    response.accepted
  }

  fn handshake_remote(&self, peer: &PeerDescriptor) -> HandshakeRpcRemote {
    HandshakeRpcRemote::new(
      peer.clone(),
      self.inner.stream_part_id.clone(),
      Arc::clone(&self.inner.rpc),
      self.inner.rpc_request_timeout,
    )
  }

  pub(crate) fn delivery_remote(
    &self,
    peer: &PeerDescriptor,
  ) -> ContentDeliveryRpcRemote {
    ContentDeliveryRpcRemote::new(
      peer.clone(),
      self.inner.stream_part_id.clone(),
      Arc::clone(&self.inner.rpc),
      self.inner.rpc_request_timeout,
    )
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{Handshaker, OngoingHandshakes},
    crate::{
      config::Config,
      node_list::NodeViews,
      rpc::{
        RpcCommunicator,
        RpcError,
        RpcNotification,
        RpcOptions,
        RpcRequest,
        RpcResponse,
      },
      testing::{peer, remote, stream_part, ws_peer, MockRpc},
      wire::{
        NodeId,
        PeerDescriptor,
        StreamPartHandshakeResponse,
        StreamPartId,
      },
    },
    async_trait::async_trait,
    parking_lot::Mutex,
    std::{collections::HashSet, sync::Arc, time::Duration},
  };

  fn handshaker(
    views: &NodeViews,
    ongoing: &OngoingHandshakes,
    rpc: Arc<dyn RpcCommunicator>,
  ) -> Handshaker {
    Handshaker::new(
      stream_part(),
      views.clone(),
      ongoing.clone(),
      rpc,
      &Config::default(),
    )
  }

  fn requested_ids(rpc: &MockRpc) -> Vec<NodeId> {
    rpc.requests().into_iter().map(|(id, _)| id).collect()
  }

  #[test]
  fn guards_are_exclusive_and_released_on_drop() {
    let ongoing = OngoingHandshakes::default();
    let id = NodeId::random();

    let guard = ongoing.try_acquire(id);
    assert!(guard.is_some());
    assert!(ongoing.try_acquire(id).is_none());
    assert!(ongoing.contains(&id));

    drop(guard);
    assert!(ongoing.is_empty());
    assert!(ongoing.try_acquire(id).is_some());
  }

  #[tokio::test]
  async fn websocket_contact_is_preferred_without_neighbors() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let (plain, ws) = (peer(), ws_peer());
    views.nearby.add(remote(&plain, &rpc));
    views.nearby.add(remote(&ws, &rpc));

    let handshaker = handshaker(&views, &ongoing, rpc.clone());
    let targets = handshaker.select_parallel_targets(&[]);
    assert_eq!(targets[0].node_id(), ws.node_id);

    views.neighbors.add(remote(&peer(), &rpc));
    let targets = handshaker.select_parallel_targets(&[]);
    assert_eq!(targets[0].node_id(), plain.node_id);
  }

  #[tokio::test]
  async fn parallel_targets_follow_ring_then_nearby_then_random() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let handshaker = handshaker(&views, &ongoing, rpc.clone());
    views.neighbors.add(remote(&peer(), &rpc));

    let (left, right, near, random) = (peer(), peer(), peer(), peer());
    views.left.add(remote(&left, &rpc));
    views.right.add(remote(&right, &rpc));
    views.nearby.add(remote(&near, &rpc));
    views.random.add(remote(&random, &rpc));

    let ids = |excluded: &[NodeId]| -> Vec<NodeId> {
      handshaker
        .select_parallel_targets(excluded)
        .iter()
        .map(|t| t.node_id())
        .collect()
    };

    assert_eq!(ids(&[]), vec![left.node_id, right.node_id]);
    assert_eq!(ids(&[left.node_id]), vec![right.node_id, near.node_id]);
    assert_eq!(
      ids(&[left.node_id, right.node_id]),
      vec![near.node_id, random.node_id]
    );
    assert!(ids(&[left.node_id, right.node_id, near.node_id, random.node_id])
      .is_empty());
  }

  #[tokio::test]
  async fn accepted_targets_become_neighbors_and_rejected_are_excluded() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let (good, bad) = (peer(), peer());
    views.left.add(remote(&good, &rpc));
    views.right.add(remote(&bad, &rpc));
    rpc.set_unreachable(bad.node_id);

    let excluded = handshaker(&views, &ongoing, rpc.clone())
      .attempt_handshakes_on_contacts(vec![])
      .await;

    assert_eq!(views.neighbors.ids(), vec![good.node_id]);
    assert!(excluded.contains(&bad.node_id));
    assert!(ongoing.is_empty());
  }

  #[tokio::test]
  async fn parallel_handshakes_name_each_other_as_concurrent() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let (a, b) = (peer(), peer());
    views.left.add(remote(&a, &rpc));
    views.right.add(remote(&b, &rpc));

    handshaker(&views, &ongoing, rpc.clone())
      .attempt_handshakes_on_contacts(vec![])
      .await;

    for (target, request) in rpc.requests() {
      let RpcRequest::Handshake(request) = request else {
        panic!("expected only handshake requests");
      };
      let other = if target == a.node_id { b.node_id } else { a.node_id };
      assert_eq!(request.concurrent_handshake_node_id, Some(other));
      assert_eq!(request.interleave_source_id, None);
    }
  }

  #[tokio::test]
  async fn single_handshake_when_close_to_target() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    for _ in 0..2 {
      views.neighbors.add(remote(&peer(), &rpc));
    }
    let (left, right) = (peer(), peer());
    views.left.add(remote(&left, &rpc));
    views.right.add(remote(&right, &rpc));

    handshaker(&views, &ongoing, rpc.clone())
      .attempt_handshakes_on_contacts(vec![])
      .await;
    assert_eq!(requested_ids(&rpc), vec![left.node_id]);
  }

  #[tokio::test]
  async fn no_handshake_when_target_reached() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    for _ in 0..4 {
      views.neighbors.add(remote(&peer(), &rpc));
    }
    views.left.add(remote(&peer(), &rpc));

    let excluded = handshaker(&views, &ongoing, rpc.clone())
      .attempt_handshakes_on_contacts(vec![])
      .await;
    assert!(excluded.is_empty());
    assert!(rpc.requests().is_empty());
  }

  #[tokio::test]
  async fn interleave_suggestion_is_followed() {
    let rpc = MockRpc::new();
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let (full, suggested) = (peer(), peer());
    views.left.add(remote(&full, &rpc));

    let full_id = full.node_id;
    let suggestion = suggested.clone();
    rpc.respond_with(move |target, _| {
      let response = if target.node_id == full_id {
        StreamPartHandshakeResponse {
          accepted: true,
          interleave_target_descriptor: Some(suggestion.clone()),
        }
      } else {
        StreamPartHandshakeResponse::accepted()
      };
      RpcResponse::Handshake(response)
    });

    handshaker(&views, &ongoing, rpc.clone())
      .attempt_handshakes_on_contacts(vec![])
      .await;

    let neighbors: HashSet<_> = views.neighbors.ids().into_iter().collect();
    assert_eq!(neighbors, [full.node_id, suggested.node_id].into());

    let requests = rpc.requests();
    let (_, RpcRequest::Handshake(nested)) = &requests[1] else {
      panic!("expected nested handshake");
    };
    assert_eq!(nested.interleave_source_id, Some(full.node_id));
    assert!(ongoing.is_empty());
  }

  /// Answers handshakes after a delay and records whether two requests
  /// to the same node were ever in flight together.
  #[derive(Default)]
  struct SlowRpc {
    in_flight: Mutex<HashSet<NodeId>>,
    overlapped: Mutex<bool>,
    calls: Mutex<usize>,
  }

  #[async_trait]
  impl RpcCommunicator for SlowRpc {
    async fn request(
      &self,
      target: &PeerDescriptor,
      _: &StreamPartId,
      _: RpcRequest,
      _: RpcOptions,
    ) -> Result<RpcResponse, RpcError> {
      *self.calls.lock() += 1;
      if !self.in_flight.lock().insert(target.node_id) {
        *self.overlapped.lock() = true;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
      self.in_flight.lock().remove(&target.node_id);
      Ok(RpcResponse::Handshake(StreamPartHandshakeResponse::rejected()))
    }

    async fn notify(
      &self,
      _: &PeerDescriptor,
      _: &StreamPartId,
      _: RpcNotification,
      _: RpcOptions,
    ) -> Result<(), RpcError> {
      Ok(())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn overlapping_passes_never_handshake_the_same_node_twice() {
    let rpc = Arc::new(SlowRpc::default());
    let views = NodeViews::new(NodeId::random(), 20);
    let ongoing = OngoingHandshakes::default();
    let mock = MockRpc::new();
    for _ in 0..3 {
      views.nearby.add(remote(&peer(), &mock));
    }

    let handshaker = handshaker(&views, &ongoing, rpc.clone());
    let (a, b, c) = tokio::join!(
      handshaker.attempt_handshakes_on_contacts(vec![]),
      handshaker.attempt_handshakes_on_contacts(vec![]),
      handshaker.attempt_handshakes_on_contacts(vec![]),
    );

    assert!(!*rpc.overlapped.lock());
    assert!(*rpc.calls.lock() >= 1);
    assert!(ongoing.is_empty());
    for excluded in [a, b, c] {
      assert!(!excluded.is_empty());
    }
  }
}
