//! One stream part as seen by this node: its neighbor set, the contact
//! views feeding it, and the delivery of messages over it.

use {
  crate::{
    channel::{Channel, Listeners},
    config::Config,
    delivery::{
      ContentDeliveryRpcLocal,
      Delivery,
      Fanout,
      LeaveNotice,
      NeighborResolver,
    },
    discovery::{DiscoveryEvent, DiscoveryLayer},
    handshake::{HandshakeRpcLocal, HandshakeRpcLocalOptions},
    handshaker::{Handshaker, OngoingHandshakes},
    inspect::Inspector,
    neighbor_finder::NeighborFinder,
    neighbor_update::{
      NeighborUpdateContext,
      NeighborUpdateManager,
      NeighborUpdateRpcLocal,
    },
    node_list::{NodeListEvent, NodeViews},
    plumtree::PlumtreeManager,
    propagation::{Propagation, SendToNeighbor},
    proxy::ProxyConnections,
    remote::ContentDeliveryRpcRemote,
    rpc::{CallContext, RpcCommunicator, RpcNotification, RpcRequest, RpcResponse},
    wire::{NodeId, PeerDescriptor, StreamMessage, StreamPartId},
  },
  futures::Stream,
  parking_lot::Mutex,
  serde::Serialize,
  std::{
    pin::Pin,
    sync::{
      atomic::{AtomicBool, AtomicU64, Ordering},
      Arc,
      Weak,
    },
    task::{Context, Poll},
    time::Duration,
  },
  thiserror::Error,
  tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    task::JoinHandle,
  },
  tracing::{debug, trace},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Stream part {0} is stopped")]
  Stopped(StreamPartId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPartEvent {
  NeighborConnected(NodeId),

  /// A node that acted as an entry point of the stream part left it.
  EntryPointLeaveDetected,
}

/// Snapshot of view sizes for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticInfo {
  pub neighbor_count: usize,
  pub nearby_view_count: usize,
  pub random_view_count: usize,
  pub left_view_count: usize,
  pub right_view_count: usize,
  pub ongoing_handshakes: usize,
  pub neighbor_finder_running: bool,
  pub proxy_connections: usize,
  pub pending_propagations: usize,
  pub messages_propagated: u64,
}

#[derive(Default)]
struct Lifecycle {
  started: bool,
  stopped: bool,
  pump: Option<JoinHandle<()>>,
}

struct StreamPartInner {
  stream_part_id: StreamPartId,
  config: Config,
  discovery: Arc<dyn DiscoveryLayer>,
  views: NodeViews,
  ongoing: OngoingHandshakes,
  handshaker: Handshaker,
  handshake_local: HandshakeRpcLocal,
  finder: NeighborFinder,
  update_manager: NeighborUpdateManager,
  update_local: NeighborUpdateRpcLocal,
  proxies: ProxyConnections,
  content: ContentDeliveryRpcLocal,

  /// Messages delivered to the local application.
  outmsgs: Mutex<Channel<StreamMessage>>,
  events: Mutex<Listeners<StreamPartEvent>>,
  leave_notices: Mutex<Option<UnboundedReceiver<LeaveNotice>>>,
  entry_point: AtomicBool,
  messages_propagated: AtomicU64,
  lifecycle: Mutex<Lifecycle>,
}

/// Overlay node of a single stream part.
///
/// Cheap to clone, clones share the same node. Implements [`Stream`]
/// over every message delivered to this node, both received and locally
/// published ones.
#[derive(Clone)]
pub struct StreamPart {
  inner: Arc<StreamPartInner>,
}

// Public API
impl StreamPart {
  pub fn id(&self) -> &StreamPartId {
    &self.inner.stream_part_id
  }

  /// Publishes a message from this node to the stream part.
  pub fn broadcast(&self, message: StreamMessage) -> Result<(), Error> {
    self.ensure_running()?;
    self.inner.messages_propagated.fetch_add(1, Ordering::Relaxed);
    self.inner.content.publish(message);
    Ok(())
  }

  pub fn subscribe_events(&self) -> UnboundedReceiver<StreamPartEvent> {
    self.inner.events.lock().subscribe()
  }

  /// Whether this node is an entry point of the stream part. Reported
  /// to neighbors when leaving.
  pub fn set_entry_point(&self, entry_point: bool) {
    self.inner.entry_point.store(entry_point, Ordering::Relaxed);
  }

  pub fn neighbors(&self) -> Vec<PeerDescriptor> {
    self.inner.views.neighbors.peer_descriptors()
  }

  pub fn neighbor_ids(&self) -> Vec<NodeId> {
    self.inner.views.neighbors.ids()
  }

  /// Neighbors with the round trip time of the last neighbor update.
  pub fn neighbor_infos(&self) -> Vec<(PeerDescriptor, Option<Duration>)> {
    self
      .inner
      .views
      .neighbors
      .all()
      .into_iter()
      .map(|n| (n.peer_descriptor().clone(), n.rtt()))
      .collect()
  }

  pub fn has_proxy_connection(&self, id: &NodeId) -> bool {
    self.inner.proxies.has_connection(id)
  }

  pub fn outgoing_handshake_count(&self) -> usize {
    self.inner.ongoing.len()
  }

  pub fn is_plumtree_enabled(&self) -> bool {
    self.inner.content.delivery().plumtree().is_some()
  }

  /// Whether full messages of `chain` no longer flow between us and
  /// `node` in at least one direction. Always false without plumtree.
  pub fn is_neighbor_paused(&self, node: &NodeId, chain: &str) -> bool {
    self
      .inner
      .content
      .delivery()
      .plumtree()
      .map(|plumtree| plumtree.is_neighbor_paused(node, chain))
      .unwrap_or(false)
  }

  pub fn diagnostic_info(&self) -> DiagnosticInfo {
    let views = &self.inner.views;
    DiagnosticInfo {
      neighbor_count: views.neighbors.size(),
      nearby_view_count: views.nearby.size(),
      random_view_count: views.random.size(),
      left_view_count: views.left.size(),
      right_view_count: views.right.size(),
      ongoing_handshakes: self.inner.ongoing.len(),
      neighbor_finder_running: self.inner.finder.is_running(),
      proxy_connections: self.inner.proxies.len(),
      pending_propagations: self.inner.content.delivery().propagation().pending(),
      messages_propagated: self.inner.messages_propagated.load(Ordering::Relaxed),
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.inner.lifecycle.lock().stopped
  }

  /// Leaves the stream part: neighbors are notified, background work
  /// ends and every view is emptied. Idempotent.
  pub fn stop(&self) {
    let inner = &self.inner;
    {
      let mut lifecycle = inner.lifecycle.lock();
      if lifecycle.stopped {
        return;
      }
      lifecycle.stopped = true;
      if let Some(pump) = lifecycle.pump.take() {
        pump.abort();
      }
    }
    debug!("{}: stopping", inner.stream_part_id);

    inner.proxies.stop();
    let is_entry_point = inner.entry_point.load(Ordering::Relaxed);
    for neighbor in inner.views.neighbors.all() {
      tokio::spawn(async move {
        if let Err(e) = neighbor.leave_stream_part_notice(is_entry_point).await
        {
          trace!("leave notice to {:?} failed: {e}", neighbor.node_id());
        }
      });
    }

    inner.events.lock().clear();
    inner.content.stop();
    inner.finder.stop();
    inner.update_manager.stop();
    inner.views.stop();
  }
}

// internal api
impl StreamPart {
  pub(crate) fn new(
    stream_part_id: StreamPartId,
    config: Config,
    local_peer_descriptor: PeerDescriptor,
    rpc: Arc<dyn RpcCommunicator>,
    discovery: Arc<dyn DiscoveryLayer>,
    inspector: Arc<dyn Inspector>,
  ) -> Self {
    let views =
      NodeViews::new(local_peer_descriptor.node_id, config.max_contact_count);
    let ongoing = OngoingHandshakes::default();
    let handshaker = Handshaker::new(
      stream_part_id.clone(),
      views.clone(),
      ongoing.clone(),
      Arc::clone(&rpc),
      &config,
    );
    let finder = NeighborFinder::new(
      handshaker.clone(),
      views.clone(),
      config.neighbor_target_count,
      config.neighbor_finder_initial_wait,
      config.neighbor_finder_interval,
    );
    let handshake_local = HandshakeRpcLocal::new(HandshakeRpcLocalOptions {
      stream_part_id: stream_part_id.clone(),
      neighbors: views.neighbors.clone(),
      ongoing: ongoing.clone(),
      max_neighbor_count: config.max_neighbor_count(),
      handshaker: handshaker.clone(),
      rpc: Arc::clone(&rpc),
      rpc_request_timeout: config.rpc_request_timeout,
      interleave_request_timeout: config.interleave_request_timeout,
    });

    let update_context = NeighborUpdateContext {
      local_peer_descriptor,
      stream_part_id: stream_part_id.clone(),
      views: views.clone(),
      finder: finder.clone(),
      ongoing: ongoing.clone(),
      rpc: Arc::clone(&rpc),
      neighbor_target_count: config.neighbor_target_count,
      rpc_request_timeout: config.rpc_request_timeout,
    };
    let update_manager = NeighborUpdateManager::new(
      update_context.clone(),
      config.neighbor_update_interval,
    );
    let update_local = NeighborUpdateRpcLocal::new(update_context);

    let proxies = ProxyConnections::new(
      config.accept_proxy_connections,
      stream_part_id.clone(),
      Arc::clone(&rpc),
      config.rpc_request_timeout,
    );

    let outmsgs = Channel::new();
    let resolver = NeighborResolver {
      neighbors: views.neighbors.clone(),
      proxies: proxies.clone(),
      buffer_while_connecting: config.buffer_while_connecting,
    };
    let fanout = Fanout {
      propagation: Propagation::new(
        Arc::new(resolver) as Arc<dyn SendToNeighbor>,
        config.min_propagation_targets,
        config.max_propagation_buffer_size,
        config.propagation_buffer_ttl,
      ),
      neighbors: views.neighbors.clone(),
      proxies: proxies.clone(),
      deliver: outmsgs.sender(),
    };
    let delivery = if config.plumtree_optimization {
      Delivery::Plumtree {
        manager: PlumtreeManager::new(
          stream_part_id.clone(),
          views.neighbors.clone(),
          Arc::clone(&rpc),
          (&config).into(),
          outmsgs.sender(),
        ),
        fanout,
      }
    } else {
      Delivery::Eager(fanout)
    };

    let (leave_tx, leave_rx) = unbounded_channel();
    let content = ContentDeliveryRpcLocal::new(
      stream_part_id.clone(),
      delivery,
      inspector,
      leave_tx,
    );

    Self {
      inner: Arc::new(StreamPartInner {
        stream_part_id,
        config,
        discovery,
        views,
        ongoing,
        handshaker,
        handshake_local,
        finder,
        update_manager,
        update_local,
        proxies,
        content,
        outmsgs: Mutex::new(outmsgs),
        events: Mutex::new(Listeners::new()),
        leave_notices: Mutex::new(Some(leave_rx)),
        entry_point: AtomicBool::new(false),
        messages_propagated: AtomicU64::new(0),
        lifecycle: Mutex::new(Lifecycle::default()),
      }),
    }
  }

  /// Loads the current contacts and starts finding neighbors.
  pub(crate) fn start(&self) {
    let inner = &self.inner;
    let mut lifecycle = inner.lifecycle.lock();
    if lifecycle.started || lifecycle.stopped {
      return;
    }
    lifecycle.started = true;

    let discovery = inner.discovery.subscribe();
    let neighbors = inner.views.neighbors.subscribe();
    let proxies = inner.proxies.subscribe();
    let (_, closed) = unbounded_channel();
    let leaves = inner.leave_notices.lock().take().unwrap_or(closed);

    inner.update_ring_views();
    inner.update_nearby_view();
    inner.update_random_view();

    lifecycle.pump = Some(tokio::spawn(pump_events(
      Arc::downgrade(inner),
      discovery,
      neighbors,
      proxies,
      leaves,
    )));
    drop(lifecycle);

    inner.finder.start(vec![]);
    inner.update_manager.start();
  }

  pub(crate) async fn handle_request(
    &self,
    request: RpcRequest,
    context: &CallContext,
  ) -> Result<RpcResponse, Error> {
    self.ensure_running()?;
    let inner = &self.inner;
    Ok(match request {
      RpcRequest::Handshake(request) => {
        RpcResponse::Handshake(inner.handshake_local.handshake(request, context))
      }
      RpcRequest::Interleave(request) => RpcResponse::Interleave(
        inner
          .handshake_local
          .interleave_request(request, context)
          .await,
      ),
      RpcRequest::NeighborUpdate(update) => RpcResponse::NeighborUpdate(
        inner.update_local.neighbor_update(update, context),
      ),
      RpcRequest::ProxyConnection(request) => RpcResponse::ProxyConnection(
        inner.proxies.proxy_connection(request, context),
      ),
    })
  }

  pub(crate) async fn handle_notification(
    &self,
    notification: RpcNotification,
    context: &CallContext,
  ) -> Result<(), Error> {
    self.ensure_running()?;
    let content = &self.inner.content;
    let plumtree = content.delivery().plumtree();

    match (notification, plumtree) {
      (RpcNotification::StreamMessage(message), _) => {
        self.inner.messages_propagated.fetch_add(1, Ordering::Relaxed);
        content.send_stream_message(message, context).await;
      }
      (RpcNotification::LeaveStreamPartNotice(notice), _) => {
        content.leave_stream_part_notice(notice, context);
      }
      (RpcNotification::Metadata(id), Some(plumtree)) => {
        plumtree.handle_metadata(id, context).await;
      }
      (RpcNotification::PauseNeighbor(request), Some(plumtree)) => {
        plumtree.handle_pause_neighbor(request, context);
      }
      (RpcNotification::ResumeNeighbor(request), Some(plumtree)) => {
        plumtree.handle_resume_neighbor(request, context).await;
      }
      (notification, None) => {
        trace!(
          "{}: ignoring {notification:?}, plumtree is disabled",
          self.inner.stream_part_id
        );
      }
    }
    Ok(())
  }

  /// The transport lost its connection to `peer`.
  pub(crate) fn on_peer_disconnected(&self, peer: &PeerDescriptor) {
    if self.is_stopped() {
      return;
    }
    let id = peer.node_id;
    if self.inner.views.neighbors.remove(&id) {
      debug!("{}: neighbor {id:?} disconnected", self.inner.stream_part_id);
      self.inner.finder.start(vec![id]);
    }
    self.inner.proxies.remove_connection(&id);
  }

  fn ensure_running(&self) -> Result<(), Error> {
    match self.is_stopped() {
      true => Err(Error::Stopped(self.inner.stream_part_id.clone())),
      false => Ok(()),
    }
  }
}

impl StreamPartInner {
  fn below_target(&self) -> bool {
    self.views.neighbors.size() < self.config.neighbor_target_count
  }

  fn on_discovery_event(&self, event: DiscoveryEvent) {
    trace!("{}: {event:?}", self.stream_part_id);
    match event {
      DiscoveryEvent::NearbyContactAdded => {
        self.update_nearby_view();
        if self.below_target() {
          self.finder.start(vec![]);
        }
      }
      DiscoveryEvent::NearbyContactRemoved => self.update_nearby_view(),
      DiscoveryEvent::RandomContactAdded => {
        self.update_random_view();
        if self.below_target() {
          self.finder.start(vec![]);
        }
      }
      DiscoveryEvent::RandomContactRemoved => self.update_random_view(),
      DiscoveryEvent::RingContactAdded | DiscoveryEvent::RingContactRemoved => {
        self.update_ring_views()
      }
    }
  }

  fn on_neighbor_event(&self, event: NodeListEvent) {
    if let NodeListEvent::NodeAdded(id, _) = event {
      if !self.views.neighbors.has(&id) {
        trace!("{}: {id:?} left before it was announced", self.stream_part_id);
        return;
      }
      self.content.delivery().propagation().on_neighbor_joined(id);
      self
        .events
        .lock()
        .emit(StreamPartEvent::NeighborConnected(id));
    }
  }

  fn on_leave_notice(&self, notice: LeaveNotice) {
    let id = notice.node_id;
    let known = self.views.neighbors.has(&id)
      || self.views.find_contact(&id).is_some()
      || self.proxies.has_connection(&id);

    if known {
      debug!("{}: {id:?} left the stream part", self.stream_part_id);
      self.discovery.remove_contact(&id);
      self.views.remove_everywhere(&id);
      self.finder.start(vec![id]);
      self.proxies.remove_connection(&id);
    }
    if notice.is_entry_point {
      self
        .events
        .lock()
        .emit(StreamPartEvent::EntryPointLeaveDetected);
    }
  }

  fn remotes(
    &self,
    peers: Vec<PeerDescriptor>,
  ) -> impl Iterator<Item = ContentDeliveryRpcRemote> + '_ {
    peers
      .into_iter()
      .map(|peer| self.handshaker.delivery_remote(&peer))
  }

  fn update_ring_views(&self) {
    let ring = self.discovery.ring_contacts();
    self.views.left.replace_all(self.remotes(ring.left));
    self.views.right.replace_all(self.remotes(ring.right));
  }

  /// Closest contacts first, then topped up with the discovery layer's
  /// direct neighbors.
  fn update_nearby_view(&self) {
    let nearby = &self.views.nearby;
    nearby.replace_all(self.remotes(self.discovery.closest_contacts()));
    for remote in self.remotes(self.discovery.dht_neighbors()) {
      if nearby.size() >= self.config.node_view_size {
        break;
      }
      nearby.add(remote);
    }
  }

  fn update_random_view(&self) {
    let contacts = self
      .discovery
      .random_contacts(self.config.random_node_view_size);
    self.views.random.replace_all(self.remotes(contacts));
  }
}

/// Applies background events to the stream part.
///
/// Branches are polled in order: neighbor changes, then proxy
/// registrations, then discovery, then leave notices. A leave notice is
/// therefore never applied before the arrival of the node it concerns.
async fn pump_events(
  inner: Weak<StreamPartInner>,
  mut discovery: UnboundedReceiver<DiscoveryEvent>,
  mut neighbors: UnboundedReceiver<NodeListEvent>,
  mut proxies: UnboundedReceiver<NodeId>,
  mut leaves: UnboundedReceiver<LeaveNotice>,
) {
  loop {
    tokio::select! {
      biased;
      Some(event) = neighbors.recv() => {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_neighbor_event(event);
      }
      Some(id) = proxies.recv() => {
        let Some(inner) = inner.upgrade() else { break };
        inner.content.delivery().propagation().on_neighbor_joined(id);
      }
      Some(event) = discovery.recv() => {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_discovery_event(event);
      }
      Some(notice) = leaves.recv() => {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_leave_notice(notice);
      }
      else => break,
    }
  }
}

impl Stream for StreamPart {
  type Item = StreamMessage;

  fn poll_next(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    self.inner.outmsgs.lock().poll_recv(cx)
  }
}

impl std::fmt::Debug for StreamPart {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamPart")
      .field("id", &self.inner.stream_part_id)
      .field("neighbors", &self.inner.views.neighbors.ids())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{StreamPart, StreamPartEvent},
    crate::{
      config::Config,
      discovery::{DiscoveryLayer, RingContacts, StaticDiscovery},
      inspect::NoopInspector,
      rpc::{CallContext, RpcCommunicator, RpcNotification, RpcRequest},
      testing::{message, peer, settle, stream_part, MockRpc},
      wire::{LeaveStreamPartNotice, StreamPartHandshakeRequest},
    },
    futures::StreamExt,
    std::{sync::Arc, time::Duration},
  };

  fn stream_part_node(
    config: Config,
    rpc: &Arc<MockRpc>,
    discovery: &Arc<StaticDiscovery>,
  ) -> StreamPart {
    StreamPart::new(
      stream_part(),
      config,
      peer(),
      Arc::clone(rpc) as Arc<dyn RpcCommunicator>,
      Arc::clone(discovery) as Arc<dyn DiscoveryLayer>,
      Arc::new(NoopInspector),
    )
  }

  fn handshake() -> RpcRequest {
    RpcRequest::Handshake(StreamPartHandshakeRequest {
      stream_part_id: stream_part(),
      neighbor_node_ids: vec![],
      concurrent_handshake_node_id: None,
      interleave_source_id: None,
    })
  }

  #[tokio::test(start_paused = true)]
  async fn start_loads_views_and_finds_neighbors() {
    let rpc = MockRpc::new();
    let contacts: Vec<_> = (0..6).map(|_| peer()).collect();
    let discovery = Arc::new(StaticDiscovery::new(contacts.clone()));
    let (left, right) = (peer(), peer());
    discovery.set_ring_contacts(RingContacts {
      left: vec![left.clone()],
      right: vec![right.clone()],
    });

    let node = stream_part_node(Config::default(), &rpc, &discovery);
    let mut events = node.subscribe_events();
    node.start();

    let info = node.diagnostic_info();
    assert_eq!(info.nearby_view_count, 6);
    assert_eq!(info.random_view_count, 6);
    assert_eq!(info.left_view_count, 1);
    assert_eq!(info.right_view_count, 1);
    assert!(info.neighbor_finder_running);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let neighbors = node.neighbor_ids();
    assert_eq!(neighbors.len(), 4);
    assert!(neighbors.contains(&left.node_id));
    assert!(neighbors.contains(&right.node_id));
    assert!(!node.diagnostic_info().neighbor_finder_running);

    let mut connected = vec![];
    while let Ok(StreamPartEvent::NeighborConnected(id)) = events.try_recv() {
      connected.push(id);
    }
    assert_eq!(connected, neighbors);
    node.stop();
  }

  #[tokio::test]
  async fn local_and_received_messages_are_streamed() {
    let rpc = MockRpc::new();
    let discovery = Arc::new(StaticDiscovery::default());
    let mut node = stream_part_node(Config::default(), &rpc, &discovery);
    node.start();

    let sender = peer();
    node
      .handle_request(handshake(), &CallContext::new(sender.clone()))
      .await
      .unwrap();
    node.broadcast(message("c", 1, None)).unwrap();
    node
      .handle_notification(
        RpcNotification::StreamMessage(message("c", 2, Some(1))),
        &CallContext::new(sender.clone()),
      )
      .await
      .unwrap();
    node
      .handle_notification(
        RpcNotification::StreamMessage(message("c", 2, Some(1))),
        &CallContext::new(sender),
      )
      .await
      .unwrap();

    assert_eq!(node.next().await.map(|m| m.timestamp()), Some(1));
    assert_eq!(node.next().await.map(|m| m.timestamp()), Some(2));
    assert_eq!(node.diagnostic_info().messages_propagated, 3);
    node.stop();
  }

  #[tokio::test]
  async fn leave_notice_forgets_the_node_and_reports_entry_points() {
    let rpc = MockRpc::new();
    let leaver = peer();
    let discovery = Arc::new(StaticDiscovery::new(vec![leaver.clone()]));
    let node = stream_part_node(Config::default(), &rpc, &discovery);
    let mut events = node.subscribe_events();
    node.start();

    let ctx = CallContext::new(leaver.clone());
    node.handle_request(handshake(), &ctx).await.unwrap();
    assert_eq!(node.neighbor_ids(), vec![leaver.node_id]);

    node
      .handle_notification(
        RpcNotification::LeaveStreamPartNotice(LeaveStreamPartNotice {
          stream_part_id: stream_part(),
          is_entry_point: true,
        }),
        &ctx,
      )
      .await
      .unwrap();
    settle().await;

    assert!(node.neighbor_ids().is_empty());
    assert_eq!(node.diagnostic_info().nearby_view_count, 0);
    assert!(discovery.closest_contacts().is_empty());

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert_eq!(seen, vec![
      StreamPartEvent::NeighborConnected(leaver.node_id),
      StreamPartEvent::EntryPointLeaveDetected,
    ]);
    node.stop();
  }

  #[tokio::test]
  async fn arrivals_are_announced_before_departures() {
    let rpc = MockRpc::new();
    let discovery = Arc::new(StaticDiscovery::default());
    let node = stream_part_node(Config::default(), &rpc, &discovery);
    let mut events = node.subscribe_events();
    node.start();

    let peers: Vec<_> = (0..3).map(|_| peer()).collect();
    for p in &peers {
      let ctx = CallContext::new(p.clone());
      node.handle_request(handshake(), &ctx).await.unwrap();
      node
        .handle_notification(
          RpcNotification::LeaveStreamPartNotice(LeaveStreamPartNotice {
            stream_part_id: stream_part(),
            is_entry_point: false,
          }),
          &ctx,
        )
        .await
        .unwrap();
    }
    settle().await;

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    let expected: Vec<_> = peers
      .iter()
      .map(|p| StreamPartEvent::NeighborConnected(p.node_id))
      .collect();
    assert_eq!(seen, expected);
    assert!(node.neighbor_ids().is_empty());
    node.stop();
  }

  #[tokio::test]
  async fn stop_notifies_neighbors_and_rejects_further_calls() {
    let rpc = MockRpc::new();
    let discovery = Arc::new(StaticDiscovery::default());
    let node = stream_part_node(Config::default(), &rpc, &discovery);
    node.set_entry_point(true);
    node.start();

    let neighbor = peer();
    node
      .handle_request(handshake(), &CallContext::new(neighbor.clone()))
      .await
      .unwrap();

    node.stop();
    node.stop();
    settle().await;

    assert!(node.is_stopped());
    assert!(node.neighbor_ids().is_empty());
    assert_eq!(rpc.notifications_to(&neighbor.node_id), vec![
      RpcNotification::LeaveStreamPartNotice(LeaveStreamPartNotice {
        stream_part_id: stream_part(),
        is_entry_point: true,
      })
    ]);
    assert!(node.broadcast(message("c", 1, None)).is_err());
    assert!(node
      .handle_request(handshake(), &CallContext::new(peer()))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn disconnected_neighbors_are_removed() {
    let rpc = MockRpc::new();
    let discovery = Arc::new(StaticDiscovery::default());
    let node = stream_part_node(Config::default(), &rpc, &discovery);
    node.start();

    let neighbor = peer();
    node
      .handle_request(handshake(), &CallContext::new(neighbor.clone()))
      .await
      .unwrap();
    node.on_peer_disconnected(&neighbor);
    assert!(node.neighbor_ids().is_empty());
    node.stop();
  }
}
