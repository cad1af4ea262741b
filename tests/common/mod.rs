//! In-memory transport connecting several overlay nodes in one process.

#![allow(dead_code)]

use {
  async_trait::async_trait,
  bytes::Bytes,
  parking_lot::{Mutex, RwLock},
  std::{collections::HashMap, sync::Arc},
  streampart_overlay::{
    discovery::{DiscoveryLayer, RingContacts, StaticDiscovery},
    inspect::Inspector,
    rpc::{
      CallContext,
      RpcCommunicator,
      RpcError,
      RpcNotification,
      RpcOptions,
      RpcRequest,
      RpcResponse,
    },
    wire::{
      MessageId,
      MessageRef,
      NodeId,
      PeerDescriptor,
      StreamMessage,
      StreamPartId,
    },
    Config,
    Network,
    StreamPart,
  },
};

/// Every call that went through the router, in the order it was made.
#[derive(Debug, Clone)]
pub enum Call {
  Request(NodeId, NodeId, RpcRequest),
  Notification(NodeId, NodeId, RpcNotification),
}

#[derive(Default)]
pub struct Router {
  nodes: RwLock<HashMap<NodeId, Network>>,
  calls: Mutex<Vec<Call>>,
}

impl Router {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Creates a node reachable through this router.
  pub fn spawn_node(
    self: &Arc<Self>,
    config: Config,
    local: PeerDescriptor,
    inspector: Option<Arc<dyn Inspector>>,
  ) -> Network {
    let rpc = Arc::new(RouterRpc {
      router: Arc::clone(self),
      local: local.clone(),
    });
    let mut network = Network::new(config, local.clone(), rpc);
    if let Some(inspector) = inspector {
      network = network.with_inspector(inspector);
    }
    self.nodes.write().insert(local.node_id, network.clone());
    network
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().clone()
  }

  pub fn handshakes_from(&self, from: &NodeId) -> Vec<NodeId> {
    self
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        Call::Request(source, target, RpcRequest::Handshake(_))
          if source == *from =>
        {
          Some(target)
        }
        _ => None,
      })
      .collect()
  }

  pub fn notifications_between(
    &self,
    from: &NodeId,
    to: &NodeId,
  ) -> Vec<RpcNotification> {
    self
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        Call::Notification(source, target, n)
          if source == *from && target == *to =>
        {
          Some(n)
        }
        _ => None,
      })
      .collect()
  }

  fn node(&self, id: &NodeId) -> Option<Network> {
    self.nodes.read().get(id).cloned()
  }
}

struct RouterRpc {
  router: Arc<Router>,
  local: PeerDescriptor,
}

#[async_trait]
impl RpcCommunicator for RouterRpc {
  async fn request(
    &self,
    target: &PeerDescriptor,
    service: &StreamPartId,
    request: RpcRequest,
    _: RpcOptions,
  ) -> Result<RpcResponse, RpcError> {
    self.router.calls.lock().push(Call::Request(
      self.local.node_id,
      target.node_id,
      request.clone(),
    ));
    let node = self
      .router
      .node(&target.node_id)
      .ok_or(RpcError::Unreachable(target.node_id))?;
    node
      .handle_request(service, request, &CallContext::new(self.local.clone()))
      .await
      .map_err(|e| RpcError::Transport(e.to_string()))
  }

  async fn notify(
    &self,
    target: &PeerDescriptor,
    service: &StreamPartId,
    notification: RpcNotification,
    _: RpcOptions,
  ) -> Result<(), RpcError> {
    self.router.calls.lock().push(Call::Notification(
      self.local.node_id,
      target.node_id,
      notification.clone(),
    ));
    let node = self
      .router
      .node(&target.node_id)
      .ok_or(RpcError::Unreachable(target.node_id))?;
    let service = service.clone();
    let context = CallContext::new(self.local.clone());
    tokio::spawn(async move {
      let _ = node.handle_notification(&service, notification, &context).await;
    });
    Ok(())
  }
}

pub fn stream_part() -> StreamPartId {
  StreamPartId::new("stream", 0)
}

pub fn peer() -> PeerDescriptor {
  PeerDescriptor::new(NodeId::random())
}

pub fn ws_peer() -> PeerDescriptor {
  let addr = "/ip4/127.0.0.1/tcp/8080/ws"
    .parse()
    .expect("static multiaddr");
  peer().with_websocket(addr)
}

pub fn join(
  network: &Network,
  contacts: Vec<PeerDescriptor>,
  ring: Option<RingContacts>,
) -> StreamPart {
  let discovery = Arc::new(StaticDiscovery::new(contacts));
  if let Some(ring) = ring {
    discovery.set_ring_contacts(ring);
  }
  network
    .join(stream_part(), discovery as Arc<dyn DiscoveryLayer>)
    .expect("stream part joined once")
}

pub fn message(timestamp: u64, previous: Option<u64>) -> StreamMessage {
  StreamMessage {
    message_id: MessageId {
      stream_id: "stream".into(),
      stream_partition: 0,
      timestamp,
      sequence_number: 0,
      publisher_id: "publisher".into(),
      message_chain_id: "chain".into(),
    },
    previous_message_ref: previous.map(|timestamp| MessageRef {
      timestamp,
      sequence_number: 0,
    }),
    content: Bytes::from_static(b"payload"),
    signature: Bytes::new(),
  }
}

/// Records which node sent which message, by timestamp.
#[derive(Default)]
pub struct Receipts(pub Mutex<Vec<(NodeId, u64)>>);

impl Inspector for Receipts {
  fn mark_message(&self, sender: &NodeId, message_id: &MessageId) {
    self.0.lock().push((*sender, message_id.timestamp));
  }
}
