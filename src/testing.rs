//! Helpers shared by unit tests.

use {
  crate::{
    remote::ContentDeliveryRpcRemote,
    rpc::{
      RpcCommunicator,
      RpcError,
      RpcNotification,
      RpcOptions,
      RpcRequest,
      RpcResponse,
    },
    wire::{
      InterleaveResponse,
      MessageId,
      MessageRef,
      NeighborUpdate,
      NodeId,
      PeerDescriptor,
      ProxyConnectionResponse,
      StreamMessage,
      StreamPartHandshakeResponse,
      StreamPartId,
    },
  },
  async_trait::async_trait,
  bytes::Bytes,
  parking_lot::Mutex,
  std::{collections::HashSet, sync::Arc, time::Duration},
};

pub type Responder =
  Box<dyn Fn(&PeerDescriptor, &RpcRequest) -> RpcResponse + Send + Sync>;

/// Communicator that records every outgoing call and answers requests
/// through a configurable responder. By default every request is
/// accepted.
pub struct MockRpc {
  requests: Mutex<Vec<(NodeId, RpcRequest)>>,
  notifications: Mutex<Vec<(NodeId, RpcNotification)>>,
  notify_options: Mutex<Vec<(NodeId, RpcOptions)>>,
  unreachable: Mutex<HashSet<NodeId>>,
  responder: Mutex<Responder>,
}

impl MockRpc {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      requests: Mutex::new(vec![]),
      notifications: Mutex::new(vec![]),
      notify_options: Mutex::new(vec![]),
      unreachable: Mutex::new(HashSet::new()),
      responder: Mutex::new(Box::new(|_, request| accept_all(request))),
    })
  }

  pub fn respond_with(
    &self,
    responder: impl Fn(&PeerDescriptor, &RpcRequest) -> RpcResponse
      + Send
      + Sync
      + 'static,
  ) {
    *self.responder.lock() = Box::new(responder);
  }

  pub fn set_unreachable(&self, node: NodeId) {
    self.unreachable.lock().insert(node);
  }

  pub fn requests(&self) -> Vec<(NodeId, RpcRequest)> {
    self.requests.lock().clone()
  }

  pub fn notifications(&self) -> Vec<(NodeId, RpcNotification)> {
    self.notifications.lock().clone()
  }

  pub fn notifications_to(&self, node: &NodeId) -> Vec<RpcNotification> {
    self
      .notifications
      .lock()
      .iter()
      .filter(|(target, _)| target == node)
      .map(|(_, n)| n.clone())
      .collect()
  }

  pub fn notify_options_to(&self, node: &NodeId) -> Vec<RpcOptions> {
    self
      .notify_options
      .lock()
      .iter()
      .filter(|(target, _)| target == node)
      .map(|(_, options)| *options)
      .collect()
  }

  pub fn clear(&self) {
    self.requests.lock().clear();
    self.notifications.lock().clear();
    self.notify_options.lock().clear();
  }
}

pub fn accept_all(request: &RpcRequest) -> RpcResponse {
  match request {
    RpcRequest::Handshake(_) => {
      RpcResponse::Handshake(StreamPartHandshakeResponse::accepted())
    }
    RpcRequest::Interleave(_) => {
      RpcResponse::Interleave(InterleaveResponse { accepted: true })
    }
    RpcRequest::NeighborUpdate(update) => {
      RpcResponse::NeighborUpdate(NeighborUpdate {
        stream_part_id: update.stream_part_id.clone(),
        neighbor_descriptors: vec![],
        remove_me: false,
      })
    }
    RpcRequest::ProxyConnection(_) => {
      RpcResponse::ProxyConnection(ProxyConnectionResponse { accepted: true })
    }
  }
}

#[async_trait]
impl RpcCommunicator for MockRpc {
  async fn request(
    &self,
    target: &PeerDescriptor,
    _: &StreamPartId,
    request: RpcRequest,
    _: RpcOptions,
  ) -> Result<RpcResponse, RpcError> {
    self.requests.lock().push((target.node_id, request.clone()));
    if self.unreachable.lock().contains(&target.node_id) {
      return Err(RpcError::Unreachable(target.node_id));
    }
    let responder = self.responder.lock();
    Ok((*responder)(target, &request))
  }

  async fn notify(
    &self,
    target: &PeerDescriptor,
    _: &StreamPartId,
    notification: RpcNotification,
    options: RpcOptions,
  ) -> Result<(), RpcError> {
    if self.unreachable.lock().contains(&target.node_id) {
      return Err(RpcError::Unreachable(target.node_id));
    }
    self.notify_options.lock().push((target.node_id, options));
    self.notifications.lock().push((target.node_id, notification));
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
  PeerDescriptor::new(NodeId::random()).with_websocket(addr)
}

pub fn remote(
  peer: &PeerDescriptor,
  rpc: &Arc<MockRpc>,
) -> ContentDeliveryRpcRemote {
  ContentDeliveryRpcRemote::new(
    peer.clone(),
    stream_part(),
    Arc::clone(rpc) as Arc<dyn RpcCommunicator>,
    Duration::from_secs(5),
  )
}

pub fn message(
  chain: &str,
  timestamp: u64,
  previous: Option<u64>,
) -> StreamMessage {
  StreamMessage {
    message_id: MessageId {
      stream_id: "stream".into(),
      stream_partition: 0,
      timestamp,
      sequence_number: 0,
      publisher_id: "publisher".into(),
      message_chain_id: chain.into(),
    },
    previous_message_ref: previous.map(|timestamp| MessageRef {
      timestamp,
      sequence_number: 0,
    }),
    content: Bytes::from_static(b"hello"),
    signature: Bytes::new(),
  }
}

/// Lets spawned tasks run to completion on the current-thread runtime.
pub async fn settle() {
  for _ in 0..20 {
    tokio::task::yield_now().await;
  }
}
