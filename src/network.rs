use {
  crate::{
    discovery::DiscoveryLayer,
    inspect::{Inspector, NoopInspector},
    rpc::{CallContext, RpcCommunicator, RpcNotification, RpcRequest, RpcResponse},
    stream_part::{self, StreamPart},
    wire::{PeerDescriptor, StreamMessage, StreamPartId},
    Config,
  },
  metrics::{gauge, increment_counter},
  parking_lot::RwLock,
  std::{collections::HashMap, sync::Arc},
  thiserror::Error,
  tracing::{debug, warn},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Stream part {0} already joined")]
  StreamPartAlreadyJoined(StreamPartId),

  #[error("Stream part {0} is not joined")]
  UnknownStreamPart(StreamPartId),

  #[error(transparent)]
  StreamPart(#[from] stream_part::Error),
}

/// This type is the entrypoint to using the content delivery overlay.
///
/// It holds the network-wide configuration, the local identity and the
/// RPC transport shared by all stream parts. An instance of this type is
/// used to join stream parts and acquire [`StreamPart`] handles for
/// publishing and receiving messages.
///
/// On the implementation level, this type acts as a multiplexer for
/// stream parts: the embedding transport hands every incoming call to
/// [`Network::handle_request`] or [`Network::handle_notification`] and
/// it gets routed to the stream part named by the call's service id.
///
/// Cheap to clone, clones share the same joined stream parts.
#[derive(Clone)]
pub struct Network {
  /// Global network-level configuration.
  config: Config,

  /// Identity and connectivity of the local node.
  this: PeerDescriptor,

  /// Outgoing side of the transport.
  rpc: Arc<dyn RpcCommunicator>,

  inspector: Arc<dyn Inspector>,

  /// All joined stream parts addressed by their id.
  stream_parts: Arc<RwLock<HashMap<StreamPartId, StreamPart>>>,
}

impl Network {
  pub fn new(
    config: Config,
    this: PeerDescriptor,
    rpc: Arc<dyn RpcCommunicator>,
  ) -> Self {
    debug!("local identity: {}", this.node_id);
    Self {
      config,
      this,
      rpc,
      inspector: Arc::new(NoopInspector),
      stream_parts: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// Observes every stream message received by stream parts joined
  /// after this call.
  pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
    self.inspector = inspector;
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
    &self.this
  }

  /// Joins a stream part on this network.
  ///
  /// Contacts come from `discovery`. If it knows no other node of the
  /// stream part yet, this node waits for others to handshake with it.
  /// Must be called within a tokio runtime.
  pub fn join(
    &self,
    stream_part_id: StreamPartId,
    discovery: Arc<dyn DiscoveryLayer>,
  ) -> Result<StreamPart, Error> {
    let mut stream_parts = self.stream_parts.write();
    if stream_parts.contains_key(&stream_part_id) {
      return Err(Error::StreamPartAlreadyJoined(stream_part_id));
    }

    let stream_part = StreamPart::new(
      stream_part_id.clone(),
      self.config.clone(),
      self.this.clone(),
      Arc::clone(&self.rpc),
      discovery,
      Arc::clone(&self.inspector),
    );
    stream_part.start();
    stream_parts.insert(stream_part_id, stream_part.clone());

    increment_counter!("stream_parts_joined");
    gauge!("stream_parts", stream_parts.len() as f64);
    Ok(stream_part)
  }

  /// Leaves a stream part, notifying its neighbors.
  pub fn leave(&self, stream_part_id: &StreamPartId) -> Result<(), Error> {
    let removed = self.stream_parts.write().remove(stream_part_id);
    match removed {
      Some(stream_part) => {
        stream_part.stop();
        gauge!("stream_parts", self.stream_parts.read().len() as f64);
        Ok(())
      }
      None => Err(Error::UnknownStreamPart(stream_part_id.clone())),
    }
  }

  pub fn stream_part(&self, stream_part_id: &StreamPartId) -> Option<StreamPart> {
    self.stream_parts.read().get(stream_part_id).cloned()
  }

  pub fn stream_part_ids(&self) -> Vec<StreamPartId> {
    self.stream_parts.read().keys().cloned().collect()
  }

  /// Publishes a message to the stream part it belongs to.
  pub fn broadcast(&self, message: StreamMessage) -> Result<(), Error> {
    let id = message.message_id.stream_part_id();
    let stream_part = self
      .stream_part(&id)
      .ok_or(Error::UnknownStreamPart(id))?;
    Ok(stream_part.broadcast(message)?)
  }

  /// Routes an incoming request to the stream part named by `service`.
  pub async fn handle_request(
    &self,
    service: &StreamPartId,
    request: RpcRequest,
    context: &CallContext,
  ) -> Result<RpcResponse, Error> {
    let stream_part = self.route(service)?;
    Ok(stream_part.handle_request(request, context).await?)
  }

  /// Routes an incoming notification to the stream part named by
  /// `service`.
  pub async fn handle_notification(
    &self,
    service: &StreamPartId,
    notification: RpcNotification,
    context: &CallContext,
  ) -> Result<(), Error> {
    let stream_part = self.route(service)?;
    Ok(stream_part.handle_notification(notification, context).await?)
  }

  /// Called by the transport when the connection to `peer` is gone.
  pub fn on_peer_disconnected(&self, peer: &PeerDescriptor) {
    let stream_parts: Vec<_> =
      self.stream_parts.read().values().cloned().collect();
    for stream_part in stream_parts {
      stream_part.on_peer_disconnected(peer);
    }
  }

  /// Leaves every joined stream part.
  pub fn stop(&self) {
    let stream_parts: Vec<_> =
      self.stream_parts.write().drain().map(|(_, s)| s).collect();
    for stream_part in stream_parts {
      stream_part.stop();
    }
    gauge!("stream_parts", 0.0);
  }

  fn route(&self, service: &StreamPartId) -> Result<StreamPart, Error> {
    self.stream_part(service).ok_or_else(|| {
      warn!("incoming call for unknown stream part {service}");
      Error::UnknownStreamPart(service.clone())
    })
  }
}
