//! Clients that do not join the overlay themselves but publish or
//! subscribe through us.

use {
  crate::{
    channel::Listeners,
    remote::ContentDeliveryRpcRemote,
    rpc::{CallContext, RpcCommunicator},
    wire::{
      NodeId,
      ProxyConnectionRequest,
      ProxyConnectionResponse,
      ProxyDirection,
      StreamPartId,
    },
  },
  parking_lot::{Mutex, RwLock},
  std::{collections::HashMap, sync::Arc, time::Duration},
  tokio::sync::mpsc::UnboundedReceiver,
  tracing::debug,
};

#[derive(Debug, Clone)]
pub struct ProxyConnection {
  pub direction: ProxyDirection,
  pub user_id: String,
  pub remote: ContentDeliveryRpcRemote,
}

struct ProxyConnectionsInner {
  accept: bool,
  stream_part_id: StreamPartId,
  rpc: Arc<dyn RpcCommunicator>,
  rpc_request_timeout: Duration,
  connections: RwLock<HashMap<NodeId, ProxyConnection>>,
  listeners: Mutex<Listeners<NodeId>>,
}

/// Proxy connections of one stream part, keyed by the client's node id.
#[derive(Clone)]
pub struct ProxyConnections {
  inner: Arc<ProxyConnectionsInner>,
}

impl ProxyConnections {
  pub fn new(
    accept: bool,
    stream_part_id: StreamPartId,
    rpc: Arc<dyn RpcCommunicator>,
    rpc_request_timeout: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(ProxyConnectionsInner {
        accept,
        stream_part_id,
        rpc,
        rpc_request_timeout,
        connections: RwLock::new(HashMap::new()),
        listeners: Mutex::new(Listeners::new()),
      }),
    }
  }

  /// Emits the node id of every newly accepted connection.
  pub fn subscribe(&self) -> UnboundedReceiver<NodeId> {
    self.inner.listeners.lock().subscribe()
  }

  pub fn proxy_connection(
    &self,
    request: ProxyConnectionRequest,
    context: &CallContext,
  ) -> ProxyConnectionResponse {
    if !self.inner.accept {
      return ProxyConnectionResponse { accepted: false };
    }

    let id = context.source_id();
    debug!(
      "{}: accepted {:?} proxy connection from {id:?}",
      self.inner.stream_part_id, request.direction
    );
    let remote = ContentDeliveryRpcRemote::new(
      context.incoming_source.clone(),
      self.inner.stream_part_id.clone(),
      Arc::clone(&self.inner.rpc),
      self.inner.rpc_request_timeout,
    );
    self.inner.connections.write().insert(id, ProxyConnection {
      direction: request.direction,
      user_id: request.user_id,
      remote,
    });
    self.inner.listeners.lock().emit(id);
    ProxyConnectionResponse { accepted: true }
  }

  pub fn has_connection(&self, id: &NodeId) -> bool {
    self.inner.connections.read().contains_key(id)
  }

  pub fn get_connection(&self, id: &NodeId) -> Option<ProxyConnection> {
    self.inner.connections.read().get(id).cloned()
  }

  pub fn remove_connection(&self, id: &NodeId) -> bool {
    let removed = self.inner.connections.write().remove(id).is_some();
    if removed {
      debug!("{}: proxy connection {id:?} closed", self.inner.stream_part_id);
    }
    removed
  }

  /// Clients that want every message of the stream part.
  pub fn propagation_targets(&self) -> Vec<NodeId> {
    self
      .inner
      .connections
      .read()
      .iter()
      .filter(|(_, c)| c.direction == ProxyDirection::Subscribe)
      .map(|(id, _)| *id)
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.connections.read().len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stop(&self) {
    self.inner.connections.write().clear();
    self.inner.listeners.lock().clear();
  }
}
