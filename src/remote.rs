//! Typed client stubs for the calls this overlay makes to other nodes.

use {
  crate::{
    rpc::{
      with_timeout,
      RpcCommunicator,
      RpcError,
      RpcNotification,
      RpcOptions,
      RpcRequest,
      RpcResponse,
    },
    wire::{
      InterleaveRequest,
      LeaveStreamPartNotice,
      MessageId,
      NeighborUpdate,
      NodeId,
      PauseNeighborRequest,
      PeerDescriptor,
      ResumeNeighborRequest,
      StreamMessage,
      StreamPartHandshakeRequest,
      StreamPartHandshakeResponse,
      StreamPartId,
    },
  },
  parking_lot::Mutex,
  std::{fmt, sync::Arc, time::Duration},
  tracing::debug,
};

/// Addressing shared by all remotes: who to call, on which stream part,
/// through which transport and with what timeout.
#[derive(Clone)]
struct RpcTarget {
  peer: PeerDescriptor,
  service: StreamPartId,
  rpc: Arc<dyn RpcCommunicator>,
  timeout: Duration,
}

impl RpcTarget {
  async fn request(
    &self,
    request: RpcRequest,
    options: RpcOptions,
    timeout: Duration,
  ) -> Result<RpcResponse, RpcError> {
    with_timeout(
      timeout,
      self.rpc.request(&self.peer, &self.service, request, options),
    )
    .await
  }

  async fn notify(
    &self,
    notification: RpcNotification,
    options: RpcOptions,
  ) -> Result<(), RpcError> {
    with_timeout(
      self.timeout,
      self.rpc.notify(&self.peer, &self.service, notification, options),
    )
    .await
  }
}

impl fmt::Debug for RpcTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RpcTarget")
      .field("peer", &self.peer.node_id)
      .field("service", &self.service)
      .finish()
  }
}

/// A neighbor (or proxied client) we deliver stream messages to.
///
/// Cheap to clone. Clones share the last measured round trip time.
#[derive(Debug, Clone)]
pub struct ContentDeliveryRpcRemote {
  target: RpcTarget,
  rtt: Arc<Mutex<Option<Duration>>>,
}

impl ContentDeliveryRpcRemote {
  pub fn new(
    peer: PeerDescriptor,
    stream_part_id: StreamPartId,
    rpc: Arc<dyn RpcCommunicator>,
    timeout: Duration,
  ) -> Self {
    Self {
      target: RpcTarget {
        peer,
        service: stream_part_id,
        rpc,
        timeout,
      },
      rtt: Arc::new(Mutex::new(None)),
    }
  }

  pub fn peer_descriptor(&self) -> &PeerDescriptor {
    &self.target.peer
  }

  pub fn node_id(&self) -> NodeId {
    self.target.peer.node_id
  }

  pub fn rtt(&self) -> Option<Duration> {
    *self.rtt.lock()
  }

  pub fn set_rtt(&self, rtt: Duration) {
    *self.rtt.lock() = Some(rtt);
  }

  /// Stream messages only travel over existing connections. With
  /// `buffer_while_connecting` the transport may hold the message while
  /// a connection to the neighbor is still being set up.
  pub async fn send_stream_message(
    &self,
    message: StreamMessage,
    buffer_while_connecting: bool,
  ) -> Result<(), RpcError> {
    self
      .target
      .notify(RpcNotification::StreamMessage(message), RpcOptions {
        connect: false,
        buffer_while_connecting,
      })
      .await
  }

  pub async fn leave_stream_part_notice(
    &self,
    is_entry_point: bool,
  ) -> Result<(), RpcError> {
    let notice = LeaveStreamPartNotice {
      stream_part_id: self.target.service.clone(),
      is_entry_point,
    };
    self
      .target
      .notify(
        RpcNotification::LeaveStreamPartNotice(notice),
        RpcOptions::existing_connection(),
      )
      .await
  }
}

/// Outgoing handshake calls.
///
/// Failures are never surfaced: a timeout or transport error reads as
/// a rejection.
#[derive(Debug, Clone)]
pub struct HandshakeRpcRemote {
  target: RpcTarget,
}

impl HandshakeRpcRemote {
  pub fn new(
    peer: PeerDescriptor,
    stream_part_id: StreamPartId,
    rpc: Arc<dyn RpcCommunicator>,
    timeout: Duration,
  ) -> Self {
    Self {
      target: RpcTarget {
        peer,
        service: stream_part_id,
        rpc,
        timeout,
      },
    }
  }

  pub fn peer_descriptor(&self) -> &PeerDescriptor {
    &self.target.peer
  }

  pub fn node_id(&self) -> NodeId {
    self.target.peer.node_id
  }

  pub async fn handshake(
    &self,
    neighbor_node_ids: Vec<NodeId>,
    concurrent_handshake_node_id: Option<NodeId>,
    interleave_source_id: Option<NodeId>,
  ) -> StreamPartHandshakeResponse {
    let request = RpcRequest::Handshake(StreamPartHandshakeRequest {
      stream_part_id: self.target.service.clone(),
      neighbor_node_ids,
      concurrent_handshake_node_id,
      interleave_source_id,
    });

    match self
      .target
      .request(request, RpcOptions::default(), self.target.timeout)
      .await
    {
      Ok(RpcResponse::Handshake(response)) => response,
      Ok(other) => {
        debug!(
          "unexpected handshake response from {}: {other:?}",
          self.node_id()
        );
        StreamPartHandshakeResponse::rejected()
      }
      Err(e) => {
        debug!("handshake with {} failed: {e}", self.node_id());
        StreamPartHandshakeResponse::rejected()
      }
    }
  }

  /// Asks this neighbor to replace us with `originator` in its own
  /// neighbor list. Only uses an already open connection.
  pub async fn interleave_request(
    &self,
    originator: PeerDescriptor,
    timeout: Duration,
  ) -> bool {
    let request = RpcRequest::Interleave(InterleaveRequest {
      interleave_target_descriptor: originator,
    });

    match self
      .target
      .request(request, RpcOptions::existing_connection(), timeout)
      .await
    {
      Ok(RpcResponse::Interleave(response)) => response.accepted,
      Ok(_) => false,
      Err(e) => {
        debug!("interleave request to {} failed: {e}", self.node_id());
        false
      }
    }
  }
}

/// Result of one neighbor list exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborUpdateResult {
  pub peer_descriptors: Vec<PeerDescriptor>,
  pub remove_me: bool,
}

#[derive(Debug, Clone)]
pub struct NeighborUpdateRpcRemote {
  target: RpcTarget,
}

impl NeighborUpdateRpcRemote {
  pub fn new(
    peer: PeerDescriptor,
    stream_part_id: StreamPartId,
    rpc: Arc<dyn RpcCommunicator>,
    timeout: Duration,
  ) -> Self {
    Self {
      target: RpcTarget {
        peer,
        service: stream_part_id,
        rpc,
        timeout,
      },
    }
  }

  /// Sends our neighbor list and returns the neighbor's list.
  ///
  /// A failed call is reported as `remove_me`, so that unresponsive
  /// neighbors get replaced.
  pub async fn update_neighbors(
    &self,
    neighbors: Vec<PeerDescriptor>,
  ) -> NeighborUpdateResult {
    let request = RpcRequest::NeighborUpdate(NeighborUpdate {
      stream_part_id: self.target.service.clone(),
      neighbor_descriptors: neighbors,
      remove_me: false,
    });

    match self
      .target
      .request(request, RpcOptions::default(), self.target.timeout)
      .await
    {
      Ok(RpcResponse::NeighborUpdate(response)) => NeighborUpdateResult {
        peer_descriptors: response.neighbor_descriptors,
        remove_me: response.remove_me,
      },
      Ok(_) | Err(_) => {
        debug!("neighbor update with {} failed", self.target.peer.node_id);
        NeighborUpdateResult {
          peer_descriptors: vec![],
          remove_me: true,
        }
      }
    }
  }
}

/// Plumtree control messages.
#[derive(Debug, Clone)]
pub struct PlumtreeRpcRemote {
  target: RpcTarget,
}

impl PlumtreeRpcRemote {
  pub fn new(
    peer: PeerDescriptor,
    stream_part_id: StreamPartId,
    rpc: Arc<dyn RpcCommunicator>,
    timeout: Duration,
  ) -> Self {
    Self {
      target: RpcTarget {
        peer,
        service: stream_part_id,
        rpc,
        timeout,
      },
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.target.peer.node_id
  }

  pub async fn send_metadata(&self, id: MessageId) -> Result<(), RpcError> {
    self
      .target
      .notify(RpcNotification::Metadata(id), RpcOptions::default())
      .await
  }

  pub async fn pause_neighbor(
    &self,
    message_chain_id: String,
  ) -> Result<(), RpcError> {
    self
      .target
      .notify(
        RpcNotification::PauseNeighbor(PauseNeighborRequest {
          message_chain_id,
        }),
        RpcOptions::default(),
      )
      .await
  }

  pub async fn resume_neighbor(
    &self,
    from_timestamp: u64,
    message_chain_id: String,
  ) -> Result<(), RpcError> {
    self
      .target
      .notify(
        RpcNotification::ResumeNeighbor(ResumeNeighborRequest {
          from_timestamp,
          message_chain_id,
        }),
        RpcOptions::default(),
      )
      .await
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    rpc::RpcOptions,
    testing::{message, peer, remote, MockRpc},
  };

  #[tokio::test]
  async fn deliveries_never_open_connections() {
    let rpc = MockRpc::new();
    let neighbor = peer();
    let remote = remote(&neighbor, &rpc);

    remote
      .send_stream_message(message("c", 1, None), true)
      .await
      .unwrap();
    remote
      .send_stream_message(message("c", 2, Some(1)), false)
      .await
      .unwrap();
    remote.leave_stream_part_notice(false).await.unwrap();

    assert_eq!(rpc.notify_options_to(&neighbor.node_id), vec![
      RpcOptions {
        connect: false,
        buffer_while_connecting: true,
      },
      RpcOptions {
        connect: false,
        buffer_while_connecting: false,
      },
      RpcOptions::existing_connection(),
    ]);
  }
}
