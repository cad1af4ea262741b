//! Seam between the overlay and the injected RPC transport.
//!
//! The overlay never opens connections itself. All outgoing calls go
//! through an [`RpcCommunicator`] supplied by the embedding node, and all
//! incoming calls are handed to [`crate::Network`] together with a
//! [`CallContext`] naming the transport-verified caller.

use {
  crate::wire::{
    InterleaveRequest,
    InterleaveResponse,
    LeaveStreamPartNotice,
    MessageId,
    NeighborUpdate,
    NodeId,
    PauseNeighborRequest,
    PeerDescriptor,
    ProxyConnectionRequest,
    ProxyConnectionResponse,
    ResumeNeighborRequest,
    StreamMessage,
    StreamPartHandshakeRequest,
    StreamPartHandshakeResponse,
    StreamPartId,
  },
  async_trait::async_trait,
  serde::{Deserialize, Serialize},
  std::{future::Future, time::Duration},
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum RpcError {
  #[error("RPC call timed out")]
  Timeout,

  #[error("Peer {0} is unreachable")]
  Unreachable(NodeId),

  #[error("Unexpected response type from peer")]
  UnexpectedResponse,

  #[error("Transport error: {0}")]
  Transport(String),
}

/// Calls that expect an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
  Handshake(StreamPartHandshakeRequest),
  Interleave(InterleaveRequest),
  NeighborUpdate(NeighborUpdate),
  ProxyConnection(ProxyConnectionRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
  Handshake(StreamPartHandshakeResponse),
  Interleave(InterleaveResponse),
  NeighborUpdate(NeighborUpdate),
  ProxyConnection(ProxyConnectionResponse),
}

/// Fire-and-forget calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcNotification {
  StreamMessage(StreamMessage),
  LeaveStreamPartNotice(LeaveStreamPartNotice),
  Metadata(MessageId),
  PauseNeighbor(PauseNeighborRequest),
  ResumeNeighbor(ResumeNeighborRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
  /// Whether the transport may open a new connection to reach the
  /// target. When false the call only succeeds over an existing one.
  pub connect: bool,

  /// Hint that the transport may hold the call while a connection to
  /// the target is still being set up, instead of failing it.
  pub buffer_while_connecting: bool,
}

impl RpcOptions {
  /// Only over an already open connection.
  pub fn existing_connection() -> Self {
    Self {
      connect: false,
      buffer_while_connecting: false,
    }
  }
}

impl Default for RpcOptions {
  fn default() -> Self {
    Self {
      connect: true,
      buffer_while_connecting: false,
    }
  }
}

/// Metadata of an incoming call, filled in by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
  /// The authenticated caller.
  pub incoming_source: PeerDescriptor,
}

impl CallContext {
  pub fn new(incoming_source: PeerDescriptor) -> Self {
    Self { incoming_source }
  }

  pub fn source_id(&self) -> NodeId {
    self.incoming_source.node_id
  }
}

/// Outgoing side of the transport. Every call is addressed to one peer
/// and one stream part, the stream part acting as the service name.
#[async_trait]
pub trait RpcCommunicator: Send + Sync + 'static {
  async fn request(
    &self,
    target: &PeerDescriptor,
    service: &StreamPartId,
    request: RpcRequest,
    options: RpcOptions,
  ) -> Result<RpcResponse, RpcError>;

  async fn notify(
    &self,
    target: &PeerDescriptor,
    service: &StreamPartId,
    notification: RpcNotification,
    options: RpcOptions,
  ) -> Result<(), RpcError>;
}

/// Bounds an RPC future by `limit`.
pub(crate) async fn with_timeout<T>(
  limit: Duration,
  call: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
  match tokio::time::timeout(limit, call).await {
    Ok(result) => result,
    Err(_) => Err(RpcError::Timeout),
  }
}
