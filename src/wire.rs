//! Data model and RPC payloads of the content delivery overlay.
//!
//! Every type here is plain data with serde support so that the injected
//! RPC communicator can carry it over whatever encoding it uses.

use {
  bytes::Bytes,
  libp2p_identity::PeerId,
  multiaddr::Multiaddr,
  serde::{Deserialize, Serialize},
  std::fmt,
};

/// Identity of a node in the overlay.
///
/// Derived from the node's public key by the DHT layer, used as the key
/// of every neighbor collection in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(PeerId);

impl NodeId {
  /// A random identity, used mostly by tests and simulations.
  pub fn random() -> Self {
    Self(PeerId::random())
  }

  pub fn peer_id(&self) -> &PeerId {
    &self.0
  }
}

impl From<PeerId> for NodeId {
  fn from(value: PeerId) -> Self {
    Self(value)
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Debug for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "NodeId({})", self.0)
  }
}

/// Connectivity description of a remote node.
///
/// Owned by the DHT layer. This crate only compares and forwards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
  /// Identity of the described node.
  pub node_id: NodeId,

  /// Address of a publicly reachable WebSocket server run by the node.
  ///
  /// Nodes with this address can be dialed directly without NAT
  /// traversal, which makes them good first contacts for nodes that
  /// have no neighbors yet.
  pub websocket: Option<Multiaddr>,
}

impl PeerDescriptor {
  pub fn new(node_id: NodeId) -> Self {
    Self {
      node_id,
      websocket: None,
    }
  }

  pub fn with_websocket(mut self, addr: Multiaddr) -> Self {
    self.websocket = Some(addr);
    self
  }

  pub fn is_websocket_reachable(&self) -> bool {
    self.websocket.is_some()
  }
}

/// Identifies one partition of a stream, formatted `<stream id>#<partition>`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StreamPartId(String);

impl StreamPartId {
  pub fn new(stream_id: &str, partition: u32) -> Self {
    Self(format!("{stream_id}#{partition}"))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for StreamPartId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Position of a message within its message chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
  pub timestamp: u64,
  pub sequence_number: u32,
}

/// Globally unique identity of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
  pub stream_id: String,
  pub stream_partition: u32,
  pub timestamp: u64,
  pub sequence_number: u32,
  pub publisher_id: String,
  pub message_chain_id: String,
}

impl MessageId {
  pub fn stream_part_id(&self) -> StreamPartId {
    StreamPartId::new(&self.stream_id, self.stream_partition)
  }

  pub fn message_ref(&self) -> MessageRef {
    MessageRef {
      timestamp: self.timestamp,
      sequence_number: self.sequence_number,
    }
  }
}

/// A published message travelling through the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
  pub message_id: MessageId,

  /// Reference to the preceding message in the same chain, used for
  /// duplicate detection and gap tracking.
  pub previous_message_ref: Option<MessageRef>,

  /// Opaque payload. Encryption and signing are handled by upper layers.
  pub content: Bytes,

  pub signature: Bytes,
}

impl StreamMessage {
  pub fn message_chain_id(&self) -> &str {
    &self.message_id.message_chain_id
  }

  pub fn timestamp(&self) -> u64 {
    self.message_id.timestamp
  }
}

/// Sent by a node that wants to become our neighbor on a stream part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPartHandshakeRequest {
  pub stream_part_id: StreamPartId,

  /// Current neighbors of the requester.
  pub neighbor_node_ids: Vec<NodeId>,

  /// Another node the requester is handshaking with at the same time.
  pub concurrent_handshake_node_id: Option<NodeId>,

  /// Set when this handshake was triggered by an interleave: the node
  /// that redirected the requester here.
  pub interleave_source_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPartHandshakeResponse {
  pub accepted: bool,

  /// A full receiver hands one of its own neighbors over to the
  /// requester and names it here.
  pub interleave_target_descriptor: Option<PeerDescriptor>,
}

impl StreamPartHandshakeResponse {
  pub fn rejected() -> Self {
    Self {
      accepted: false,
      interleave_target_descriptor: None,
    }
  }

  pub fn accepted() -> Self {
    Self {
      accepted: true,
      interleave_target_descriptor: None,
    }
  }
}

/// Asks a neighbor to replace us with `interleave_target_descriptor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterleaveRequest {
  pub interleave_target_descriptor: PeerDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterleaveResponse {
  pub accepted: bool,
}

/// Sent to all neighbors when a node leaves a stream part gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveStreamPartNotice {
  pub stream_part_id: StreamPartId,
  pub is_entry_point: bool,
}

/// Asks a neighbor to stop pushing full messages of a chain to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseNeighborRequest {
  pub message_chain_id: String,
}

/// Asks a neighbor to push a chain to us again, starting after
/// `from_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeNeighborRequest {
  pub from_timestamp: u64,
  pub message_chain_id: String,
}

/// Periodic exchange of neighbor lists between neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborUpdate {
  pub stream_part_id: StreamPartId,
  pub neighbor_descriptors: Vec<PeerDescriptor>,

  /// Set in responses when the responder dropped the requester.
  pub remove_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyDirection {
  /// The proxied client only publishes through us.
  Publish,

  /// The proxied client receives every message of the stream part from us.
  Subscribe,
}

/// Sent by a light client that wants to use this node as its proxy
/// into the stream part instead of joining the overlay itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionRequest {
  pub direction: ProxyDirection,
  pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionResponse {
  pub accepted: bool,
}
