use {crate::plumtree::MAX_PAUSED_NEIGHBORS_DEFAULT, std::time::Duration};

/// Node wide configuration applied to every joined stream part.
#[derive(Debug, Clone)]
pub struct Config {
  /// Capacity of every node list (neighbors, left, right, nearby and
  /// random views). Additions beyond this are ignored.
  pub max_contact_count: usize,

  /// Number of neighbors the node tries to maintain per stream part.
  ///
  /// Handshakes beyond this are answered by interleaving: the receiver
  /// hands one of its neighbors over to the requester.
  pub neighbor_target_count: usize,

  /// Whether light clients may use this node as their proxy into
  /// a stream part.
  pub accept_proxy_connections: bool,

  /// How often neighbor lists are exchanged with every neighbor.
  pub neighbor_update_interval: Duration,

  /// A message stays in the propagation buffer until it has been
  /// delivered to at least this many targets.
  pub min_propagation_targets: usize,

  /// Maximum number of messages kept in the propagation buffer.
  pub max_propagation_buffer_size: usize,

  /// How long an undelivered message stays in the propagation buffer
  /// waiting for new neighbors.
  pub propagation_buffer_ttl: Duration,

  /// Switches message delivery from eager flooding to the plumtree
  /// push/lazy-push protocol.
  pub plumtree_optimization: bool,

  /// Upper bound on neighbors this node pauses per message chain.
  pub plumtree_max_paused_neighbors: usize,

  /// Number of metadata notifications ahead of the latest received
  /// message that trigger resuming the notifying neighbor.
  pub plumtree_resume_threshold: usize,

  /// Per chain ring buffer of recent messages replayed to resumed
  /// neighbors.
  pub plumtree_latest_messages: usize,

  /// When set, outgoing messages to neighbors that are still being
  /// connected are queued by the transport instead of failing.
  pub buffer_while_connecting: bool,

  /// Timeout of handshake, neighbor update and other RPC requests.
  pub rpc_request_timeout: Duration,

  /// Timeout of interleave requests, which wait for a nested handshake.
  pub interleave_request_timeout: Duration,

  /// How many nearby contacts are requested from the discovery layer.
  pub node_view_size: usize,

  /// How many random contacts are requested from the discovery layer.
  pub random_node_view_size: usize,

  /// Delay between joining a stream part and the first neighbor search.
  pub neighbor_finder_initial_wait: Duration,

  /// Pause between neighbor search rounds while below target.
  pub neighbor_finder_interval: Duration,
}

impl Config {
  /// Upper bound on neighbors plus handshakes in flight. Incoming
  /// handshakes beyond it are interleaved or rejected.
  pub fn max_neighbor_count(&self) -> usize {
    self.neighbor_target_count
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_contact_count: 20,
      neighbor_target_count: 4,
      accept_proxy_connections: false,
      neighbor_update_interval: Duration::from_secs(10),
      min_propagation_targets: 2,
      max_propagation_buffer_size: 150,
      propagation_buffer_ttl: Duration::from_secs(10),
      plumtree_optimization: false,
      plumtree_max_paused_neighbors: MAX_PAUSED_NEIGHBORS_DEFAULT,
      plumtree_resume_threshold: 2,
      plumtree_latest_messages: 20,
      buffer_while_connecting: false,
      rpc_request_timeout: Duration::from_secs(5),
      interleave_request_timeout: Duration::from_secs(10),
      node_view_size: 20,
      random_node_view_size: 20,
      neighbor_finder_initial_wait: Duration::from_millis(100),
      neighbor_finder_interval: Duration::from_millis(250),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Config;

  #[test]
  fn neighbor_cap_follows_the_target() {
    let config = Config {
      neighbor_target_count: 7,
      ..Config::default()
    };
    assert_eq!(config.max_neighbor_count(), 7);
    assert_eq!(Config::default().max_neighbor_count(), 4);
  }
}
