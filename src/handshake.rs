//! Answers handshake and interleave requests from other nodes.

use {
  crate::{
    handshaker::{Handshaker, OngoingHandshakes},
    node_list::NodeList,
    remote::HandshakeRpcRemote,
    rpc::{CallContext, RpcCommunicator},
    wire::{
      InterleaveRequest,
      InterleaveResponse,
      NodeId,
      PeerDescriptor,
      StreamPartHandshakeRequest,
      StreamPartHandshakeResponse,
      StreamPartId,
    },
  },
  metrics::increment_counter,
  parking_lot::Mutex,
  std::{collections::HashSet, sync::Arc, time::Duration},
  tracing::{debug, warn},
};

struct HandshakeRpcLocalInner {
  stream_part_id: StreamPartId,
  neighbors: NodeList,
  ongoing: OngoingHandshakes,
  /// Neighbors we asked to hand over to someone else, not settled yet.
  ongoing_interleaves: Mutex<HashSet<NodeId>>,
  max_neighbor_count: usize,
  handshaker: Handshaker,
  rpc: Arc<dyn RpcCommunicator>,
  rpc_request_timeout: Duration,
  interleave_request_timeout: Duration,
}

#[derive(Clone)]
pub struct HandshakeRpcLocal {
  inner: Arc<HandshakeRpcLocalInner>,
}

pub struct HandshakeRpcLocalOptions {
  pub stream_part_id: StreamPartId,
  pub neighbors: NodeList,
  pub ongoing: OngoingHandshakes,
  pub max_neighbor_count: usize,
  pub handshaker: Handshaker,
  pub rpc: Arc<dyn RpcCommunicator>,
  pub rpc_request_timeout: Duration,
  pub interleave_request_timeout: Duration,
}

impl HandshakeRpcLocal {
  pub fn new(options: HandshakeRpcLocalOptions) -> Self {
    Self {
      inner: Arc::new(HandshakeRpcLocalInner {
        stream_part_id: options.stream_part_id,
        neighbors: options.neighbors,
        ongoing: options.ongoing,
        ongoing_interleaves: Mutex::new(HashSet::new()),
        max_neighbor_count: options.max_neighbor_count,
        handshaker: options.handshaker,
        rpc: options.rpc,
        rpc_request_timeout: options.rpc_request_timeout,
        interleave_request_timeout: options.interleave_request_timeout,
      }),
    }
  }

  /// Decides on an incoming handshake:
  ///
  /// - reject nodes we are currently interleaving away,
  /// - accept nodes that are already neighbors or mid-handshake with us,
  /// - accept while below the neighbor target,
  /// - when full, accept and hand one of our neighbors over to the
  ///   requester, provided enough neighbors remain,
  /// - otherwise reject.
  pub fn handshake(
    &self,
    request: StreamPartHandshakeRequest,
    context: &CallContext,
  ) -> StreamPartHandshakeResponse {
    let inner = &self.inner;
    let sender = &context.incoming_source;
    let sender_id = sender.node_id;

    if request.stream_part_id != inner.stream_part_id {
      warn!(
        "handshake from {sender_id:?} for {} arrived on {}",
        request.stream_part_id, inner.stream_part_id
      );
      return StreamPartHandshakeResponse::rejected();
    }

    let interleaving = inner.ongoing_interleaves.lock().len();
    let source_excluded: Vec<NodeId> =
      request.interleave_source_id.into_iter().collect();

    let response = if inner.ongoing_interleaves.lock().contains(&sender_id) {
      StreamPartHandshakeResponse::rejected()
    } else if inner.neighbors.has(&sender_id)
      || inner.ongoing.contains(&sender_id)
    {
      self.accept(sender)
    } else if inner.neighbors.size() + inner.ongoing.len()
      < inner.max_neighbor_count
    {
      self.accept(sender)
    } else if inner.neighbors.size_excluding(&source_excluded)
      >= interleaving + 2
      && inner.neighbors.size() <= inner.max_neighbor_count
    {
      self.accept_with_interleaving(request, sender)
    } else {
      StreamPartHandshakeResponse::rejected()
    };

    if response.accepted {
      increment_counter!("handshakes_answered", "outcome" => "accepted");
    } else {
      increment_counter!("handshakes_answered", "outcome" => "rejected");
    }
    response
  }

  /// A neighbor asks us to replace it with the given node.
  ///
  /// We only drop the asking neighbor once the handshake with its
  /// replacement succeeded.
  pub async fn interleave_request(
    &self,
    request: InterleaveRequest,
    context: &CallContext,
  ) -> InterleaveResponse {
    let sender_id = context.source_id();
    let accepted = self
      .inner
      .handshaker
      .handshake_with_interleaving(
        request.interleave_target_descriptor,
        sender_id,
      )
      .await;

    if accepted {
      debug!(
        "{}: replaced {sender_id:?} through interleaving",
        self.inner.stream_part_id
      );
      self.inner.neighbors.remove(&sender_id);
    }
    InterleaveResponse { accepted }
  }

  fn accept(&self, sender: &PeerDescriptor) -> StreamPartHandshakeResponse {
    self
      .inner
      .neighbors
      .add(self.inner.handshaker.delivery_remote(sender));
    StreamPartHandshakeResponse::accepted()
  }

  fn accept_with_interleaving(
    &self,
    request: StreamPartHandshakeRequest,
    sender: &PeerDescriptor,
  ) -> StreamPartHandshakeResponse {
    let inner = &self.inner;
    let mut exclude = request.neighbor_node_ids;
    exclude.push(sender.node_id);
    exclude.extend(request.interleave_source_id);

    let Some(handed_over) = inner.neighbors.last(&exclude, false) else {
      return self.accept(sender);
    };
    let handed_over_id = handed_over.node_id();
    inner.ongoing_interleaves.lock().insert(handed_over_id);

    let remote = HandshakeRpcRemote::new(
      handed_over.peer_descriptor().clone(),
      inner.stream_part_id.clone(),
      Arc::clone(&inner.rpc),
      inner.rpc_request_timeout,
    );
    let this = self.clone();
    let requester = sender.clone();
    tokio::spawn(async move {
      let timeout = this.inner.interleave_request_timeout;
      if remote.interleave_request(requester, timeout).await {
        this.inner.neighbors.remove(&handed_over_id);
      }
      this.inner.ongoing_interleaves.lock().remove(&handed_over_id);
    });

    self.accept(sender);
    StreamPartHandshakeResponse {
      accepted: true,
      interleave_target_descriptor: Some(handed_over.peer_descriptor().clone()),
    }
  }
}
