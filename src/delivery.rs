//! Receive path of stream messages and the two ways of passing them on.

use {
  crate::{
    duplicates::DuplicateDetectors,
    inspect::Inspector,
    node_list::NodeList,
    plumtree::PlumtreeManager,
    propagation::{Error, Propagation, SendToNeighbor},
    proxy::ProxyConnections,
    rpc::CallContext,
    wire::{LeaveStreamPartNotice, NodeId, StreamMessage, StreamPartId},
  },
  async_trait::async_trait,
  metrics::increment_counter,
  parking_lot::Mutex,
  std::sync::Arc,
  tokio::sync::mpsc::UnboundedSender,
  tracing::{debug, trace, warn},
};

/// Resolves propagation targets among neighbors first, then proxied
/// clients.
pub(crate) struct NeighborResolver {
  pub neighbors: NodeList,
  pub proxies: ProxyConnections,
  pub buffer_while_connecting: bool,
}

#[async_trait]
impl SendToNeighbor for NeighborResolver {
  async fn send_to_neighbor(
    &self,
    neighbor: &NodeId,
    message: StreamMessage,
  ) -> Result<(), Error> {
    let remote = match self.neighbors.get(neighbor) {
      Some(remote) => remote,
      None => match self.proxies.get_connection(neighbor) {
        Some(connection) => connection.remote,
        None => {
          increment_counter!("propagation_target_missing");
          return Err(Error::TargetNotFound(*neighbor));
        }
      },
    };
    remote
      .send_stream_message(message, self.buffer_while_connecting)
      .await?;
    Ok(())
  }
}

/// Eager push of every new message to all neighbors and subscribed
/// proxy clients.
#[derive(Clone)]
pub struct Fanout {
  pub(crate) propagation: Propagation,
  pub(crate) neighbors: NodeList,
  pub(crate) proxies: ProxyConnections,
  pub(crate) deliver: UnboundedSender<StreamMessage>,
}

impl Fanout {
  pub fn broadcast(&self, message: StreamMessage, previous: Option<NodeId>) {
    let _ = self.deliver.send(message.clone());
    let mut targets = self.neighbors.ids();
    targets.extend(self.proxies.propagation_targets());
    self.propagation.feed_unseen_message(message, &targets, previous);
  }

  /// Pushes the message to subscribed proxy clients only.
  pub fn broadcast_to_proxies(
    &self,
    message: StreamMessage,
    previous: Option<NodeId>,
  ) {
    let targets = self.proxies.propagation_targets();
    if !targets.is_empty() {
      self.propagation.feed_unseen_message(message, &targets, previous);
    }
  }
}

/// How a stream part passes new messages on.
#[derive(Clone)]
pub enum Delivery {
  /// Every neighbor gets every message.
  Eager(Fanout),

  /// Neighbors may be paused per chain. Proxied clients are not part
  /// of the broadcast tree and always get full messages.
  Plumtree {
    manager: PlumtreeManager,
    fanout: Fanout,
  },
}

impl Delivery {
  /// Delivers locally and forwards to everyone except `previous`.
  pub fn broadcast(&self, message: StreamMessage, previous: Option<NodeId>) {
    match self {
      Delivery::Eager(fanout) => fanout.broadcast(message, previous),
      Delivery::Plumtree { manager, fanout } => {
        fanout.broadcast_to_proxies(message.clone(), previous);
        manager.broadcast(message, previous.as_ref());
      }
    }
  }

  pub fn plumtree(&self) -> Option<&PlumtreeManager> {
    match self {
      Delivery::Eager(_) => None,
      Delivery::Plumtree { manager, .. } => Some(manager),
    }
  }

  pub fn propagation(&self) -> &Propagation {
    match self {
      Delivery::Eager(fanout) | Delivery::Plumtree { fanout, .. } => {
        &fanout.propagation
      }
    }
  }

  pub fn stop(&self) {
    if let Delivery::Plumtree { manager, .. } = self {
      manager.stop();
    }
  }
}

/// A node announced that it leaves a stream part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveNotice {
  pub node_id: NodeId,
  pub is_entry_point: bool,
}

/// Handles stream messages and leave notices sent to us.
pub struct ContentDeliveryRpcLocal {
  stream_part_id: StreamPartId,
  delivery: Delivery,
  duplicates: Mutex<DuplicateDetectors>,
  inspector: Arc<dyn Inspector>,
  leave_notices: UnboundedSender<LeaveNotice>,
}

impl ContentDeliveryRpcLocal {
  pub fn new(
    stream_part_id: StreamPartId,
    delivery: Delivery,
    inspector: Arc<dyn Inspector>,
    leave_notices: UnboundedSender<LeaveNotice>,
  ) -> Self {
    Self {
      stream_part_id,
      delivery,
      duplicates: Mutex::new(DuplicateDetectors::default()),
      inspector,
      leave_notices,
    }
  }

  pub fn delivery(&self) -> &Delivery {
    &self.delivery
  }

  /// Publishes a message originating from this node.
  pub fn publish(&self, message: StreamMessage) {
    match self.duplicates.lock().mark_and_check(&message) {
      Ok(true) => self.delivery.broadcast(message, None),
      Ok(false) => {
        debug!("not publishing already seen message {:?}", message.message_id)
      }
      Err(e) => warn!("not publishing {:?}: {e}", message.message_id),
    }
  }

  /// New messages are passed on. With plumtree a duplicate means the
  /// sender is a redundant path for the chain and gets paused.
  pub async fn send_stream_message(
    &self,
    message: StreamMessage,
    context: &CallContext,
  ) {
    let sender = context.source_id();
    self.inspector.mark_message(&sender, &message.message_id);
    let fresh = match self.duplicates.lock().mark_and_check(&message) {
      Ok(fresh) => fresh,
      Err(e) => {
        warn!("dropping {:?} from {sender:?}: {e}", message.message_id);
        return;
      }
    };

    match (&self.delivery, fresh) {
      (_, true) => self.delivery.broadcast(message, Some(sender)),
      (Delivery::Eager(_), false) => {
        trace!("dropping duplicate {:?}", message.message_id);
      }
      (Delivery::Plumtree { manager, .. }, false) => {
        manager
          .pause_neighbor(&context.incoming_source, message.message_chain_id())
          .await;
      }
    }
  }

  pub fn leave_stream_part_notice(
    &self,
    notice: LeaveStreamPartNotice,
    context: &CallContext,
  ) {
    if notice.stream_part_id != self.stream_part_id {
      return;
    }
    let _ = self.leave_notices.send(LeaveNotice {
      node_id: context.source_id(),
      is_entry_point: notice.is_entry_point,
    });
  }

  pub fn stop(&self) {
    self.duplicates.lock().clear();
    self.delivery.stop();
    self.inspector.stop();
  }
}
