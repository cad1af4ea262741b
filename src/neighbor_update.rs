//! Periodic exchange of neighbor lists.
//!
//! Both sides learn new nearby contacts from each other, and a side with
//! too many neighbors can ask a well connected neighbor to drop it.

use {
  crate::{
    handshaker::OngoingHandshakes,
    neighbor_finder::NeighborFinder,
    node_list::NodeViews,
    remote::{ContentDeliveryRpcRemote, NeighborUpdateRpcRemote},
    rpc::{CallContext, RpcCommunicator},
    wire::{NeighborUpdate, NodeId, PeerDescriptor, StreamPartId},
  },
  futures::future::join_all,
  metrics::gauge,
  parking_lot::Mutex,
  std::{sync::Arc, time::Duration},
  tokio::{task::JoinHandle, time::Instant},
  tracing::{debug, trace},
};

/// Everything both sides of the exchange need to reach the views.
#[derive(Clone)]
pub struct NeighborUpdateContext {
  pub local_peer_descriptor: PeerDescriptor,
  pub stream_part_id: StreamPartId,
  pub views: NodeViews,
  pub finder: NeighborFinder,
  pub ongoing: OngoingHandshakes,
  pub rpc: Arc<dyn RpcCommunicator>,
  pub neighbor_target_count: usize,
  pub rpc_request_timeout: Duration,
}

impl NeighborUpdateContext {
  fn own_id(&self) -> NodeId {
    self.local_peer_descriptor.node_id
  }

  fn delivery_remote(&self, peer: PeerDescriptor) -> ContentDeliveryRpcRemote {
    ContentDeliveryRpcRemote::new(
      peer,
      self.stream_part_id.clone(),
      Arc::clone(&self.rpc),
      self.rpc_request_timeout,
    )
  }

  fn update_remote(&self, peer: PeerDescriptor) -> NeighborUpdateRpcRemote {
    NeighborUpdateRpcRemote::new(
      peer,
      self.stream_part_id.clone(),
      Arc::clone(&self.rpc),
      self.rpc_request_timeout,
    )
  }

  fn learn_contacts(&self, descriptors: Vec<PeerDescriptor>) {
    let own_id = self.own_id();
    for descriptor in descriptors {
      if descriptor.node_id != own_id
        && !self.views.neighbors.has(&descriptor.node_id)
      {
        self.views.nearby.add(self.delivery_remote(descriptor));
      }
    }
  }
}

/// Sends our neighbor list to every neighbor on a fixed interval.
pub struct NeighborUpdateManager {
  context: NeighborUpdateContext,
  interval: Duration,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl NeighborUpdateManager {
  pub fn new(context: NeighborUpdateContext, interval: Duration) -> Self {
    Self {
      context,
      interval,
      task: Mutex::new(None),
    }
  }

  pub fn start(&self) {
    let mut task = self.task.lock();
    if task.is_some() {
      return;
    }

    let context = self.context.clone();
    let period = self.interval;
    *task = Some(tokio::spawn(async move {
      let mut ticks = tokio::time::interval(period);
      ticks.tick().await; // the first tick completes immediately
      loop {
        ticks.tick().await;
        update_neighbor_info(&context).await;
        report_view_sizes(&context);
      }
    }));
  }

  pub fn stop(&self) {
    if let Some(task) = self.task.lock().take() {
      task.abort();
    }
  }
}

async fn update_neighbor_info(context: &NeighborUpdateContext) {
  let neighbors = context.views.neighbors.all();
  trace!(
    "{}: updating neighbor info with {} neighbors",
    context.stream_part_id,
    neighbors.len()
  );

  let descriptors = context.views.neighbors.peer_descriptors();
  let started = Instant::now();
  join_all(neighbors.into_iter().map(|neighbor| {
    let descriptors = descriptors.clone();
    async move {
      let id = neighbor.node_id();
      let result = context
        .update_remote(neighbor.peer_descriptor().clone())
        .update_neighbors(descriptors)
        .await;

      if result.remove_me {
        debug!("{}: neighbor {id:?} asked to be removed", context.stream_part_id);
        context.views.neighbors.remove(&id);
        context.finder.start(vec![id]);
      } else if let Some(current) = context.views.neighbors.get(&id) {
        current.set_rtt(started.elapsed());
        context.learn_contacts(result.peer_descriptors);
      }
    }
  }))
  .await;
}

fn report_view_sizes(context: &NeighborUpdateContext) {
  let views = &context.views;
  gauge!("neighbor_count", views.neighbors.size() as f64);
  gauge!("nearby_view_size", views.nearby.size() as f64);
  gauge!("random_view_size", views.random.size() as f64);
  gauge!("ongoing_handshakes", context.ongoing.len() as f64);
}

/// Answers neighbor updates sent by other nodes.
#[derive(Clone)]
pub struct NeighborUpdateRpcLocal {
  context: NeighborUpdateContext,
}

impl NeighborUpdateRpcLocal {
  pub fn new(context: NeighborUpdateContext) -> Self {
    Self { context }
  }

  pub fn neighbor_update(
    &self,
    update: NeighborUpdate,
    call: &CallContext,
  ) -> NeighborUpdate {
    let context = &self.context;
    let sender = call.source_id();
    let reported = update.neighbor_descriptors.len();
    context.learn_contacts(update.neighbor_descriptors);

    let remove_me = if !context.views.neighbors.has(&sender)
      && !context.ongoing.contains(&sender)
    {
      true
    } else if context.views.neighbors.size() > context.neighbor_target_count
      && reported > context.neighbor_target_count
    {
      debug!(
        "{}: dropping {sender:?}, both sides are over the neighbor target",
        context.stream_part_id
      );
      context.views.neighbors.remove(&sender);
      context.finder.start(vec![sender]);
      true
    } else {
      false
    };

    NeighborUpdate {
      stream_part_id: context.stream_part_id.clone(),
      neighbor_descriptors: context.views.neighbors.peer_descriptors(),
      remove_me,
    }
  }
}
