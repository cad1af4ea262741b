use {
  crate::{handshaker::Handshaker, node_list::NodeViews, wire::NodeId},
  futures::future::join,
  parking_lot::Mutex,
  std::{sync::Arc, time::Duration},
  tokio::task::JoinHandle,
  tracing::trace,
};

#[derive(Default)]
struct FinderState {
  running: bool,
  stopped: bool,
  task: Option<JoinHandle<()>>,
}

struct NeighborFinderInner {
  handshaker: Handshaker,
  views: NodeViews,
  min_count: usize,
  initial_wait: Duration,
  interval: Duration,
  state: Mutex<FinderState>,
}

/// Keeps handshaking with contacts until the neighbor target is met or
/// every known contact has been tried.
#[derive(Clone)]
pub struct NeighborFinder {
  inner: Arc<NeighborFinderInner>,
}

impl NeighborFinder {
  pub fn new(
    handshaker: Handshaker,
    views: NodeViews,
    min_count: usize,
    initial_wait: Duration,
    interval: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(NeighborFinderInner {
        handshaker,
        views,
        min_count,
        initial_wait,
        interval,
        state: Mutex::new(FinderState::default()),
      }),
    }
  }

  /// Starts looking for neighbors unless already doing so. Two find
  /// loops run side by side, each with its own exclusion list.
  pub fn start(&self, excluded: Vec<NodeId>) {
    let mut state = self.inner.state.lock();
    if state.running || state.stopped {
      return;
    }
    state.running = true;

    let inner = Arc::clone(&self.inner);
    state.task = Some(tokio::spawn(async move {
      tokio::time::sleep(inner.initial_wait).await;
      join(
        find_loop(Arc::clone(&inner), excluded.clone()),
        find_loop(Arc::clone(&inner), excluded),
      )
      .await;

      let mut state = inner.state.lock();
      state.running = false;
      state.task = None;
    }));
  }

  pub fn is_running(&self) -> bool {
    self.inner.state.lock().running
  }

  /// Aborts the find loops for good, in-flight handshakes included.
  pub fn stop(&self) {
    let mut state = self.inner.state.lock();
    state.stopped = true;
    state.running = false;
    if let Some(task) = state.task.take() {
      task.abort();
    }
  }
}

async fn find_loop(inner: Arc<NeighborFinderInner>, mut excluded: Vec<NodeId>) {
  loop {
    excluded = inner
      .handshaker
      .attempt_handshakes_on_contacts(excluded)
      .await;

    let neighbors = inner.views.neighbors.size();
    let contacts = inner.views.unique_contact_count();
    if neighbors >= inner.min_count || excluded.len() >= contacts {
      trace!(
        "neighbor search done with {neighbors} neighbors, {} of {contacts} \
         contacts excluded",
        excluded.len()
      );
      return;
    }
    tokio::time::sleep(inner.interval).await;
  }
}
