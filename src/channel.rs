use {
  std::{
    fmt::Debug,
    task::{Context, Poll},
  },
  tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

/// FIFO queue used in async streams.
///
/// Messages delivered to a stream part are queued here until the
/// application polls them, waking the consumer through its Waker.
pub struct Channel<T: Send + Sync + Debug> {
  tx: UnboundedSender<T>,
  rx: UnboundedReceiver<T>,
}

impl<T: Send + Sync + Debug> Channel<T> {
  pub fn new() -> Self {
    let (tx, rx) = unbounded_channel();
    Self { tx, rx }
  }

  pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
    self.rx.poll_recv(cx)
  }

  pub fn sender(&self) -> UnboundedSender<T> {
    self.tx.clone()
  }
}

impl<T: Send + Sync + Debug> Default for Channel<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Fan-out of events to any number of subscribers.
///
/// Subscribers that dropped their receiving end are forgotten on the
/// next emit.
#[derive(Debug)]
pub struct Listeners<T: Clone> {
  senders: Vec<UnboundedSender<T>>,
}

impl<T: Clone> Listeners<T> {
  pub fn new() -> Self {
    Self {
      senders: Vec::new(),
    }
  }

  pub fn subscribe(&mut self) -> UnboundedReceiver<T> {
    let (tx, rx) = unbounded_channel();
    self.senders.push(tx);
    rx
  }

  pub fn emit(&mut self, event: T) {
    self.senders.retain(|tx| tx.send(event.clone()).is_ok());
  }

  /// Detaches all subscribers. Their receivers yield whatever is still
  /// queued and then end.
  pub fn clear(&mut self) {
    self.senders.clear();
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.senders.len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.senders.is_empty()
  }
}

impl<T: Clone> Default for Listeners<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::Listeners;

  #[test]
  fn emits_to_every_subscriber() {
    let mut listeners = Listeners::new();
    let mut first = listeners.subscribe();
    let mut second = listeners.subscribe();
    listeners.emit(7u32);

    assert_eq!(first.try_recv().ok(), Some(7));
    assert_eq!(second.try_recv().ok(), Some(7));
  }

  #[test]
  fn forgets_dropped_subscribers() {
    let mut listeners = Listeners::new();
    let kept = listeners.subscribe();
    drop(listeners.subscribe());
    listeners.emit(1u32);

    assert_eq!(listeners.len(), 1);
    drop(kept);
    listeners.emit(2);
    assert!(listeners.is_empty());
  }

  #[test]
  fn clear_ends_receivers_after_draining() {
    let mut listeners = Listeners::new();
    let mut rx = listeners.subscribe();
    listeners.emit(1u32);
    listeners.clear();

    assert_eq!(rx.try_recv().ok(), Some(1));
    assert!(matches!(
      rx.try_recv(),
      Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
  }
}
