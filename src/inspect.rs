use crate::wire::{MessageId, NodeId};

/// Observes every stream message received from the network, before
/// duplicate detection.
pub trait Inspector: Send + Sync + 'static {
  fn mark_message(&self, sender: &NodeId, message_id: &MessageId);

  fn stop(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInspector;

impl Inspector for NoopInspector {
  fn mark_message(&self, _: &NodeId, _: &MessageId) {}
}
