//! Contacts supplied by the peer discovery layer underneath the overlay.

use {
  crate::{
    channel::Listeners,
    wire::{NodeId, PeerDescriptor},
  },
  parking_lot::Mutex,
  rand::seq::SliceRandom,
  tokio::sync::mpsc::UnboundedReceiver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
  NearbyContactAdded,
  NearbyContactRemoved,
  RandomContactAdded,
  RandomContactRemoved,
  RingContactAdded,
  RingContactRemoved,
}

/// Closest ring contacts on either side of us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingContacts {
  pub left: Vec<PeerDescriptor>,
  pub right: Vec<PeerDescriptor>,
}

/// Per stream part view of the discovery layer.
///
/// Lookups are answered from local state. Changes to that state are
/// announced through [`DiscoveryEvent`]s, after which the overlay reads
/// the contacts again.
pub trait DiscoveryLayer: Send + Sync + 'static {
  fn closest_contacts(&self) -> Vec<PeerDescriptor>;

  /// Nodes the discovery layer is directly connected to.
  fn dht_neighbors(&self) -> Vec<PeerDescriptor>;

  fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor>;

  fn ring_contacts(&self) -> RingContacts;

  fn remove_contact(&self, id: &NodeId);

  fn subscribe(&self) -> UnboundedReceiver<DiscoveryEvent>;
}

#[derive(Default)]
struct StaticState {
  contacts: Vec<PeerDescriptor>,
  ring: RingContacts,
  listeners: Listeners<DiscoveryEvent>,
}

/// Discovery layer over a fixed, manually maintained set of contacts.
///
/// Every contact is both a nearby and a random contact. Useful for small
/// deployments with known entry points and for tests.
#[derive(Default)]
pub struct StaticDiscovery {
  state: Mutex<StaticState>,
}

impl StaticDiscovery {
  pub fn new(contacts: Vec<PeerDescriptor>) -> Self {
    Self {
      state: Mutex::new(StaticState {
        contacts,
        ..Default::default()
      }),
    }
  }

  pub fn add_contact(&self, contact: PeerDescriptor) {
    let mut state = self.state.lock();
    if state.contacts.iter().any(|c| c.node_id == contact.node_id) {
      return;
    }
    state.contacts.push(contact);
    state.listeners.emit(DiscoveryEvent::NearbyContactAdded);
    state.listeners.emit(DiscoveryEvent::RandomContactAdded);
  }

  pub fn set_ring_contacts(&self, ring: RingContacts) {
    let mut state = self.state.lock();
    state.ring = ring;
    state.listeners.emit(DiscoveryEvent::RingContactAdded);
  }
}

impl DiscoveryLayer for StaticDiscovery {
  fn closest_contacts(&self) -> Vec<PeerDescriptor> {
    self.state.lock().contacts.clone()
  }

  fn dht_neighbors(&self) -> Vec<PeerDescriptor> {
    self.state.lock().contacts.clone()
  }

  fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
    self
      .state
      .lock()
      .contacts
      .choose_multiple(&mut rand::thread_rng(), limit)
      .cloned()
      .collect()
  }

  fn ring_contacts(&self) -> RingContacts {
    self.state.lock().ring.clone()
  }

  fn remove_contact(&self, id: &NodeId) {
    let mut state = self.state.lock();
    let before = state.contacts.len();
    state.contacts.retain(|c| c.node_id != *id);
    state.ring.left.retain(|c| c.node_id != *id);
    state.ring.right.retain(|c| c.node_id != *id);
    if state.contacts.len() != before {
      state.listeners.emit(DiscoveryEvent::NearbyContactRemoved);
      state.listeners.emit(DiscoveryEvent::RandomContactRemoved);
    }
  }

  fn subscribe(&self) -> UnboundedReceiver<DiscoveryEvent> {
    self.state.lock().listeners.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{DiscoveryEvent, DiscoveryLayer, StaticDiscovery},
    crate::testing::peer,
  };

  #[tokio::test]
  async fn static_discovery_announces_changes() {
    let discovery = StaticDiscovery::default();
    let mut events = discovery.subscribe();
    let contact = peer();

    discovery.add_contact(contact.clone());
    discovery.add_contact(contact.clone());
    assert_eq!(discovery.closest_contacts(), vec![contact.clone()]);
    assert_eq!(discovery.random_contacts(5), vec![contact.clone()]);

    discovery.remove_contact(&contact.node_id);
    assert!(discovery.dht_neighbors().is_empty());

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert_eq!(seen, vec![
      DiscoveryEvent::NearbyContactAdded,
      DiscoveryEvent::RandomContactAdded,
      DiscoveryEvent::NearbyContactRemoved,
      DiscoveryEvent::RandomContactRemoved,
    ]);
  }
}
