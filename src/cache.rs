use {
  std::{
    collections::{HashMap, VecDeque},
    fmt,
    hash::Hash,
    time::Duration,
  },
  tokio::time::Instant,
};

#[derive(Debug, Clone)]
struct Timestamped<T>(T, Instant);

/// Callback invoked with the key of every entry leaving the map.
pub type OnItemDropped<K> = Box<dyn FnMut(&K) + Send>;

/// Bounded insertion-ordered map whose entries expire after a TTL.
///
/// When full, inserting a new key evicts the oldest one. Re-inserting an
/// existing key replaces it and moves it to the newest position. Expired
/// entries are dropped lazily when they are looked up or listed.
pub struct FifoMapWithTtl<K, V>
where
  K: Eq + Hash + Clone,
{
  ttl: Duration,
  max_size: usize,
  data: HashMap<K, Timestamped<V>>,
  order: VecDeque<K>,
  on_item_dropped: Option<OnItemDropped<K>>,
}

impl<K: Eq + Hash + Clone, V> FifoMapWithTtl<K, V> {
  pub fn new(ttl: Duration, max_size: usize) -> Self {
    Self {
      ttl,
      max_size,
      data: HashMap::new(),
      order: VecDeque::new(),
      on_item_dropped: None,
    }
  }

  pub fn with_on_item_dropped(
    mut self,
    callback: impl FnMut(&K) + Send + 'static,
  ) -> Self {
    self.on_item_dropped = Some(Box::new(callback));
    self
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn set(&mut self, key: K, value: V) {
    if self.max_size == 0 {
      return;
    }

    if self.data.contains_key(&key) {
      self.delete(&key);
    }

    if self.data.len() >= self.max_size {
      if let Some(oldest) = self.order.front().cloned() {
        self.delete(&oldest);
      }
    }

    self.order.push_back(key.clone());
    self.data.insert(key, Timestamped(value, Instant::now()));
  }

  #[cfg(test)]
  pub fn get(&mut self, key: &K) -> Option<&V> {
    self.get_mut(key).map(|v| &*v)
  }

  pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
    if self.is_expired(key) {
      self.delete(key);
      return None;
    }
    self.data.get_mut(key).map(|v| &mut v.0)
  }

  pub fn delete(&mut self, key: &K) -> Option<V> {
    let removed = self.data.remove(key)?;
    self.order.retain(|k| k != key);
    if let Some(callback) = self.on_item_dropped.as_mut() {
      callback(key);
    }
    Some(removed.0)
  }

  /// Drops every expired entry. Entries share one TTL and are kept in
  /// insertion order, so the expired ones are always the oldest.
  pub fn purge_expired(&mut self) {
    while let Some(oldest) = self.order.front().cloned() {
      if !self.is_expired(&oldest) {
        break;
      }
      self.delete(&oldest);
    }
  }

  /// Live values from oldest to newest. Expired entries are dropped.
  pub fn values(&mut self) -> impl Iterator<Item = &V> + '_ {
    self.purge_expired();
    let data = &self.data;
    self
      .order
      .iter()
      .filter_map(move |key| data.get(key).map(|v| &v.0))
  }

  fn is_expired(&self, key: &K) -> bool {
    self
      .data
      .get(key)
      .map(|v| v.1.elapsed() >= self.ttl)
      .unwrap_or(false)
  }
}

impl<K, V> fmt::Debug for FifoMapWithTtl<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug,
  V: fmt::Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FifoMapWithTtl")
      .field("ttl", &self.ttl)
      .field("max_size", &self.max_size)
      .field("order", &self.order)
      .finish()
  }
}
