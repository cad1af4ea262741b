use {
  crate::wire::NodeId,
  std::collections::{HashMap, HashSet},
};

/// Neighbors paused per message chain, bounded per chain.
#[derive(Debug)]
pub struct PausedNeighbors {
  limit: usize,
  chains: HashMap<String, HashSet<NodeId>>,
}

impl PausedNeighbors {
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      chains: HashMap::new(),
    }
  }

  /// Pauses `node` for `chain` unless the chain already holds `limit`
  /// paused nodes.
  pub fn add(&mut self, node: NodeId, chain: &str) -> bool {
    let paused = self.chains.entry(chain.to_owned()).or_default();
    if paused.len() >= self.limit {
      if paused.is_empty() {
        self.chains.remove(chain);
      }
      return false;
    }
    paused.insert(node)
  }

  pub fn delete(&mut self, node: &NodeId, chain: &str) -> bool {
    let Some(paused) = self.chains.get_mut(chain) else {
      return false;
    };
    let removed = paused.remove(node);
    if paused.is_empty() {
      self.chains.remove(chain);
    }
    removed
  }

  /// Unpauses `node` on every chain.
  pub fn delete_all(&mut self, node: &NodeId) {
    self.chains.retain(|_, paused| {
      paused.remove(node);
      !paused.is_empty()
    });
  }

  pub fn is_paused(&self, node: &NodeId, chain: &str) -> bool {
    self
      .chains
      .get(chain)
      .map(|paused| paused.contains(node))
      .unwrap_or(false)
  }

  pub fn size(&self, chain: &str) -> usize {
    self.chains.get(chain).map(HashSet::len).unwrap_or(0)
  }

  /// Chains that have at least one paused node.
  pub fn chains(&self) -> impl Iterator<Item = (&str, &HashSet<NodeId>)> {
    self.chains.iter().map(|(chain, paused)| (chain.as_str(), paused))
  }
}

#[cfg(test)]
mod tests {
  use {super::PausedNeighbors, crate::wire::NodeId};

  #[test]
  fn respects_per_chain_limit() {
    let mut paused = PausedNeighbors::new(2);
    let nodes: Vec<_> = (0..3).map(|_| NodeId::random()).collect();

    assert!(paused.add(nodes[0], "a"));
    assert!(paused.add(nodes[1], "a"));
    assert!(!paused.add(nodes[2], "a"));
    assert!(paused.add(nodes[2], "b"));

    assert_eq!(paused.size("a"), 2);
    assert!(!paused.is_paused(&nodes[2], "a"));
    assert!(paused.is_paused(&nodes[2], "b"));
  }

  #[test]
  fn empty_chains_are_forgotten() {
    let mut paused = PausedNeighbors::new(3);
    let (a, b) = (NodeId::random(), NodeId::random());
    paused.add(a, "x");
    paused.add(a, "y");
    paused.add(b, "y");

    assert!(paused.delete(&a, "x"));
    assert!(!paused.delete(&a, "x"));
    assert_eq!(paused.chains().count(), 1);

    paused.delete_all(&a);
    assert!(paused.is_paused(&b, "y"));
    paused.delete_all(&b);
    assert_eq!(paused.chains().count(), 0);
  }
}
