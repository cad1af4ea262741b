//! Duplicate detection for message chains.
//!
//! Each message carries its own `(timestamp, sequence number)` and a
//! reference to the previous message of its chain. The detector remembers
//! which ranges of that numbering have *not* been seen yet as a list of
//! half-open gaps `(lower, upper]`. A message is new iff the range
//! `(previous, number]` fits inside one gap, in which case the gap is
//! shrunk or split accordingly.

use {
  crate::wire::{MessageRef, StreamMessage},
  metrics::increment_counter,
  std::{collections::HashMap, fmt},
  thiserror::Error,
};

pub const DEFAULT_MAX_GAP_COUNT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("pre-condition: previous number {previous} >= number {number}")]
  InvalidNumbering {
    previous: NumberPair,
    number: NumberPair,
  },

  #[error(
    "pre-condition: gap overlap in given numbers: previous {previous}, \
     number {number}, state {state}"
  )]
  GapMismatch {
    state: String,
    previous: NumberPair,
    number: NumberPair,
  },
}

/// A position in a message chain, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumberPair {
  pub timestamp: u64,
  pub sequence_number: u32,
}

impl NumberPair {
  /// Upper bound of the open-ended last gap.
  pub const INFINITY: NumberPair = NumberPair {
    timestamp: u64::MAX,
    sequence_number: u32::MAX,
  };

  pub fn new(timestamp: u64, sequence_number: u32) -> Self {
    Self {
      timestamp,
      sequence_number,
    }
  }
}

impl From<MessageRef> for NumberPair {
  fn from(r: MessageRef) -> Self {
    Self::new(r.timestamp, r.sequence_number)
  }
}

impl fmt::Display for NumberPair {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if *self == Self::INFINITY {
      return f.write_str("Infinity|Infinity");
    }
    write!(f, "{}|{}", self.timestamp, self.sequence_number)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
  lower: NumberPair,
  upper: NumberPair,
}

/// Tracks seen numbers of a single message chain.
#[derive(Debug, Clone)]
pub struct DuplicateMessageDetector {
  max_gap_count: usize,
  gaps: Vec<Gap>,
}

impl Default for DuplicateMessageDetector {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_GAP_COUNT)
  }
}

impl DuplicateMessageDetector {
  pub fn new(max_gap_count: usize) -> Self {
    Self {
      max_gap_count,
      gaps: Vec::new(),
    }
  }

  /// Marks `(previous, number]` as seen.
  ///
  /// Returns `true` when the message has not been seen before and
  /// `false` for duplicates. Without a previous number only the last,
  /// open-ended gap is consulted.
  pub fn mark_and_check(
    &mut self,
    previous: Option<NumberPair>,
    number: NumberPair,
  ) -> Result<bool, Error> {
    if let Some(previous) = previous {
      if previous >= number {
        return Err(Error::InvalidNumbering { previous, number });
      }
    }

    if self.gaps.is_empty() {
      self.gaps.push(Gap {
        lower: number,
        upper: NumberPair::INFINITY,
      });
      return Ok(true);
    }

    let Some(previous) = previous else {
      return Ok(match self.gaps.last_mut() {
        Some(last) if last.lower < number => {
          last.lower = number;
          true
        }
        _ => false,
      });
    };

    for i in (0..self.gaps.len()).rev() {
      let Gap { lower, upper } = self.gaps[i];

      if number > upper {
        if previous >= upper {
          return Ok(false);
        }
        return Err(self.mismatch(previous, number));
      }

      if number > lower {
        if previous < lower {
          return Err(self.mismatch(previous, number));
        }

        if previous == lower {
          if number == upper {
            self.gaps.remove(i);
          } else {
            self.gaps[i].lower = number;
          }
        } else if number == upper {
          self.gaps[i].upper = previous;
        } else {
          self.gaps[i].upper = previous;
          self.gaps.insert(i + 1, Gap {
            lower: number,
            upper,
          });
        }

        if self.gaps.len() > self.max_gap_count {
          self.gaps.remove(0);
        }
        return Ok(true);
      }
    }

    Ok(false)
  }

  /// Convenience wrapper taking the numbering from a stream message.
  pub fn mark_message(&mut self, message: &StreamMessage) -> Result<bool, Error> {
    self.mark_and_check(
      message.previous_message_ref.map(NumberPair::from),
      message.message_id.message_ref().into(),
    )
  }

  fn mismatch(&self, previous: NumberPair, number: NumberPair) -> Error {
    Error::GapMismatch {
      state: self.to_string(),
      previous,
      number,
    }
  }
}

impl fmt::Display for DuplicateMessageDetector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, gap) in self.gaps.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "({}, {}]", gap.lower, gap.upper)?;
    }
    Ok(())
  }
}

/// One detector per publisher and message chain.
#[derive(Debug)]
pub struct DuplicateDetectors {
  max_gap_count: usize,
  detectors: HashMap<String, DuplicateMessageDetector>,
}

impl Default for DuplicateDetectors {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_GAP_COUNT)
  }
}

impl DuplicateDetectors {
  pub fn new(max_gap_count: usize) -> Self {
    Self {
      max_gap_count,
      detectors: HashMap::new(),
    }
  }

  /// Returns true for messages that were never seen before.
  ///
  /// Broken numbering is an error rather than a duplicate: it says
  /// nothing about the path the message took.
  pub fn mark_and_check(
    &mut self,
    message: &StreamMessage,
  ) -> Result<bool, Error> {
    let id = &message.message_id;
    let key = format!("{}-{}", id.publisher_id, id.message_chain_id);
    let max_gap_count = self.max_gap_count;
    let fresh = self
      .detectors
      .entry(key)
      .or_insert_with(|| DuplicateMessageDetector::new(max_gap_count))
      .mark_message(message)?;

    if !fresh {
      increment_counter!("duplicate_messages");
    }
    Ok(fresh)
  }

  pub fn clear(&mut self) {
    self.detectors.clear();
  }
}
