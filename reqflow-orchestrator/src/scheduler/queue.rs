//! Tiered FIFO queue with backpressure.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether enqueues at this priority may displace queued work
    pub fn can_evict(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Outcome of pushing onto a full or non-full queue
#[derive(Debug)]
pub(crate) enum Admission<T> {
    Accepted,
    /// Accepted by displacing this older item
    Evicted(T),
    /// Not accepted; the item is handed back
    Rejected(T),
}

/// Four FIFO tiers served in a fixed order
pub(crate) struct TieredQueue<T> {
    tiers: [VecDeque<T>; 4],
    order: [Priority; 4],
    max_size: usize,
}

impl<T> TieredQueue<T> {
    pub fn new(order: [Priority; 4], max_size: usize) -> Self {
        Self {
            tiers: Default::default(),
            order,
            max_size,
        }
    }

    /// Append to a tier, applying backpressure at `max_size`.
    ///
    /// A full queue rejects `low`/`normal`; `critical`/`high` displace the
    /// oldest `low` item, else the oldest `normal` one.
    pub fn push(&mut self, priority: Priority, item: T) -> Admission<T> {
        if self.len() < self.max_size {
            self.tiers[priority.index()].push_back(item);
            return Admission::Accepted;
        }

        if !priority.can_evict() {
            return Admission::Rejected(item);
        }

        let victim = self.tiers[Priority::Low.index()]
            .pop_front()
            .or_else(|| self.tiers[Priority::Normal.index()].pop_front());

        match victim {
            Some(victim) => {
                self.tiers[priority.index()].push_back(item);
                Admission::Evicted(victim)
            }
            None => Admission::Rejected(item),
        }
    }

    /// Put an item at the head of its tier, ignoring the size bound
    pub fn push_front(&mut self, priority: Priority, item: T) {
        self.tiers[priority.index()].push_front(item);
    }

    /// Take the oldest item of the first non-empty tier
    pub fn pop(&mut self) -> Option<T> {
        self.order
            .iter()
            .find_map(|priority| self.tiers[priority.index()].pop_front())
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Remove everything, highest tier first
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for priority in self.order {
            drained.extend(self.tiers[priority.index()].drain(..));
        }
        drained
    }
}
