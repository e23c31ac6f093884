use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One executed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub statement: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Rows returned or affected.
    pub rows: u64,
    pub success: bool,
}

/// Ring of the most recent statements on one instance.
#[derive(Debug)]
pub struct Timings {
    entries: VecDeque<Timing>,
    max_entries: usize,
}

impl Timings {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
        }
    }

    pub fn add(&mut self, entry: Timing) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn last(&self) -> Option<&Timing> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<Timing> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(statement: &str) -> Timing {
        Timing {
            statement: statement.into(),
            started_at: Utc::now(),
            duration: Duration::from_millis(3),
            rows: 1,
            success: true,
        }
    }

    #[test]
    fn test_ring_drops_oldest() {
        let mut timings = Timings::new(2);
        timings.add(timing("a"));
        timings.add(timing("b"));
        timings.add(timing("c"));
        let kept: Vec<String> = timings.entries().into_iter().map(|t| t.statement).collect();
        assert_eq!(kept, vec!["b", "c"]);
        assert_eq!(timings.last().unwrap().statement, "c");
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut timings = Timings::new(0);
        timings.add(timing("a"));
        assert!(timings.last().is_none());
    }
}
