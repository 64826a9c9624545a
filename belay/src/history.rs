//! Bounded record of session-defining commands, replayed on reconnect.

use std::collections::VecDeque;
use std::time::SystemTime;

/// One submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Command {
    /// Session-wide id; strictly increasing across reconnects.
    pub id: u64,
    /// Program text as sent.
    pub payload: String,
    /// Results were decoded with the trusted evaluator.
    pub trusted: bool,
    /// The command is part of the session state and gets replayed.
    pub record: bool,
    /// When the command was issued.
    pub issued: SystemTime,
}

/// FIFO of recorded commands; the oldest entry is dropped on overflow.
#[derive(Debug, Clone)]
pub struct CallHistory {
    /// Entries, oldest first.
    entries: VecDeque<Command>,
    /// Maximum number of entries.
    capacity: usize,
}

impl CallHistory {
    /// Creates an empty history holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Appends a command, evicting the oldest entry when full.
    pub fn push(&mut self, cmd: Command) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!(id = evicted.id, "history full, dropping oldest entry");
            }
        }
        self.entries.push_back(cmd);
    }

    /// Entries in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(id: u64) -> Command {
        Command {
            id,
            payload: format!("x{id} = {id}"),
            trusted: false,
            record: true,
            issued: SystemTime::now(),
        }
    }

    #[test]
    fn keeps_order() {
        let mut h = CallHistory::new(10);
        for i in 0..5 {
            h.push(cmd(i));
        }
        let ids: Vec<u64> = h.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut h = CallHistory::new(3);
        for i in 0..5 {
            h.push(cmd(i));
        }
        assert_eq!(h.len(), 3);
        let ids: Vec<u64> = h.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut h = CallHistory::new(0);
        h.push(cmd(1));
        assert!(h.is_empty());
    }
}
