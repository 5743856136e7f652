//! Bounded in-memory journal of orchestrator-level messages.
//!
//! Operator views read the most recent entries; every entry is also logged
//! through `tracing` at its level.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub level: JournalLevel,
    pub message: String,
}

#[derive(Debug)]
pub struct Journal {
    entries: Mutex<VecDeque<JournalEntry>>,
    capacity: usize,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Journal {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, level: JournalLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            JournalLevel::Info => tracing::info!(target: "sbx_broker::journal", "{}", message),
            JournalLevel::Warn => tracing::warn!(target: "sbx_broker::journal", "{}", message),
            JournalLevel::Error => tracing::error!(target: "sbx_broker::journal", "{}", message),
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_back(JournalEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(JournalLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(JournalLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(JournalLevel::Error, message);
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_drops_oldest() {
        let journal = Journal::new(3);
        for i in 0..5 {
            journal.info(format!("entry {}", i));
        }
        let all = journal.recent(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "entry 2");
        assert_eq!(all[2].message, "entry 4");
    }

    #[test]
    fn test_recent_returns_tail() {
        let journal = Journal::new(10);
        journal.info("a");
        journal.warn("b");
        journal.error("c");
        let tail = journal.recent(2);
        assert_eq!(tail[0].message, "b");
        assert_eq!(tail[0].level, JournalLevel::Warn);
        assert_eq!(tail[1].level, JournalLevel::Error);
    }
}
