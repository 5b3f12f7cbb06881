//! Shared record of motion commands.
//!
//! Several mock motors can write into one journal, which lets tests assert
//! on the relative order and timing of starts across devices (e.g. which
//! slit blade was started first, and how long after the other).

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// One recorded `start` call.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Motor name.
    pub device: String,
    /// Requested target.
    pub target: f64,
    /// Time of the call.
    pub at: Instant,
}

/// Cloneable handle to a shared journal.
#[derive(Debug, Clone, Default)]
pub struct MotionJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MotionJournal {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped with the current time.
    pub fn record(&self, device: &str, target: f64) {
        self.entries.lock().push(JournalEntry {
            device: device.to_string(),
            target,
            at: Instant::now(),
        });
    }

    /// Copy of all entries in call order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Device names in call order.
    pub fn order(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.device.clone()).collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
