//! Recently sent messages, for input recall in the UI.

use std::collections::VecDeque;

/// Number of sent messages remembered per connection.
pub const HISTORY_MAX_COUNT: usize = 24;

/// Bounded list of sent messages, oldest first.
#[derive(Debug, Clone)]
pub struct SentHistory {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for SentHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_MAX_COUNT)
    }
}

impl SentHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, evicting the oldest once full.
    pub fn push(&mut self, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}
