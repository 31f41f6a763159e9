use serde::{Deserialize, Serialize};

/// Client-local high-water mark of the server timestamps seen by successful polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    last_update: i64,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_update(&self) -> i64 {
        self.last_update
    }

    /// Moves the cursor forward to `timestamp`. Older timestamps are ignored so
    /// the cursor never moves backward.
    pub fn advance_to(&mut self, timestamp: i64) -> bool {
        if timestamp <= self.last_update {
            return false;
        }
        self.last_update = timestamp;
        true
    }

    pub fn reset(&mut self) {
        self.last_update = 0;
    }

    /// Rewinds to the stamp a freshly loaded page was rendered at. Negative
    /// stamps count as 0.
    pub fn reset_to(&mut self, stamp: i64) {
        self.last_update = stamp.max(0);
    }
}
