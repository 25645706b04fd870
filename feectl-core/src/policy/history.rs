use core::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

/// The rolling window the change limit applies to
pub const CHANGE_WINDOW_SECS: u64 = 24 * 3600;

/// Recent changes applied to one channel.
///
/// Only changes inside the tracking window matter, so older entries are pruned
/// whenever the history is touched.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeHistory {
    /// seconds since the epoch of each recorded change, oldest first
    pub timestamps: Vec<u64>,
}

impl Debug for ChangeHistory {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ChangeHistory")
            .field("timestamps", &format_args!("{:?}", self.timestamps))
            .finish()
    }
}

impl ChangeHistory {
    /// Load from persistence
    pub fn load_from_state(timestamps: Vec<u64>) -> Self {
        let mut timestamps = timestamps;
        timestamps.sort_unstable();
        ChangeHistory { timestamps }
    }

    /// Drop entries that fell out of the window ending at `current_sec`
    pub fn prune(&mut self, current_sec: u64) {
        let start = current_sec.saturating_sub(CHANGE_WINDOW_SECS);
        self.timestamps.retain(|ts| *ts > start);
    }

    /// Record a change at `current_sec`
    pub fn insert(&mut self, current_sec: u64) {
        self.prune(current_sec);
        self.timestamps.push(current_sec);
    }

    /// Number of changes in the window ending at `current_sec`
    pub fn count_in_window(&self, current_sec: u64) -> usize {
        let start = current_sec.saturating_sub(CHANGE_WINDOW_SECS);
        self.timestamps.iter().filter(|ts| **ts > start).count()
    }

    /// The most recent change
    pub fn last(&self) -> Option<u64> {
        self.timestamps.last().copied()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
