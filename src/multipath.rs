//! Multi-alias reference counter (C3).
//!
//! When `--multipath` is enabled, several visible aliases can share one
//! canonical backing directory (`.u` and `u` both resolving to `u`, for
//! example). This registry counts live aliases per canonical name so the
//! dispatcher can tell when the last alias has gone away and a backup is
//! due.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Ref-counts canonical names by number of live aliases.
pub struct MultipathRegistry {
    counts: Mutex<HashMap<Vec<u8>, usize>>,
}

impl Default for MultipathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipathRegistry {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Increment the alias count for `name`, creating the entry at 1 if
    /// it did not exist.
    pub fn increment(&self, name: &[u8]) {
        let mut counts = self.counts.lock();
        *counts.entry(name.to_vec()).or_insert(0) += 1;
    }

    /// Decrement the alias count for `name`. Returns the new count, or
    /// `-1` if the entry was missing (a protocol violation: an expire for
    /// a name that was never incremented).
    pub fn decrement(&self, name: &[u8]) -> i64 {
        let mut counts = self.counts.lock();
        match counts.get_mut(name) {
            None => -1,
            Some(count) => {
                *count -= 1;
                let new_count = *count;
                if new_count == 0 {
                    counts.remove(name);
                }
                new_count as i64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_then_decrement_to_zero_removes_entry() {
        let reg = MultipathRegistry::new();
        reg.increment(b"u");
        reg.increment(b"u");
        assert_eq!(reg.decrement(b"u"), 1);
        assert_eq!(reg.decrement(b"u"), 0);
        assert_eq!(reg.counts.lock().len(), 0);
    }

    #[test]
    fn decrement_missing_entry_returns_negative_one() {
        let reg = MultipathRegistry::new();
        assert_eq!(reg.decrement(b"missing"), -1);
    }
}
