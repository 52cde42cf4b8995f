//! Cyclic trigger state for memory updates.
//!
//! Each (persona, conversation) pair keeps a cycle base: the message count
//! at which the last update fired. An update is due when the count has
//! advanced a full threshold past the base, where the threshold is a fixed
//! fraction of the model's context window. The base map is tiny and persists
//! as one JSON file.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::fsutil;

/// Messages between updates for a given window and frequency, at least 1.
pub fn threshold(context_window: u64, frequency: f64) -> u64 {
    let raw = (context_window as f64 * frequency).floor() as u64;
    raw.max(1)
}

/// The highest whole-cycle boundary not exceeding the count. Used to
/// reconstruct a lost base without firing a burst of catch-up updates.
pub fn rebuild_cycle_base(message_count: u64, threshold: u64) -> u64 {
    (message_count / threshold) * threshold
}

/// Read-only view of one conversation's position in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleProgress {
    /// Messages since the cycle base.
    pub progress: u64,
    pub threshold: u64,
    /// Progress toward the next trigger, clamped to 100.
    pub percent: u8,
    /// 1-based ordinal of the current cycle.
    pub cycle_number: u64,
}

pub struct CycleTracker {
    path: PathBuf,
    state: Mutex<BTreeMap<String, u64>>,
}

impl CycleTracker {
    /// Load the base map; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fsutil::load_json::<BTreeMap<String, u64>>(&path) {
            Ok(map) => map,
            Err(e) => {
                if path.exists() {
                    tracing::warn!("Cycle state {:?} unreadable ({:#}), starting fresh", path, e);
                }
                BTreeMap::new()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn key(persona_id: &str, conversation_id: &str) -> String {
        format!("{}:{}", persona_id, conversation_id)
    }

    /// Record the current message count and decide whether an update is due.
    ///
    /// A base of zero with a count already past one threshold means the base
    /// was lost (fresh install over old history); it is rebuilt to the last
    /// whole-cycle boundary so one stale conversation does not fire a burst
    /// of updates.
    pub fn advance(
        &self,
        persona_id: &str,
        conversation_id: &str,
        message_count: u64,
        context_window: u64,
        frequency: f64,
    ) -> Result<bool> {
        let threshold = threshold(context_window, frequency);
        let key = Self::key(persona_id, conversation_id);

        let (fire, snapshot) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut base = state.get(&key).copied().unwrap_or(0);
            let mut changed = false;

            if base == 0 && message_count > threshold {
                base = rebuild_cycle_base(message_count, threshold);
                tracing::debug!(
                    "Rebuilt cycle base for {} to {} (count {}, threshold {})",
                    key,
                    base,
                    message_count,
                    threshold
                );
                state.insert(key.clone(), base);
                changed = true;
            }

            let progress = message_count.saturating_sub(base);
            let fire = progress >= threshold;
            if fire {
                state.insert(key.clone(), message_count);
                changed = true;
            }
            (fire, changed.then(|| state.clone()))
        };

        if let Some(snapshot) = snapshot {
            fsutil::save_json(&self.path, &snapshot)?;
        }
        Ok(fire)
    }

    /// Where one conversation stands, without mutating anything.
    pub fn progress(
        &self,
        persona_id: &str,
        conversation_id: &str,
        message_count: u64,
        context_window: u64,
        frequency: f64,
    ) -> CycleProgress {
        let threshold = threshold(context_window, frequency);
        let key = Self::key(persona_id, conversation_id);
        let base = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.get(&key).copied())
            .unwrap_or(0);

        let progress = message_count.saturating_sub(base);
        let percent = ((progress.min(threshold) * 100) / threshold) as u8;
        CycleProgress {
            progress,
            threshold,
            percent,
            cycle_number: base / threshold + 1,
        }
    }

    /// Forget one conversation's base, e.g. when its history is cleared.
    pub fn reset(&self, persona_id: &str, conversation_id: &str) -> Result<()> {
        let key = Self::key(persona_id, conversation_id);
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.remove(&key).is_none() {
                return Ok(());
            }
            state.clone()
        };
        fsutil::save_json(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &std::path::Path) -> CycleTracker {
        CycleTracker::load(dir.join("cycles.json"))
    }

    #[test]
    fn threshold_floors_and_clamps() {
        assert_eq!(threshold(65, 0.5), 32);
        assert_eq!(threshold(65, 0.75), 48);
        assert_eq!(threshold(65, 0.95), 61);
        assert_eq!(threshold(1, 0.1), 1);
    }

    #[test]
    fn base_rebuild_is_idempotent() {
        assert_eq!(rebuild_cycle_base(100, 48), 96);
        assert_eq!(rebuild_cycle_base(100, 48), 96);
        assert_eq!(rebuild_cycle_base(96, 48), 96);
        assert_eq!(rebuild_cycle_base(47, 48), 0);
    }

    #[test]
    fn fires_once_per_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());

        // Window 100, frequency 0.5: threshold 50.
        assert!(!t.advance("rin", "main", 10, 100, 0.5).unwrap());
        assert!(!t.advance("rin", "main", 49, 100, 0.5).unwrap());
        assert!(t.advance("rin", "main", 50, 100, 0.5).unwrap());
        // Base moved to 50: next fire needs 100.
        assert!(!t.advance("rin", "main", 51, 100, 0.5).unwrap());
        assert!(!t.advance("rin", "main", 99, 100, 0.5).unwrap());
        assert!(t.advance("rin", "main", 100, 100, 0.5).unwrap());
    }

    #[test]
    fn lost_base_is_rebuilt_instead_of_bursting() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());

        // Old conversation with 170 messages, no recorded base.
        // Threshold 50: base rebuilds to 150, so nothing fires until 200.
        assert!(!t.advance("rin", "main", 170, 100, 0.5).unwrap());
        assert!(!t.advance("rin", "main", 199, 100, 0.5).unwrap());
        assert!(t.advance("rin", "main", 200, 100, 0.5).unwrap());
    }

    #[test]
    fn count_exactly_at_threshold_fires_without_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        // count == threshold: not "past" a whole cycle, so no rebuild; fires.
        assert!(t.advance("rin", "main", 50, 100, 0.5).unwrap());
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = tracker(dir.path());
            assert!(t.advance("rin", "main", 50, 100, 0.5).unwrap());
        }
        let t = tracker(dir.path());
        assert!(!t.advance("rin", "main", 60, 100, 0.5).unwrap());
        assert!(t.advance("rin", "main", 100, 100, 0.5).unwrap());
    }

    #[test]
    fn progress_reports_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        assert!(t.advance("rin", "main", 50, 100, 0.5).unwrap());

        let p = t.progress("rin", "main", 75, 100, 0.5);
        assert_eq!(p.progress, 25);
        assert_eq!(p.threshold, 50);
        assert_eq!(p.percent, 50);
        assert_eq!(p.cycle_number, 2);

        // Reading twice changes nothing.
        let again = t.progress("rin", "main", 75, 100, 0.5);
        assert_eq!(p, again);
    }

    #[test]
    fn percent_clamps_at_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        let p = t.progress("rin", "main", 80, 100, 0.5);
        assert_eq!(p.percent, 100);
    }

    #[test]
    fn reset_forgets_one_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path());
        assert!(t.advance("rin", "main", 50, 100, 0.5).unwrap());
        assert!(t.advance("rin", "side", 50, 100, 0.5).unwrap());

        t.reset("rin", "main").unwrap();
        // Cleared history restarts the cycle from zero.
        assert!(!t.advance("rin", "main", 10, 100, 0.5).unwrap());
        // The other conversation keeps its base.
        assert!(!t.advance("rin", "side", 60, 100, 0.5).unwrap());
    }
}
