use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Suppression window after a local status change. Also used for the coarse
/// `lastUserAction` notification guard so both layers agree.
pub const GUARD_WINDOW_MS: i64 = 10_000;
pub const DEFAULT_GUARD_CAPACITY: usize = 1024;

/// Per-route record of recent local changes. Poll deltas for a guarded route
/// are dropped until the guard expires.
#[derive(Debug, Clone)]
pub struct ChangeGuard {
    window_ms: i64,
    capacity: usize,
    entries: HashMap<String, i64>,
}

impl Default for ChangeGuard {
    fn default() -> Self {
        Self::new(GUARD_WINDOW_MS)
    }
}

impl ChangeGuard {
    pub fn new(window_ms: i64) -> Self {
        Self::with_capacity(window_ms, DEFAULT_GUARD_CAPACITY)
    }

    pub fn with_capacity(window_ms: i64, capacity: usize) -> Self {
        Self {
            window_ms: window_ms.max(0),
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Records a local change. Replaces any earlier entry for the same route.
    pub fn mark_changed(&mut self, route_id: &str, now_ms: i64) {
        let guarded_until = now_ms.saturating_add(self.window_ms);
        if !self.entries.contains_key(route_id) && self.entries.len() >= self.capacity {
            self.sweep(now_ms);
            if self.entries.len() >= self.capacity {
                self.evict_earliest();
            }
        }
        self.entries.insert(route_id.to_string(), guarded_until);
    }

    pub fn is_guarded(&self, route_id: &str, now_ms: i64) -> bool {
        self.entries
            .get(route_id)
            .map(|until| now_ms < *until)
            .unwrap_or(false)
    }

    pub fn guarded_until(&self, route_id: &str) -> Option<i64> {
        self.entries.get(route_id).copied()
    }

    /// Drops expired entries, returning how many were removed.
    pub fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| now_ms < *until);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_earliest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, until)| **until)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// Coarse "a user acted recently" marker, persisted client-side as
/// `lastUserAction`. Only gates background notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityGuard {
    #[serde(rename = "lastUserAction", default)]
    last_user_action: Option<i64>,
    #[serde(skip, default = "default_window")]
    window_ms: i64,
}

fn default_window() -> i64 {
    GUARD_WINDOW_MS
}

impl Default for ActivityGuard {
    fn default() -> Self {
        Self {
            last_user_action: None,
            window_ms: GUARD_WINDOW_MS,
        }
    }
}

impl ActivityGuard {
    pub fn touch(&mut self, now_ms: i64) {
        self.last_user_action = Some(now_ms);
    }

    pub fn last_user_action(&self) -> Option<i64> {
        self.last_user_action
    }

    pub fn suppresses_notifications(&self, now_ms: i64) -> bool {
        match self.last_user_action {
            Some(at) => now_ms >= at && now_ms - at < self.window_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_holds_for_the_full_window_then_expires() {
        let mut guard = ChangeGuard::default();
        guard.mark_changed("r1", 1_000);
        assert!(guard.is_guarded("r1", 1_000));
        assert!(guard.is_guarded("r1", 1_000 + GUARD_WINDOW_MS - 1));
        assert!(!guard.is_guarded("r1", 1_000 + GUARD_WINDOW_MS));
        assert!(!guard.is_guarded("r2", 1_000));
    }

    #[test]
    fn remarking_extends_instead_of_accumulating() {
        let mut guard = ChangeGuard::new(5_000);
        guard.mark_changed("r1", 0);
        guard.mark_changed("r1", 4_000);
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.guarded_until("r1"), Some(9_000));
        assert!(guard.is_guarded("r1", 8_999));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let mut guard = ChangeGuard::new(1_000);
        guard.mark_changed("old", 0);
        guard.mark_changed("new", 900);
        assert_eq!(guard.sweep(1_500), 1);
        assert!(guard.guarded_until("old").is_none());
        assert!(guard.is_guarded("new", 1_500));
    }

    #[test]
    fn capacity_evicts_earliest_expiry_when_full() {
        let mut guard = ChangeGuard::with_capacity(10_000, 2);
        guard.mark_changed("a", 0);
        guard.mark_changed("b", 100);
        guard.mark_changed("c", 200);
        assert_eq!(guard.len(), 2);
        assert!(guard.guarded_until("a").is_none());
        assert!(guard.is_guarded("b", 300));
        assert!(guard.is_guarded("c", 300));
    }

    #[test]
    fn activity_guard_suppresses_within_window() {
        let mut activity = ActivityGuard::default();
        assert!(!activity.suppresses_notifications(0));
        activity.touch(2_000);
        assert!(activity.suppresses_notifications(2_500));
        assert!(!activity.suppresses_notifications(2_000 + GUARD_WINDOW_MS));
    }

    #[test]
    fn activity_guard_round_trips_last_user_action_key() {
        let mut activity = ActivityGuard::default();
        activity.touch(42);
        let raw = serde_json::to_string(&activity).expect("serialize");
        assert_eq!(raw, r#"{"lastUserAction":42}"#);
        let back: ActivityGuard = serde_json::from_str(&raw).expect("parse");
        assert_eq!(back, activity);
    }
}
