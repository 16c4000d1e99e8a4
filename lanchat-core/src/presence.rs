//! Presence registry: who is online, keyed by nickname, with TTL eviction.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::identity::ClientId;

/// Recommended heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Silence longer than this removes a member (two missed heartbeats).
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(20);

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Current wall-clock time in [`Millis`].
pub fn now_millis() -> Millis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Member {
    client_id: ClientId,
    last_seen: Millis,
}

/// Online members. All methods take `&self`; the lock is held only for the map operation.
pub struct PresenceRegistry {
    members: Mutex<HashMap<String, Member>>,
    timeout_ms: Millis,
}

impl PresenceRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            timeout_ms: timeout.as_millis() as Millis,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Record a heartbeat. Returns true if the nickname was not online before.
    /// A late, reordered heartbeat never moves `last_seen` backwards.
    pub fn upsert(&self, nickname: &str, client_id: &ClientId, seen: Millis) -> bool {
        let mut members = self.members.lock();
        match members.get_mut(nickname) {
            Some(m) => {
                m.last_seen = m.last_seen.max(seen);
                if m.client_id != *client_id {
                    m.client_id = client_id.clone();
                }
                false
            }
            None => {
                members.insert(
                    nickname.to_string(),
                    Member {
                        client_id: client_id.clone(),
                        last_seen: seen,
                    },
                );
                true
            }
        }
    }

    /// Drop a member. Returns true if it was present.
    pub fn remove(&self, nickname: &str) -> bool {
        self.members.lock().remove(nickname).is_some()
    }

    /// Evict members silent for longer than the timeout. Returns the evicted nicknames, sorted.
    pub fn sweep(&self, now: Millis) -> Vec<String> {
        let mut evicted: Vec<String> = {
            let mut members = self.members.lock();
            let stale: Vec<String> = members
                .iter()
                .filter(|(_, m)| now.saturating_sub(m.last_seen) > self.timeout_ms)
                .map(|(n, _)| n.clone())
                .collect();
            for n in &stale {
                members.remove(n);
            }
            stale
        };
        evicted.sort();
        evicted
    }

    /// Online nicknames, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Like [`snapshot`](Self::snapshot) but hides members that a sweep at `now` would evict.
    pub fn snapshot_at(&self, now: Millis) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .lock()
            .iter()
            .filter(|(_, m)| now.saturating_sub(m.last_seen) <= self.timeout_ms)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Nickname last announced by `client_id`.
    pub fn nickname_for(&self, client_id: &ClientId) -> Option<String> {
        self.members
            .lock()
            .iter()
            .find(|(_, m)| m.client_id == *client_id)
            .map(|(n, _)| n.clone())
    }

    #[cfg(test)]
    pub(crate) fn last_seen(&self, nickname: &str) -> Option<Millis> {
        self.members.lock().get(nickname).map(|m| m.last_seen)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.members.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SEC: Millis = 1000;

    fn id(s: &str) -> ClientId {
        s.parse().unwrap()
    }

    #[test]
    fn heartbeat_keeps_member_online() {
        let reg = PresenceRegistry::new(Duration::from_secs(20));
        assert!(reg.upsert("alice", &id("c1"), 0));
        assert!(!reg.upsert("alice", &id("c1"), 9 * SEC));
        assert!(reg.sweep(15 * SEC).is_empty());
        assert_eq!(reg.snapshot(), vec!["alice"]);
        assert_eq!(reg.sweep(35 * SEC), vec!["alice"]);
        assert!(reg.is_empty());
    }

    #[test]
    fn eviction_is_strictly_after_timeout() {
        let reg = PresenceRegistry::new(Duration::from_secs(20));
        reg.upsert("bob", &id("c2"), 0);
        assert!(reg.sweep(20 * SEC).is_empty());
        assert_eq!(reg.sweep(20 * SEC + 1), vec!["bob"]);
    }

    #[test]
    fn reordered_heartbeat_does_not_rewind() {
        let reg = PresenceRegistry::default();
        reg.upsert("alice", &id("c1"), 10 * SEC);
        reg.upsert("alice", &id("c1"), 2 * SEC);
        assert_eq!(reg.last_seen("alice"), Some(10 * SEC));
    }

    #[test]
    fn goodbye_removes() {
        let reg = PresenceRegistry::default();
        reg.upsert("alice", &id("c1"), 0);
        assert!(reg.remove("alice"));
        assert!(!reg.remove("alice"));
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_lazy_view_hides_stale() {
        let reg = PresenceRegistry::new(Duration::from_secs(20));
        reg.upsert("carol", &id("c3"), 0);
        reg.upsert("alice", &id("c1"), 30 * SEC);
        assert_eq!(reg.snapshot(), vec!["alice", "carol"]);
        assert_eq!(reg.snapshot_at(30 * SEC), vec!["alice"]);
        // Lazy view does not mutate.
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn nickname_lookup_by_client_id() {
        let reg = PresenceRegistry::default();
        reg.upsert("alice", &id("c1"), 0);
        assert_eq!(reg.nickname_for(&id("c1")).as_deref(), Some("alice"));
        assert_eq!(reg.nickname_for(&id("c9")), None);
        reg.upsert("alice", &id("c7"), 1);
        assert_eq!(reg.nickname_for(&id("c7")).as_deref(), Some("alice"));
    }

    #[test]
    fn concurrent_upserts() {
        let reg = Arc::new(PresenceRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        reg.upsert(&format!("user{}", i % 10), &id(&format!("c{t}")), i);
                        reg.snapshot();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 10);
    }
}
