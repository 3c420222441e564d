//! The rotating upstream pool.
//!
//! The proxy list is shared with the host behind a read-write lock; the
//! host edits it, the service only reads snapshots and flips per-entry
//! health state. Selection walks the currently-active subset either
//! uniformly at random or in strict round-robin order. The round-robin
//! cursor remembers the last-used entry by identity, so list edits between
//! selections cannot make the rotation repeat an upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::config::SelectionMode;
use crate::entry::{ProxyEntry, ProxyId};
use crate::events::EventSink;

/// Consecutive failures before an entry is marked inactive.
pub const MAX_FAILURES: u32 = 3;

/// Round-robin position, tracked by identity. The numeric index is always
/// recomputed from the identity's position in the current active snapshot,
/// so list edits between selections cannot skew the rotation.
#[derive(Default)]
struct RotationCursor {
    last_used: Option<ProxyId>,
}

/// Shared pool of upstream proxies with rotation and failure tracking.
pub struct ProxyRegistry {
    entries: RwLock<Vec<ProxyEntry>>,
    cursor: Mutex<RotationCursor>,
    failures: Mutex<HashMap<String, u32>>,
    per_proxy: Mutex<HashMap<String, usize>>,
    events: Arc<EventSink>,
}

impl ProxyRegistry {
    pub fn new(events: Arc<EventSink>) -> Self {
        Self::with_entries(Vec::new(), events)
    }

    pub fn with_entries(entries: Vec<ProxyEntry>, events: Arc<EventSink>) -> Self {
        ProxyRegistry {
            entries: RwLock::new(entries),
            cursor: Mutex::new(RotationCursor::default()),
            failures: Mutex::new(HashMap::new()),
            per_proxy: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replace the proxy list. Failure counters are keyed by host:port and
    /// survive a reload so a flapping upstream cannot launder its history.
    pub fn set_entries(&self, entries: Vec<ProxyEntry>) {
        *self.entries.write().unwrap() = entries;
    }

    pub fn add_entry(&self, entry: ProxyEntry) {
        self.entries.write().unwrap().push(entry);
    }

    /// Snapshot of the full list, inactive entries included.
    pub fn entries(&self) -> Vec<ProxyEntry> {
        self.entries.read().unwrap().clone()
    }

    pub fn active_count(&self) -> usize {
        self.entries.read().unwrap().iter().filter(|e| e.active).count()
    }

    /// Choose the upstream for a new connection.
    ///
    /// Builds the active snapshot under the read lock, minus `exclude`
    /// (a host:port key of an upstream that just failed). Random mode picks
    /// uniformly; round-robin advances past the last-used identity and
    /// never returns the same entry twice in a row while two or more are
    /// active.
    pub fn select(&self, mode: SelectionMode, exclude: Option<&str>) -> Option<ProxyEntry> {
        let active: Vec<ProxyEntry> = {
            let entries = self.entries.read().unwrap();
            entries.iter().filter(|e| e.active).cloned().collect()
        };

        if active.iter().all(|e| exclude == Some(e.key().as_str())) {
            return None;
        }

        let selected = match mode {
            SelectionMode::Random => {
                let candidates: Vec<ProxyEntry> = active
                    .iter()
                    .filter(|e| exclude != Some(e.key().as_str()))
                    .cloned()
                    .collect();
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                let entry = candidates[idx].clone();
                self.events.info(&format!(
                    "Randomly selected proxy {} ({} of {})",
                    entry.sanitized_url(),
                    idx + 1,
                    candidates.len()
                ));
                entry
            }
            SelectionMode::RoundRobin => {
                // Advance past the last-used identity within the active
                // list, then step over the excluded key if it lands there.
                let mut cursor = self.cursor.lock().unwrap();
                let mut idx = match &cursor.last_used {
                    None => 0,
                    Some(last) => match active.iter().position(|e| &e.id() == last) {
                        // Last-used entry left the active set; restart.
                        None => 0,
                        Some(last_idx) => (last_idx + 1) % active.len(),
                    },
                };
                if exclude == Some(active[idx].key().as_str()) {
                    idx = (idx + 1) % active.len();
                }
                let entry = active[idx].clone();
                cursor.last_used = Some(entry.id());
                self.events.info(&format!(
                    "Rotating proxy {} ({} of {})",
                    entry.sanitized_url(),
                    idx + 1,
                    active.len()
                ));
                entry
            }
        };

        Some(selected)
    }

    /// Record one failed connect or handshake against an entry. The third
    /// consecutive failure deactivates it and notifies the host.
    pub fn record_failure(&self, entry: &ProxyEntry) {
        if entry.is_direct() {
            return;
        }
        let key = entry.key();

        let failures = {
            let mut map = self.failures.lock().unwrap();
            let count = map.entry(key.clone()).or_insert(0);
            *count += 1;
            let current = *count;
            if current >= MAX_FAILURES {
                map.remove(&key);
            }
            current
        };

        if failures < MAX_FAILURES {
            return;
        }

        let message = format!("Marked inactive after {failures} consecutive failures");
        {
            let mut entries = self.entries.write().unwrap();
            if let Some(e) = entries.iter_mut().find(|e| e.id() == entry.id()) {
                e.active = false;
                e.last_error = message.clone();
            }
        }
        self.events
            .error(&format!("Marking proxy {key} as inactive: {message}"));
        self.events.proxy_failed(&entry.host, entry.port, &message);
    }

    /// A connect and handshake through this entry succeeded; clear its
    /// failure history.
    pub fn record_success(&self, entry: &ProxyEntry) {
        if entry.is_direct() {
            return;
        }
        self.failures.lock().unwrap().remove(&entry.key());
    }

    /// A health probe succeeded: clear failures and, if the entry was
    /// sitting inactive, put it back into rotation.
    pub fn mark_healthy(&self, entry: &ProxyEntry) {
        if entry.is_direct() {
            return;
        }
        let key = entry.key();
        self.failures.lock().unwrap().remove(&key);

        let reactivated = {
            let mut entries = self.entries.write().unwrap();
            match entries.iter_mut().find(|e| e.id() == entry.id()) {
                Some(e) if !e.active => {
                    e.active = true;
                    e.last_error.clear();
                    true
                }
                _ => false,
            }
        };

        if reactivated {
            self.events
                .info(&format!("Health check: reactivated proxy {key}"));
            self.events.proxy_reactivated(&entry.host, entry.port);
        }
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Charge a connection to an upstream.
    pub fn acquire(&self, key: &str) {
        *self.per_proxy.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    /// Release a previously charged connection.
    pub fn release(&self, key: &str) {
        let mut map = self.per_proxy.lock().unwrap();
        if let Some(count) = map.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn connections_for(&self, key: &str) -> usize {
        self.per_proxy.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Per-upstream connection counts, for the stats line.
    pub fn connections_snapshot(&self) -> Vec<(String, usize)> {
        self.per_proxy
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Reset counters and the rotation cursor. Used on service stop.
    pub fn reset_counters(&self) {
        self.per_proxy.lock().unwrap().clear();
        *self.cursor.lock().unwrap() = RotationCursor::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ProxyProtocol;
    use crate::events::test_support::RecordingEvents;
    use crate::events::NullEvents;

    fn sink() -> Arc<EventSink> {
        Arc::new(EventSink::new(Arc::new(NullEvents), false))
    }

    fn recording() -> (Arc<RecordingEvents>, Arc<EventSink>) {
        let rec = Arc::new(RecordingEvents::default());
        let sink = Arc::new(EventSink::new(rec.clone(), true));
        (rec, sink)
    }

    fn pool(n: usize) -> Vec<ProxyEntry> {
        (0..n)
            .map(|i| ProxyEntry::new(ProxyProtocol::Socks5, &format!("10.0.0.{}", i + 1), 1080))
            .collect()
    }

    #[test]
    fn test_select_empty_pool() {
        let reg = ProxyRegistry::new(sink());
        assert!(reg.select(SelectionMode::Random, None).is_none());
        assert!(reg.select(SelectionMode::RoundRobin, None).is_none());
    }

    #[test]
    fn test_round_robin_never_repeats() {
        let reg = ProxyRegistry::with_entries(pool(3), sink());

        let mut last: Option<ProxyId> = None;
        for _ in 0..20 {
            let e = reg.select(SelectionMode::RoundRobin, None).unwrap();
            if let Some(prev) = &last {
                assert_ne!(prev, &e.id(), "round-robin repeated an upstream");
            }
            last = Some(e.id());
        }
    }

    #[test]
    fn test_round_robin_wraps_in_order() {
        let reg = ProxyRegistry::with_entries(pool(3), sink());
        let hosts: Vec<String> = (0..6)
            .map(|_| reg.select(SelectionMode::RoundRobin, None).unwrap().host)
            .collect();
        assert_eq!(
            hosts,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn test_round_robin_identity_survives_list_change() {
        let reg = ProxyRegistry::with_entries(pool(3), sink());
        let first = reg.select(SelectionMode::RoundRobin, None).unwrap();
        assert_eq!(first.host, "10.0.0.1");

        // Reorder the list; identity of the last-used entry still decides.
        let mut reordered = pool(3);
        reordered.reverse();
        reg.set_entries(reordered);

        // Last used was 10.0.0.1, now at index 2; next is index 0 = 10.0.0.3.
        let next = reg.select(SelectionMode::RoundRobin, None).unwrap();
        assert_eq!(next.host, "10.0.0.3");

        // Remove the last-used entry entirely; rotation restarts at 0.
        reg.set_entries(pool(2));
        let restarted = reg.select(SelectionMode::RoundRobin, None).unwrap();
        assert_eq!(restarted.host, "10.0.0.1");
    }

    #[test]
    fn test_select_skips_inactive_and_excluded() {
        let mut entries = pool(3);
        entries[0].active = false;
        let reg = ProxyRegistry::with_entries(entries, sink());

        for _ in 0..10 {
            let e = reg.select(SelectionMode::Random, Some("10.0.0.2:1080")).unwrap();
            assert_eq!(e.host, "10.0.0.3");
        }
    }

    #[test]
    fn test_select_none_when_all_excluded() {
        let reg = ProxyRegistry::with_entries(pool(1), sink());
        assert!(reg.select(SelectionMode::Random, Some("10.0.0.1:1080")).is_none());
    }

    #[test]
    fn test_three_failures_deactivate() {
        let (rec, sink) = recording();
        let reg = ProxyRegistry::with_entries(pool(1), sink);
        let entry = reg.entries()[0].clone();

        reg.record_failure(&entry);
        reg.record_failure(&entry);
        assert!(reg.entries()[0].active);
        assert_eq!(reg.failure_count("10.0.0.1:1080"), 2);

        reg.record_failure(&entry);
        let after = reg.entries()[0].clone();
        assert!(!after.active);
        assert_eq!(after.last_error, "Marked inactive after 3 consecutive failures");
        // Counter resets once the entry is deactivated.
        assert_eq!(reg.failure_count("10.0.0.1:1080"), 0);

        let failed = rec.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "10.0.0.1");
        assert_eq!(failed[0].1, 1080);
    }

    #[test]
    fn test_success_clears_failures() {
        let reg = ProxyRegistry::with_entries(pool(1), sink());
        let entry = reg.entries()[0].clone();

        reg.record_failure(&entry);
        reg.record_failure(&entry);
        reg.record_success(&entry);
        assert_eq!(reg.failure_count("10.0.0.1:1080"), 0);

        // Two fresh failures still leave it active.
        reg.record_failure(&entry);
        reg.record_failure(&entry);
        assert!(reg.entries()[0].active);
    }

    #[test]
    fn test_mark_healthy_reactivates() {
        let (rec, sink) = recording();
        let reg = ProxyRegistry::with_entries(pool(1), sink);
        let entry = reg.entries()[0].clone();

        for _ in 0..3 {
            reg.record_failure(&entry);
        }
        assert!(!reg.entries()[0].active);

        reg.mark_healthy(&entry);
        let after = reg.entries()[0].clone();
        assert!(after.active);
        assert!(after.last_error.is_empty());
        assert_eq!(rec.reactivated.lock().unwrap().len(), 1);

        // Healthy on an already-active entry does not re-notify.
        reg.mark_healthy(&entry);
        assert_eq!(rec.reactivated.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_direct_entries_never_tracked() {
        let reg = ProxyRegistry::new(sink());
        let direct = ProxyEntry::direct("example.com", 443);
        reg.record_failure(&direct);
        reg.record_failure(&direct);
        reg.record_failure(&direct);
        assert_eq!(reg.failure_count("example.com:443"), 0);
    }

    #[test]
    fn test_rotation_under_failure() {
        // Three upstreams in round-robin: A fails once, B fails once, C
        // succeeds, then the wrap selects A again since it is still active.
        let reg = ProxyRegistry::with_entries(pool(3), sink());

        let a = reg.select(SelectionMode::RoundRobin, None).unwrap();
        assert_eq!(a.host, "10.0.0.1");
        reg.record_failure(&a);
        assert_eq!(reg.failure_count(&a.key()), 1);

        let b = reg.select(SelectionMode::RoundRobin, Some(&a.key())).unwrap();
        assert_eq!(b.host, "10.0.0.2");
        reg.record_failure(&b);

        let c = reg.select(SelectionMode::RoundRobin, Some(&b.key())).unwrap();
        assert_eq!(c.host, "10.0.0.3");
        reg.record_success(&c);

        let next = reg.select(SelectionMode::RoundRobin, None).unwrap();
        assert_eq!(next.host, "10.0.0.1");
        assert!(next.active);
    }

    #[test]
    fn test_connection_counters() {
        let reg = ProxyRegistry::new(sink());
        reg.acquire("a:1");
        reg.acquire("a:1");
        reg.acquire("b:2");
        assert_eq!(reg.connections_for("a:1"), 2);
        assert_eq!(reg.connections_for("b:2"), 1);

        reg.release("a:1");
        assert_eq!(reg.connections_for("a:1"), 1);
        reg.release("a:1");
        reg.release("a:1"); // over-release saturates at zero
        assert_eq!(reg.connections_for("a:1"), 0);

        reg.reset_counters();
        assert!(reg.connections_snapshot().is_empty());
    }
}
