use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::watch::matcher::Matcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

#[derive(Default)]
struct Resolution {
    line: Mutex<Option<String>>,
    ready: Condvar,
}

impl Resolution {
    fn resolve(&self, line: &str) -> bool {
        let mut slot = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(line.to_string());
        self.ready.notify_all();
        true
    }

    fn get(&self) -> Option<String> {
        self.line
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut slot = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Read-only view of one registered expectation.
#[derive(Clone)]
pub struct WatchHandle {
    id: WatchId,
    description: String,
    resolution: Arc<Resolution>,
}

impl WatchHandle {
    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.get().is_some()
    }

    /// The line that completed the expectation, once resolved.
    pub fn value(&self) -> Option<String> {
        self.resolution.get()
    }

    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.resolution.wait_until(deadline)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<String> {
        if self.wait_until(Instant::now() + timeout) {
            self.value()
        } else {
            None
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

struct Expectation {
    matcher: Arc<Matcher>,
    remaining: u32,
    handle: WatchHandle,
}

/// Pending expectations keyed by registration id. Ids grow monotonically, so
/// iteration follows registration order.
#[derive(Default)]
pub struct PatternRegistry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<WatchId, Expectation>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, matcher: Matcher, min_times: u32) -> WatchHandle {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = WatchHandle {
            id,
            description: matcher.description(),
            resolution: Arc::new(Resolution::default()),
        };
        let expectation = Expectation {
            matcher: Arc::new(matcher),
            remaining: min_times.max(1),
            handle: handle.clone(),
        };
        self.lock().insert(id, expectation);
        handle
    }

    pub fn pending(&self) -> Vec<WatchHandle> {
        self.lock()
            .values()
            .map(|expectation| expectation.handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn remaining(&self, id: WatchId) -> Option<u32> {
        self.lock().get(&id).map(|expectation| expectation.remaining)
    }

    /// Evaluates every registered matcher against `line` and resolves the
    /// expectations whose counter reaches zero. Returns the resolved handles.
    pub fn process_line(&self, line: &str, trace_id: &str) -> Vec<WatchHandle> {
        let snapshot: Vec<(WatchId, Arc<Matcher>)> = self
            .lock()
            .iter()
            .map(|(id, expectation)| (*id, Arc::clone(&expectation.matcher)))
            .collect();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let matched: Vec<WatchId> = snapshot
            .iter()
            .filter(|(id, matcher)| evaluate(*id, matcher, line, trace_id))
            .map(|(id, _)| *id)
            .collect();
        if matched.is_empty() {
            return Vec::new();
        }

        let completed = self.record_matches(&matched);
        for handle in &completed {
            if handle.resolution.resolve(line) {
                debug!(trace_id = %trace_id, watch = %handle.id, pattern = %handle.description, "watch resolved");
            } else {
                warn!(trace_id = %trace_id, watch = %handle.id, "watch already resolved; ignoring");
            }
        }
        completed
    }

    fn record_matches(&self, matched: &[WatchId]) -> Vec<WatchHandle> {
        let mut entries = self.lock();
        let mut completed = Vec::new();
        for id in matched {
            let Some(expectation) = entries.get_mut(id) else {
                continue;
            };
            expectation.remaining = expectation.remaining.saturating_sub(1);
            if expectation.remaining == 0 {
                if let Some(expectation) = entries.remove(id) {
                    completed.push(expectation.handle);
                }
            }
        }
        completed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<WatchId, Expectation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// A panicking predicate counts as "no match" for this line and stays registered.
fn evaluate(id: WatchId, matcher: &Matcher, line: &str, trace_id: &str) -> bool {
    match catch_unwind(AssertUnwindSafe(|| matcher.is_match(line))) {
        Ok(found) => {
            if found {
                debug!(trace_id = %trace_id, watch = %id, pattern = %matcher, "found log line");
            }
            found
        }
        Err(_) => {
            warn!(trace_id = %trace_id, watch = %id, pattern = %matcher, "watch predicate panicked; skipping line");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pattern(text: &str) -> Matcher {
        Matcher::pattern(text, "trace").expect("compile")
    }

    #[test]
    fn resolves_on_first_match() {
        let registry = PatternRegistry::new();
        let handle = registry.register(pattern("ready"), 1);
        for line in ["starting", "loading", "ready", "done"] {
            registry.process_line(line, "trace");
        }
        assert_eq!(handle.value().as_deref(), Some("ready"));
        assert!(registry.is_empty());
    }

    #[test]
    fn min_times_counts_matches_exactly() {
        let registry = PatternRegistry::new();
        let handle = registry.register(pattern("x"), 2);

        assert!(registry.process_line("x first", "trace").is_empty());
        assert_eq!(registry.remaining(handle.id()), Some(1));
        assert!(registry.process_line("y", "trace").is_empty());
        let resolved = registry.process_line("x second", "trace");

        assert_eq!(resolved.len(), 1);
        assert_eq!(handle.value().as_deref(), Some("x second"));
        // Later lines never overwrite the resolution.
        registry.process_line("x third", "trace");
        assert_eq!(handle.value().as_deref(), Some("x second"));
    }

    #[test]
    fn zero_min_times_behaves_like_one() {
        let registry = PatternRegistry::new();
        let handle = registry.register(pattern("boot"), 0);
        registry.process_line("boot completed", "trace");
        assert!(handle.is_resolved());
    }

    #[test]
    fn one_line_resolves_every_matching_watch() {
        let registry = PatternRegistry::new();
        let first = registry.register(pattern("Displayed"), 1);
        let second = registry.register(pattern("com\\.example"), 1);
        let other = registry.register(pattern("crash"), 1);

        let resolved = registry.process_line("I/ActivityManager: Displayed com.example/.Main", "trace");

        assert_eq!(resolved.len(), 2);
        assert!(first.is_resolved());
        assert!(second.is_resolved());
        assert!(!other.is_resolved());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn identical_patterns_are_independent() {
        let registry = PatternRegistry::new();
        let once = registry.register(pattern("tick"), 1);
        let twice = registry.register(pattern("tick"), 2);
        assert_ne!(once.id(), twice.id());

        registry.process_line("tick", "trace");
        assert!(once.is_resolved());
        assert!(!twice.is_resolved());
        registry.process_line("tick", "trace");
        assert!(twice.is_resolved());
    }

    #[test]
    fn panicking_predicate_stays_registered() {
        let registry = PatternRegistry::new();
        let flaky = registry.register(
            Matcher::predicate("flaky", |line| {
                if line == "boom" {
                    panic!("predicate failure");
                }
                line == "ok"
            }),
            1,
        );
        let steady = registry.register(pattern("boom"), 1);

        registry.process_line("boom", "trace");
        assert!(steady.is_resolved());
        assert!(!flaky.is_resolved());
        assert_eq!(registry.len(), 1);

        registry.process_line("ok", "trace");
        assert_eq!(flaky.value().as_deref(), Some("ok"));
    }

    #[test]
    fn resolution_is_written_once() {
        let resolution = Resolution::default();
        assert!(resolution.resolve("first"));
        assert!(!resolution.resolve("second"));
        assert_eq!(resolution.get().as_deref(), Some("first"));
    }

    #[test]
    fn wait_timeout_wakes_on_resolution() {
        let registry = Arc::new(PatternRegistry::new());
        let handle = registry.register(pattern("late"), 1);

        let feeder = Arc::clone(&registry);
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            feeder.process_line("late line", "trace");
        });

        assert_eq!(handle.wait_timeout(Duration::from_secs(2)).as_deref(), Some("late line"));
        join.join().expect("join");
    }

    #[test]
    fn wait_timeout_expires_without_match() {
        let registry = PatternRegistry::new();
        let handle = registry.register(pattern("never"), 1);
        let start = Instant::now();
        assert_eq!(handle.wait_timeout(Duration::from_millis(100)), None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
