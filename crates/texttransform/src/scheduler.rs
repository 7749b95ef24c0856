use std::collections::HashMap;
use std::hash::Hash;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

struct State<K> {
    deadlines: HashMap<K, Instant>,
    shutdown: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    wake: Condvar,
}

impl<K> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Coalesces run requests per key. Each `schedule` restarts the key's timer;
/// once a key stays quiet for its delay it is queued exactly once for the
/// single consumer.
pub struct DebounceScheduler<K> {
    shared: Arc<Shared<K>>,
    sender: Sender<K>,
    ready: Receiver<K>,
    worker: Option<JoinHandle<()>>,
}

impl<K> DebounceScheduler<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadlines: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let (sender, ready) = mpsc::channel();
        let worker = {
            let shared = shared.clone();
            let sender = sender.clone();
            thread::spawn(move || run_timers(&shared, &sender))
        };
        Self {
            shared,
            sender,
            ready,
            worker: Some(worker),
        }
    }

    /// A zero delay queues the key immediately and drops any pending timer.
    pub fn schedule(&self, key: K, delay: Duration) {
        let mut state = self.shared.lock();
        if delay.is_zero() {
            state.deadlines.remove(&key);
            drop(state);
            let _ = self.sender.send(key);
            return;
        }
        debug!("scheduling {key:?} in {delay:?}");
        state.deadlines.insert(key, Instant::now() + delay);
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Returns true when a pending timer was removed.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.shared.lock().deadlines.remove(key).is_some();
        if removed {
            self.shared.wake.notify_all();
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().deadlines.len()
    }

    /// Blocks until a key is ready.
    pub fn next_ready(&self) -> Option<K> {
        self.ready.recv().ok()
    }

    pub fn try_next_ready(&self) -> Option<K> {
        self.ready.try_recv().ok()
    }

    pub fn next_ready_timeout(&self, timeout: Duration) -> Option<K> {
        match self.ready.recv_timeout(timeout) {
            Ok(key) => Some(key),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl<K> Default for DebounceScheduler<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for DebounceScheduler<K> {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_timers<K: Eq + Hash + Clone>(shared: &Shared<K>, sender: &Sender<K>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let mut due: Vec<(Instant, K)> = state
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        if !due.is_empty() {
            due.sort_by_key(|(deadline, _)| *deadline);
            for (_, key) in due {
                state.deadlines.remove(&key);
                if sender.send(key).is_err() {
                    return;
                }
            }
            continue;
        }
        let next = state.deadlines.values().min().copied();
        state = match next {
            Some(next) => {
                let wait = next.saturating_duration_since(now);
                shared
                    .wake
                    .wait_timeout(state, wait)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0)
            }
            None => shared
                .wake
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(40);
    const PATIENCE: Duration = Duration::from_secs(5);

    #[test]
    fn zero_delay_is_queued_immediately() {
        let scheduler = DebounceScheduler::new();
        scheduler.schedule("a.tt".to_string(), Duration::ZERO);
        assert_eq!(scheduler.try_next_ready().as_deref(), Some("a.tt"));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn bursts_collapse_into_one_run() {
        let scheduler = DebounceScheduler::new();
        for _ in 0..5 {
            scheduler.schedule("a.tt", SHORT);
        }
        assert_eq!(scheduler.next_ready_timeout(PATIENCE), Some("a.tt"));
        assert_eq!(scheduler.next_ready_timeout(SHORT * 3), None);
    }

    #[test]
    fn keys_are_debounced_independently() {
        let scheduler = DebounceScheduler::new();
        scheduler.schedule("slow.tt", SHORT * 4);
        scheduler.schedule("fast.tt", SHORT);
        assert_eq!(scheduler.next_ready_timeout(PATIENCE), Some("fast.tt"));
        assert_eq!(scheduler.next_ready_timeout(PATIENCE), Some("slow.tt"));
    }

    #[test]
    fn cancelled_keys_never_become_ready() {
        let scheduler = DebounceScheduler::new();
        scheduler.schedule("a.tt", SHORT);
        assert!(scheduler.cancel(&"a.tt"));
        assert!(!scheduler.cancel(&"a.tt"));
        assert_eq!(scheduler.next_ready_timeout(SHORT * 3), None);
    }
}
