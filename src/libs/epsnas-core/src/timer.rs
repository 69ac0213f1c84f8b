//! NAS timer service
//!
//! One-shot retransmission timers (T3450, T3460, T3470, ...) keyed by an
//! opaque timer identifier. A BTreeMap orders armed timers by absolute
//! deadline, which gives O(log n) arm/disarm like a red-black tree.
//!
//! Timers are driven manually: the owning event loop calls [`NasTimerMgr::next`]
//! to learn how long it may sleep and [`NasTimerMgr::expire`] to collect the
//! events whose deadline has passed. A timer that has been stopped is never
//! returned by a later `expire` call, so a stop racing an expiry always wins.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Timer handle type.
pub type NasTimerId = u64;

/// Sentinel meaning "no timer is running".
pub const NAS_TIMER_INACTIVE_ID: NasTimerId = 0;

/// Ordering key: absolute deadline with the timer id as tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: u128,
    id: NasTimerId,
}

#[derive(Debug)]
struct TimerEntry<T> {
    duration: Duration,
    deadline: Option<u128>,
    event: T,
}

/// Manager for one-shot NAS timers carrying an event payload of type `T`.
pub struct NasTimerMgr<T> {
    entries: HashMap<NasTimerId, TimerEntry<T>>,
    tree: BTreeMap<TimerKey, NasTimerId>,
    next_id: NasTimerId,
    epoch: Instant,
}

impl<T: Clone> NasTimerMgr<T> {
    pub fn new() -> Self {
        NasTimerMgr {
            entries: HashMap::new(),
            tree: BTreeMap::new(),
            next_id: NAS_TIMER_INACTIVE_ID + 1,
            epoch: Instant::now(),
        }
    }

    /// Arm a new timer. The returned id is never `NAS_TIMER_INACTIVE_ID`.
    pub fn start(&mut self, duration: Duration, event: T) -> NasTimerId {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = self.instant_to_nanos(Instant::now() + duration);
        self.entries.insert(
            id,
            TimerEntry {
                duration,
                deadline: Some(deadline),
                event,
            },
        );
        self.tree.insert(TimerKey { deadline, id }, id);
        id
    }

    /// Disarm and discard a timer. Returns `NAS_TIMER_INACTIVE_ID` so callers
    /// can overwrite their handle in one statement. Stopping an unknown or
    /// already-expired id is a no-op.
    pub fn stop(&mut self, id: NasTimerId) -> NasTimerId {
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(deadline) = entry.deadline {
                self.tree.remove(&TimerKey { deadline, id });
            }
        }
        NAS_TIMER_INACTIVE_ID
    }

    /// Re-arm a timer with its original duration. Works on a timer that has
    /// expired but not been stopped. Returns the id, or
    /// `NAS_TIMER_INACTIVE_ID` when the timer is unknown.
    pub fn restart(&mut self, id: NasTimerId) -> NasTimerId {
        let now = self.instant_to_nanos(Instant::now());
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if let Some(deadline) = entry.deadline.take() {
                    self.tree.remove(&TimerKey { deadline, id });
                }
                let deadline = now + entry.duration.as_nanos();
                entry.deadline = Some(deadline);
                self.tree.insert(TimerKey { deadline, id }, id);
                id
            }
            None => NAS_TIMER_INACTIVE_ID
        }
    }

    /// Whether the timer is armed (started or restarted and not yet expired).
    pub fn is_running(&self, id: NasTimerId) -> bool {
        self.entries
            .get(&id)
            .map(|e| e.deadline.is_some())
            .unwrap_or(false)
    }

    /// Time until the earliest deadline, or `Duration::MAX` when idle.
    pub fn next(&self) -> Duration {
        match self.tree.first_key_value() {
            Some((key, _)) => {
                let now = self.instant_to_nanos(Instant::now());
                if key.deadline > now {
                    Duration::from_nanos((key.deadline - now) as u64)
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::MAX,
        }
    }

    /// Collect the events of every timer whose deadline has passed. Expired
    /// timers stay known to the manager (so `restart` keeps working on them)
    /// but fire at most once per arming.
    pub fn expire(&mut self) -> Vec<(NasTimerId, T)> {
        let now = self.instant_to_nanos(Instant::now());
        let due: Vec<TimerKey> = self
            .tree
            .range(
                ..=TimerKey {
                    deadline: now,
                    id: NasTimerId::MAX,
                },
            )
            .map(|(k, _)| *k)
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for key in due {
            self.tree.remove(&key);
            if let Some(entry) = self.entries.get_mut(&key.id) {
                entry.deadline = None;
                fired.push((key.id, entry.event.clone()));
            }
        }
        fired
    }

    /// Number of armed timers.
    pub fn count(&self) -> usize {
        self.tree.len()
    }

    fn instant_to_nanos(&self, instant: Instant) -> u128 {
        instant.duration_since(self.epoch).as_nanos()
    }
}

impl<T: Clone> Default for NasTimerMgr<T> {
    fn default() -> Self {
        Self::new()
    }
}
