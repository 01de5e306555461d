//! Cyclic transmission scheduling.
//!
//! Holds the set of frames to be re-sent at fixed periods and the worker
//! loop that sweeps due entries onto the transport. Deadlines are absolute
//! instants on the monotonic clock, so lateness in one cycle never drifts
//! the average period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use embedded_can::{Frame as _, Id};
use tracing::debug;

use crate::frame::Frame;

/// How a cyclic entry is addressed: an explicit name, or the frame's own
/// identifier when none was given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CyclicKey {
    Id(Id),
    Name(String),
}

impl From<Id> for CyclicKey {
    fn from(id: Id) -> Self {
        CyclicKey::Id(id)
    }
}

impl From<&str> for CyclicKey {
    fn from(name: &str) -> Self {
        CyclicKey::Name(name.to_owned())
    }
}

impl From<String> for CyclicKey {
    fn from(name: String) -> Self {
        CyclicKey::Name(name)
    }
}

struct CyclicEntry {
    key: CyclicKey,
    frame: Frame,
    period: Duration,
    next_run: Instant,
    active: bool,
}

/// Keyed table of cyclic entries plus the worker wakeup.
///
/// One mutex serializes every mutation; the condvar wakes the worker when
/// the earliest deadline may have moved. Entries stay in insertion order,
/// so same-sweep sends are ordered too.
pub(crate) struct CyclicScheduler {
    entries: Mutex<Vec<CyclicEntry>>,
    wakeup: Condvar,
}

impl CyclicScheduler {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
        }
    }

    /// Insert or replace the entry for `key` (defaults to the frame id).
    /// A replaced entry keeps its position but restarts its schedule.
    pub fn add(&self, frame: Frame, period: Duration, key: Option<CyclicKey>) -> bool {
        if period.is_zero() {
            return false;
        }
        let key = key.unwrap_or_else(|| CyclicKey::Id(frame.id()));
        let entry = CyclicEntry {
            key,
            next_run: Instant::now() + period,
            frame,
            period,
            active: true,
        };
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.wakeup.notify_all();
        true
    }

    /// Swap the payload of an existing entry. The schedule (and the active
    /// flag) are left untouched.
    pub fn update(&self, frame: Frame, key: Option<CyclicKey>) -> bool {
        let key = key.unwrap_or_else(|| CyclicKey::Id(frame.id()));
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.frame = frame;
                true
            }
            None => false,
        }
    }

    /// Deactivate the entry for `key`, leaving it listable. Re-adding the
    /// key starts a fresh schedule.
    pub fn stop(&self, key: &CyclicKey) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.key == *key) {
            Some(entry) => {
                entry.active = false;
                self.wakeup.notify_all();
                true
            }
            None => false,
        }
    }

    /// Snapshot of (key, active) pairs in insertion order.
    pub fn list(&self) -> Vec<(CyclicKey, bool)> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|e| (e.key.clone(), e.active)).collect()
    }

    /// Wake the worker so it rechecks the running flag.
    pub fn wake(&self) {
        self.wakeup.notify_all();
    }

    /// Worker loop body. Runs until `running` clears.
    ///
    /// `send` is the bus transmit path (so loopback applies to cyclic
    /// traffic too); a `false` return is a dropped cycle.
    pub fn run(&self, send: &dyn Fn(&Frame) -> bool, running: &AtomicBool) {
        // Final approach to a deadline is finished off-lock with yields:
        // condvar timeouts alone are too coarse at the 10ms end.
        const SPIN_WINDOW: Duration = Duration::from_millis(1);
        const IDLE_WAIT: Duration = Duration::from_millis(500);

        let mut due: Vec<Frame> = Vec::new();
        let mut entries = self.entries.lock().unwrap();
        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            let deadline = entries
                .iter()
                .filter(|e| e.active)
                .map(|e| e.next_run)
                .min();
            match deadline {
                None => {
                    entries = self.wakeup.wait_timeout(entries, IDLE_WAIT).unwrap().0;
                }
                Some(deadline) if deadline > now + SPIN_WINDOW => {
                    let wait = deadline - now - SPIN_WINDOW;
                    // May wake early when the table changes; the next pass
                    // recomputes the earliest deadline either way.
                    entries = self.wakeup.wait_timeout(entries, wait).unwrap().0;
                }
                Some(deadline) => {
                    drop(entries);
                    while Instant::now() < deadline && running.load(Ordering::Acquire) {
                        std::thread::yield_now();
                    }
                    entries = self.entries.lock().unwrap();
                    let now = Instant::now();
                    for entry in entries.iter_mut().filter(|e| e.active) {
                        if entry.next_run <= now {
                            due.push(entry.frame.clone());
                            entry.next_run += entry.period;
                            if entry.next_run <= now {
                                // Fell a whole period behind: re-anchor
                                // instead of bursting to catch up.
                                entry.next_run = now + entry.period;
                            }
                        }
                    }
                    drop(entries);
                    // Sends happen with no lock held: a full outbound queue
                    // is a dropped cycle, not a stalled scheduler.
                    for frame in due.drain(..) {
                        if !send(&frame) {
                            debug!("cyclic send dropped, outbound queue full: {frame}");
                        }
                    }
                    entries = self.entries.lock().unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u16, payload: &[u8]) -> Frame {
        Frame::new_std(id, payload).unwrap()
    }

    #[test]
    fn key_defaults_to_frame_id() {
        let sched = CyclicScheduler::new();
        let f = frame(0x123, &[1]);
        assert!(sched.add(f.clone(), Duration::from_millis(100), None));
        assert!(sched.stop(&CyclicKey::Id(f.id())));
    }

    #[test]
    fn zero_period_rejected() {
        let sched = CyclicScheduler::new();
        assert!(!sched.add(frame(1, &[]), Duration::ZERO, None));
        assert!(sched.list().is_empty());
    }

    #[test]
    fn update_requires_existing_key() {
        let sched = CyclicScheduler::new();
        assert!(!sched.update(frame(1, &[]), Some("missing".into())));
        assert!(sched.add(frame(1, &[1]), Duration::from_millis(50), Some("a".into())));
        assert!(sched.update(frame(1, &[2]), Some("a".into())));
    }

    #[test]
    fn update_does_not_reset_schedule() {
        let sched = CyclicScheduler::new();
        sched.add(frame(1, &[1]), Duration::from_millis(50), Some("a".into()));
        let before = sched.entries.lock().unwrap()[0].next_run;
        sched.update(frame(1, &[9]), Some("a".into()));
        let entries = sched.entries.lock().unwrap();
        assert_eq!(entries[0].next_run, before);
        assert_eq!(entries[0].frame.data(), &[9]);
    }

    #[test]
    fn stop_deactivates_in_place() {
        let sched = CyclicScheduler::new();
        sched.add(frame(1, &[]), Duration::from_millis(50), Some("a".into()));
        sched.add(frame(2, &[]), Duration::from_millis(50), Some("b".into()));
        assert!(sched.stop(&"a".into()));
        assert!(!sched.stop(&"missing".into()));
        assert_eq!(
            sched.list(),
            vec![("a".into(), false), ("b".into(), true)]
        );
    }

    #[test]
    fn replace_keeps_position_and_reactivates() {
        let sched = CyclicScheduler::new();
        sched.add(frame(1, &[]), Duration::from_millis(50), Some("a".into()));
        sched.add(frame(2, &[]), Duration::from_millis(50), Some("b".into()));
        sched.stop(&"a".into());
        sched.add(frame(3, &[]), Duration::from_millis(70), Some("a".into()));
        assert_eq!(sched.list(), vec![("a".into(), true), ("b".into(), true)]);
    }
}
