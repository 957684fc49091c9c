//! A scripted counter backend for tests and development.
//!
//! Hardware counters are inherently non-deterministic, and attaching them to
//! arbitrary processes needs privileges a test run would rather not have.
//! [`SimBackend`] stands in for the real backend behind the same
//! [`CounterBackend`] trait: tests decide exactly what every counter reads,
//! which attaches fail, and which processes look dead, and can check
//! afterwards that every handle the engine attached was released again.
//!
//! [`CounterBackend`]: crate::counter::CounterBackend

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::counter::{CounterBackend, EventCounter};
use crate::Pid;

/// A counter attach key: process plus raw event selector.
type Key = (Pid, u8, u8);

#[derive(Default, Debug)]
struct SimState {
    /// Scripted value per attached counter.
    counters: Mutex<HashMap<Key, Arc<AtomicU64>>>,
    /// Event selectors whose attach fails with `EIO`.
    failing: Mutex<Vec<(u8, u8)>>,
    /// Processes whose attach fails with `ESRCH`.
    dead: Mutex<Vec<Pid>>,
    /// Attached-and-not-yet-dropped handle count.
    live_handles: AtomicUsize,
    /// Total successful attaches.
    attaches: AtomicUsize,
}

/// A simulated counter backend.
///
/// Clones share state, so a test can keep one handle for scripting while the
/// engine owns another.
#[derive(Clone, Default)]
pub struct SimBackend {
    state: Arc<SimState>,
}

impl SimBackend {
    /// A fresh backend with no scripted failures.
    pub fn new() -> SimBackend {
        SimBackend::default()
    }

    /// Make every attach of `(event_code, umask)` fail with `EIO`.
    pub fn fail_event(&self, event_code: u8, umask: u8) {
        self.state.failing.lock().push((event_code, umask));
    }

    /// Make every attach to `pid` fail with `ESRCH`, as the kernel does for
    /// a process that no longer exists.
    pub fn mark_dead(&self, pid: Pid) {
        self.state.dead.lock().push(pid);
    }

    /// Script the value the counter for `(pid, event_code, umask)` reads.
    ///
    /// The counter need not be attached yet; the value is picked up when it
    /// is.
    pub fn set_count(&self, pid: Pid, event_code: u8, umask: u8, value: u64) {
        let cell = self
            .state
            .counters
            .lock()
            .entry((pid, event_code, umask))
            .or_default()
            .clone();
        cell.store(value, Ordering::Relaxed);
    }

    /// How many counters are currently attached and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state.live_handles.load(Ordering::Relaxed)
    }

    /// How many attaches have succeeded over the backend's lifetime.
    pub fn total_attaches(&self) -> usize {
        self.state.attaches.load(Ordering::Relaxed)
    }
}

impl CounterBackend for SimBackend {
    fn attach(&self, pid: Pid, event_code: u8, umask: u8) -> io::Result<Box<dyn EventCounter>> {
        if self.state.dead.lock().contains(&pid) {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        if self.state.failing.lock().contains(&(event_code, umask)) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let value = self
            .state
            .counters
            .lock()
            .entry((pid, event_code, umask))
            .or_default()
            .clone();
        self.state.live_handles.fetch_add(1, Ordering::Relaxed);
        self.state.attaches.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimCounter {
            value,
            state: self.state.clone(),
        }))
    }
}

/// A counter handle returning whatever the test scripted.
#[derive(Debug)]
struct SimCounter {
    value: Arc<AtomicU64>,
    state: Arc<SimState>,
}

impl EventCounter for SimCounter {
    fn read_scaled(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Drop for SimCounter {
    fn drop(&mut self) {
        self.state.live_handles.fetch_sub(1, Ordering::Relaxed);
    }
}
