//! The registry of traced tasks: the *live* and *retiring* lists.
//!
//! One lock guards both lists; everything else on a record is atomic and is
//! touched outside the lock. A record belongs to at most one of the two
//! lists at any instant, and every list membership counts as one strong
//! reference, so a record reachable from a list can never be freed under a
//! reader that looked it up.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::TracedTask;
use crate::Pid;

struct Lists {
    live: Vec<Arc<TracedTask>>,
    retiring: VecDeque<Arc<TracedTask>>,
}

/// The set of traced-task records, keyed by process id.
pub struct Registry {
    lists: Mutex<Lists>,
    n_events: usize,
}

impl Registry {
    /// An empty registry whose records carry `n_events` counter slots.
    pub fn new(n_events: usize) -> Registry {
        Registry {
            lists: Mutex::new(Lists {
                live: Vec::new(),
                retiring: VecDeque::new(),
            }),
            n_events,
        }
    }

    /// Look up `pid` on the live list, optionally creating a record.
    ///
    /// On a hit the existing record is returned; on a miss with `create`
    /// set, a fresh record (not ready, wanting setup) is inserted and
    /// returned. Creation allocates but performs no I/O, because the fork
    /// adapter calls this from the fast path.
    pub fn lookup_or_create(
        &self,
        pid: Pid,
        comm: &str,
        create: bool,
    ) -> Option<Arc<TracedTask>> {
        let mut lists = self.lists.lock();
        if let Some(task) = lists.live.iter().find(|t| t.pid() == pid) {
            return Some(task.clone());
        }
        if !create {
            return None;
        }
        let task = TracedTask::new(pid, comm, self.n_events);
        lists.live.push(task.clone());
        Some(task)
    }

    /// Look up `pid` on the live list without creating.
    pub fn lookup(&self, pid: Pid) -> Option<Arc<TracedTask>> {
        self.lookup_or_create(pid, "", false)
    }

    /// Atomically move a record from *live* to the back of *retiring*.
    ///
    /// A record the live list no longer holds (a racing exit already moved
    /// it) is left alone, so the move happens at most once.
    pub fn move_to_retiring(&self, task: &Arc<TracedTask>) {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.live.iter().position(|t| Arc::ptr_eq(t, task)) {
            let task = lists.live.remove(pos);
            lists.retiring.push_back(task);
        }
    }

    /// Pop the oldest retiring record, releasing the list's reference to the
    /// caller. Used by the retire worker to drain in FIFO order.
    pub fn pop_retiring(&self) -> Option<Arc<TracedTask>> {
        self.lists.lock().retiring.pop_front()
    }

    /// Move every live record to the retiring list. Part of shutdown, after
    /// the adapters have been unhooked.
    pub fn drain_live_into_retiring(&self) {
        let mut lists = self.lists.lock();
        while let Some(task) = lists.live.pop() {
            task.mark_retiring();
            lists.retiring.push_back(task);
        }
    }

    /// Clone out the current live list so workers can visit records without
    /// holding the lock.
    pub fn snapshot_live(&self) -> Vec<Arc<TracedTask>> {
        self.lists.lock().live.clone()
    }

    /// Claim one record that wants setup, clearing its request under the
    /// lock. Returns `None` when no candidate remains.
    pub(crate) fn pick_setup_candidate(&self) -> Option<Arc<TracedTask>> {
        let lists = self.lists.lock();
        for task in &lists.live {
            if task.wants_setup() && task.take_setup_request() {
                return Some(task.clone());
            }
        }
        None
    }

    /// Number of live records.
    pub fn live_len(&self) -> usize {
        self.lists.lock().live.len()
    }

    /// Number of records waiting to be retired.
    pub fn retiring_len(&self) -> usize {
        self.lists.lock().retiring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_miss_without_create() {
        let registry = Registry::new(1);
        assert!(registry.lookup(42).is_none());
        assert_eq!(registry.live_len(), 0);
    }

    #[test]
    fn create_then_lookup_returns_same_record() {
        let registry = Registry::new(1);
        let a = registry.lookup_or_create(42, "a", true).unwrap();
        let b = registry.lookup(42).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_len(), 1);
    }

    #[test]
    fn move_to_retiring_is_idempotent() {
        let registry = Registry::new(1);
        let task = registry.lookup_or_create(42, "a", true).unwrap();
        registry.move_to_retiring(&task);
        registry.move_to_retiring(&task);
        assert_eq!(registry.live_len(), 0);
        assert_eq!(registry.retiring_len(), 1);
        assert!(registry.lookup(42).is_none());
    }

    #[test]
    fn retiring_drains_fifo() {
        let registry = Registry::new(1);
        let a = registry.lookup_or_create(1, "a", true).unwrap();
        let b = registry.lookup_or_create(2, "b", true).unwrap();
        registry.move_to_retiring(&a);
        registry.move_to_retiring(&b);
        assert_eq!(registry.pop_retiring().unwrap().pid(), 1);
        assert_eq!(registry.pop_retiring().unwrap().pid(), 2);
        assert!(registry.pop_retiring().is_none());
    }

    #[test]
    fn setup_candidates_are_claimed_once() {
        let registry = Registry::new(1);
        registry.lookup_or_create(1, "a", true).unwrap();
        registry.lookup_or_create(2, "b", true).unwrap();
        let first = registry.pick_setup_candidate().unwrap();
        let second = registry.pick_setup_candidate().unwrap();
        assert_ne!(first.pid(), second.pid());
        assert!(registry.pick_setup_candidate().is_none());
    }
}
