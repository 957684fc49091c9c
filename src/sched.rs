//! The scheduler tracepoint adapters: process fork, process exit, and
//! context switch.
//!
//! These are the fast-path entry points, invoked once per scheduler event by
//! the trace source (or directly by tests). They are restricted to atomic
//! operations plus one registry lock acquire: no counter attach, no MSR
//! access, nothing that can block. Anything heavier is handed to the work
//! pipeline.

use std::sync::Arc;

use log::debug;

use crate::engine::WorkQueue;
use crate::registry::Registry;
use crate::task::TaskState;

/// Fast-path callbacks shared between the engine and its trace source.
///
/// Cloning is cheap and clones feed the same engine, so each per-CPU source
/// thread can own one.
#[derive(Clone)]
pub struct SchedAdapters {
    pub(crate) registry: Arc<Registry>,
    pub(crate) work: Arc<WorkQueue>,
}

impl SchedAdapters {
    /// A new process came into existence.
    ///
    /// Kernel threads are ignored. For anything else a record is created on
    /// the live list, marked as wanting setup, and the setup worker is
    /// queued to attach its counters off the fast path.
    pub fn on_fork(&self, child: &TaskState) {
        if child.kernel_thread {
            return;
        }
        let task = self
            .registry
            .lookup_or_create(child.pid, &child.comm, true);
        if let Some(task) = task {
            debug!("tracing new process pid {} comm {:?}", task.pid(), task.comm());
            self.work.queue_setup();
        }
    }

    /// A process exited.
    ///
    /// Takes the final delta snapshot, flags the record so the estimator
    /// skips it, moves it from *live* to *retiring* in one registry lock
    /// acquire, and queues the retire worker to drop the list's reference.
    pub fn on_exit(&self, state: &TaskState) {
        let Some(task) = self.registry.lookup(state.pid) else {
            return;
        };
        task.record_deltas(state);
        task.mark_retiring();
        self.registry.move_to_retiring(&task);
        debug!(
            "process exiting: pid {} comm {:?} energy estimate {} uJ",
            task.pid(),
            task.comm(),
            task.energy_uj()
        );
        self.work.queue_retire();
    }

    /// A context switch; `prev` is the task that just left the CPU.
    ///
    /// A record whose counters are not attached yet only re-requests setup;
    /// a ready record accumulates its deltas.
    pub fn on_switch(&self, prev: &TaskState) {
        let Some(task) = self.registry.lookup(prev.pid) else {
            return;
        };
        if !task.is_ready() {
            task.request_setup();
            return;
        }
        task.record_deltas(prev);
    }
}
