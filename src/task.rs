//! The per-process accounting record.
//!
//! A [`TracedTask`] is the central mutable entity: one exists per observed
//! process, shared via `Arc` between the registry lists, the scheduler
//! fast path, and the workers. All mutable state on it is atomic (or, for
//! the counter slots, guarded by a lock that the fast path only ever tries),
//! so the fast path never blocks on a record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;

use crate::counter::{CounterBackend, EventCounter};
use crate::events::EnergyModel;
use crate::Pid;

/// The longest process name a record captures, matching the kernel's comm.
pub const COMM_LEN: usize = 16;

/// A snapshot of a task's scheduler-visible state, supplied by whoever
/// invokes the adapters (the Linux trace source in production, the test
/// harness under test).
#[derive(Clone, Debug)]
pub struct TaskState {
    /// The process id.
    pub pid: Pid,
    /// The process name at the time of the event.
    pub comm: String,
    /// Cumulative on-CPU execution time of the task, in nanoseconds.
    pub exec_runtime_ns: u64,
    /// Monotonic wall time of the event, in nanoseconds.
    pub timestamp_ns: u64,
    /// Whether the task is a kernel thread; kernel threads are never traced.
    pub kernel_thread: bool,
}

/// One counter slot on a record.
///
/// A slot is empty until the setup worker runs, and afterwards holds either
/// a usable counter or the failed sentinel. Failed slots are silently
/// ignored by every reader; they accumulate no deltas and contribute zero
/// to the model.
pub enum EventSlot {
    /// No attach has been attempted yet.
    Empty,
    /// A usable, enabled counter.
    Attached(Box<dyn EventCounter>),
    /// Attach failed; the slot is treated as disabled.
    Failed,
}

impl EventSlot {
    fn is_attached(&self) -> bool {
        matches!(self, EventSlot::Attached(_))
    }
}

/// What the setup worker concluded about a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SetupStatus {
    /// Every slot is attached or carries the failed sentinel; the record is
    /// ready for accounting.
    Ready,
    /// The process no longer exists; the record should be retired.
    ProcessGone,
}

/// The per-process accounting record.
///
/// Reference counting follows the registry rules: the *live* (or *retiring*)
/// list owns one reference, and every lookup hands out one more for the
/// duration of the caller's use. Dropping the last reference releases all
/// counter handles and frees the record.
pub struct TracedTask {
    pid: Pid,
    comm: String,

    ready: AtomicBool,
    needs_setup: AtomicBool,
    retiring: AtomicBool,

    /// Counter slots, written by the setup worker before `ready` is
    /// published and only read by fast paths that observed `ready`.
    events: RwLock<Box<[EventSlot]>>,

    /// Last scaled value seen per counter, fast-path only.
    counts: Box<[AtomicU64]>,
    /// Per-interval count deltas, drained by the estimator with an
    /// exchange-to-zero so each delta is observed exactly once.
    pub(crate) diff_counts: Box<[AtomicU64]>,

    last_exec_runtime: AtomicU64,
    pub(crate) delta_exec_runtime_acc: AtomicU64,
    last_timestamp_ns: AtomicU64,
    pub(crate) delta_timestamp_acc: AtomicU64,

    /// Cumulative observed CPU time; estimator only.
    pub(crate) total_exec_runtime_acc: AtomicU64,

    pub(crate) energy: AtomicU64,
    pub(crate) power_a: AtomicU64,
    pub(crate) power_i: AtomicU64,
    pub(crate) power_w: AtomicU64,

    record_count: AtomicU64,
}

impl TracedTask {
    /// Allocate a fresh record with `n_events` empty counter slots.
    ///
    /// The record starts not ready and wanting setup. Creation performs no
    /// I/O and never blocks beyond the allocation itself, because the fork
    /// adapter calls it from the fast path.
    pub(crate) fn new(pid: Pid, comm: &str, n_events: usize) -> Arc<TracedTask> {
        let mut comm = comm.to_owned();
        if comm.len() > COMM_LEN {
            // Comms can be lossily decoded; never split a character.
            let mut end = COMM_LEN;
            while !comm.is_char_boundary(end) {
                end -= 1;
            }
            comm.truncate(end);
        }
        Arc::new(TracedTask {
            pid,
            comm,
            ready: AtomicBool::new(false),
            needs_setup: AtomicBool::new(true),
            retiring: AtomicBool::new(false),
            events: RwLock::new(
                (0..n_events)
                    .map(|_| EventSlot::Empty)
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            ),
            counts: (0..n_events).map(|_| AtomicU64::new(0)).collect(),
            diff_counts: (0..n_events).map(|_| AtomicU64::new(0)).collect(),
            last_exec_runtime: AtomicU64::new(0),
            delta_exec_runtime_acc: AtomicU64::new(0),
            last_timestamp_ns: AtomicU64::new(0),
            delta_timestamp_acc: AtomicU64::new(0),
            total_exec_runtime_acc: AtomicU64::new(0),
            energy: AtomicU64::new(0),
            power_a: AtomicU64::new(0),
            power_i: AtomicU64::new(0),
            power_w: AtomicU64::new(0),
            record_count: AtomicU64::new(0),
        })
    }

    /// The process id this record accounts for.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The process name captured when the record was created.
    pub fn comm(&self) -> &str {
        &self.comm
    }

    /// Whether counters are attached and the record participates in
    /// estimation.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the record is on its way out and must be skipped.
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    /// Cumulative estimated energy, in microjoules.
    pub fn energy_uj(&self) -> u64 {
        self.energy.load(Ordering::Relaxed)
    }

    /// Running-average power over the task's observed CPU time, in mW.
    pub fn power_avg_mw(&self) -> u64 {
        self.power_a.load(Ordering::Relaxed)
    }

    /// Smoothed instantaneous power over CPU time, in mW.
    pub fn power_instant_mw(&self) -> u64 {
        self.power_i.load(Ordering::Relaxed)
    }

    /// Smoothed power over wall-clock time, in mW.
    pub fn power_wall_mw(&self) -> u64 {
        self.power_w.load(Ordering::Relaxed)
    }

    /// How many context-switch records the fast path has folded in.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_retiring(&self) {
        self.retiring.store(true, Ordering::Release);
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn request_setup(&self) {
        self.needs_setup.store(true, Ordering::Release);
    }

    /// Claim the record for setup, clearing the request. Called under the
    /// registry lock by the setup worker's candidate scan.
    pub(crate) fn take_setup_request(&self) -> bool {
        self.needs_setup.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn wants_setup(&self) -> bool {
        !self.is_ready() && self.needs_setup.load(Ordering::Acquire)
    }

    /// Fold one scheduler observation into the record.
    ///
    /// The first observation only establishes baselines. Afterwards each
    /// call accumulates the execution-time delta, the wall-time delta, and
    /// one delta per attached counter, all with saturating subtraction so
    /// counter resets or wraparound never inject negative deltas.
    pub fn record_deltas(&self, state: &TaskState) {
        if self.last_exec_runtime.load(Ordering::Relaxed) == 0
            || self.last_timestamp_ns.load(Ordering::Relaxed) == 0
        {
            self.init_baselines(state);
            return;
        }

        let prev_exec = self
            .last_exec_runtime
            .swap(state.exec_runtime_ns, Ordering::Relaxed);
        self.delta_exec_runtime_acc.fetch_add(
            state.exec_runtime_ns.saturating_sub(prev_exec),
            Ordering::Relaxed,
        );

        let prev_ts = self
            .last_timestamp_ns
            .swap(state.timestamp_ns, Ordering::Relaxed);
        self.delta_timestamp_acc.fetch_add(
            state.timestamp_ns.saturating_sub(prev_ts),
            Ordering::Relaxed,
        );

        // try_read keeps the fast path non-blocking: the only writer is the
        // setup worker, which finishes before `ready` is published, so a
        // miss here can only happen on a record that is not yet accounting.
        if let Some(events) = self.events.try_read() {
            for (i, slot) in events.iter().enumerate() {
                if let EventSlot::Attached(counter) = slot {
                    let value = counter.read_scaled();
                    let prev = self.counts[i].swap(value, Ordering::Relaxed);
                    self.diff_counts[i].fetch_add(value.saturating_sub(prev), Ordering::Relaxed);
                }
            }
        }

        self.record_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Populate time baselines and current counter values without
    /// accumulating anything.
    fn init_baselines(&self, state: &TaskState) {
        self.last_exec_runtime
            .store(state.exec_runtime_ns, Ordering::Relaxed);
        self.last_timestamp_ns
            .store(state.timestamp_ns, Ordering::Relaxed);
        if let Some(events) = self.events.try_read() {
            for (i, slot) in events.iter().enumerate() {
                if let EventSlot::Attached(counter) = slot {
                    self.counts[i].store(counter.read_scaled(), Ordering::Relaxed);
                }
            }
        }
    }

    /// Attach every missing counter slot through the backend.
    ///
    /// Runs on the setup worker only. A slot whose attach fails keeps the
    /// failed sentinel and the record still becomes ready; a process that no
    /// longer exists reports [`SetupStatus::ProcessGone`] so the caller can
    /// retire the record instead of parking it forever.
    pub(crate) fn setup_counters(
        &self,
        backend: &dyn CounterBackend,
        model: &EnergyModel,
    ) -> SetupStatus {
        let mut events = self.events.write();
        for (i, desc) in model.descriptors().iter().enumerate() {
            if events[i].is_attached() {
                continue;
            }
            match backend.attach(self.pid, desc.event_code, desc.umask) {
                Ok(counter) => events[i] = EventSlot::Attached(counter),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    return SetupStatus::ProcessGone;
                }
                Err(e) => {
                    warn!(
                        "failed to set up counter for pid {} event code {:#04x} umask {:#04x}: {}",
                        self.pid, desc.event_code, desc.umask, e
                    );
                    events[i] = EventSlot::Failed;
                }
            }
        }
        SetupStatus::Ready
    }
}

impl std::fmt::Debug for TracedTask {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TracedTask")
            .field("pid", &self.pid)
            .field("comm", &self.comm)
            .field("ready", &self.is_ready())
            .field("retiring", &self.is_retiring())
            .field("energy_uj", &self.energy_uj())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use crate::events::CounterDescriptor;

    static TABLE: [CounterDescriptor; 2] = [
        CounterDescriptor {
            event_code: 0x01,
            umask: 0,
            koeff: 1,
        },
        CounterDescriptor {
            event_code: 0x02,
            umask: 0,
            koeff: 1,
        },
    ];

    fn state(pid: Pid, exec_ns: u64, ts_ns: u64) -> TaskState {
        TaskState {
            pid,
            comm: "test".into(),
            exec_runtime_ns: exec_ns,
            timestamp_ns: ts_ns,
            kernel_thread: false,
        }
    }

    #[test]
    fn first_observation_only_sets_baselines() {
        let task = TracedTask::new(7, "test", 2);
        task.record_deltas(&state(7, 1_000, 50_000));
        assert_eq!(task.delta_exec_runtime_acc.load(Ordering::Relaxed), 0);
        assert_eq!(task.delta_timestamp_acc.load(Ordering::Relaxed), 0);

        task.record_deltas(&state(7, 3_000, 56_000));
        assert_eq!(task.delta_exec_runtime_acc.load(Ordering::Relaxed), 2_000);
        assert_eq!(task.delta_timestamp_acc.load(Ordering::Relaxed), 6_000);
    }

    #[test]
    fn deltas_saturate_on_counter_regression() {
        let task = TracedTask::new(7, "test", 2);
        task.record_deltas(&state(7, 5_000, 50_000));
        // Execution time going backwards must not underflow.
        task.record_deltas(&state(7, 4_000, 51_000));
        assert_eq!(task.delta_exec_runtime_acc.load(Ordering::Relaxed), 0);
        assert_eq!(task.delta_timestamp_acc.load(Ordering::Relaxed), 1_000);
    }

    #[test]
    fn attached_counters_accumulate_diffs() {
        let model = EnergyModel::new(&TABLE);
        let backend = SimBackend::new();
        let task = TracedTask::new(7, "test", model.len());
        assert_eq!(
            task.setup_counters(&backend, &model),
            SetupStatus::Ready
        );
        task.set_ready();

        backend.set_count(7, 0x01, 0, 100);
        task.record_deltas(&state(7, 1_000, 50_000));

        backend.set_count(7, 0x01, 0, 350);
        backend.set_count(7, 0x02, 0, 40);
        task.record_deltas(&state(7, 2_000, 51_000));

        assert_eq!(task.diff_counts[0].load(Ordering::Relaxed), 250);
        assert_eq!(task.diff_counts[1].load(Ordering::Relaxed), 40);
        assert_eq!(task.record_count(), 1);
    }

    #[test]
    fn failed_slot_keeps_record_usable() {
        let model = EnergyModel::new(&TABLE);
        let backend = SimBackend::new();
        backend.fail_event(0x02, 0);
        let task = TracedTask::new(7, "test", model.len());
        assert_eq!(task.setup_counters(&backend, &model), SetupStatus::Ready);
        task.set_ready();

        backend.set_count(7, 0x01, 0, 10);
        task.record_deltas(&state(7, 1_000, 50_000));
        backend.set_count(7, 0x01, 0, 25);
        task.record_deltas(&state(7, 2_000, 51_000));

        assert_eq!(task.diff_counts[0].load(Ordering::Relaxed), 15);
        assert_eq!(task.diff_counts[1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dead_process_reports_gone() {
        let model = EnergyModel::new(&TABLE);
        let backend = SimBackend::new();
        backend.mark_dead(9);
        let task = TracedTask::new(9, "test", model.len());
        assert_eq!(
            task.setup_counters(&backend, &model),
            SetupStatus::ProcessGone
        );
    }

    #[test]
    fn comm_is_truncated() {
        let task = TracedTask::new(1, "a-very-long-process-name", 0);
        assert_eq!(task.comm().len(), COMM_LEN);
    }
}
