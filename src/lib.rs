//! Per-process energy accounting and package power capping for Linux.
//!
//! This crate estimates, for every non-kernel process on the host, how much
//! electrical energy (in microjoules) and power (in milliwatts) that process
//! is consuming. The estimate is a linear model over a fixed set of hardware
//! performance counters attached to each process; the model is re-evaluated
//! on a short periodic tick. Alongside the per-process model, a package-level
//! sampler reads the RAPL energy register and differentiates it into package
//! power, which can optionally drive a feedback loop that caps per-policy CPU
//! frequency so the package stays near a configured power target.
//!
//! The moving parts:
//!
//! -   A [`Registry`] of [`TracedTask`] records, one per observed process,
//!     shared between the scheduler adapters and the workers.
//!
//! -   [`SchedAdapters`], the fast-path callbacks for process fork, process
//!     exit, and context switch. They are limited to atomic operations plus
//!     one registry lock acquire, and never attach counters themselves.
//!
//! -   An [`Engine`] running the slow-path workers: budgeted counter setup,
//!     record retirement, the periodic energy estimator, the periodic package
//!     power sampler, and a one-shot scan of pre-existing processes.
//!
//! -   A [`TraceSource`] that feeds the adapters from the kernel's sched
//!     tracepoints, resolved by name from tracefs and observed through
//!     per-CPU `perf_event_open` sampling counters.
//!
//! Counter access and MSR access sit behind the [`CounterBackend`] and
//! [`Msr`] traits, so the whole engine can run against simulated hardware;
//! the [`sim`] module provides a scripted counter backend for exactly that.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pacct_energy::{Config, Engine, EnergyModel, PerfCounterBackend, TraceSource};
//!
//! fn main() -> Result<(), pacct_energy::Error> {
//!     let engine = Engine::start(
//!         Config::default(),
//!         Arc::new(PerfCounterBackend),
//!         EnergyModel::default(),
//!         None,
//!         None,
//!     )?;
//!     let source = TraceSource::start(engine.adapters())?;
//!     // ... run until told to stop ...
//!     source.stop();
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! [`CounterBackend`]: counter::CounterBackend
//! [`Msr`]: rapl::Msr
//! [`TraceSource`]: source::TraceSource

#![deny(missing_docs)]

use std::io;
use std::path::PathBuf;

pub mod counter;
pub mod engine;
mod estimator;
pub mod events;
pub mod export;
mod flags;
pub mod powercap;
pub mod rapl;
pub mod registry;
pub mod sched;
pub mod sim;
pub mod source;
pub mod task;

pub use crate::counter::{CounterBackend, EventCounter, PerfCounterBackend};
pub use crate::engine::{Config, Engine, SETUP_BUDGET};
pub use crate::events::{CounterDescriptor, EnergyModel, TRACKED_EVENTS};
pub use crate::flags::ReadFormat;
pub use crate::registry::Registry;
pub use crate::sched::SchedAdapters;
pub use crate::source::TraceSource;
pub use crate::task::{TaskState, TracedTask};

/// A process identifier, as used by the kernel interfaces this crate talks to.
pub type Pid = libc::pid_t;

/// Errors that can abort engine or trace-source startup.
///
/// Runtime errors never surface through this type: per the error policy, a
/// failed counter attach leaves a sentinel in the slot, a failed MSR read
/// skips that sampler tick, and nothing that happens after startup can do
/// worse than leave some task without an energy reading.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither `/sys/kernel/tracing` nor `/sys/kernel/debug/tracing` holds a
    /// usable tracefs events directory.
    #[error("tracefs is not mounted (looked in /sys/kernel/tracing and /sys/kernel/debug/tracing)")]
    TracefsNotFound,

    /// One of the three sched tracepoints this crate binds to was not found.
    /// Each missing tracepoint reports its own name.
    #[error("tracepoint {0} not found")]
    TracepointMissing(&'static str),

    /// The power-cap controller found no cpufreq policies to put ceilings on.
    #[error("no cpufreq policy found under {}, cannot powercap", .0.display())]
    NoCpufreqPolicies(PathBuf),

    /// An underlying system call or file operation failed during startup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A type whose values can be safely accessed as a slice of bytes.
///
/// # Safety
///
/// `Self` must be a type such that storing a value in memory initializes all
/// the bytes of that memory, so that `slice_as_bytes_mut` can never expose
/// uninitialized bytes to the caller.
unsafe trait SliceAsBytesMut: Sized {
    fn slice_as_bytes_mut(slice: &mut [Self]) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                slice.as_mut_ptr() as *mut u8,
                std::mem::size_of_val(slice),
            )
        }
    }
}

unsafe impl SliceAsBytesMut for u64 {}

/// Produce an `io::Result` from an errno-style system call.
///
/// An 'errno-style' system call is one that reports failure by returning -1
/// and setting the C `errno` value when an error occurs.
pub(crate) fn check_errno_syscall<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
    R: PartialOrd + Default,
{
    let result = f();
    if result < R::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// The kernel's `PF_KTHREAD` task flag, as reported in `/proc/<pid>/stat`.
pub(crate) const PF_KTHREAD: u64 = 0x0020_0000;

/// Whether `pid` is a kernel thread, judged from its stat flags.
///
/// A process that cannot be inspected (typically because it is already gone)
/// is treated as an ordinary process; the registry copes with records for
/// vanished pids anyway.
pub(crate) fn is_kernel_thread(pid: Pid) -> bool {
    procfs::process::Process::new(pid)
        .and_then(|p| p.stat())
        .map(|stat| stat.flags as u64 & PF_KTHREAD != 0)
        .unwrap_or(false)
}

/// The monotonic clock in nanoseconds, the time base for all wall-time deltas.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
