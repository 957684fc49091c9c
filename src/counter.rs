//! The counter backend: attaching and reading per-process hardware counters.
//!
//! The accounting engine only ever talks to counters through the
//! [`CounterBackend`] and [`EventCounter`] traits. The real implementation,
//! [`PerfCounterBackend`], opens one `PERF_TYPE_RAW` counter per tracked
//! event per process via `perf_event_open(2)`; tests interpose the scripted
//! backend from [`crate::sim`] instead and the rest of the engine cannot
//! tell the difference.
//!
//! Attaching may block in the kernel, so it only ever happens on the setup
//! worker, never on the scheduler fast path.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd};

use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

use crate::check_errno_syscall;
use crate::flags::ReadFormat;
use crate::{Pid, SliceAsBytesMut};

/// An attached, enabled counter for one hardware event on one process.
///
/// Dropping the handle releases the kernel-side counter. A handle is owned
/// exclusively by the task record it was attached for; nothing in it points
/// back at the record.
pub trait EventCounter: Send + Sync + std::fmt::Debug {
    /// The counter's current value, scaled for time multiplexing.
    ///
    /// When the kernel had to timeshare the hardware counter, the raw value
    /// only covers the time the counter was actually running; the returned
    /// value is `raw * time_enabled / time_running` to estimate the full
    /// total. Read failures report zero, which the saturating delta logic
    /// upstream absorbs.
    fn read_scaled(&self) -> u64;
}

/// Creates counters bound to a specific process.
pub trait CounterBackend: Send + Sync {
    /// Attach a counter for the raw event `(event_code, umask)` to `pid`.
    ///
    /// The counter is created disabled and enabled before being returned, so
    /// a successful attach is already counting. This may block and must not
    /// be called from the scheduler fast path.
    fn attach(&self, pid: Pid, event_code: u8, umask: u8) -> io::Result<Box<dyn EventCounter>>;
}

/// The real backend, built on `perf_event_open(2)`.
pub struct PerfCounterBackend;

impl CounterBackend for PerfCounterBackend {
    fn attach(&self, pid: Pid, event_code: u8, umask: u8) -> io::Result<Box<dyn EventCounter>> {
        let counter = PerfCounter::open(pid, event_code, umask)?;
        counter.enable()?;
        Ok(Box::new(counter))
    }
}

/// A counter file descriptor returned by `perf_event_open`.
#[derive(Debug)]
struct PerfCounter {
    file: File,
}

impl PerfCounter {
    /// Open a disabled raw-event counter observing `pid` on any CPU.
    fn open(pid: Pid, event_code: u8, umask: u8) -> io::Result<PerfCounter> {
        let mut attrs = perf_event_attr {
            // Setting `size` accurately will not prevent the code from
            // working on older kernels; the kernel zero-fills the rest.
            size: std::mem::size_of::<perf_event_attr>() as u32,
            type_: sys::bindings::PERF_TYPE_RAW,
            config: event_code as u64 | (umask as u64) << 8,
            ..perf_event_attr::default()
        };

        attrs.set_disabled(1);
        // Count user, kernel, and hypervisor time alike: the model was
        // calibrated against whole-process activity.
        attrs.set_exclude_kernel(0);
        attrs.set_exclude_user(0);
        attrs.set_exclude_hv(0);

        // Request `time_enabled` and `time_running` so reads can be scaled
        // when the PMU is overcommitted and multiplexing happens.
        attrs.read_format =
            (ReadFormat::TOTAL_TIME_ENABLED | ReadFormat::TOTAL_TIME_RUNNING).bits();

        let file = unsafe {
            File::from_raw_fd(check_errno_syscall(|| {
                sys::perf_event_open(&mut attrs, pid, -1, -1, 0)
            })?)
        };

        Ok(PerfCounter { file })
    }

    fn enable(&self) -> io::Result<()> {
        check_errno_syscall(|| unsafe { sys::ioctls::ENABLE(self.file.as_raw_fd(), 0) })
            .map(|_| ())
    }
}

impl EventCounter for PerfCounter {
    fn read_scaled(&self) -> u64 {
        // With our read_format the kernel returns [value, enabled, running].
        let mut data = [0_u64; 3];
        match (&self.file).read(u64::slice_as_bytes_mut(&mut data)) {
            Ok(n) if n >= std::mem::size_of_val(&data) => {}
            _ => return 0,
        }
        let [value, enabled, running] = data;
        if running > 0 {
            (value as u128 * enabled as u128 / running as u128).min(u64::MAX as u128) as u64
        } else {
            value
        }
    }
}

impl Drop for PerfCounter {
    fn drop(&mut self) {
        // Stop counting before the descriptor goes away; the close itself
        // releases the kernel counter.
        unsafe {
            sys::ioctls::DISABLE(self.file.as_raw_fd(), 0);
        }
    }
}
