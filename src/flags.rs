#![allow(missing_docs)]

use bitflags::bitflags;

use perf_event_open_sys::bindings;

bitflags! {
    /// Specifies what a `read(2)` on a counter file descriptor returns
    /// alongside the count itself.
    ///
    /// These values correspond to `PERF_FORMAT_x` values. See the
    /// [manpage] for documentation on what they mean.
    ///
    /// [manpage]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html
    pub struct ReadFormat: u64 {
        const TOTAL_TIME_ENABLED = bindings::PERF_FORMAT_TOTAL_TIME_ENABLED as u64;
        const TOTAL_TIME_RUNNING = bindings::PERF_FORMAT_TOTAL_TIME_RUNNING as u64;
        const ID = bindings::PERF_FORMAT_ID as u64;
        const GROUP = bindings::PERF_FORMAT_GROUP as u64;
    }
}
