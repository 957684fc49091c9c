//! The Linux trace source: turns kernel sched tracepoints into adapter
//! calls.
//!
//! One feed thread per CPU owns three `PERF_TYPE_TRACEPOINT` sampling
//! counters (`sched_switch`, `sched_process_fork`, `sched_process_exit`,
//! resolved by name from tracefs), each with its own mmap ring. The threads
//! poll their descriptors, decode raw tracepoint payloads using the field
//! layout from tracefs, and invoke the corresponding [`SchedAdapters`]
//! callback with a [`TaskState`] snapshot.
//!
//! Observing every process on a CPU requires `CAP_PERFMON` (or root);
//! failing to open the counters aborts startup, per the init error policy.

pub mod tracefs;

mod ring;

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

use self::ring::RingBuffer;
use self::tracefs::{SchedTracepoints, TracepointDesc};
use crate::sched::SchedAdapters;
use crate::task::TaskState;
use crate::{check_errno_syscall, is_kernel_thread, Error, Pid};

/// Ring size per sampled tracepoint, in pages.
const RING_PAGES: usize = 16;

/// Poll timeout, which bounds how quickly a feed thread notices shutdown.
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// Which sched tracepoint a sampled counter carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SchedEvent {
    Switch,
    Fork,
    Exit,
}

struct SampledEvent {
    file: File,
    ring: RingBuffer,
    kind: SchedEvent,
}

/// The running per-CPU tracepoint feeds.
pub struct TraceSource {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl TraceSource {
    /// Bind the sched tracepoints and start one feed thread per CPU.
    ///
    /// All counters are opened before any thread starts, so a permission
    /// problem or missing tracepoint unwinds startup completely instead of
    /// surfacing later as a half-blind engine.
    pub fn start(adapters: SchedAdapters) -> Result<TraceSource, Error> {
        let events_root = tracefs::tracefs_events_root()?;
        let tracepoints = Arc::new(tracefs::bind_sched_tracepoints(&events_root)?);

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(cpus);

        let mut feeds = Vec::with_capacity(cpus);
        for cpu in 0..cpus {
            let events = vec![
                open_sampled_event(&tracepoints.switch, cpu, SchedEvent::Switch)?,
                open_sampled_event(&tracepoints.fork, cpu, SchedEvent::Fork)?,
                open_sampled_event(&tracepoints.exit, cpu, SchedEvent::Exit)?,
            ];
            feeds.push((cpu, events));
        }

        info!(
            "trace source: {} cpus, tracepoint ids switch={} fork={} exit={}",
            cpus, tracepoints.switch.id, tracepoints.fork.id, tracepoints.exit.id
        );

        for (cpu, events) in feeds {
            let feed = Feed {
                adapters: adapters.clone(),
                tracepoints: tracepoints.clone(),
                stop: stop.clone(),
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("pacct-trace{}", cpu))
                    .spawn(move || feed.run(events))?,
            );
        }

        Ok(TraceSource { stop, threads })
    }

    /// Stop the feed threads and wait for them. After this returns, no
    /// adapter is invoked anymore and the engine can be shut down.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Open a sampling counter for `tracepoint` observing every pid on `cpu`,
/// with a one-event wakeup and its ring mapped, enabled on return.
fn open_sampled_event(
    tracepoint: &TracepointDesc,
    cpu: usize,
    kind: SchedEvent,
) -> io::Result<SampledEvent> {
    let mut attrs = perf_event_attr {
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_: sys::bindings::PERF_TYPE_TRACEPOINT,
        config: tracepoint.id as u64,
        sample_type: (sys::bindings::PERF_SAMPLE_TID
            | sys::bindings::PERF_SAMPLE_TIME
            | sys::bindings::PERF_SAMPLE_RAW) as u64,
        ..perf_event_attr::default()
    };
    attrs.__bindgen_anon_1.sample_period = 1;
    attrs.__bindgen_anon_2.wakeup_events = 1;
    attrs.set_disabled(1);

    let file = unsafe {
        File::from_raw_fd(check_errno_syscall(|| {
            sys::perf_event_open(&mut attrs, -1, cpu as libc::c_int, -1, 0)
        })?)
    };
    let ring = RingBuffer::new(&file, RING_PAGES)?;
    check_errno_syscall(|| unsafe { sys::ioctls::ENABLE(file.as_raw_fd(), 0) })?;

    Ok(SampledEvent { file, ring, kind })
}

struct Feed {
    adapters: SchedAdapters,
    tracepoints: Arc<SchedTracepoints>,
    stop: Arc<AtomicBool>,
}

impl Feed {
    fn run(self, mut events: Vec<SampledEvent>) {
        let mut pollfds: Vec<libc::pollfd> = events
            .iter()
            .map(|e| libc::pollfd {
                fd: e.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let mut payload = Vec::new();

        while !self.stop.load(Ordering::Acquire) {
            let ret = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as _, POLL_TIMEOUT_MS)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                warn!("trace feed poll failed, stopping: {}", err);
                break;
            }
            for event in &mut events {
                while let Some(ty) = event.ring.next_record(&mut payload) {
                    if ty == sys::bindings::PERF_RECORD_SAMPLE {
                        self.dispatch(event.kind, &payload);
                    }
                }
            }
        }
    }

    fn dispatch(&self, kind: SchedEvent, payload: &[u8]) {
        let Some(sample) = parse_sample(payload) else {
            return;
        };
        match kind {
            SchedEvent::Switch => {
                let desc = &self.tracepoints.switch;
                let Some(pid) = decoded_pid(desc, sample.raw, "prev_pid") else {
                    return;
                };
                let comm = desc.read_comm(sample.raw, "prev_comm").unwrap_or_default();
                self.adapters.on_switch(&TaskState {
                    pid,
                    comm,
                    exec_runtime_ns: read_schedstat_ns(pid),
                    timestamp_ns: sample.time,
                    kernel_thread: false,
                });
            }
            SchedEvent::Fork => {
                let desc = &self.tracepoints.fork;
                let Some(pid) = decoded_pid(desc, sample.raw, "child_pid") else {
                    return;
                };
                let comm = desc.read_comm(sample.raw, "child_comm").unwrap_or_default();
                self.adapters.on_fork(&TaskState {
                    pid,
                    comm,
                    exec_runtime_ns: 0,
                    timestamp_ns: sample.time,
                    kernel_thread: is_kernel_thread(pid),
                });
            }
            SchedEvent::Exit => {
                let desc = &self.tracepoints.exit;
                let Some(pid) = decoded_pid(desc, sample.raw, "pid") else {
                    return;
                };
                let comm = desc.read_comm(sample.raw, "comm").unwrap_or_default();
                self.adapters.on_exit(&TaskState {
                    pid,
                    comm,
                    exec_runtime_ns: read_schedstat_ns(pid),
                    timestamp_ns: sample.time,
                    kernel_thread: false,
                });
            }
        }
    }
}

/// Decode a pid field, filtering out the idle task (pid 0).
fn decoded_pid(desc: &TracepointDesc, raw: &[u8], field: &str) -> Option<Pid> {
    match desc.read_i32(raw, field) {
        Some(pid) if pid > 0 => Some(pid),
        _ => None,
    }
}

struct Sample<'a> {
    time: u64,
    raw: &'a [u8],
}

/// Split a `PERF_RECORD_SAMPLE` payload laid out for
/// `PERF_SAMPLE_TID | TIME | RAW`: pid, tid, time, raw size, raw bytes.
fn parse_sample(payload: &[u8]) -> Option<Sample> {
    if payload.len() < 20 {
        return None;
    }
    let time = u64::from_ne_bytes(payload[8..16].try_into().ok()?);
    let raw_size = u32::from_ne_bytes(payload[16..20].try_into().ok()?) as usize;
    let raw = payload.get(20..20 + raw_size)?;
    Some(Sample { time, raw })
}

/// The task's cumulative on-CPU time from `/proc/<pid>/schedstat`, or 0 when
/// the process is already gone.
fn read_schedstat_ns(pid: Pid) -> u64 {
    std::fs::read_to_string(format!("/proc/{}/schedstat", pid))
        .ok()
        .and_then(|text| text.split_whitespace().next()?.parse().ok())
        .unwrap_or(0)
}
