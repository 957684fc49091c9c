//! The work pipeline: everything that must not run on the fast path.
//!
//! Five jobs run here, mirroring the split described in the crate docs:
//!
//! 1.  the budgeted **setup worker**, attaching counters to records that
//!     want them (at most [`SETUP_BUDGET`] per run),
//! 2.  the **retire worker**, draining the retiring list and dropping the
//!     list's reference so records release their counters,
//! 3.  the periodic **energy estimator**,
//! 4.  the periodic **package power sampler**, which also drives the
//!     optional power-cap controller,
//! 5.  the one-shot **existing-process scanner** that seeds the registry
//!     with everything already running when the engine starts.
//!
//! Setup and retire share one maintenance thread fed by a work queue;
//! enqueueing a job that is already queued is a no-op, and a run drains
//! whatever is waiting when it starts. The periodic workers re-arm
//! themselves only while the estimator-enabled flag is set, and shutdown
//! joins every worker before the registry is torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{info, warn};

use crate::counter::CounterBackend;
use crate::estimator::EstimateTick;
use crate::events::EnergyModel;
use crate::export::ExportSurface;
use crate::powercap::PowerCap;
use crate::rapl::PackageSampler;
use crate::registry::Registry;
use crate::sched::SchedAdapters;
use crate::task::SetupStatus;
use crate::{monotonic_ns, Error, PF_KTHREAD};

/// How many setup candidates one run of the setup worker will process.
pub const SETUP_BUDGET: usize = 32;

/// Engine configuration. These are the module parameters of the system plus
/// the periods of the two periodic workers.
#[derive(Clone, Debug)]
pub struct Config {
    /// RAPL PMU type identifier. Accepted for interface compatibility; the
    /// MSR-based package sampler does not consume it.
    pub rapl_pmu_type: u32,
    /// Whether the power-cap controller is stepped from package samples.
    pub enable_power_cap: bool,
    /// Target package power in mW for the controller.
    pub target_mw: u64,
    /// Hysteresis margin in mW around the target in which the controller
    /// does nothing.
    pub hysteresis_mw: u64,
    /// Step size in kHz for frequency ceiling adjustments.
    pub step_khz: u64,
    /// Period of the energy estimator.
    pub energy_estimate_period: Duration,
    /// Period of the package power sampler.
    pub total_power_gather_period: Duration,
    /// Delay before the existing-process scan runs.
    pub scan_delay: Duration,
    /// Whether to scan pre-existing processes at all. On by default; tests
    /// that construct their own process population turn it off.
    pub scan_existing: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rapl_pmu_type: 32,
            enable_power_cap: false,
            target_mw: 30_000,
            hysteresis_mw: 800,
            step_khz: 100_000,
            energy_estimate_period: Duration::from_millis(30),
            total_power_gather_period: Duration::from_millis(150),
            scan_delay: Duration::from_millis(100),
            scan_existing: true,
        }
    }
}

enum Job {
    Setup,
    Retire,
    Shutdown,
}

/// The setup/retire work queue shared with the fast-path adapters.
///
/// Queueing is a channel send guarded by a pending flag, so it never blocks
/// and enqueueing an already-queued job is a no-op.
pub(crate) struct WorkQueue {
    tx: Sender<Job>,
    setup_pending: AtomicBool,
    retire_pending: AtomicBool,
}

impl WorkQueue {
    pub(crate) fn queue_setup(&self) {
        if !self.setup_pending.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Job::Setup);
        }
    }

    pub(crate) fn queue_retire(&self) {
        if !self.retire_pending.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Job::Retire);
        }
    }
}

/// The running accounting engine.
///
/// Constructed with [`Engine::start`], fed through the adapters returned by
/// [`Engine::adapters`], and torn down with [`Engine::shutdown`] (or by
/// dropping it, which does the same).
pub struct Engine {
    registry: Arc<Registry>,
    work: Arc<WorkQueue>,
    estimator_enabled: Arc<AtomicBool>,
    total_power: Arc<AtomicU64>,
    stop_tx: Option<Sender<()>>,
    maintenance: Option<JoinHandle<()>>,
    estimator: Option<JoinHandle<()>>,
    sampler: Option<JoinHandle<()>>,
    scanner: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start the engine: spawn the maintenance worker, the two periodic
    /// workers, and (unless disabled) the existing-process scanner.
    ///
    /// `package` is the RAPL sampler to use for package power, if one could
    /// be opened; `powercap` the initialized controller, if capping is
    /// wanted. Both are optional so the accounting side works on machines
    /// where neither is accessible.
    pub fn start(
        config: Config,
        backend: Arc<dyn CounterBackend>,
        model: EnergyModel,
        package: Option<PackageSampler>,
        powercap: Option<PowerCap>,
    ) -> Result<Engine, Error> {
        Self::start_with_export(config, backend, model, package, powercap, None)
    }

    /// Like [`Engine::start`], additionally publishing per-task `energy_uj`
    /// files under `export` (the surface directory is created inside it).
    pub fn start_with_export(
        config: Config,
        backend: Arc<dyn CounterBackend>,
        model: EnergyModel,
        package: Option<PackageSampler>,
        mut powercap: Option<PowerCap>,
        export: Option<ExportSurface>,
    ) -> Result<Engine, Error> {
        let registry = Arc::new(Registry::new(model.len()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let work = Arc::new(WorkQueue {
            tx,
            setup_pending: AtomicBool::new(false),
            retire_pending: AtomicBool::new(false),
        });
        let estimator_enabled = Arc::new(AtomicBool::new(true));
        let total_power = Arc::new(AtomicU64::new(0));
        let export = Arc::new(export);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let maintenance = {
            let registry = registry.clone();
            let work = work.clone();
            let backend = backend.clone();
            let export = export.clone();
            thread::Builder::new()
                .name("pacct-maintenance".into())
                .spawn(move || maintenance_worker(rx, &registry, &work, &*backend, model, &export))?
        };

        let estimator = {
            let registry = registry.clone();
            let enabled = estimator_enabled.clone();
            let export = export.clone();
            let period = config.energy_estimate_period;
            let stop_rx = stop_rx.clone();
            thread::Builder::new()
                .name("pacct-estimator".into())
                .spawn(move || {
                    while enabled.load(Ordering::Acquire) {
                        match stop_rx.recv_timeout(period) {
                            Err(RecvTimeoutError::Timeout) => {
                                estimate_tick(&registry, &model, &export)
                            }
                            _ => break,
                        }
                    }
                })?
        };

        let sampler = {
            let registry = registry.clone();
            let enabled = estimator_enabled.clone();
            let total_power = total_power.clone();
            let stop_rx = stop_rx.clone();
            let config = config.clone();
            let mut package = package;
            thread::Builder::new()
                .name("pacct-power".into())
                .spawn(move || {
                    while enabled.load(Ordering::Acquire) {
                        match stop_rx.recv_timeout(config.total_power_gather_period) {
                            Err(RecvTimeoutError::Timeout) => gather_power_tick(
                                &registry,
                                &total_power,
                                package.as_mut(),
                                powercap.as_mut().filter(|_| config.enable_power_cap),
                            ),
                            _ => break,
                        }
                    }
                })?
        };

        let scanner = if config.scan_existing {
            let registry = registry.clone();
            let work = work.clone();
            let delay = config.scan_delay;
            Some(
                thread::Builder::new()
                    .name("pacct-scan".into())
                    .spawn(move || {
                        if let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(delay) {
                            scan_existing_processes(&registry);
                            work.queue_setup();
                        }
                    })?,
            )
        } else {
            None
        };

        Ok(Engine {
            registry,
            work,
            estimator_enabled,
            total_power,
            stop_tx: Some(stop_tx),
            maintenance: Some(maintenance),
            estimator: Some(estimator),
            sampler: Some(sampler),
            scanner,
        })
    }

    /// The fast-path adapters feeding this engine.
    pub fn adapters(&self) -> SchedAdapters {
        SchedAdapters {
            registry: self.registry.clone(),
            work: self.work.clone(),
        }
    }

    /// The task registry, for inspection.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sum of per-task wall-referenced power from the last sampler tick, mW.
    pub fn total_power_mw(&self) -> u64 {
        self.total_power.load(Ordering::Relaxed)
    }

    /// Tear the engine down: stop the periodic workers, retire every record,
    /// and join all worker threads. Counters are all released when this
    /// returns.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(maintenance) = self.maintenance.take() else {
            return;
        };

        // Stop re-arming, then wake and join the periodic workers.
        self.estimator_enabled.store(false, Ordering::Release);
        drop(self.stop_tx.take());
        for handle in [
            self.estimator.take(),
            self.sampler.take(),
            self.scanner.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }

        // With the periodic workers quiesced, move everything still live to
        // the retiring list and let the retire worker drop the references.
        self.registry.drain_live_into_retiring();
        self.work.queue_retire();
        let _ = self.work.tx.send(Job::Shutdown);
        let _ = maintenance.join();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn maintenance_worker(
    rx: Receiver<Job>,
    registry: &Registry,
    work: &WorkQueue,
    backend: &dyn CounterBackend,
    model: EnergyModel,
    export: &Option<ExportSurface>,
) {
    for job in rx {
        match job {
            Job::Setup => run_setup(registry, work, backend, &model),
            Job::Retire => run_retire(registry, work, export),
            Job::Shutdown => break,
        }
    }
}

/// Attach counters for up to [`SETUP_BUDGET`] waiting records, yielding
/// between candidates. If the budget was exhausted the worker re-queues
/// itself so the remainder is picked up by the next run.
fn run_setup(registry: &Registry, work: &WorkQueue, backend: &dyn CounterBackend, model: &EnergyModel) {
    work.setup_pending.store(false, Ordering::Release);

    let mut done = 0;
    while done < SETUP_BUDGET {
        let Some(task) = registry.pick_setup_candidate() else {
            break;
        };
        match task.setup_counters(backend, model) {
            SetupStatus::Ready => task.set_ready(),
            SetupStatus::ProcessGone => {
                task.mark_retiring();
                registry.move_to_retiring(&task);
                work.queue_retire();
            }
        }
        done += 1;
        thread::yield_now();
    }

    if done == SETUP_BUDGET {
        work.queue_setup();
    }
}

/// Drain the retiring list in FIFO order, dropping the list's reference so
/// the record destructor releases its counters.
fn run_retire(registry: &Registry, work: &WorkQueue, export: &Option<ExportSurface>) {
    work.retire_pending.store(false, Ordering::Release);

    while let Some(task) = registry.pop_retiring() {
        if let Some(export) = export {
            export.retire(task.pid());
        }
        drop(task);
        thread::yield_now();
    }
}

/// One estimator tick over every ready, non-retiring live record.
fn estimate_tick(registry: &Registry, model: &EnergyModel, export: &Option<ExportSurface>) {
    let mut tick = EstimateTick::new();
    for task in registry.snapshot_live() {
        if !task.is_ready() || task.is_retiring() {
            continue;
        }
        tick.estimate_record(&task, model);
        if let Some(export) = export {
            export.publish(&task);
        }
    }
}

/// One power-sampler tick: total up per-task wall power, sample the package,
/// and step the controller when capping is enabled.
fn gather_power_tick(
    registry: &Registry,
    total_power: &AtomicU64,
    package: Option<&mut PackageSampler>,
    powercap: Option<&mut PowerCap>,
) {
    let mut total = 0_u64;
    for task in registry.snapshot_live() {
        if !task.is_ready() {
            continue;
        }
        total = total.saturating_add(task.power_wall_mw());
    }
    total_power.store(total, Ordering::Relaxed);

    let Some(package) = package else {
        info!("power: tasks {} mW, package sampler unavailable", total);
        return;
    };
    match package.sample(monotonic_ns()) {
        Ok(pkg_mw) => {
            info!("power: tasks {} mW, package {} mW", total, pkg_mw);
            if let Some(cap) = powercap {
                cap.step(pkg_mw);
            }
        }
        // Skip the tick: a failed sample must not drive the controller.
        Err(e) => warn!("failed to read package energy, skipping tick: {}", e),
    }
}

/// Seed the registry with every user process already running, the same way
/// the fork adapter would have.
fn scan_existing_processes(registry: &Registry) {
    let procs = match procfs::process::all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            warn!("failed to enumerate processes: {}", e);
            return;
        }
    };
    for process in procs {
        let Ok(stat) = process.stat() else {
            // The process can be gone by the time we stat it.
            continue;
        };
        if stat.flags as u64 & PF_KTHREAD != 0 {
            continue;
        }
        registry.lookup_or_create(process.pid, &stat.comm, true);
    }
}
