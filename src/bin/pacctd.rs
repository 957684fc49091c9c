//! The per-process energy accounting daemon.
//!
//! Wires the engine to the real hardware: perf counters for the model, the
//! MSR device for package energy, cpufreq sysfs for the optional power cap,
//! and the kernel sched tracepoints as the event feed. Runs until SIGINT or
//! SIGTERM, then unhooks the trace source before tearing the engine down so
//! no adapter fires into a dying registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use pacct_energy::export::ExportSurface;
use pacct_energy::powercap::PowerCap;
use pacct_energy::rapl::{MsrDevice, PackageSampler};
use pacct_energy::{Config, Engine, EnergyModel, PerfCounterBackend, TraceSource};

#[derive(Parser)]
#[command(name = "pacctd", about = "Per-process energy accounting daemon")]
struct Opts {
    /// RAPL PMU type identifier (accepted for compatibility; the sampler
    /// uses the MSR interface).
    #[arg(long, default_value_t = 32)]
    rapl_pmu_type: u32,

    /// Enable the package power-cap controller.
    #[arg(long)]
    enable_power_cap: bool,

    /// Target package power in mW.
    #[arg(long, default_value_t = 30_000)]
    target_mw: u64,

    /// Hysteresis margin in mW around the target.
    #[arg(long, default_value_t = 800)]
    hysteresis_mw: u64,

    /// Frequency cap adjustment step in kHz.
    #[arg(long, default_value_t = 100_000)]
    step_khz: u64,

    /// Energy estimator period in milliseconds.
    #[arg(long, default_value_t = 30)]
    estimate_period_ms: u64,

    /// Package power sampling period in milliseconds.
    #[arg(long, default_value_t = 150)]
    gather_period_ms: u64,

    /// Directory to publish per-task energy files under; omitted, nothing
    /// is published.
    #[arg(long)]
    export_root: Option<PathBuf>,

    /// cpufreq sysfs root for the power-cap controller.
    #[arg(long, default_value = "/sys/devices/system/cpu/cpufreq")]
    cpufreq_root: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let config = Config {
        rapl_pmu_type: opts.rapl_pmu_type,
        enable_power_cap: opts.enable_power_cap,
        target_mw: opts.target_mw,
        hysteresis_mw: opts.hysteresis_mw,
        step_khz: opts.step_khz,
        energy_estimate_period: Duration::from_millis(opts.estimate_period_ms),
        total_power_gather_period: Duration::from_millis(opts.gather_period_ms),
        ..Config::default()
    };

    // Accounting still works without package power; warn and carry on.
    let package = match MsrDevice::open(0).and_then(|msr| PackageSampler::new(Box::new(msr))) {
        Ok(sampler) => Some(sampler),
        Err(e) => {
            warn!("package energy unavailable (is the msr module loaded?): {}", e);
            None
        }
    };

    let powercap = if opts.enable_power_cap {
        Some(
            PowerCap::init(
                &opts.cpufreq_root,
                opts.target_mw,
                opts.hysteresis_mw,
                opts.step_khz,
            )
            .context("failed to initialize the power-cap controller")?,
        )
    } else {
        None
    };

    let export = opts
        .export_root
        .as_deref()
        .map(ExportSurface::create)
        .transpose()
        .context("failed to create the export surface")?;

    let engine = Engine::start_with_export(
        config,
        Arc::new(PerfCounterBackend),
        EnergyModel::default(),
        package,
        powercap,
        export,
    )
    .context("failed to start the accounting engine")?;

    // Hook the tracepoints last, once everything they feed exists.
    let source = TraceSource::start(engine.adapters())
        .context("failed to start the trace source (needs CAP_PERFMON or root)")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .context("failed to install the signal handler")?;
    }

    info!("pacctd running");
    while running.load(Ordering::Acquire) {
        std::thread::park_timeout(Duration::from_millis(200));
    }

    // Unhook first, then quiesce the workers and retire every record.
    info!("pacctd stopping");
    source.stop();
    engine.shutdown();
    Ok(())
}
