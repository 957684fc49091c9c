//! The per-record energy estimation step.
//!
//! Each estimator tick drains the delta accumulators of every ready record,
//! folds the counter deltas through the model, and updates the record's
//! energy total plus three derived power figures:
//!
//! -   `power_a`, the running average over all observed CPU time,
//! -   `power_i`, an exponentially smoothed instantaneous power over the
//!     CPU-time delta of this interval,
//! -   `power_w`, the same but over the wall-clock delta.
//!
//! All arithmetic runs in 128-bit intermediates; the model output can be
//! negative from measurement noise and is clamped to zero.

use std::sync::atomic::Ordering;

use log::info;

use crate::events::EnergyModel;
use crate::task::TracedTask;

/// `a * b / d` in 128-bit intermediates, saturating on the way back down.
fn mul_div(a: u64, b: u64, d: u64) -> u64 {
    ((a as u128 * b as u128) / d as u128).min(u64::MAX as u128) as u64
}

/// Smoothing to reduce noise: 75% old value, 25% new value.
fn smooth(old: u64, new: u64) -> u64 {
    ((old as u128 * 3 + new as u128) >> 2) as u64
}

/// State carried across one tick of the estimator, mainly so a burst of
/// negative model outputs logs once per tick instead of once per record.
pub(crate) struct EstimateTick {
    negative_logged: bool,
}

impl EstimateTick {
    pub(crate) fn new() -> EstimateTick {
        EstimateTick {
            negative_logged: false,
        }
    }

    /// Run the model for one record. Called without any lock held.
    pub(crate) fn estimate_record(&mut self, task: &TracedTask, model: &EnergyModel) {
        // Atomically exchange the accumulators to zero so each delta is
        // observed exactly once, no matter how the fast path interleaves.
        let mut deltas = vec![0_u64; model.len()];
        for (i, d) in deltas.iter_mut().enumerate() {
            *d = task.diff_counts[i].swap(0, Ordering::Relaxed);
        }
        let delta_exec_ns = task.delta_exec_runtime_acc.swap(0, Ordering::Relaxed);
        let delta_wall_ns = task.delta_timestamp_acc.swap(0, Ordering::Relaxed);
        task.total_exec_runtime_acc
            .fetch_add(delta_exec_ns, Ordering::Relaxed);

        let mut acc = model.fold(&deltas);
        if acc < 0 {
            if !self.negative_logged {
                info!("encountered negative energy estimation, clamping to zero");
                self.negative_logged = true;
            }
            acc = 0;
        }
        let acc_uj = u64::try_from(acc).unwrap_or(u64::MAX);

        task.energy.fetch_add(acc_uj, Ordering::Relaxed);
        let energy = task.energy.load(Ordering::Relaxed);

        // uJ * 1000 / us = mW.
        let total_exec_us = task.total_exec_runtime_acc.load(Ordering::Relaxed) / 1000;
        let power_a = mul_div(energy, 1000, total_exec_us.max(1));
        task.power_a.store(power_a, Ordering::Relaxed);

        // A zero energy delta is estimation noise; it updates neither of the
        // smoothed figures.
        if acc_uj == 0 {
            return;
        }

        let dt_us = (delta_exec_ns / 1000).max(1);
        let raw_i = mul_div(acc_uj, 1000, dt_us);
        let old = task.power_i.load(Ordering::Relaxed);
        task.power_i.store(smooth(old, raw_i), Ordering::Relaxed);

        let dt_us = (delta_wall_ns / 1000).max(1);
        let raw_w = mul_div(acc_uj, 1000, dt_us);
        let old = task.power_w.load(Ordering::Relaxed);
        task.power_w.store(smooth(old, raw_w), Ordering::Relaxed);
    }
}
