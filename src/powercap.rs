//! The power-cap controller: a hysteresis-banded step controller over the
//! per-policy CPU frequency ceilings.
//!
//! The controller owns one ceiling per cpufreq policy. When sampled package
//! power leaves the hysteresis band around the target it moves a single
//! shared cap value one step down or up, clamps it into each policy's
//! hardware range, and writes it to every policy's `scaling_max_freq`. The
//! ceiling each policy had before the controller took over is restored
//! exactly once when the controller is dropped.
//!
//! The sysfs root is a parameter so tests can run the controller against a
//! synthetic policy tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::Error;

/// One cpufreq policy the controller holds a ceiling on.
struct CapPolicy {
    path: PathBuf,
    cpuinfo_min_khz: u64,
    cpuinfo_max_khz: u64,
    /// `scaling_max_freq` as found at init, restored at cleanup.
    original_max_khz: u64,
}

impl CapPolicy {
    /// Write a clamped ceiling. Runtime write failures are local: the policy
    /// keeps its previous ceiling and the controller carries on.
    fn apply(&self, cap_khz: u64) {
        let clamped = cap_khz.clamp(self.cpuinfo_min_khz, self.cpuinfo_max_khz);
        if let Err(e) = write_khz(&self.path.join("scaling_max_freq"), clamped) {
            warn!(
                "failed to set ceiling {} kHz on {}: {}",
                clamped,
                self.path.display(),
                e
            );
        }
    }
}

/// The package power-cap controller.
pub struct PowerCap {
    policies: Vec<CapPolicy>,
    current_cap_khz: u64,
    target_mw: u64,
    hysteresis_mw: u64,
    step_khz: u64,
}

impl PowerCap {
    /// Take a ceiling on every policy under `root` (normally
    /// `/sys/devices/system/cpu/cpufreq`).
    ///
    /// The initial cap is the maximum `cpuinfo_max_freq` observed, applied
    /// everywhere, so nothing is limited until the first downward step. With
    /// no policies found the controller refuses to start.
    pub fn init(
        root: &Path,
        target_mw: u64,
        hysteresis_mw: u64,
        step_khz: u64,
    ) -> Result<PowerCap, Error> {
        let mut policies = Vec::new();
        for entry in fs::read_dir(root).map_err(|_| Error::NoCpufreqPolicies(root.into()))? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with("policy") {
                continue;
            }
            let path = entry.path();
            policies.push(CapPolicy {
                cpuinfo_min_khz: read_khz(&path.join("cpuinfo_min_freq"))?,
                cpuinfo_max_khz: read_khz(&path.join("cpuinfo_max_freq"))?,
                original_max_khz: read_khz(&path.join("scaling_max_freq"))?,
                path,
            });
        }
        if policies.is_empty() {
            return Err(Error::NoCpufreqPolicies(root.into()));
        }

        let current_cap_khz = policies
            .iter()
            .map(|p| p.cpuinfo_max_khz)
            .max()
            .unwrap_or(0);

        let cap = PowerCap {
            policies,
            current_cap_khz,
            target_mw,
            hysteresis_mw,
            step_khz,
        };
        // Establish a known starting point before the control loop runs.
        cap.apply_to_all();

        info!(
            "powercap: policies {} initial cap {} kHz target {} mW",
            cap.policies.len(),
            cap.current_cap_khz,
            cap.target_mw
        );
        Ok(cap)
    }

    /// One control step against a package power sample.
    ///
    /// Above `target + hysteresis` the cap moves one step down; below
    /// `target - hysteresis` one step up; inside the band nothing happens.
    pub fn step(&mut self, pkg_power_mw: u64) {
        if pkg_power_mw > self.target_mw + self.hysteresis_mw {
            self.current_cap_khz = self.current_cap_khz.saturating_sub(self.step_khz);
            self.apply_to_all();
        } else if pkg_power_mw < self.target_mw.saturating_sub(self.hysteresis_mw) {
            self.current_cap_khz = self.current_cap_khz.saturating_add(self.step_khz);
            self.apply_to_all();
        }
    }

    /// The shared cap value, before per-policy clamping.
    pub fn current_cap_khz(&self) -> u64 {
        self.current_cap_khz
    }

    fn apply_to_all(&self) {
        for policy in &self.policies {
            policy.apply(self.current_cap_khz);
        }
    }
}

impl Drop for PowerCap {
    /// Put every policy's original ceiling back, one restore per policy.
    fn drop(&mut self) {
        for policy in self.policies.drain(..) {
            if let Err(e) = write_khz(
                &policy.path.join("scaling_max_freq"),
                policy.original_max_khz,
            ) {
                warn!(
                    "failed to restore ceiling on {}: {}",
                    policy.path.display(),
                    e
                );
            }
        }
    }
}

fn read_khz(path: &Path) -> io::Result<u64> {
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_khz(path: &Path, khz: u64) -> io::Result<()> {
    fs::write(path, format!("{}\n", khz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a synthetic cpufreq tree with one directory per policy, each
    /// holding (min, max, scaling_max) in kHz.
    fn cpufreq_tree(policies: &[(u64, u64, u64)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (i, (min, max, scaling_max)) in policies.iter().enumerate() {
            let p = dir.path().join(format!("policy{}", i));
            fs::create_dir(&p).unwrap();
            fs::write(p.join("cpuinfo_min_freq"), format!("{}\n", min)).unwrap();
            fs::write(p.join("cpuinfo_max_freq"), format!("{}\n", max)).unwrap();
            fs::write(p.join("scaling_max_freq"), format!("{}\n", scaling_max)).unwrap();
        }
        dir
    }

    fn scaling_max(dir: &TempDir, i: usize) -> u64 {
        read_khz(&dir.path().join(format!("policy{}/scaling_max_freq", i))).unwrap()
    }

    #[test]
    fn init_applies_highest_hardware_max() {
        let dir = cpufreq_tree(&[(800_000, 3_000_000, 2_500_000), (800_000, 4_000_000, 4_000_000)]);
        let cap = PowerCap::init(dir.path(), 30_000, 800, 100_000).unwrap();
        assert_eq!(cap.current_cap_khz(), 4_000_000);
        // Clamped into each policy's own range.
        assert_eq!(scaling_max(&dir, 0), 3_000_000);
        assert_eq!(scaling_max(&dir, 1), 4_000_000);
    }

    #[test]
    fn steps_down_up_and_holds_in_band() {
        let dir = cpufreq_tree(&[(800_000, 3_000_000, 3_000_000)]);
        let mut cap = PowerCap::init(dir.path(), 30_000, 800, 100_000).unwrap();

        // Above the band: one step down.
        cap.step(31_000);
        assert_eq!(cap.current_cap_khz(), 2_900_000);
        assert_eq!(scaling_max(&dir, 0), 2_900_000);

        // Inside the band: no-op.
        cap.step(30_500);
        assert_eq!(cap.current_cap_khz(), 2_900_000);

        // Below the band: one step up.
        cap.step(29_000);
        assert_eq!(cap.current_cap_khz(), 3_000_000);
        assert_eq!(scaling_max(&dir, 0), 3_000_000);
    }

    #[test]
    fn consecutive_high_samples_step_down_each_time() {
        let dir = cpufreq_tree(&[(800_000, 3_000_000, 3_000_000)]);
        let mut cap = PowerCap::init(dir.path(), 30_000, 800, 100_000).unwrap();
        for _ in 0..3 {
            cap.step(30_000 + 2 * 800);
        }
        assert_eq!(cap.current_cap_khz(), 2_700_000);
        assert_eq!(scaling_max(&dir, 0), 2_700_000);
    }

    #[test]
    fn cap_clamps_to_hardware_floor() {
        let dir = cpufreq_tree(&[(800_000, 1_000_000, 1_000_000)]);
        let mut cap = PowerCap::init(dir.path(), 30_000, 800, 400_000).unwrap();
        cap.step(40_000);
        assert_eq!(scaling_max(&dir, 0), 800_000);
    }

    #[test]
    fn drop_restores_original_ceilings() {
        let dir = cpufreq_tree(&[(800_000, 3_000_000, 2_200_000)]);
        {
            let mut cap = PowerCap::init(dir.path(), 30_000, 800, 100_000).unwrap();
            cap.step(50_000);
            assert_ne!(scaling_max(&dir, 0), 2_200_000);
        }
        assert_eq!(scaling_max(&dir, 0), 2_200_000);
    }

    #[test]
    fn empty_tree_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PowerCap::init(dir.path(), 30_000, 800, 100_000),
            Err(Error::NoCpufreqPolicies(_))
        ));
    }
}
