//! The per-task read-only surface: one directory per traced process with a
//! text file per exposed metric.
//!
//! The surface lives under `<base>/pacct_energy/<pid>/`. Only `energy_uj` is
//! populated: it holds the latest cumulative energy estimate as a decimal,
//! one line. Files are rewritten on estimator ticks and the per-pid
//! directory disappears when the record retires. The surface is ancillary;
//! every failure here is logged at debug level and otherwise ignored.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::task::TracedTask;
use crate::Pid;

const SURFACE_DIR: &str = "pacct_energy";

/// The export surface rooted at `<base>/pacct_energy`.
pub struct ExportSurface {
    root: PathBuf,
}

impl ExportSurface {
    /// Create (or reuse) the surface directory under `base`.
    pub fn create(base: &Path) -> io::Result<ExportSurface> {
        let root = base.join(SURFACE_DIR);
        fs::create_dir_all(&root)?;
        Ok(ExportSurface { root })
    }

    /// Where a task's metric files live.
    pub fn task_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Refresh the metric files for one task.
    pub fn publish(&self, task: &TracedTask) {
        let dir = self.task_dir(task.pid());
        let result = fs::create_dir_all(&dir)
            .and_then(|_| fs::write(dir.join("energy_uj"), format!("{}\n", task.energy_uj())));
        if let Err(e) = result {
            debug!("failed to publish energy for pid {}: {}", task.pid(), e);
        }
    }

    /// Drop a retired task's directory.
    pub fn retire(&self, pid: Pid) {
        if let Err(e) = fs::remove_dir_all(self.task_dir(pid)) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("failed to remove surface for pid {}: {}", pid, e);
            }
        }
    }
}

impl Drop for ExportSurface {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TracedTask;
    use tempfile::TempDir;

    #[test]
    fn publish_and_retire_roundtrip() {
        let base = TempDir::new().unwrap();
        let surface = ExportSurface::create(base.path()).unwrap();
        let task = TracedTask::new(123, "demo", 0);

        surface.publish(&task);
        let path = base.path().join("pacct_energy/123/energy_uj");
        assert_eq!(fs::read_to_string(&path).unwrap(), "0\n");

        surface.retire(123);
        assert!(!path.exists());
        // Retiring an unknown pid is quietly accepted.
        surface.retire(999);
    }

    #[test]
    fn surface_root_is_removed_on_drop() {
        let base = TempDir::new().unwrap();
        {
            let surface = ExportSurface::create(base.path()).unwrap();
            let task = TracedTask::new(5, "demo", 0);
            surface.publish(&task);
        }
        assert!(!base.path().join("pacct_energy").exists());
    }
}
