//! The package power sampler, backed by the RAPL model-specific registers.
//!
//! RAPL exposes a package energy counter whose unit is described by a
//! separate unit register. The sampler reads the unit once, then on every
//! tick reads the 32-bit wrapping energy counter, converts it to
//! microjoules, and differentiates against the previous reading to yield
//! package power in milliwatts.
//!
//! Register access goes through the [`Msr`] trait; the real implementation
//! reads `/dev/cpu/<n>/msr`, and tests script their own. By convention all
//! reads happen on CPU 0.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// `MSR_RAPL_POWER_UNIT`: bits 12:8 hold the energy-unit shift.
pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;

/// `MSR_PKG_ENERGY_STATUS`: the package energy counter, 32 wrapping bits.
pub const MSR_PKG_ENERGY_STATUS: u32 = 0x611;

/// Read access to model-specific registers.
pub trait Msr: Send {
    /// Read the 64-bit value of register `reg`.
    fn read(&self, reg: u32) -> io::Result<u64>;
}

/// The `/dev/cpu/<n>/msr` device, provided by the msr kernel module.
pub struct MsrDevice {
    file: File,
}

impl MsrDevice {
    /// Open the MSR device of the given CPU. Requires root (or
    /// `CAP_SYS_RAWIO`) and the msr module.
    pub fn open(cpu: usize) -> io::Result<MsrDevice> {
        let file = File::open(format!("/dev/cpu/{}/msr", cpu))?;
        Ok(MsrDevice { file })
    }
}

impl Msr for MsrDevice {
    fn read(&self, reg: u32) -> io::Result<u64> {
        // The register number is the read offset into the device.
        let mut buf = [0_u8; 8];
        self.file.read_exact_at(&mut buf, reg as u64)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

/// Samples package energy and differentiates it into power.
pub struct PackageSampler {
    msr: Box<dyn Msr>,
    eu_shift: u32,
    last_uj: u64,
    last_ns: u64,
}

impl PackageSampler {
    /// Build a sampler, reading the energy-unit shift once up front.
    pub fn new(msr: Box<dyn Msr>) -> io::Result<PackageSampler> {
        let unit = msr.read(MSR_RAPL_POWER_UNIT)?;
        Ok(PackageSampler {
            msr,
            eu_shift: ((unit >> 8) & 0x1f) as u32,
            last_uj: 0,
            last_ns: 0,
        })
    }

    /// The current package energy reading, in microjoules.
    ///
    /// Only the low 32 bits of the status register are valid; the counter
    /// wraps there, which the differentiation in [`sample`] tolerates.
    ///
    /// [`sample`]: PackageSampler::sample
    pub fn read_energy_uj(&self) -> io::Result<u64> {
        let raw = self.msr.read(MSR_PKG_ENERGY_STATUS)? as u32;
        Ok(((raw as u128 * 1_000_000) >> self.eu_shift) as u64)
    }

    /// Sample package power in mW at monotonic time `now_ns`.
    ///
    /// The first call only records the baseline and returns 0. Subsequent
    /// calls return `d_uj * 10^6 / dt_ns`; the subtraction is performed
    /// modulo 2^64 on the converted values, so a wrapped energy counter
    /// yields an oversized but never negative figure. A failed register
    /// read propagates so the caller can skip the tick.
    pub fn sample(&mut self, now_ns: u64) -> io::Result<u64> {
        let uj = self.read_energy_uj()?;

        if self.last_ns == 0 {
            self.last_uj = uj;
            self.last_ns = now_ns;
            return Ok(0);
        }

        let d_uj = uj.wrapping_sub(self.last_uj);
        let dt_ns = now_ns.saturating_sub(self.last_ns);
        self.last_uj = uj;
        self.last_ns = now_ns;

        if dt_ns == 0 {
            return Ok(0);
        }
        Ok(((d_uj as u128 * 1_000_000) / dt_ns as u128).min(u64::MAX as u128) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// An MSR whose registers the test scripts.
    struct ScriptedMsr {
        unit: u64,
        energy: Arc<AtomicU64>,
        fail: Arc<AtomicU64>,
    }

    impl Msr for ScriptedMsr {
        fn read(&self, reg: u32) -> io::Result<u64> {
            if self.fail.load(Ordering::Relaxed) != 0 {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            match reg {
                MSR_RAPL_POWER_UNIT => Ok(self.unit),
                MSR_PKG_ENERGY_STATUS => Ok(self.energy.load(Ordering::Relaxed)),
                _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
        }
    }

    fn sampler(eu_shift: u64) -> (PackageSampler, Arc<AtomicU64>, Arc<AtomicU64>) {
        let energy = Arc::new(AtomicU64::new(0));
        let fail = Arc::new(AtomicU64::new(0));
        let msr = ScriptedMsr {
            unit: eu_shift << 8,
            energy: energy.clone(),
            fail: fail.clone(),
        };
        (PackageSampler::new(Box::new(msr)).unwrap(), energy, fail)
    }

    #[test]
    fn unit_conversion_applies_shift() {
        let (s, energy, _) = sampler(4);
        energy.store(32, Ordering::Relaxed);
        // 32 * 1e6 >> 4 = 2e6 uJ.
        assert_eq!(s.read_energy_uj().unwrap(), 2_000_000);
    }

    #[test]
    fn first_sample_is_zero_then_differentiates() {
        let (mut s, energy, _) = sampler(0);
        energy.store(1_000, Ordering::Relaxed);
        assert_eq!(s.sample(1_000_000_000).unwrap(), 0);

        // +500 raw = +5e8 uJ over 1 s = 500 J/s = 500,000 mW.
        energy.store(1_500, Ordering::Relaxed);
        assert_eq!(s.sample(2_000_000_000).unwrap(), 500_000);
    }

    #[test]
    fn zero_dt_yields_zero() {
        let (mut s, energy, _) = sampler(0);
        energy.store(100, Ordering::Relaxed);
        assert_eq!(s.sample(1_000).unwrap(), 0);
        energy.store(200, Ordering::Relaxed);
        assert_eq!(s.sample(1_000).unwrap(), 0);
    }

    #[test]
    fn wrapped_energy_counter_stays_non_negative() {
        let (mut s, energy, _) = sampler(0);
        energy.store(0xFFFF_FFF0, Ordering::Relaxed);
        assert_eq!(s.sample(1_000_000_000).unwrap(), 0);

        // The 32-bit counter wrapped; the converted subtraction is modulo
        // 2^64 and must never surface a negative value.
        energy.store(0x0000_0010, Ordering::Relaxed);
        let mw = s.sample(2_000_000_000).unwrap();
        assert!(mw > 0);
    }

    #[test]
    fn read_failure_propagates() {
        let (mut s, energy, fail) = sampler(0);
        energy.store(100, Ordering::Relaxed);
        s.sample(1_000_000).unwrap();
        fail.store(1, Ordering::Relaxed);
        assert!(s.sample(2_000_000).is_err());
    }
}
