//! DMEM copy primitive
//!
//! The falcon's data memory is only reachable through an indirect port: the
//! host programs the byte address into DMEMC with auto-increment enabled and
//! then streams 32-bit words through DMEMD. One lock serialises every copy so
//! two transfers never interleave their address setup.

use log::{error, trace};
use pmu_mmio::{RegisterIo, read_barrier, write_barrier};
use spin::Mutex;

use crate::error::PmuError;
use crate::regs;

/// One DMEM access port.
pub struct DmemPort {
    port: usize,
    lock: Mutex<()>,
}

impl DmemPort {
    #[must_use]
    pub const fn new(port: usize) -> Self {
        Self {
            port,
            lock: Mutex::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn port(&self) -> usize {
        self.port
    }

    fn check(offset: u32, len: usize) -> Result<(), PmuError> {
        if len == 0 {
            error!("dmem copy: size is zero");
            return Err(PmuError::InvalidArgument);
        }
        if offset & 0x3 != 0 {
            error!("dmem copy: offset {offset:#x} not 4-byte aligned");
            return Err(PmuError::Alignment);
        }
        Ok(())
    }

    /// Copy `out.len()` bytes starting at DMEM byte `offset`.
    pub fn read<R: RegisterIo>(&self, io: &R, offset: u32, out: &mut [u8]) -> Result<(), PmuError> {
        Self::check(offset, out.len())?;
        let _guard = self.lock.lock();

        trace!("dmem read {:#x} +{}", offset, out.len());
        io.write32(regs::dmemc(self.port), regs::dmemc_value(offset, true));
        read_barrier();

        let mut words = out.chunks_exact_mut(4);
        for word in &mut words {
            word.copy_from_slice(&io.read32(regs::dmemd(self.port)).to_le_bytes());
        }
        let rest = words.into_remainder();
        if !rest.is_empty() {
            let data = io.read32(regs::dmemd(self.port)).to_le_bytes();
            rest.copy_from_slice(&data[..rest.len()]);
        }
        Ok(())
    }

    /// Copy `data` to DMEM byte `offset`, then check the port advanced by
    /// the aligned length.
    pub fn write<R: RegisterIo>(&self, io: &R, offset: u32, data: &[u8]) -> Result<(), PmuError> {
        Self::check(offset, data.len())?;
        let _guard = self.lock.lock();

        trace!("dmem write {:#x} +{}", offset, data.len());
        io.write32(regs::dmemc(self.port), regs::dmemc_value(offset, false));

        let mut words = data.chunks_exact(4);
        for word in &mut words {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(word);
            io.write32(regs::dmemd(self.port), u32::from_le_bytes(raw));
        }
        let rest = words.remainder();
        if !rest.is_empty() {
            let mut raw = [0u8; 4];
            raw[..rest.len()].copy_from_slice(rest);
            io.write32(regs::dmemd(self.port), u32::from_le_bytes(raw));
        }
        write_barrier();

        let expected = offset + pmu_mmio::align_up(data.len() as u32, 4);
        let reached = regs::dmemc_address(io.read32(regs::dmemc(self.port)));
        if reached != expected {
            error!("dmem copy failed: port at {reached:#x}, expected {expected:#x}");
            return Err(PmuError::Protocol);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFalcon;

    #[test]
    fn test_unaligned_tail_round_trips() {
        let sim = SimFalcon::new();
        let port = DmemPort::new(0);
        port.write(&sim, 0x100, &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut back = [0u8; 6];
        port.read(&sim, 0x100, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5, 6]);
        // The tail word is padded with zeroes
        assert_eq!(sim.dmem(0x104, 4), [5, 6, 0, 0]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let sim = SimFalcon::new();
        let port = DmemPort::new(0);
        assert_eq!(port.write(&sim, 0x102, &[0; 4]), Err(PmuError::Alignment));
        assert_eq!(port.read(&sim, 0x100, &mut []), Err(PmuError::InvalidArgument));
    }
}
