//! Platform boundary
//!
//! Everything the engine needs from its surroundings (register access, time,
//! power references, framebuffer surfaces, firmware image facts and an event
//! sink) comes through [`Platform`]. The in-memory falcon in [`crate::sim`]
//! implements it for tests.

use alloc::vec::Vec;

use log::error;
use pmu_mmio::RegisterIo;

use crate::error::PmuError;
use crate::regs;

/// A framebuffer surface mapped into the GPU address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Surface {
    pub gpu_va: u64,
    pub size: u32,
    /// Platform-private handle
    pub handle: u64,
}

/// Facts about the loaded firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Application version from the image descriptor
    pub app_version: u32,
    /// FECS power-gating buffer
    pub pg_buf: Surface,
    /// ZBC save/restore sequence buffer
    pub zbc_buf: Surface,
}

/// Unsolicited notifications forwarded to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PmuEvent {
    /// Hardware slowdown on the first thermal alert
    ThermalAlarm { mask: u32 },
    /// Perf unit event body, passed through unparsed
    Perf { body: Vec<u8> },
    /// Falcon halted
    Halted,
    /// Falcon reported an external bus error
    ExternalError,
}

/// Services the engine consumes.
pub trait Platform: RegisterIo + Send + Sync {
    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Sleep for somewhere between `min_us` and `max_us`.
    fn sleep_us(&self, min_us: u64, max_us: u64);

    /// Take a power reference on the GPU before touching it.
    fn busy(&self) -> Result<(), PmuError>;

    /// Drop a power reference taken with [`Platform::busy`].
    fn idle(&self);

    fn alloc_surface(&self, size: u32) -> Result<Surface, PmuError>;

    fn write_surface(&self, surface: &Surface, offset: u32, data: &[u8]);

    fn read_surface(&self, surface: &Surface, offset: u32, out: &mut [u8]);

    fn free_surface(&self, surface: Surface);

    /// Version and buffers of the firmware about to be booted.
    fn firmware_info(&self) -> Result<FirmwareInfo, PmuError>;

    /// Event sink.
    fn notify(&self, _event: PmuEvent) {}

    /// Log falcon state after a halt, external error or ack timeout.
    fn dump_falcon_state(&self)
    where
        Self: Sized,
    {
        error!(
            "pmu falcon: mailbox0 {:#x} mailbox1 {:#x} irqstat {:#x} irqmask {:#x} exterrstat {:#x}",
            self.read32(regs::MAILBOX0),
            self.read32(regs::MAILBOX1),
            self.read32(regs::IRQSTAT),
            self.read32(regs::IRQMASK),
            self.read32(regs::EXTERRSTAT),
        );
    }
}

/// Power reference held for the duration of a public operation.
pub struct PowerRef<'a, P: Platform> {
    platform: &'a P,
}

impl<'a, P: Platform> PowerRef<'a, P> {
    pub fn acquire(platform: &'a P) -> Result<Self, PmuError> {
        platform.busy()?;
        Ok(Self { platform })
    }
}

impl<P: Platform> Drop for PowerRef<'_, P> {
    fn drop(&mut self) {
        self.platform.idle();
    }
}
