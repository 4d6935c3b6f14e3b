//! Register Access Layer for the PMU Protocol Engine
//!
//! This crate provides the low-level building blocks the PMU transport is
//! written against: a register access trait, a volatile MMIO implementation
//! of it, memory barriers, and the byte-ring arithmetic shared by both ends
//! of the firmware queues.
//!
//! # Modules
//!
//! - [`io`]: The [`RegisterIo`] trait with read-modify-write and polling helpers
//! - [`region`]: Offset-based volatile access to a mapped register window
//! - [`barrier`]: Memory barrier helpers for device memory ordering
//! - [`ring`]: Head/tail byte-ring arithmetic with rewind detection
//!
//! # Example
//!
//! ```ignore
//! use pmu_mmio::{MmioRegion, RegisterIo, barrier};
//!
//! // Falcon register window of the PMU
//! let pwr = unsafe { MmioRegion::new(0x1010_a000, 0x1000) };
//!
//! let irqstat = pwr.read32(0x008);
//! pwr.write32(0x004, irqstat);
//! barrier::write_barrier();
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod io;
pub mod region;
pub mod ring;

// Re-exports for convenience
pub use barrier::{read_barrier, write_barrier};
pub use io::RegisterIo;
pub use region::MmioRegion;
pub use ring::{RING_ALIGNMENT, RingCursor, Room, align_up};
