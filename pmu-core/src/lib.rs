//! PMU Firmware RPC Engine
//!
//! Host side of the command/message protocol spoken with the GPU power
//! management unit's falcon firmware. Commands travel through two DMEM
//! command queues, answers and unsolicited events come back through the
//! message queue, and every in-flight command is tracked by a sequence slot
//! until its response has been dispatched.
//!
//! # Layers
//!
//! - **Transport**: [`dmem`] copies through the DMEM port, [`mutex`]
//!   arbitrates hardware mutexes, [`queue`] manages the rings, [`seq`]
//!   tracks in-flight commands, [`post`] stages payloads and posts, [`msg`]
//!   drains and dispatches messages, [`isr`] services interrupts
//! - **Power management**: [`pg`] walks the firmware through its bootstrap
//!   chain after the init message, [`elpg`] reference-counts engine power
//!   gating, [`zbc`] delivers ZBC table updates, [`perfmon`] drives load
//!   sampling, [`ap`] configures adaptive power
//! - **Platform**: [`platform::Platform`] supplies register access, time,
//!   power references and framebuffer surfaces
//!
//! # Optional Features
//!
//! - `sim`: in-memory falcon with a scripted firmware ([`sim::SimFalcon`])
//!
//! # Usage
//!
//! ```ignore
//! use pmu_core::{PmuConfig, PmuContext};
//!
//! let pmu = PmuContext::new(platform, PmuConfig::new());
//! pmu.bring_up()?;
//! // Load and start the firmware, then route the PMU interrupt to
//! // `pmu.service_interrupt()`
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod ap;
pub mod config;
pub mod context;
pub mod dmem;
pub mod dmem_alloc;
pub mod elpg;
pub mod error;
pub mod isr;
pub mod msg;
pub mod mutex;
pub mod perfmon;
pub mod pg;
pub mod platform;
pub mod post;
pub mod queue;
pub mod regs;
pub mod seq;
pub mod zbc;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports for convenience
pub use ap::ApCommand;
pub use config::{AelpgParams, PmuConfig};
pub use context::PmuContext;
pub use elpg::{ElpgState, Engine, PgStatsData, Residency};
pub use error::PmuError;
pub use mutex::{MutexId, MutexToken};
pub use pg::PmuState;
pub use platform::{FirmwareInfo, Platform, PmuEvent, Surface};
pub use post::{Callback, Payload, PayloadIn, PayloadOut, Response, ResponseStatus};
pub use queue::QueueId;
