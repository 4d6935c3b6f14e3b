//! Performance monitor unit commands and events
//!
//! START and INIT embed a counter description as a payload, so their bodies
//! have a fixed head, an allocation descriptor whose size depends on the
//! firmware ABI, and (for INIT) a fixed tail. The pieces are defined here and
//! assembled by [`crate::FirmwareAbi`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `cmd_type` values
pub mod cmd_id {
    pub const START: u8 = 0;
    pub const STOP: u8 = 1;
    pub const INIT: u8 = 2;
}

/// `msg_type` values
pub mod msg_id {
    /// Load rose above the upper threshold
    pub const INCREASE_EVENT: u8 = 0;
    /// Load fell below the lower threshold
    pub const DECREASE_EVENT: u8 = 1;
    /// Firmware finished perfmon initialisation
    pub const INIT_EVENT: u8 = 2;
    pub const ACK: u8 = 3;
}

/// START flags
pub mod flags {
    pub const ENABLE_INCREASE: u8 = 1 << 0;
    pub const ENABLE_DECREASE: u8 = 1 << 1;
    pub const CLEAR_PREV: u8 = 1 << 2;
}

/// Clock domain group driven by perfmon
pub const DOMAIN_GROUP_PSTATE: u8 = 0;

/// Counter description, first layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonCounterV0 {
    pub index: u8,
    pub flags: u8,
    pub group_id: u8,
    pub valid: u8,
    pub upper_threshold: u16,
    pub lower_threshold: u16,
}

/// Counter description with a scale factor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonCounterV2 {
    pub index: u8,
    pub flags: u8,
    pub group_id: u8,
    pub valid: u8,
    pub upper_threshold: u16,
    pub lower_threshold: u16,
    pub scale: u32,
}

/// Layout-independent counter description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfmonCounter {
    pub index: u8,
    pub flags: u8,
    pub group_id: u8,
    pub valid: bool,
    /// Upper threshold in 0.01% units
    pub upper_threshold: u16,
    /// Lower threshold in 0.01% units
    pub lower_threshold: u16,
}

/// Fixed part of START preceding the counter allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonStartHead {
    pub cmd_type: u8,
    pub group_id: u8,
    pub state_id: u8,
    pub flags: u8,
}

/// Fixed part of INIT preceding the counter allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonInitHead {
    pub cmd_type: u8,
    pub to_decrease_count: u8,
    pub base_counter_id: u8,
    pub pad: u8,
    pub sample_period_us: u32,
}

/// Fixed part of INIT following the counter allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonInitTail {
    pub num_counters: u8,
    pub samples_in_moving_avg: u8,
    /// DMEM offset of the host-readable load sample
    pub sample_buffer: u16,
}

/// STOP body.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonStop {
    pub cmd_type: u8,
    pub pad: [u8; 3],
}

impl PerfmonStop {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cmd_type: cmd_id::STOP,
            pad: [0; 3],
        }
    }
}

/// Event and acknowledgement body.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PerfmonMsg {
    pub msg_type: u8,
    pub state_id: u8,
    pub group_id: u8,
    /// Load percentage for threshold events
    pub data: u8,
}

/// Parameters of START.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfmonStart {
    pub group_id: u8,
    pub state_id: u8,
    pub flags: u8,
}

/// Parameters of INIT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfmonInit {
    pub sample_buffer: u16,
    pub to_decrease_count: u8,
    pub base_counter_id: u8,
    pub sample_period_us: u32,
    pub num_counters: u8,
    pub samples_in_moving_avg: u8,
}
