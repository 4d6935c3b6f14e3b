//! Unsolicited firmware messages outside the perfmon unit

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// RC unit message types
pub mod rc {
    /// The firmware rejected a command it has no handler for
    pub const MSG_TYPE_UNHANDLED_CMD: u8 = 0;
}

/// RC notification that a command was not handled.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RcUnhandledCmd {
    pub msg_type: u8,
    /// Unit the rejected command was addressed to
    pub unit_id: u8,
}

/// Thermal unit message types and event bits
pub mod therm {
    pub const MSG_ID_EVENT_HW_SLOWDOWN_NOTIFICATION: u8 = 2;
    /// Bit index of the first thermal alert in `mask`
    pub const EVENT_THERMAL_1: u32 = 1;
}

/// Hardware slowdown notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ThermHwSlowdown {
    pub msg_type: u8,
    pub pad: [u8; 3],
    pub mask: u32,
}
