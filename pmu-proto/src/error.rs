//! Decode/encode errors for wire layouts

use core::fmt;

/// Errors raised while decoding or encoding a wire layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiError {
    /// Input shorter than the layout being decoded
    Truncated,
    /// Output buffer too small for the layout being encoded
    NoSpace,
    /// Firmware application version with no known layout set
    UnsupportedVersion(u32),
    /// Field value the layout cannot represent
    BadLayout,
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated wire data"),
            Self::NoSpace => write!(f, "no space for wire layout"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported firmware version {v:#x}"),
            Self::BadLayout => write!(f, "value not representable in wire layout"),
        }
    }
}
