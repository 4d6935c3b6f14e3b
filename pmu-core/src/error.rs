//! Error types for the PMU protocol engine

use core::fmt;

use pmu_proto::AbiError;

/// Errors returned by PMU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuError {
    /// Argument rejected by validation (queue, unit, payload geometry, token)
    InvalidArgument,
    /// Firmware has not reported ready, or the queue is not configured yet
    NotReady,
    /// Every sequence slot is in flight
    NoFreeSequence,
    /// Not enough room in the command queue
    QueueFull,
    /// Hardware mutex could not be acquired
    Busy,
    /// Waited condition did not become true in time
    Timeout,
    /// DMEM offset is not 4-byte aligned
    Alignment,
    /// Software-managed DMEM window exhausted
    OutOfDmem,
    /// Platform could not provide a framebuffer surface
    SurfaceAlloc,
    /// Firmware sent something the host cannot make sense of
    Protocol,
    /// Wire layout error
    Abi(AbiError),
}

impl fmt::Display for PmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotReady => write!(f, "pmu not ready"),
            Self::NoFreeSequence => write!(f, "no free sequence"),
            Self::QueueFull => write!(f, "command queue full"),
            Self::Busy => write!(f, "hardware mutex busy"),
            Self::Timeout => write!(f, "timed out"),
            Self::Alignment => write!(f, "dmem offset not aligned"),
            Self::OutOfDmem => write!(f, "out of dmem"),
            Self::SurfaceAlloc => write!(f, "surface allocation failed"),
            Self::Protocol => write!(f, "protocol error"),
            Self::Abi(e) => write!(f, "abi: {e}"),
        }
    }
}

impl From<AbiError> for PmuError {
    fn from(e: AbiError) -> Self {
        PmuError::Abi(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_abi_errors_convert() {
        let e: PmuError = AbiError::Truncated.into();
        assert_eq!(e, PmuError::Abi(AbiError::Truncated));
        assert_eq!(e.to_string(), "abi: truncated wire data");
    }
}
