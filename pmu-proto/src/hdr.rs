//! Frame header, unit ids and control flags
//!
//! Every command and message starts with a [`PmuHdr`]. `size` covers the
//! header plus body and is a single byte, so a frame is at most 255 bytes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Common header of commands and messages.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PmuHdr {
    /// Logical service the frame is addressed to (see [`unit`])
    pub unit_id: u8,
    /// Header plus body size in bytes
    pub size: u8,
    /// See [`ctrl_flags`]
    pub ctrl_flags: u8,
    /// Sequence slot the response must be correlated with
    pub seq_id: u8,
}

/// Size of [`PmuHdr`] on the wire.
pub const HDR_SIZE: usize = core::mem::size_of::<PmuHdr>();

/// Largest frame the one-byte `size` field can describe.
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize;

impl PmuHdr {
    /// Header for a frame of `body_len` bytes addressed to `unit_id`.
    ///
    /// Returns `None` if the frame would exceed [`MAX_FRAME_SIZE`].
    #[inline]
    #[must_use]
    pub fn for_body(unit_id: u8, body_len: usize) -> Option<Self> {
        let size = u8::try_from(HDR_SIZE + body_len).ok()?;
        Some(Self {
            unit_id,
            size,
            ctrl_flags: 0,
            seq_id: 0,
        })
    }

    /// Queue rewind marker.
    #[inline]
    #[must_use]
    pub const fn rewind() -> Self {
        Self {
            unit_id: unit::REWIND,
            size: HDR_SIZE as u8,
            ctrl_flags: 0,
            seq_id: 0,
        }
    }

    /// Body length implied by `size`, or `None` if `size` is below the header.
    #[inline]
    #[must_use]
    pub const fn body_len(&self) -> Option<usize> {
        (self.size as usize).checked_sub(HDR_SIZE)
    }

    /// Whether the firmware flagged this frame as an unsolicited event.
    #[inline]
    #[must_use]
    pub const fn is_event(&self) -> bool {
        self.ctrl_flags & !ctrl_flags::PMU_MASK == ctrl_flags::EVENT
    }
}

/// Logical unit ids
pub mod unit {
    /// Queue rewind marker, never a real payload
    pub const REWIND: u8 = 0x00;
    /// Power gating
    pub const PG: u8 = 0x03;
    /// Firmware init message
    pub const INIT: u8 = 0x07;
    /// Secure boot
    pub const ACR: u8 = 0x0a;
    /// Clocks
    pub const CLK: u8 = 0x0d;
    /// Voltage
    pub const VOLT: u8 = 0x0e;
    /// Performance monitor on newer chips
    pub const PERFMON_T18X: u8 = 0x11;
    /// Performance monitor
    pub const PERFMON: u8 = 0x12;
    /// Performance tables
    pub const PERF: u8 = 0x13;
    /// Thermal
    pub const THERM: u8 = 0x14;
    /// Power management
    pub const PMGR: u8 = 0x18;
    /// FECS memory override
    pub const FECS_MEM_OVERRIDE: u8 = 0x1e;
    /// Firmware RC notifications (unhandled commands)
    pub const RC: u8 = 0x1f;
    /// One past the last production unit
    pub const END: u8 = 0x23;
    /// First id of the firmware test range
    pub const TEST_START: u8 = 0xfe;

    /// Whether `id` names a unit the firmware can address.
    #[inline]
    #[must_use]
    pub const fn is_valid(id: u8) -> bool {
        id < END || id >= TEST_START
    }
}

/// Header control flags
pub mod ctrl_flags {
    /// Host expects a status message for this command
    pub const STATUS: u8 = 1 << 0;
    /// Firmware should interrupt the host on completion
    pub const INTR: u8 = 1 << 1;
    /// Message is an unsolicited event, not a response
    pub const EVENT: u8 = 1 << 2;
    /// Queue watermark notification
    pub const WATERMARK: u8 = 1 << 3;
    /// Bits reserved for firmware-internal use
    pub const PMU_MASK: u8 = 0xf0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn test_header_layout() {
        assert_eq!(HDR_SIZE, 4);
        let hdr = PmuHdr {
            unit_id: unit::PG,
            size: 8,
            ctrl_flags: ctrl_flags::STATUS | ctrl_flags::INTR,
            seq_id: 5,
        };
        assert_eq!(hdr.as_bytes(), &[0x03, 8, 3, 5]);

        let (back, rest) = PmuHdr::read_from_prefix(&[0x07, 12, 0, 0, 0xaa][..]).unwrap();
        assert_eq!(back.unit_id, unit::INIT);
        assert_eq!(back.body_len(), Some(8));
        assert_eq!(rest, &[0xaa]);
    }

    #[test]
    fn test_unit_validity() {
        assert!(unit::is_valid(unit::PG));
        assert!(unit::is_valid(unit::RC));
        assert!(!unit::is_valid(unit::END));
        assert!(!unit::is_valid(0x80));
        assert!(unit::is_valid(unit::TEST_START));
        assert!(unit::is_valid(0xff));
    }

    #[test]
    fn test_event_flag_ignores_firmware_bits() {
        let mut hdr = PmuHdr::for_body(unit::PERFMON, 4).unwrap();
        hdr.ctrl_flags = ctrl_flags::EVENT | 0x30;
        assert!(hdr.is_event());
        hdr.ctrl_flags = ctrl_flags::EVENT | ctrl_flags::STATUS;
        assert!(!hdr.is_event());
    }

    #[test]
    fn test_frame_size_limit() {
        assert!(PmuHdr::for_body(unit::PG, MAX_FRAME_SIZE - HDR_SIZE).is_some());
        assert!(PmuHdr::for_body(unit::PG, MAX_FRAME_SIZE).is_none());
        assert_eq!(PmuHdr::rewind().size as usize, HDR_SIZE);
        assert_eq!(PmuHdr { size: 2, ..PmuHdr::default() }.body_len(), None);
    }
}
