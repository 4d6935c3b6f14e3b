//! Firmware init message
//!
//! The first message the firmware emits after boot. It is read directly at
//! the message queue tail (the queue geometry is not known before it) and
//! reports where every queue lives in DMEM and which window of DMEM the host
//! may allocate from.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::AbiError;

/// `msg_type` of the init message body
pub const MSG_TYPE_PMU_INIT: u8 = 0;

/// Number of queues described by the v0-v2 layouts
pub const QUEUE_COUNT: usize = 5;

/// Number of queues described by the v3 layout
pub const QUEUE_COUNT_V3: usize = 3;

/// Logical queue ids as used in the v0-v2 `queue_info` table
pub mod queue_id {
    /// High-priority command queue
    pub const HPQ: usize = 0;
    /// Low-priority command queue
    pub const LPQ: usize = 1;
    /// Firmware/BIOS shared queue
    pub const BIOS: usize = 2;
    /// Firmware/SMI shared queue
    pub const SMI: usize = 3;
    /// Message queue (firmware writes, host reads)
    pub const MESSAGE: usize = 4;
}

/// Signature at the start of the software-managed DMEM area when the
/// firmware carries a SHA1 build id.
pub const SHA1_GID_SIGNATURE: u32 = 0xa7c6_6ad2;

/// Length of the SHA1 build id following the signature.
pub const SHA1_GID_SIZE: usize = 16;

/// Queue placement reported by the firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// Byte offset of the ring in DMEM
    pub offset: u32,
    /// Ring size in bytes
    pub size: u32,
    /// Index of the head/tail register pair serving this queue
    pub index: u8,
}

/// Decoded init message, independent of the layout version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitInfo {
    /// High-priority command queue
    pub hpq: QueueInfo,
    /// Low-priority command queue
    pub lpq: QueueInfo,
    /// Message queue
    pub msgq: QueueInfo,
    /// Start of the host-allocatable DMEM window
    pub sw_managed_offset: u32,
    /// Size of the host-allocatable DMEM window
    pub sw_managed_size: u32,
    /// Firmware debugger entry point (zero on layouts without it)
    pub os_debug_entry_point: u16,
}

/// Per-queue record of the v0-v2 layouts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct QueueInfoRaw {
    pub size: u16,
    pub offset: u16,
    pub index: u8,
    pub pad: u8,
}

impl QueueInfoRaw {
    fn decode(&self) -> QueueInfo {
        QueueInfo {
            offset: u32::from(self.offset),
            size: u32::from(self.size),
            index: self.index,
        }
    }
}

/// Init message body, first layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitMsgV0 {
    pub msg_type: u8,
    pub pad: u8,
    pub queue_info: [QueueInfoRaw; QUEUE_COUNT],
    pub sw_managed_area_offset: u16,
    pub sw_managed_area_size: u16,
}

/// Init message body with the debugger entry point (v1 and v2 share it).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitMsgV1 {
    pub msg_type: u8,
    pub pad: u8,
    pub os_debug_entry_point: u16,
    pub queue_info: [QueueInfoRaw; QUEUE_COUNT],
    pub sw_managed_area_offset: u16,
    pub sw_managed_area_size: u16,
}

/// Init message body, packed layout with contiguous queues.
///
/// Queues are laid out back to back from `queue_offset` in HPQ, LPQ,
/// message order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitMsgV3 {
    pub msg_type: u8,
    pub queue_index: [u8; QUEUE_COUNT_V3],
    pub queue_size: [u16; QUEUE_COUNT_V3],
    pub queue_offset: u16,
    pub sw_managed_area_offset: u16,
    pub sw_managed_area_size: u16,
    pub os_debug_entry_point: u16,
    pub dummy: [u8; 18],
}

fn check_type(msg_type: u8) -> Result<(), AbiError> {
    if msg_type == MSG_TYPE_PMU_INIT {
        Ok(())
    } else {
        Err(AbiError::BadLayout)
    }
}

impl InitMsgV0 {
    /// Decode from the message body (header stripped).
    pub fn decode(body: &[u8]) -> Result<InitInfo, AbiError> {
        let (raw, _) = Self::read_from_prefix(body).map_err(|_| AbiError::Truncated)?;
        check_type(raw.msg_type)?;
        Ok(InitInfo {
            hpq: raw.queue_info[queue_id::HPQ].decode(),
            lpq: raw.queue_info[queue_id::LPQ].decode(),
            msgq: raw.queue_info[queue_id::MESSAGE].decode(),
            sw_managed_offset: u32::from(raw.sw_managed_area_offset),
            sw_managed_size: u32::from(raw.sw_managed_area_size),
            os_debug_entry_point: 0,
        })
    }
}

impl InitMsgV1 {
    /// Decode from the message body (header stripped).
    pub fn decode(body: &[u8]) -> Result<InitInfo, AbiError> {
        let (raw, _) = Self::read_from_prefix(body).map_err(|_| AbiError::Truncated)?;
        check_type(raw.msg_type)?;
        Ok(InitInfo {
            hpq: raw.queue_info[queue_id::HPQ].decode(),
            lpq: raw.queue_info[queue_id::LPQ].decode(),
            msgq: raw.queue_info[queue_id::MESSAGE].decode(),
            sw_managed_offset: u32::from(raw.sw_managed_area_offset),
            sw_managed_size: u32::from(raw.sw_managed_area_size),
            os_debug_entry_point: raw.os_debug_entry_point,
        })
    }
}

impl InitMsgV3 {
    /// Decode from the message body (header stripped).
    pub fn decode(body: &[u8]) -> Result<InitInfo, AbiError> {
        let (raw, _) = Self::read_from_prefix(body).map_err(|_| AbiError::Truncated)?;
        check_type(raw.msg_type)?;

        let mut queues = [QueueInfo::default(); QUEUE_COUNT_V3];
        let mut offset = u32::from(raw.queue_offset);
        for (i, queue) in queues.iter_mut().enumerate() {
            let size = u32::from(raw.queue_size[i]);
            *queue = QueueInfo {
                offset,
                size,
                index: raw.queue_index[i],
            };
            offset += size;
        }

        Ok(InitInfo {
            hpq: queues[0],
            lpq: queues[1],
            msgq: queues[2],
            sw_managed_offset: u32::from(raw.sw_managed_area_offset),
            sw_managed_size: u32::from(raw.sw_managed_area_size),
            os_debug_entry_point: raw.os_debug_entry_point,
        })
    }
}
