//! Power-gating unit (`unit::PG`) commands and messages
//!
//! Every PG body starts with a one-byte `cmd_type`/`msg_type` selecting the
//! sub-protocol: ELPG control, statistics, engine buffer load, ZBC table
//! update or adaptive power. Layouts that vary across firmware releases
//! (engine buffer load, ZBC command id) go through [`crate::FirmwareAbi`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `cmd_type` values
pub mod cmd_id {
    /// ELPG control, body is [`super::ElpgCmd`]
    pub const ELPG_CMD: u8 = 0;
    /// Engine buffer load, body layout from the firmware ABI
    pub const ENG_BUF_LOAD: u8 = 1;
    /// Statistics control, body is [`super::PgStatCmd`]
    pub const PG_STAT: u8 = 8;
    /// Adaptive power, body is one of the `Ap*` commands
    pub const AP: u8 = 10;
}

/// `msg_type` values
pub mod msg_id {
    /// ELPG acknowledgement, body is [`super::ElpgMsg`]
    pub const ELPG_MSG: u8 = 0;
    /// Statistics response, body is [`super::PgStatMsg`]
    pub const STAT: u8 = 1;
    /// Engine buffer load status, body is [`super::EngBufStat`]
    pub const ENG_BUF_STAT: u8 = 3;
    /// Adaptive power response, body is [`super::ApMsg`]
    pub const AP: u8 = 4;
}

/// Gateable engines
pub mod engine {
    /// Graphics engine
    pub const GRAPHICS: u8 = 0;
    /// Memory subsystem (MSCG)
    pub const MS: u8 = 4;
    /// One past the last engine id
    pub const INVALID: u8 = 5;
}

/// ELPG sub-commands
pub mod elpg_cmd {
    pub const INIT: u16 = 0;
    pub const DISALLOW: u16 = 1;
    pub const ALLOW: u16 = 2;
}

/// ELPG acknowledgements
pub mod elpg_msg {
    pub const INIT_ACK: u16 = 0;
    pub const DISALLOW_ACK: u16 = 1;
    pub const ALLOW_ACK: u16 = 2;
}

/// Statistics sub-commands and responses
pub mod pg_stat {
    /// Ask the firmware to allocate its statistics block
    pub const CMD_ALLOC_DMEM: u16 = 0;
    /// Response carrying the statistics block DMEM offset
    pub const MSG_RESP_DMEM_OFFSET: u16 = 0;
}

/// Engine buffer indices and load status
pub mod eng_buf {
    pub const IDX_PMU: u8 = 0;
    /// ZBC save/restore sequence buffer
    pub const IDX_ZBC: u8 = 1;
    /// FECS power-gating buffer
    pub const IDX_FECS: u8 = 2;

    pub const STATUS_LOADED: u8 = 1;
    pub const STATUS_FAILED: u8 = 2;
}

/// DMA aperture indices understood by the firmware
pub mod dma_idx {
    pub const UCODE: u8 = 0;
    pub const VIRT: u8 = 1;
    pub const PHYS_VID: u8 = 2;
    pub const PHYS_SYS_COH: u8 = 3;
    pub const PHYS_SYS_NCOH: u8 = 4;
}

/// ELPG control command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ElpgCmd {
    pub cmd_type: u8,
    pub engine_id: u8,
    pub cmd: u16,
}

impl ElpgCmd {
    #[must_use]
    pub const fn new(engine_id: u8, cmd: u16) -> Self {
        Self {
            cmd_type: cmd_id::ELPG_CMD,
            engine_id,
            cmd,
        }
    }
}

/// ELPG acknowledgement.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ElpgMsg {
    pub msg_type: u8,
    pub engine_id: u8,
    pub msg: u16,
}

/// Statistics command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PgStatCmd {
    pub cmd_type: u8,
    pub engine_id: u8,
    pub sub_cmd_id: u16,
    pub data: u32,
}

/// Statistics response.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PgStatMsg {
    pub msg_type: u8,
    pub engine_id: u8,
    pub sub_msg_id: u16,
    pub data: u32,
}

/// Engine buffer load status.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EngBufStat {
    pub msg_type: u8,
    pub engine_id: u8,
    pub buf_idx: u8,
    pub status: u8,
}

/// Layout-independent engine buffer load request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngBufLoad {
    pub engine_id: u8,
    pub buf_idx: u8,
    pub buf_size: u32,
    pub gpu_va: u64,
    pub dma_idx: u8,
}

/// Engine buffer load, first layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EngBufLoadV0 {
    pub cmd_type: u8,
    pub engine_id: u8,
    pub buf_idx: u8,
    pub pad: u8,
    pub buf_size: u16,
    pub dma_offset: u8,
    pub dma_idx: u8,
    /// Address bits 39:8
    pub dma_base: u32,
}

/// Engine buffer load with a split 64-bit address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EngBufLoadV1 {
    pub cmd_type: u8,
    pub engine_id: u8,
    pub buf_idx: u8,
    pub pad: u8,
    pub dma_addr_lo: u32,
    pub dma_addr_hi: u32,
    pub dma_size: u16,
    pub dma_idx: u8,
    pub pad2: u8,
}

/// Engine buffer load carrying a surface descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EngBufLoadV2 {
    pub cmd_type: u8,
    pub engine_id: u8,
    pub buf_idx: u8,
    pub pad: u8,
    pub dma_desc: crate::alloc::FbDesc,
}

/// ZBC table update command (`cmd_type` comes from the firmware ABI).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ZbcCmd {
    pub cmd_type: u8,
    pub pad: u8,
    pub entry_mask: u16,
}

/// Mask of ZBC table entries `1..=entries` (entry 0 is reserved).
#[inline]
#[must_use]
pub const fn zbc_mask(entries: u32) -> u16 {
    let bits = if entries >= 31 {
        u32::MAX
    } else {
        !(u32::MAX << (entries + 1))
    };
    (bits & 0xfffe) as u16
}

/// Firmware power-gating residency counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PgStats {
    pub entry_start_timestamp: u64,
    pub ingating_start_timestamp: u64,
    pub exit_start_timestamp: u64,
    pub ungating_start_timestamp: u64,
    pub avg_entry_time_us: u32,
    pub ingating_cnt: u32,
    pub ingating_time_us: u32,
    pub avg_exit_time_us: u32,
    pub ungating_count: u32,
    pub ungating_time_us: u32,
    pub gating_cnt: u32,
    pub gating_deny_cnt: u32,
}

// -- Adaptive power

/// Adaptive power sub-commands
pub mod ap_cmd {
    pub const INIT: u8 = 0;
    pub const INIT_AND_ENABLE_CTRL: u8 = 1;
    pub const ENABLE_CTRL: u8 = 2;
    pub const DISABLE_CTRL: u8 = 3;
    pub const KICK_CTRL: u8 = 4;
}

/// Adaptive power responses
pub mod ap_msg {
    pub const INIT_ACK: u8 = 0;
}

/// Adaptive power controllers
pub mod ap_ctrl {
    pub const GRAPHICS: u8 = 0;
    pub const MS: u8 = 1;
}

/// Global adaptive power initialisation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApInit {
    pub cmd_type: u8,
    pub cmd_id: u8,
    pub pad: [u8; 2],
    pub pg_sampling_period_us: u32,
}

/// Per-controller tuning parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApCtrlInitParams {
    pub min_idle_filter_us: u32,
    pub min_target_saving_us: u32,
    pub power_break_even_us: u32,
    pub cycles_per_sample_max: u32,
}

/// Initialise and enable one controller.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApInitAndEnableCtrl {
    pub cmd_type: u8,
    pub cmd_id: u8,
    pub ctrl_id: u8,
    pub pad: u8,
    pub params: ApCtrlInitParams,
}

/// Enable or disable one controller.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApCtrl {
    pub cmd_type: u8,
    pub cmd_id: u8,
    pub ctrl_id: u8,
    pub pad: u8,
}

/// Kick one controller, skipping `skip_count` samples.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApKickCtrl {
    pub cmd_type: u8,
    pub cmd_id: u8,
    pub ctrl_id: u8,
    pub pad: u8,
    pub skip_count: u32,
}

/// Adaptive power response.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ApMsg {
    pub msg_type: u8,
    pub msg_id: u8,
    pub ctrl_id: u8,
    pub pad: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zbc_mask_skips_reserved_entry() {
        assert_eq!(zbc_mask(0xf), 0xfffe);
        assert_eq!(zbc_mask(1), 0x0002);
        assert_eq!(zbc_mask(3), 0x000e);
        assert_eq!(zbc_mask(0), 0);
        assert_eq!(zbc_mask(64), 0xfffe);
    }

    #[test]
    fn test_layouts_have_no_padding() {
        assert_eq!(core::mem::size_of::<EngBufLoadV0>(), 12);
        assert_eq!(core::mem::size_of::<EngBufLoadV1>(), 16);
        assert_eq!(core::mem::size_of::<EngBufLoadV2>(), 16);
        assert_eq!(core::mem::size_of::<PgStats>(), 64);
        assert_eq!(core::mem::size_of::<ApInitAndEnableCtrl>(), 20);
    }

    #[test]
    fn test_elpg_cmd_bytes() {
        let cmd = ElpgCmd::new(engine::GRAPHICS, elpg_cmd::ALLOW);
        assert_eq!(cmd.as_bytes(), &[cmd_id::ELPG_CMD, 0, 2, 0]);
    }
}
