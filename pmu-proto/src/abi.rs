//! Firmware ABI selection
//!
//! Several layouts changed between firmware releases: the init message, the
//! payload allocation descriptor, the engine buffer load command, the perfmon
//! counter description and the ZBC command id. [`FirmwareAbi`] hides those
//! differences behind one trait object chosen once, from the application
//! version found in the firmware image, via [`select_abi`].
//!
//! Layouts that never changed are plain structs in [`crate::pg`] and
//! [`crate::perfmon`] and do not go through this trait.

use core::fmt;
use core::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::alloc::{AllocV1, AllocV3, FbDesc, PayloadAlloc};
use crate::error::AbiError;
use crate::hdr::unit;
use crate::init::{InitInfo, InitMsgV0, InitMsgV1, InitMsgV3};
use crate::perfmon::{
    PerfmonCounter, PerfmonCounterV0, PerfmonCounterV2, PerfmonInit, PerfmonInitHead,
    PerfmonInitTail, PerfmonStart, PerfmonStartHead, cmd_id as perfmon_cmd,
};
use crate::pg::{EngBufLoad, EngBufLoadV0, EngBufLoadV1, EngBufLoadV2, cmd_id as pg_cmd};

/// Known firmware application versions.
pub mod app_version {
    pub const GK20A_0: u32 = 16_856_675;
    pub const GK20A_1: u32 = 17_997_577;
    pub const GK20A_2: u32 = 18_542_378;
    pub const GK20A_3: u32 = 18_357_968;
    pub const GM20B: u32 = 17_615_280;
    pub const GM20B_1: u32 = 18_547_257;
    pub const GM20B_2: u32 = 18_694_072;
    pub const GM20B_3: u32 = 18_935_575;
    pub const GM20B_4: u32 = 19_008_461;
    pub const GM20B_5: u32 = 20_490_253;
    pub const NC_0: u32 = 20_360_931;
    pub const NC_1: u32 = 20_313_802;
    pub const NC_2: u32 = 20_429_989;
    pub const GM206: u32 = 20_652_057;
    pub const NV_GPU: u32 = 21_307_569;
    pub const NV_GPU_1: u32 = 21_308_030;
}

/// ABI generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVersion {
    /// First release: 16-bit init queue table, DMEM-only payloads
    V0,
    /// Adds the debugger entry point and split buffer addresses
    V1,
    /// Packed init message, framebuffer-backed payloads
    V3,
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0 => write!(f, "v0"),
            Self::V1 => write!(f, "v1"),
            Self::V3 => write!(f, "v3"),
        }
    }
}

/// Version-dependent layouts.
///
/// Encoders write into a caller-provided buffer, which must be at least the
/// corresponding `*_size()` long.
pub trait FirmwareAbi: Sync {
    /// Which generation this is.
    fn version(&self) -> AbiVersion;

    /// Decode the init message body.
    fn decode_init(&self, body: &[u8]) -> Result<InitInfo, AbiError>;

    /// Size of the allocation descriptor embedded in payload commands.
    fn alloc_size(&self) -> usize;

    /// Whether allocation descriptors can point at a framebuffer surface.
    fn supports_fb(&self) -> bool {
        false
    }

    /// Write an allocation descriptor.
    fn encode_alloc(&self, alloc: &PayloadAlloc, out: &mut [u8]) -> Result<(), AbiError>;

    /// Read back an allocation descriptor.
    fn decode_alloc(&self, raw: &[u8]) -> Result<PayloadAlloc, AbiError>;

    /// Size of one perfmon counter description.
    fn perfmon_counter_size(&self) -> usize;

    fn encode_perfmon_counter(
        &self,
        counter: &PerfmonCounter,
        out: &mut [u8],
    ) -> Result<(), AbiError>;

    /// Size of the engine buffer load body.
    fn eng_buf_load_size(&self) -> usize;

    fn encode_eng_buf_load(&self, load: &EngBufLoad, out: &mut [u8]) -> Result<(), AbiError>;

    /// PG `cmd_type` of the ZBC table update.
    fn zbc_table_update_id(&self) -> u8;

    /// Unit id the perfmon task listens on.
    fn perfmon_unit(&self) -> u8 {
        unit::PERFMON
    }

    // -- Provided: perfmon bodies built around the allocation descriptor

    /// Size of the perfmon START body.
    fn perfmon_start_size(&self) -> usize {
        size_of::<PerfmonStartHead>() + self.alloc_size()
    }

    /// Offset of the allocation descriptor inside START.
    fn perfmon_start_alloc_offset(&self) -> usize {
        size_of::<PerfmonStartHead>()
    }

    /// Write a START body, leaving the allocation descriptor zeroed.
    fn encode_perfmon_start(&self, start: &PerfmonStart, out: &mut [u8]) -> Result<(), AbiError> {
        if out.len() < self.perfmon_start_size() {
            return Err(AbiError::NoSpace);
        }
        let head = PerfmonStartHead {
            cmd_type: perfmon_cmd::START,
            group_id: start.group_id,
            state_id: start.state_id,
            flags: start.flags,
        };
        put(&head, out)?;
        out[size_of::<PerfmonStartHead>()..self.perfmon_start_size()].fill(0);
        Ok(())
    }

    /// Size of the perfmon INIT body.
    fn perfmon_init_size(&self) -> usize {
        size_of::<PerfmonInitHead>() + self.alloc_size() + size_of::<PerfmonInitTail>()
    }

    /// Offset of the allocation descriptor inside INIT.
    fn perfmon_init_alloc_offset(&self) -> usize {
        size_of::<PerfmonInitHead>()
    }

    /// Write an INIT body, leaving the allocation descriptor zeroed.
    fn encode_perfmon_init(&self, init: &PerfmonInit, out: &mut [u8]) -> Result<(), AbiError> {
        if out.len() < self.perfmon_init_size() {
            return Err(AbiError::NoSpace);
        }
        let head = PerfmonInitHead {
            cmd_type: perfmon_cmd::INIT,
            to_decrease_count: init.to_decrease_count,
            base_counter_id: init.base_counter_id,
            pad: 0,
            sample_period_us: init.sample_period_us,
        };
        let tail = PerfmonInitTail {
            num_counters: init.num_counters,
            samples_in_moving_avg: init.samples_in_moving_avg,
            sample_buffer: init.sample_buffer,
        };
        let alloc_at = self.perfmon_init_alloc_offset();
        let tail_at = alloc_at + self.alloc_size();
        put(&head, out)?;
        out[alloc_at..tail_at].fill(0);
        put(&tail, &mut out[tail_at..])
    }
}

fn put<T: IntoBytes + Immutable>(value: &T, out: &mut [u8]) -> Result<(), AbiError> {
    value.write_to_prefix(out).map_err(|_| AbiError::NoSpace)
}

// -- V0

/// First-generation layouts.
#[derive(Debug)]
pub struct AbiV0;

impl FirmwareAbi for AbiV0 {
    fn version(&self) -> AbiVersion {
        AbiVersion::V0
    }

    fn decode_init(&self, body: &[u8]) -> Result<InitInfo, AbiError> {
        InitMsgV0::decode(body)
    }

    fn alloc_size(&self) -> usize {
        size_of::<AllocV1>()
    }

    fn encode_alloc(&self, alloc: &PayloadAlloc, out: &mut [u8]) -> Result<(), AbiError> {
        encode_alloc_v1(alloc, out)
    }

    fn decode_alloc(&self, raw: &[u8]) -> Result<PayloadAlloc, AbiError> {
        decode_alloc_v1(raw)
    }

    fn perfmon_counter_size(&self) -> usize {
        size_of::<PerfmonCounterV0>()
    }

    fn encode_perfmon_counter(
        &self,
        counter: &PerfmonCounter,
        out: &mut [u8],
    ) -> Result<(), AbiError> {
        let raw = PerfmonCounterV0 {
            index: counter.index,
            flags: counter.flags,
            group_id: counter.group_id,
            valid: u8::from(counter.valid),
            upper_threshold: counter.upper_threshold,
            lower_threshold: counter.lower_threshold,
        };
        put(&raw, out)
    }

    fn eng_buf_load_size(&self) -> usize {
        size_of::<EngBufLoadV0>()
    }

    fn encode_eng_buf_load(&self, load: &EngBufLoad, out: &mut [u8]) -> Result<(), AbiError> {
        let buf_size = u16::try_from(load.buf_size).map_err(|_| AbiError::BadLayout)?;
        // The base register holds address bits 39:8
        if load.gpu_va >> 40 != 0 {
            return Err(AbiError::BadLayout);
        }
        let raw = EngBufLoadV0 {
            cmd_type: pg_cmd::ENG_BUF_LOAD,
            engine_id: load.engine_id,
            buf_idx: load.buf_idx,
            pad: 0,
            buf_size,
            dma_offset: (load.gpu_va & 0xff) as u8,
            dma_idx: load.dma_idx,
            dma_base: (load.gpu_va >> 8) as u32,
        };
        put(&raw, out)
    }

    fn zbc_table_update_id(&self) -> u8 {
        14
    }
}

// -- V1

/// Second-generation layouts.
#[derive(Debug)]
pub struct AbiV1;

impl FirmwareAbi for AbiV1 {
    fn version(&self) -> AbiVersion {
        AbiVersion::V1
    }

    fn decode_init(&self, body: &[u8]) -> Result<InitInfo, AbiError> {
        InitMsgV1::decode(body)
    }

    fn alloc_size(&self) -> usize {
        size_of::<AllocV1>()
    }

    fn encode_alloc(&self, alloc: &PayloadAlloc, out: &mut [u8]) -> Result<(), AbiError> {
        encode_alloc_v1(alloc, out)
    }

    fn decode_alloc(&self, raw: &[u8]) -> Result<PayloadAlloc, AbiError> {
        decode_alloc_v1(raw)
    }

    fn perfmon_counter_size(&self) -> usize {
        size_of::<PerfmonCounterV2>()
    }

    fn encode_perfmon_counter(
        &self,
        counter: &PerfmonCounter,
        out: &mut [u8],
    ) -> Result<(), AbiError> {
        encode_counter_v2(counter, out)
    }

    fn eng_buf_load_size(&self) -> usize {
        size_of::<EngBufLoadV1>()
    }

    fn encode_eng_buf_load(&self, load: &EngBufLoad, out: &mut [u8]) -> Result<(), AbiError> {
        let dma_size = u16::try_from(load.buf_size).map_err(|_| AbiError::BadLayout)?;
        let raw = EngBufLoadV1 {
            cmd_type: pg_cmd::ENG_BUF_LOAD,
            engine_id: load.engine_id,
            buf_idx: load.buf_idx,
            pad: 0,
            dma_addr_lo: load.gpu_va as u32,
            dma_addr_hi: (load.gpu_va >> 32) as u32,
            dma_size,
            dma_idx: load.dma_idx,
            pad2: 0,
        };
        put(&raw, out)
    }

    fn zbc_table_update_id(&self) -> u8 {
        16
    }
}

// -- V3

/// Layouts with framebuffer-backed payloads.
#[derive(Debug)]
pub struct AbiV3;

impl FirmwareAbi for AbiV3 {
    fn version(&self) -> AbiVersion {
        AbiVersion::V3
    }

    fn decode_init(&self, body: &[u8]) -> Result<InitInfo, AbiError> {
        InitMsgV3::decode(body)
    }

    fn alloc_size(&self) -> usize {
        size_of::<AllocV3>()
    }

    fn supports_fb(&self) -> bool {
        true
    }

    fn encode_alloc(&self, alloc: &PayloadAlloc, out: &mut [u8]) -> Result<(), AbiError> {
        let raw = AllocV3 {
            dmem_size: alloc.dmem_size,
            pad: 0,
            dmem_offset: alloc.dmem_offset,
            fb: alloc.fb.unwrap_or_default(),
        };
        put(&raw, out)
    }

    fn decode_alloc(&self, raw: &[u8]) -> Result<PayloadAlloc, AbiError> {
        let (raw, _) = AllocV3::read_from_prefix(raw).map_err(|_| AbiError::Truncated)?;
        let fb = (raw.fb != FbDesc::default()).then_some(raw.fb);
        Ok(PayloadAlloc {
            dmem_size: raw.dmem_size,
            dmem_offset: raw.dmem_offset,
            fb,
        })
    }

    fn perfmon_counter_size(&self) -> usize {
        size_of::<PerfmonCounterV2>()
    }

    fn encode_perfmon_counter(
        &self,
        counter: &PerfmonCounter,
        out: &mut [u8],
    ) -> Result<(), AbiError> {
        encode_counter_v2(counter, out)
    }

    fn eng_buf_load_size(&self) -> usize {
        size_of::<EngBufLoadV2>()
    }

    fn encode_eng_buf_load(&self, load: &EngBufLoad, out: &mut [u8]) -> Result<(), AbiError> {
        if load.buf_size > 0x00ff_ffff {
            return Err(AbiError::BadLayout);
        }
        let raw = EngBufLoadV2 {
            cmd_type: pg_cmd::ENG_BUF_LOAD,
            engine_id: load.engine_id,
            buf_idx: load.buf_idx,
            pad: 0,
            dma_desc: FbDesc::new(load.gpu_va, load.buf_size, load.dma_idx),
        };
        put(&raw, out)
    }

    fn zbc_table_update_id(&self) -> u8 {
        16
    }

    fn perfmon_unit(&self) -> u8 {
        unit::PERFMON_T18X
    }
}

fn encode_alloc_v1(alloc: &PayloadAlloc, out: &mut [u8]) -> Result<(), AbiError> {
    if alloc.fb.is_some() {
        return Err(AbiError::BadLayout);
    }
    let raw = AllocV1 {
        dmem_size: alloc.dmem_size,
        pad: 0,
        dmem_offset: alloc.dmem_offset,
    };
    put(&raw, out)
}

fn decode_alloc_v1(raw: &[u8]) -> Result<PayloadAlloc, AbiError> {
    let (raw, _) = AllocV1::read_from_prefix(raw).map_err(|_| AbiError::Truncated)?;
    Ok(PayloadAlloc {
        dmem_size: raw.dmem_size,
        dmem_offset: raw.dmem_offset,
        fb: None,
    })
}

fn encode_counter_v2(counter: &PerfmonCounter, out: &mut [u8]) -> Result<(), AbiError> {
    let raw = PerfmonCounterV2 {
        index: counter.index,
        flags: counter.flags,
        group_id: counter.group_id,
        valid: u8::from(counter.valid),
        upper_threshold: counter.upper_threshold,
        lower_threshold: counter.lower_threshold,
        scale: 0,
    };
    put(&raw, out)
}

static ABI_V0: AbiV0 = AbiV0;
static ABI_V1: AbiV1 = AbiV1;
static ABI_V3: AbiV3 = AbiV3;

/// Pick the layout set for a firmware application version.
pub fn select_abi(version: u32) -> Result<&'static dyn FirmwareAbi, AbiError> {
    use app_version::*;

    match version {
        GK20A_0 => Ok(&ABI_V0),
        GK20A_1 | GK20A_2 | GK20A_3 | GM20B | GM20B_1 | GM20B_2 | GM20B_3 | GM20B_4
        | GM20B_5 | NC_0 | NC_1 | NC_2 => Ok(&ABI_V1),
        GM206 | NV_GPU | NV_GPU_1 => Ok(&ABI_V3),
        other => Err(AbiError::UnsupportedVersion(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perfmon::flags;

    #[test]
    fn test_select_abi() {
        assert_eq!(select_abi(app_version::GK20A_0).unwrap().version(), AbiVersion::V0);
        assert_eq!(select_abi(app_version::GM20B_4).unwrap().version(), AbiVersion::V1);
        assert_eq!(select_abi(app_version::NV_GPU).unwrap().version(), AbiVersion::V3);
        assert_eq!(
            select_abi(42).map(|abi| abi.version()),
            Err(AbiError::UnsupportedVersion(42))
        );
    }

    #[test]
    fn test_fb_descriptor_only_on_v3() {
        let alloc = PayloadAlloc {
            dmem_size: 64,
            dmem_offset: 0x1000,
            fb: Some(FbDesc::new(0x1_0000_2000, 0x800, 1)),
        };
        let mut out = [0u8; 32];

        assert_eq!(AbiV1.encode_alloc(&alloc, &mut out), Err(AbiError::BadLayout));

        AbiV3.encode_alloc(&alloc, &mut out).unwrap();
        let back = AbiV3.decode_alloc(&out).unwrap();
        assert_eq!(back.fb.unwrap().gpu_va(), 0x1_0000_2000);
        assert_eq!(back.fb.unwrap().size(), 0x800);
        assert_eq!(back.dmem_offset, 0x1000);
    }

    #[test]
    fn test_eng_buf_load_v0_splits_address() {
        let load = EngBufLoad {
            engine_id: 0,
            buf_idx: 2,
            buf_size: 0x1000,
            gpu_va: 0x12_3456_7880,
            dma_idx: 1,
        };
        let mut out = [0u8; 12];
        AbiV0.encode_eng_buf_load(&load, &mut out).unwrap();
        let (raw, _) = EngBufLoadV0::read_from_prefix(&out[..]).unwrap();
        assert_eq!(raw.dma_base, 0x1234_5678);
        assert_eq!(raw.dma_offset, 0x80);
        assert_eq!(raw.buf_size, 0x1000);

        let too_big = EngBufLoad { buf_size: 0x1_0000, ..load };
        assert_eq!(AbiV0.encode_eng_buf_load(&too_big, &mut out), Err(AbiError::BadLayout));
    }

    #[test]
    fn test_perfmon_init_layout() {
        let abi: &dyn FirmwareAbi = &AbiV3;
        let init = PerfmonInit {
            sample_buffer: 0x200,
            to_decrease_count: 15,
            base_counter_id: 6,
            sample_period_us: 16_700,
            num_counters: 2,
            samples_in_moving_avg: 17,
        };
        let mut out = [0xaau8; 64];
        abi.encode_perfmon_init(&init, &mut out).unwrap();

        assert_eq!(abi.perfmon_init_size(), 8 + 20 + 4);
        assert_eq!(out[0], perfmon_cmd::INIT);
        assert!(out[8..28].iter().all(|&b| b == 0));
        assert_eq!(&out[28..32], &[2, 17, 0x00, 0x02]);

        let start = PerfmonStart {
            group_id: 0,
            state_id: 1,
            flags: flags::ENABLE_INCREASE,
        };
        assert_eq!(
            abi.encode_perfmon_start(&start, &mut out[..4]),
            Err(AbiError::NoSpace)
        );
    }
}
