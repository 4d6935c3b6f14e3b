//! In-memory falcon
//!
//! [`SimFalcon`] backs the register file and DMEM with plain memory and runs
//! a small firmware model whenever the host publishes a command queue head:
//! it consumes the queued frames, records what it saw and answers through
//! the message queue, raising SWGEN0 the way the real firmware does.
//!
//! Time is virtual: `sleep_us` advances the clock instead of blocking, so
//! timeouts in tests cost nothing.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace, warn};
use pmu_mmio::{RegisterIo, RingCursor, Room, align_up};
use pmu_proto::abi::app_version;
use pmu_proto::alloc::PayloadAlloc;
use pmu_proto::event::{RcUnhandledCmd, rc};
use pmu_proto::init::{
    InitMsgV0, InitMsgV1, InitMsgV3, MSG_TYPE_PMU_INIT, QUEUE_COUNT, QueueInfoRaw,
    SHA1_GID_SIGNATURE, SHA1_GID_SIZE, queue_id,
};
use pmu_proto::perfmon::{self, PerfmonMsg};
use pmu_proto::pg::{
    ApMsg, ElpgCmd, ElpgMsg, EngBufStat, PgStatCmd, PgStatMsg, PgStats, ZbcCmd, ap_msg, cmd_id,
    elpg_cmd, elpg_msg, eng_buf, msg_id, pg_stat,
};
use pmu_proto::{AbiVersion, FirmwareAbi, HDR_SIZE, PmuHdr, ctrl_flags, select_abi, unit};
use spin::Mutex;
use tock_registers::interfaces::Readable;
use tock_registers::registers::InMemoryRegister;
use zerocopy::{FromBytes, IntoBytes};

#[cfg(test)]
use crate::PmuConfig;
use crate::PmuContext;
use crate::error::PmuError;
use crate::platform::{FirmwareInfo, Platform, PmuEvent, Surface};
use crate::queue::QueueId;
use crate::regs::{self, DMEMC, IDLE_COUNT};

/// Unit the firmware model echoes back verbatim
pub const ECHO_UNIT: u8 = unit::TEST_START;

const DMEM_SIZE: usize = 0x1_0000;
const REG_SPACE: usize = 0x800;

// -- Boot Layout

const HPQ_OFFSET: u32 = 0x1000;
const LPQ_OFFSET: u32 = 0x1100;
const CMDQ_SIZE: u32 = 0x100;
const MSGQ_OFFSET: u32 = 0x1200;
const MSGQ_SIZE: u32 = 0x200;
const HPQ_INDEX: u8 = 0;
const LPQ_INDEX: u8 = 1;
const SW_AREA_OFFSET: u32 = 0x2000;
const SW_AREA_SIZE: u32 = 0x2000;
const OS_DEBUG_ENTRY_POINT: u16 = 0x01c0;

/// Power-gating statistics blocks, below every host-visible window
const PG_STATS_BASE: u32 = 0x0800;
const PG_STATS_STRIDE: u32 = 0x40;

const PG_BUF: Surface = Surface {
    gpu_va: 0x0010_0000,
    size: 0x2000,
    handle: 0,
};
const ZBC_BUF: Surface = Surface {
    gpu_va: 0x0020_0000,
    size: 0x1000,
    handle: 0,
};
const SURFACE_VA_BASE: u64 = 0x1000_0000;
const SURFACE_ALIGN: u32 = 0x1000;

/// Frames the firmware model consumes per kick before giving up
const MAX_FRAMES_PER_KICK: usize = 256;

/// Register classes with side effects.
enum Target {
    Dmemc(usize),
    Dmemd(usize),
    Mutex(usize),
    IdleCount,
    CommandHead,
    Plain,
}

fn target(offset: usize) -> Target {
    if let Some(port) = (0..regs::DMEM_PORTS).find(|&p| regs::dmemc(p) == offset) {
        return Target::Dmemc(port);
    }
    if let Some(port) = (0..regs::DMEM_PORTS).find(|&p| regs::dmemd(p) == offset) {
        return Target::Dmemd(port);
    }
    if let Some(index) = (0..crate::config::MUTEX_COUNT).find(|&i| regs::mutex(i) == offset) {
        return Target::Mutex(index);
    }
    if (0..regs::IDLE_COUNTERS).any(|c| regs::idle_count(c) == offset) {
        return Target::IdleCount;
    }
    if offset == regs::queue_head(usize::from(HPQ_INDEX))
        || offset == regs::queue_head(usize::from(LPQ_INDEX))
    {
        return Target::CommandHead;
    }
    Target::Plain
}

struct SimState {
    regs: Vec<u32>,
    dmem: Vec<u8>,
    dmemc: [u32; regs::DMEM_PORTS],
    app_version: u32,
    abi: Option<&'static dyn FirmwareAbi>,
    clock_us: u64,
    busy_refs: i64,

    next_token: u8,
    tokens: Vec<u8>,

    surfaces: BTreeMap<u64, Vec<u8>>,
    next_va: u64,
    events: Vec<PmuEvent>,

    paused: bool,
    drop_responses: bool,
    reject_next: bool,
    fail_buffer: Option<u8>,

    seen: BTreeMap<u8, usize>,
    elpg_cmds: Vec<(u8, u16)>,
    pg_cmds: Vec<u8>,
    zbc_masks: Vec<u16>,
    zbc_ids: Vec<u8>,
    ap_cmds: Vec<(u8, u8)>,
    perfmon_starts: Vec<u8>,
}

impl SimState {
    fn new(app_version: u32) -> Self {
        Self {
            regs: vec![0; REG_SPACE / 4],
            dmem: vec![0; DMEM_SIZE],
            dmemc: [0; regs::DMEM_PORTS],
            app_version,
            abi: select_abi(app_version).ok(),
            clock_us: 0,
            busy_refs: 0,
            next_token: 1,
            tokens: Vec::new(),
            surfaces: BTreeMap::new(),
            next_va: SURFACE_VA_BASE,
            events: Vec::new(),
            paused: false,
            drop_responses: false,
            reject_next: false,
            fail_buffer: None,
            seen: BTreeMap::new(),
            elpg_cmds: Vec::new(),
            pg_cmds: Vec::new(),
            zbc_masks: Vec::new(),
            zbc_ids: Vec::new(),
            ap_cmds: Vec::new(),
            perfmon_starts: Vec::new(),
        }
    }

    // -- Register File

    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(offset / 4).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, offset: usize, value: u32) {
        match self.regs.get_mut(offset / 4) {
            Some(slot) => *slot = value,
            None => warn!("sim: write to unmapped register {offset:#x}"),
        }
    }

    fn read(&mut self, offset: usize) -> u32 {
        if offset == regs::MUTEX_ID {
            return u32::from(self.issue_token());
        }
        match target(offset) {
            Target::Dmemc(port) => self.dmemc[port],
            Target::Dmemd(port) => self.dmemd(port, None),
            _ => self.reg(offset),
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            regs::IRQSSET => self.set_reg(regs::IRQSTAT, self.reg(regs::IRQSTAT) | value),
            regs::IRQSCLR => self.set_reg(regs::IRQSTAT, self.reg(regs::IRQSTAT) & !value),
            regs::IRQMSET => self.set_reg(regs::IRQMASK, self.reg(regs::IRQMASK) | value),
            regs::IRQMCLR => self.set_reg(regs::IRQMASK, self.reg(regs::IRQMASK) & !value),
            regs::MUTEX_ID_RELEASE => {
                let token = regs::mutex_value(value);
                self.tokens.retain(|&t| t != token);
            }
            _ => match target(offset) {
                Target::Dmemc(port) => self.dmemc[port] = value,
                Target::Dmemd(port) => {
                    self.dmemd(port, Some(value));
                }
                Target::Mutex(index) => {
                    let current = self.reg(regs::mutex(index));
                    if current == 0 || value == 0 {
                        self.set_reg(regs::mutex(index), regs::mutex_value(value).into());
                    }
                }
                Target::IdleCount => {
                    let count: InMemoryRegister<u32, IDLE_COUNT::Register> =
                        InMemoryRegister::new(value);
                    let value = if count.is_set(IDLE_COUNT::RESET) { 0 } else { value };
                    self.set_reg(offset, value);
                }
                Target::CommandHead => {
                    self.set_reg(offset, value);
                    if !self.paused {
                        self.run_firmware();
                    }
                }
                Target::Plain => self.set_reg(offset, value),
            },
        }
    }

    /// Access the DMEM word `port` points at, auto-incrementing as configured.
    fn dmemd(&mut self, port: usize, write: Option<u32>) -> u32 {
        let ctrl: InMemoryRegister<u32, DMEMC::Register> = InMemoryRegister::new(self.dmemc[port]);
        let addr = regs::dmemc_address(ctrl.get());

        let (word, step) = match write {
            Some(value) => {
                self.write_dmem_at(addr, &value.to_le_bytes());
                (value, ctrl.is_set(DMEMC::AINCW))
            }
            None => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.dmem_bytes(addr, 4)[..4]);
                (u32::from_le_bytes(raw), ctrl.is_set(DMEMC::AINCR))
            }
        };
        if step {
            let next = (addr + 4) & regs::DMEMC_ADDRESS_MASK;
            self.dmemc[port] = (ctrl.get() & !regs::DMEMC_ADDRESS_MASK) | next;
        }
        word
    }

    // -- Memory

    /// `len` bytes at `offset`, zero-padded past the end of DMEM.
    fn dmem_bytes(&self, offset: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let start = (offset as usize).min(DMEM_SIZE);
        let end = (start + len).min(DMEM_SIZE);
        out[..end - start].copy_from_slice(&self.dmem[start..end]);
        out
    }

    fn write_dmem_at(&mut self, offset: u32, data: &[u8]) {
        let start = (offset as usize).min(DMEM_SIZE);
        let end = (start + data.len()).min(DMEM_SIZE);
        if end - start < data.len() {
            warn!("sim: dmem write at {offset:#x} truncated");
        }
        self.dmem[start..end].copy_from_slice(&data[..end - start]);
    }

    fn surface_mut(&mut self, gpu_va: u64) -> Option<&mut Vec<u8>> {
        let buf = self.surfaces.get_mut(&gpu_va);
        if buf.is_none() {
            warn!("sim: no surface at {gpu_va:#x}");
        }
        buf
    }

    // -- Mutex Tokens

    fn issue_token(&mut self) -> u8 {
        let not_available = regs::MUTEX::VALUE::NotAvailable.value as u8;
        for _ in 0..u8::MAX {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            let held = (0..crate::config::MUTEX_COUNT)
                .any(|i| self.reg(regs::mutex(i)) == u32::from(token));
            if token == 0 || token == not_available || held || self.tokens.contains(&token) {
                continue;
            }
            self.tokens.push(token);
            return token;
        }
        not_available
    }

    // -- Message Queue

    fn publish(&mut self, hdr: PmuHdr, body: &[u8]) {
        let ring = RingCursor::new(MSGQ_OFFSET, MSGQ_SIZE);
        let mut head = self.reg(regs::MSGQ_HEAD);
        let tail = self.reg(regs::MSGQ_TAIL);

        match ring.room(head, tail, u32::from(hdr.size), HDR_SIZE as u32) {
            Room::Full => {
                warn!("sim: message queue full, dropping unit {:#x}", hdr.unit_id);
                return;
            }
            Room::AfterRewind => {
                self.write_dmem_at(head, PmuHdr::rewind().as_bytes());
                head = ring.offset();
            }
            Room::Fits => {}
        }
        self.write_dmem_at(head, hdr.as_bytes());
        self.write_dmem_at(head + HDR_SIZE as u32, body);
        self.set_reg(regs::MSGQ_HEAD, RingCursor::advance(head, u32::from(hdr.size)));
        self.set_reg(regs::IRQSTAT, self.reg(regs::IRQSTAT) | regs::swgen0());
        trace!(
            "sim: published unit {:#x} seq {} at {head:#x}",
            hdr.unit_id, hdr.seq_id
        );
    }

    fn send(&mut self, unit_id: u8, flags: u8, seq_id: u8, body: &[u8]) {
        let Some(mut hdr) = PmuHdr::for_body(unit_id, body.len()) else {
            warn!("sim: {} byte body does not fit a frame", body.len());
            return;
        };
        hdr.ctrl_flags = flags;
        hdr.seq_id = seq_id;
        self.publish(hdr, body);
    }

    fn respond(&mut self, unit_id: u8, seq_id: u8, body: &[u8]) {
        if self.drop_responses {
            debug!("sim: dropping response for unit {unit_id:#x} seq {seq_id}");
            return;
        }
        self.send(unit_id, ctrl_flags::STATUS, seq_id, body);
    }

    fn raise_event(&mut self, unit_id: u8, body: &[u8]) {
        self.send(unit_id, ctrl_flags::EVENT, 0, body);
    }

    // -- Firmware Model

    fn boot(&mut self) {
        for (index, offset) in [(HPQ_INDEX, HPQ_OFFSET), (LPQ_INDEX, LPQ_OFFSET)] {
            self.set_reg(regs::queue_head(usize::from(index)), offset);
            self.set_reg(regs::queue_tail(usize::from(index)), offset);
        }
        self.set_reg(regs::MSGQ_HEAD, MSGQ_OFFSET);
        self.set_reg(regs::MSGQ_TAIL, MSGQ_OFFSET);

        let mut gid = Vec::with_capacity(4 + SHA1_GID_SIZE);
        gid.extend_from_slice(&SHA1_GID_SIGNATURE.to_le_bytes());
        gid.extend((0..SHA1_GID_SIZE as u8).map(|i| 0xa0 | i));
        self.write_dmem_at(SW_AREA_OFFSET, &gid);

        let body = self.init_body();
        debug!("sim: boot, version {}, init message {} bytes", self.app_version, body.len());
        self.send(unit::INIT, ctrl_flags::STATUS, 0, &body);
    }

    fn init_body(&self) -> Vec<u8> {
        let mut table = [QueueInfoRaw::default(); QUEUE_COUNT];
        table[queue_id::HPQ] = QueueInfoRaw {
            size: CMDQ_SIZE as u16,
            offset: HPQ_OFFSET as u16,
            index: HPQ_INDEX,
            pad: 0,
        };
        table[queue_id::LPQ] = QueueInfoRaw {
            size: CMDQ_SIZE as u16,
            offset: LPQ_OFFSET as u16,
            index: LPQ_INDEX,
            pad: 0,
        };
        table[queue_id::MESSAGE] = QueueInfoRaw {
            size: MSGQ_SIZE as u16,
            offset: MSGQ_OFFSET as u16,
            index: 0,
            pad: 0,
        };

        match self.abi.map(|abi| abi.version()) {
            Some(AbiVersion::V3) => InitMsgV3 {
                msg_type: MSG_TYPE_PMU_INIT,
                queue_index: [HPQ_INDEX, LPQ_INDEX, 0],
                queue_size: [CMDQ_SIZE as u16, CMDQ_SIZE as u16, MSGQ_SIZE as u16],
                queue_offset: HPQ_OFFSET as u16,
                sw_managed_area_offset: SW_AREA_OFFSET as u16,
                sw_managed_area_size: SW_AREA_SIZE as u16,
                os_debug_entry_point: OS_DEBUG_ENTRY_POINT,
                dummy: [0; 18],
            }
            .as_bytes()
            .to_vec(),
            Some(AbiVersion::V1) => InitMsgV1 {
                msg_type: MSG_TYPE_PMU_INIT,
                pad: 0,
                os_debug_entry_point: OS_DEBUG_ENTRY_POINT,
                queue_info: table,
                sw_managed_area_offset: SW_AREA_OFFSET as u16,
                sw_managed_area_size: SW_AREA_SIZE as u16,
            }
            .as_bytes()
            .to_vec(),
            Some(AbiVersion::V0) | None => InitMsgV0 {
                msg_type: MSG_TYPE_PMU_INIT,
                pad: 0,
                queue_info: table,
                sw_managed_area_offset: SW_AREA_OFFSET as u16,
                sw_managed_area_size: SW_AREA_SIZE as u16,
            }
            .as_bytes()
            .to_vec(),
        }
    }

    fn run_firmware(&mut self) {
        self.drain_command_queue(HPQ_INDEX, RingCursor::new(HPQ_OFFSET, CMDQ_SIZE));
        self.drain_command_queue(LPQ_INDEX, RingCursor::new(LPQ_OFFSET, CMDQ_SIZE));
    }

    fn drain_command_queue(&mut self, index: u8, ring: RingCursor) {
        let head_reg = regs::queue_head(usize::from(index));
        let tail_reg = regs::queue_tail(usize::from(index));

        for _ in 0..MAX_FRAMES_PER_KICK {
            let head = self.reg(head_reg);
            let tail = self.reg(tail_reg);
            if head == tail {
                return;
            }
            let raw = self.dmem_bytes(tail, HDR_SIZE);
            let Ok((hdr, _)) = PmuHdr::read_from_prefix(&raw[..]) else {
                return;
            };
            if hdr.unit_id == unit::REWIND {
                self.set_reg(tail_reg, ring.offset());
                continue;
            }
            let Some(len) = hdr.body_len() else {
                warn!("sim: bad command frame at {tail:#x}, size {}", hdr.size);
                return;
            };
            let body = self.dmem_bytes(tail + HDR_SIZE as u32, len);
            self.set_reg(tail_reg, RingCursor::advance(tail, u32::from(hdr.size)));
            self.handle_command(hdr, &body);
        }
        warn!("sim: queue {index} still busy after {MAX_FRAMES_PER_KICK} frames");
    }

    fn handle_command(&mut self, hdr: PmuHdr, body: &[u8]) {
        *self.seen.entry(hdr.unit_id).or_default() += 1;
        trace!("sim: cmd unit {:#x} seq {} size {}", hdr.unit_id, hdr.seq_id, hdr.size);

        if self.reject_next {
            self.reject_next = false;
            let rc = RcUnhandledCmd {
                msg_type: rc::MSG_TYPE_UNHANDLED_CMD,
                unit_id: hdr.unit_id,
            };
            self.respond(unit::RC, hdr.seq_id, rc.as_bytes());
            return;
        }

        match hdr.unit_id {
            unit::PG => self.pg_command(hdr.seq_id, body),
            unit::PERFMON | unit::PERFMON_T18X => {
                self.perfmon_command(hdr.unit_id, hdr.seq_id, body);
            }
            ECHO_UNIT => self.echo_command(hdr.seq_id, body),
            other => self.respond(other, hdr.seq_id, body),
        }
    }

    fn pg_command(&mut self, seq_id: u8, body: &[u8]) {
        let Some(&cmd_type) = body.first() else {
            return;
        };
        self.pg_cmds.push(cmd_type);
        let zbc_id = self.abi.map(|abi| abi.zbc_table_update_id());

        match cmd_type {
            cmd_id::ELPG_CMD => {
                let Ok((cmd, _)) = ElpgCmd::read_from_prefix(body) else {
                    return;
                };
                self.elpg_cmds.push((cmd.engine_id, cmd.cmd));
                let ack = match cmd.cmd {
                    elpg_cmd::INIT => elpg_msg::INIT_ACK,
                    elpg_cmd::DISALLOW => elpg_msg::DISALLOW_ACK,
                    elpg_cmd::ALLOW => elpg_msg::ALLOW_ACK,
                    other => {
                        warn!("sim: unknown ELPG cmd {other}");
                        return;
                    }
                };
                let msg = ElpgMsg {
                    msg_type: msg_id::ELPG_MSG,
                    engine_id: cmd.engine_id,
                    msg: ack,
                };
                self.respond(unit::PG, seq_id, msg.as_bytes());
            }
            cmd_id::PG_STAT => {
                let Ok((cmd, _)) = PgStatCmd::read_from_prefix(body) else {
                    return;
                };
                if cmd.sub_cmd_id != pg_stat::CMD_ALLOC_DMEM {
                    return;
                }
                let offset = PG_STATS_BASE + u32::from(cmd.engine_id) * PG_STATS_STRIDE;
                let stats = stats_pattern(cmd.engine_id);
                self.write_dmem_at(offset, stats.as_bytes());
                let msg = PgStatMsg {
                    msg_type: msg_id::STAT,
                    engine_id: cmd.engine_id,
                    sub_msg_id: pg_stat::MSG_RESP_DMEM_OFFSET,
                    data: offset,
                };
                self.respond(unit::PG, seq_id, msg.as_bytes());
            }
            cmd_id::ENG_BUF_LOAD => {
                let engine_id = body.get(1).copied().unwrap_or_default();
                let buf_idx = body.get(2).copied().unwrap_or_default();
                let status = if self.fail_buffer == Some(buf_idx) {
                    eng_buf::STATUS_FAILED
                } else {
                    eng_buf::STATUS_LOADED
                };
                let msg = EngBufStat {
                    msg_type: msg_id::ENG_BUF_STAT,
                    engine_id,
                    buf_idx,
                    status,
                };
                self.respond(unit::PG, seq_id, msg.as_bytes());
            }
            cmd_id::AP => {
                let id = body.get(1).copied().unwrap_or_default();
                let ctrl_id = body.get(2).copied().unwrap_or_default();
                self.ap_cmds.push((id, ctrl_id));
                let msg = ApMsg {
                    msg_type: msg_id::AP,
                    msg_id: ap_msg::INIT_ACK,
                    ctrl_id,
                    pad: 0,
                };
                self.respond(unit::PG, seq_id, msg.as_bytes());
            }
            id if Some(id) == zbc_id => {
                if let Ok((cmd, _)) = ZbcCmd::read_from_prefix(body) {
                    self.zbc_masks.push(cmd.entry_mask);
                    self.zbc_ids.push(id);
                }
                self.respond(unit::PG, seq_id, body);
            }
            other => {
                debug!("sim: PG cmd {other} acknowledged without action");
                self.respond(unit::PG, seq_id, body);
            }
        }
    }

    fn perfmon_command(&mut self, unit_id: u8, seq_id: u8, body: &[u8]) {
        let msg = |msg_type: u8, state_id: u8| PerfmonMsg {
            msg_type,
            state_id,
            group_id: perfmon::DOMAIN_GROUP_PSTATE,
            data: 0,
        };
        match body.first().copied() {
            Some(perfmon::cmd_id::INIT) => {
                self.respond(unit_id, seq_id, msg(perfmon::msg_id::ACK, 0).as_bytes());
                self.raise_event(unit_id, msg(perfmon::msg_id::INIT_EVENT, 0).as_bytes());
            }
            Some(perfmon::cmd_id::START) => {
                let state_id = body.get(2).copied().unwrap_or_default();
                self.perfmon_starts.push(state_id);
                self.respond(unit_id, seq_id, msg(perfmon::msg_id::ACK, state_id).as_bytes());
            }
            _ => self.respond(unit_id, seq_id, msg(perfmon::msg_id::ACK, 0).as_bytes()),
        }
    }

    /// Echo the body; when it carries two descriptors, copy the input
    /// payload to the output location first.
    fn echo_command(&mut self, seq_id: u8, body: &[u8]) {
        if let Some(abi) = self.abi {
            let size = abi.alloc_size();
            if body.len() >= 4 + 2 * size
                && let (Ok(input), Ok(output)) =
                    (abi.decode_alloc(&body[4..]), abi.decode_alloc(&body[4 + size..]))
            {
                self.echo_payload(&input, &output);
            }
        }
        self.respond(ECHO_UNIT, seq_id, body);
    }

    fn echo_payload(&mut self, input: &PayloadAlloc, output: &PayloadAlloc) {
        if input.dmem_size == 0 || output.dmem_size == 0 {
            return;
        }
        let len = usize::from(input.dmem_size.min(output.dmem_size));
        let data: Vec<u8> = match input.fb {
            Some(fb) => match self.surface_mut(fb.gpu_va()) {
                Some(buf) => buf.iter().copied().chain(core::iter::repeat(0)).take(len).collect(),
                None => return,
            },
            None => self.dmem_bytes(input.dmem_offset, len),
        };
        match output.fb {
            Some(fb) => {
                if let Some(buf) = self.surface_mut(fb.gpu_va()) {
                    let n = len.min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                }
            }
            None => self.write_dmem_at(output.dmem_offset, &data),
        }
    }
}

/// Distinct non-zero residency counters per engine.
fn stats_pattern(engine_id: u8) -> PgStats {
    let k = u32::from(engine_id) + 1;
    PgStats {
        entry_start_timestamp: 1_000,
        ingating_start_timestamp: 1_020,
        exit_start_timestamp: 9_000,
        ungating_start_timestamp: 9_030,
        avg_entry_time_us: 20 * k,
        ingating_cnt: 5 * k,
        ingating_time_us: 4_000 * k,
        avg_exit_time_us: 30 * k,
        ungating_count: 5 * k,
        ungating_time_us: 1_500 * k,
        gating_cnt: 7 * k,
        gating_deny_cnt: k,
    }
}

/// A falcon with DMEM, registers and a scripted firmware, all in memory.
pub struct SimFalcon {
    state: Mutex<SimState>,
}

impl SimFalcon {
    /// A falcon that will boot the GM20B firmware.
    #[must_use]
    pub fn new() -> Self {
        Self::with_version(app_version::GM20B)
    }

    /// A falcon whose firmware reports `app_version`.
    #[must_use]
    pub fn with_version(app_version: u32) -> Self {
        Self {
            state: Mutex::new(SimState::new(app_version)),
        }
    }

    /// Start the firmware: reset the queue cursors and post the init message.
    pub fn boot(&self) {
        self.state.lock().boot();
    }

    // -- Backdoors

    #[must_use]
    pub fn dmem(&self, offset: u32, len: usize) -> Vec<u8> {
        self.state.lock().dmem_bytes(offset, len)
    }

    pub fn write_dmem(&self, offset: u32, data: &[u8]) {
        self.state.lock().write_dmem_at(offset, data);
    }

    /// Register value without access side effects.
    #[must_use]
    pub fn read_reg(&self, offset: usize) -> u32 {
        self.state.lock().reg(offset)
    }

    /// Store a register value without access side effects.
    pub fn write_reg(&self, offset: usize, value: u32) {
        self.state.lock().set_reg(offset, value);
    }

    #[must_use]
    pub fn mutex_value(&self, index: usize) -> u8 {
        regs::mutex_value(self.state.lock().reg(regs::mutex(index)))
    }

    /// Tokens handed out and not yet returned.
    #[must_use]
    pub fn tokens_outstanding(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Have the firmware own mutex `index` with `value`.
    pub fn hold_mutex(&self, index: usize, value: u8) {
        self.state.lock().set_reg(regs::mutex(index), u32::from(value));
    }

    #[must_use]
    pub fn queue_head(&self, id: QueueId) -> u32 {
        let state = self.state.lock();
        match id {
            QueueId::Hpq => state.reg(regs::queue_head(usize::from(HPQ_INDEX))),
            QueueId::Lpq => state.reg(regs::queue_head(usize::from(LPQ_INDEX))),
            QueueId::Message => state.reg(regs::MSGQ_HEAD),
        }
    }

    /// Move both cursors of a queue to `pos`, as if everything before it
    /// had been produced and consumed.
    pub fn set_command_cursors(&self, id: QueueId, pos: u32) {
        let mut state = self.state.lock();
        let (head, tail) = match id {
            QueueId::Hpq => (
                regs::queue_head(usize::from(HPQ_INDEX)),
                regs::queue_tail(usize::from(HPQ_INDEX)),
            ),
            QueueId::Lpq => (
                regs::queue_head(usize::from(LPQ_INDEX)),
                regs::queue_tail(usize::from(LPQ_INDEX)),
            ),
            QueueId::Message => (regs::MSGQ_HEAD, regs::MSGQ_TAIL),
        };
        state.set_reg(head, pos);
        state.set_reg(tail, pos);
    }

    pub fn set_message_cursors(&self, pos: u32) {
        self.set_command_cursors(QueueId::Message, pos);
    }

    #[must_use]
    pub fn msgq_tail(&self) -> u32 {
        self.state.lock().reg(regs::MSGQ_TAIL)
    }

    // -- Firmware Control

    /// Stop consuming command queues until unpaused and kicked.
    pub fn set_firmware_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// Consume whatever is queued.
    pub fn kick_firmware(&self) {
        self.state.lock().run_firmware();
    }

    /// Consume commands without answering them.
    pub fn set_drop_responses(&self, drop: bool) {
        self.state.lock().drop_responses = drop;
    }

    /// Answer the next command with an RC unhandled notification.
    pub fn reject_next(&self) {
        self.state.lock().reject_next = true;
    }

    /// Report engine buffer `buf_idx` as failed to load.
    pub fn fail_buffer_load(&self, buf_idx: u8) {
        self.state.lock().fail_buffer = Some(buf_idx);
    }

    // -- Injection

    /// Publish a message as the firmware would.
    pub fn inject_message(&self, unit_id: u8, flags: u8, seq_id: u8, body: &[u8]) {
        self.state.lock().send(unit_id, flags, seq_id, body);
    }

    /// Append raw bytes to the message queue without a header.
    pub fn inject_raw_message(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        let head = state.reg(regs::MSGQ_HEAD);
        state.write_dmem_at(head, bytes);
        state.set_reg(regs::MSGQ_HEAD, head + align_up(bytes.len() as u32, 4));
    }

    /// Publish `hdr` and `body` exactly as given.
    pub fn inject_raw_frame(&self, hdr: PmuHdr, body: &[u8]) {
        let mut state = self.state.lock();
        let head = state.reg(regs::MSGQ_HEAD);
        state.write_dmem_at(head, hdr.as_bytes());
        state.write_dmem_at(head + HDR_SIZE as u32, body);
        let len = align_up((HDR_SIZE + body.len()) as u32, 4);
        state.set_reg(regs::MSGQ_HEAD, head + len);
        let pending = state.reg(regs::IRQSTAT) | regs::swgen0();
        state.set_reg(regs::IRQSTAT, pending);
    }

    pub fn raise_irq(&self, bits: u32) {
        let mut state = self.state.lock();
        let pending = state.reg(regs::IRQSTAT) | bits;
        state.set_reg(regs::IRQSTAT, pending);
    }

    // -- Observations

    #[must_use]
    pub fn events(&self) -> Vec<PmuEvent> {
        self.state.lock().events.clone()
    }

    #[must_use]
    pub fn surfaces_live(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    /// Power references currently held.
    #[must_use]
    pub fn busy_refs(&self) -> i64 {
        self.state.lock().busy_refs
    }

    /// Commands consumed for `unit_id`.
    #[must_use]
    pub fn commands_seen(&self, unit_id: u8) -> usize {
        self.state.lock().seen.get(&unit_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn elpg_commands(&self, engine_id: u8, cmd: u16) -> usize {
        self.state
            .lock()
            .elpg_cmds
            .iter()
            .filter(|&&seen| seen == (engine_id, cmd))
            .count()
    }

    /// PG unit commands seen with sub-command `cmd_type`.
    #[must_use]
    pub fn pg_commands(&self, cmd_type: u8) -> usize {
        self.state
            .lock()
            .pg_cmds
            .iter()
            .filter(|&&seen| seen == cmd_type)
            .count()
    }

    /// Statistics block the firmware keeps for `engine_id`.
    #[must_use]
    pub fn pg_stats(&self, engine_id: u8) -> PgStats {
        let offset = PG_STATS_BASE + u32::from(engine_id) * PG_STATS_STRIDE;
        let raw = self.dmem(offset, size_of::<PgStats>());
        PgStats::read_from_bytes(&raw[..]).unwrap_or_default()
    }

    #[must_use]
    pub fn zbc_masks(&self) -> Vec<u16> {
        self.state.lock().zbc_masks.clone()
    }

    #[must_use]
    pub fn zbc_command_ids(&self) -> Vec<u8> {
        self.state.lock().zbc_ids.clone()
    }

    /// `(cmd_id, ctrl_id)` of every adaptive power command.
    #[must_use]
    pub fn ap_commands(&self) -> Vec<(u8, u8)> {
        self.state.lock().ap_cmds.clone()
    }

    /// State id of every perfmon START.
    #[must_use]
    pub fn perfmon_starts(&self) -> Vec<u8> {
        self.state.lock().perfmon_starts.clone()
    }
}

impl Default for SimFalcon {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for SimFalcon {
    fn read32(&self, offset: usize) -> u32 {
        self.state.lock().read(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.state.lock().write(offset, value);
    }
}

impl Platform for SimFalcon {
    fn now_us(&self) -> u64 {
        self.state.lock().clock_us
    }

    fn sleep_us(&self, min_us: u64, _max_us: u64) {
        self.state.lock().clock_us += min_us.max(1);
    }

    fn busy(&self) -> Result<(), PmuError> {
        self.state.lock().busy_refs += 1;
        Ok(())
    }

    fn idle(&self) {
        self.state.lock().busy_refs -= 1;
    }

    fn alloc_surface(&self, size: u32) -> Result<Surface, PmuError> {
        if size == 0 {
            return Err(PmuError::SurfaceAlloc);
        }
        let mut state = self.state.lock();
        let gpu_va = state.next_va;
        state.next_va += u64::from(align_up(size, SURFACE_ALIGN));
        state.surfaces.insert(gpu_va, vec![0; size as usize]);
        Ok(Surface {
            gpu_va,
            size,
            handle: gpu_va,
        })
    }

    fn write_surface(&self, surface: &Surface, offset: u32, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(buf) = state.surface_mut(surface.gpu_va) {
            let start = (offset as usize).min(buf.len());
            let n = data.len().min(buf.len() - start);
            buf[start..start + n].copy_from_slice(&data[..n]);
        }
    }

    fn read_surface(&self, surface: &Surface, offset: u32, out: &mut [u8]) {
        let mut state = self.state.lock();
        if let Some(buf) = state.surface_mut(surface.gpu_va) {
            let start = (offset as usize).min(buf.len());
            let n = out.len().min(buf.len() - start);
            out[..n].copy_from_slice(&buf[start..start + n]);
        }
    }

    fn free_surface(&self, surface: Surface) {
        if self.state.lock().surfaces.remove(&surface.gpu_va).is_none() {
            warn!("sim: free of unknown surface {:#x}", surface.gpu_va);
        }
    }

    fn firmware_info(&self) -> Result<FirmwareInfo, PmuError> {
        Ok(FirmwareInfo {
            app_version: self.state.lock().app_version,
            pg_buf: PG_BUF,
            zbc_buf: ZBC_BUF,
        })
    }

    fn notify(&self, event: PmuEvent) {
        self.state.lock().events.push(event);
    }
}

// -- Driving Helpers

/// Service interrupts and deferred work until the falcon goes quiet.
pub fn pump(ctx: &PmuContext<SimFalcon>) {
    for _ in 0..MAX_FRAMES_PER_KICK {
        if !ctx.irq_pending() && !ctx.pg_work.load(core::sync::atomic::Ordering::Acquire) {
            return;
        }
        ctx.service_interrupt();
    }
}

/// Descriptor offsets in an [`echo_body`]: input, then output.
#[must_use]
pub fn echo_offsets(ctx: &PmuContext<SimFalcon>) -> (usize, usize) {
    let size = ctx.abi().map_or(0, |abi| abi.alloc_size());
    (4, 4 + size)
}

/// An echo command body with room for an input and an output descriptor.
#[must_use]
pub fn echo_body(ctx: &PmuContext<SimFalcon>) -> Vec<u8> {
    let (_, out_at) = echo_offsets(ctx);
    vec![0; out_at + (out_at - 4)]
}

#[cfg(test)]
pub(crate) fn booted(sim: SimFalcon) -> PmuContext<SimFalcon> {
    booted_with(sim, PmuConfig::new())
}

#[cfg(test)]
pub(crate) fn booted_with(sim: SimFalcon, config: PmuConfig) -> PmuContext<SimFalcon> {
    let ctx = PmuContext::new(sim, config);
    ctx.bring_up().expect("sim bring-up");
    ctx.platform().boot();
    pump(&ctx);
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_generator_skips_held_values() {
        let sim = SimFalcon::new();
        sim.hold_mutex(3, 1);
        let token = regs::mutex_value(sim.read32(regs::MUTEX_ID));
        assert_eq!(token, 2);
        assert_eq!(sim.tokens_outstanding(), 1);

        sim.write32(regs::MUTEX_ID_RELEASE, u32::from(token));
        assert_eq!(sim.tokens_outstanding(), 0);
    }

    #[test]
    fn test_mutex_only_changes_hands_through_zero() {
        let sim = SimFalcon::new();
        sim.write32(regs::mutex(5), 0x11);
        sim.write32(regs::mutex(5), 0x22);
        assert_eq!(sim.mutex_value(5), 0x11);
        sim.write32(regs::mutex(5), 0);
        sim.write32(regs::mutex(5), 0x22);
        assert_eq!(sim.mutex_value(5), 0x22);
    }

    #[test]
    fn test_dmem_port_auto_increments() {
        let sim = SimFalcon::new();
        sim.write32(regs::dmemc(1), regs::dmemc_value(0x40, false));
        sim.write32(regs::dmemd(1), 0x0403_0201);
        sim.write32(regs::dmemd(1), 0x0807_0605);
        assert_eq!(regs::dmemc_address(sim.read32(regs::dmemc(1))), 0x48);
        assert_eq!(sim.dmem(0x40, 8), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_boot_posts_init_message() {
        let sim = SimFalcon::new();
        sim.boot();
        assert_eq!(sim.read_reg(regs::IRQSTAT) & regs::swgen0(), regs::swgen0());
        let hdr = sim.dmem(MSGQ_OFFSET, HDR_SIZE);
        assert_eq!(hdr[0], unit::INIT);
        assert_eq!(
            sim.queue_head(QueueId::Message),
            MSGQ_OFFSET + align_up(u32::from(hdr[1]), 4)
        );
        assert_eq!(sim.dmem(SW_AREA_OFFSET, 4), SHA1_GID_SIGNATURE.to_le_bytes());
    }

    #[test]
    fn test_idle_count_reset_bit_clears() {
        let sim = SimFalcon::new();
        sim.write_reg(regs::idle_count(4), 99);
        sim.write32(regs::idle_count(4), 1 << 31);
        assert_eq!(sim.read_reg(regs::idle_count(4)), 0);
    }
}
