//! Performance monitor
//!
//! The firmware samples idle counter 3 (graphics and copy engine busy
//! cycles) against counter 6 (every cycle), keeps a moving average in a
//! small DMEM buffer owned by the host, and raises INCREASE/DECREASE events
//! when the load crosses the configured thresholds. Counters 1 and 2 are
//! wired the same way for raw readings through [`PmuContext::load_counters`].

use alloc::vec;
use core::sync::atomic::Ordering;

use log::{debug, error, warn};
use pmu_mmio::{read_barrier, write_barrier};
use pmu_proto::perfmon::{
    DOMAIN_GROUP_PSTATE, PerfmonCounter, PerfmonInit, PerfmonMsg, PerfmonStart, PerfmonStop,
    flags, msg_id,
};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use zerocopy::{FromBytes, IntoBytes};

use crate::PmuContext;
use crate::error::PmuError;
use crate::platform::Platform;
use crate::post::Payload;
use crate::queue::QueueId;
use crate::regs::{self, IDLE_COUNT, IDLE_CTRL, IDLE_MASK};

/// Busy-cycle counter sampled by the firmware
const BUSY_COUNTER: u8 = 3;
/// Always-ticking base counter
const BASE_COUNTER: u8 = 6;
/// Raw busy / total counters exposed to the host
const RAW_BUSY_COUNTER: usize = 1;
const RAW_TOTAL_COUNTER: usize = 2;

const SAMPLE_BUFFER_SIZE: u32 = 2 * size_of::<u16>() as u32;
const SAMPLE_PERIOD_US: u32 = 16_700;
/// Periods below the lower threshold before a DECREASE event
const DECREASE_COUNT: u8 = 15;
/// Moving average window, 3 s worth of periods
const MOVING_AVG_SAMPLES: u8 = 17;
/// Thresholds in 0.01% units
const UPPER_THRESHOLD: u16 = 3000;
const LOWER_THRESHOLD: u16 = 1000;

fn busy_counter() -> PerfmonCounter {
    PerfmonCounter {
        index: BUSY_COUNTER,
        flags: 0,
        group_id: DOMAIN_GROUP_PSTATE,
        valid: true,
        upper_threshold: UPPER_THRESHOLD,
        lower_threshold: LOWER_THRESHOLD,
    }
}

impl<P: Platform> PmuContext<P> {
    fn program_idle_counter(&self, counter: usize, busy: bool) {
        let ctrl: InMemoryRegister<u32, IDLE_CTRL::Register> =
            InMemoryRegister::new(self.platform.read32(regs::idle_ctrl(counter)));
        let value = if busy {
            IDLE_CTRL::VALUE::Busy
        } else {
            IDLE_CTRL::VALUE::Always
        };
        ctrl.modify(value + IDLE_CTRL::FILTER::CLEAR);
        self.platform.write32(regs::idle_ctrl(counter), ctrl.get());
    }

    fn busy_mask() -> u32 {
        let mask: InMemoryRegister<u32, IDLE_MASK::Register> = InMemoryRegister::new(0);
        mask.write(IDLE_MASK::GR::SET + IDLE_MASK::CE_2::SET);
        mask.get()
    }

    fn counter_payload(&self, offset: usize) -> Result<Payload, PmuError> {
        let abi = self.abi()?;
        let mut counter = vec![0u8; abi.perfmon_counter_size()];
        abi.encode_perfmon_counter(&busy_counter(), &mut counter)?;
        Ok(Payload::input(counter, offset))
    }

    /// Wire the idle counters and hand the firmware its sample buffer.
    pub(crate) fn perfmon_init(&self) -> Result<(), PmuError> {
        let abi = self.abi()?;
        self.perfmon_ready.store(false, Ordering::Release);

        self.platform
            .write32(regs::idle_mask(usize::from(BUSY_COUNTER)), Self::busy_mask());
        self.program_idle_counter(usize::from(BUSY_COUNTER), true);
        self.program_idle_counter(usize::from(BASE_COUNTER), false);
        // Counters 3 and 6 belong to the firmware; mirror them on 1 and 2
        self.platform
            .write32(regs::idle_mask(RAW_BUSY_COUNTER), Self::busy_mask());
        self.program_idle_counter(RAW_BUSY_COUNTER, true);
        self.program_idle_counter(RAW_TOTAL_COUNTER, false);

        let mut sample_buffer = self.sample_buffer.load(Ordering::Acquire);
        if sample_buffer == 0 {
            sample_buffer = self.dmem_alloc.lock().alloc(SAMPLE_BUFFER_SIZE)?;
            self.sample_buffer.store(sample_buffer, Ordering::Release);
        }
        let sample_buffer = u16::try_from(sample_buffer).map_err(|_| {
            error!("perfmon sample buffer {sample_buffer:#x} out of reach");
            PmuError::OutOfDmem
        })?;

        let init = PerfmonInit {
            sample_buffer,
            to_decrease_count: DECREASE_COUNT,
            base_counter_id: BASE_COUNTER,
            sample_period_us: SAMPLE_PERIOD_US,
            num_counters: 1,
            samples_in_moving_avg: MOVING_AVG_SAMPLES,
        };
        let mut body = vec![0u8; abi.perfmon_init_size()];
        abi.encode_perfmon_init(&init, &mut body)?;
        let payload = self.counter_payload(abi.perfmon_init_alloc_offset())?;

        debug!("cmd post PERFMON INIT, sample buffer {sample_buffer:#x}");
        self.post_command(abi.perfmon_unit(), &body, Some(payload), QueueId::Lpq, None)?;
        Ok(())
    }

    fn perfmon_start_sampling(&self) -> Result<(), PmuError> {
        let abi = self.abi()?;
        let start = PerfmonStart {
            group_id: DOMAIN_GROUP_PSTATE,
            state_id: self.perfmon_state_id.load(Ordering::Acquire),
            flags: flags::ENABLE_INCREASE | flags::ENABLE_DECREASE | flags::CLEAR_PREV,
        };
        let mut body = vec![0u8; abi.perfmon_start_size()];
        abi.encode_perfmon_start(&start, &mut body)?;
        let payload = self.counter_payload(abi.perfmon_start_alloc_offset())?;

        debug!("cmd post PERFMON START");
        self.post_command(abi.perfmon_unit(), &body, Some(payload), QueueId::Lpq, None)?;
        Ok(())
    }

    fn perfmon_stop_sampling(&self) -> Result<(), PmuError> {
        let abi = self.abi()?;
        debug!("cmd post PERFMON STOP");
        self.post_command(
            abi.perfmon_unit(),
            PerfmonStop::new().as_bytes(),
            None,
            QueueId::Lpq,
            None,
        )?;
        Ok(())
    }

    /// Start or stop load sampling.
    pub fn perfmon_enable(&self, enable: bool) -> Result<(), PmuError> {
        self.perfmon_sampling.store(enable, Ordering::Release);
        if enable {
            self.perfmon_start_sampling()
        } else {
            self.perfmon_stop_sampling()
        }
    }

    pub(crate) fn handle_perfmon_event(&self, body: &[u8]) {
        let Ok((msg, _)) = PerfmonMsg::read_from_prefix(body) else {
            warn!("short perfmon event ({} bytes)", body.len());
            return;
        };

        match msg.msg_type {
            msg_id::INCREASE_EVENT | msg_id::DECREASE_EVENT => {
                let dir = if msg.msg_type == msg_id::INCREASE_EVENT {
                    "increase"
                } else {
                    "decrease"
                };
                debug!(
                    "perfmon {} event: state {} group {} load {}%",
                    dir, msg.state_id, msg.group_id, msg.data
                );
                if msg.group_id == DOMAIN_GROUP_PSTATE {
                    self.perfmon_state_id.store(msg.state_id, Ordering::Release);
                }
                self.perfmon_events.fetch_add(1, Ordering::AcqRel);
            }
            msg_id::INIT_EVENT => {
                debug!("perfmon init event");
                self.perfmon_ready.store(true, Ordering::Release);
            }
            other => {
                debug!("perfmon event {other:#x} ignored");
                return;
            }
        }

        if self.perfmon_sampling.load(Ordering::Acquire)
            && let Err(e) = self.perfmon_start_sampling()
        {
            error!("failed to restart perfmon sampling: {e}");
        }
    }

    /// Refresh the load estimate from the firmware's sample buffer.
    pub fn load_update(&self) -> Result<(), PmuError> {
        if !self.perfmon_ready() {
            self.load_shadow.store(0, Ordering::Release);
            return Ok(());
        }
        let mut raw = [0u8; size_of::<u16>()];
        self.dmem
            .read(&self.platform, self.sample_buffer.load(Ordering::Acquire), &mut raw)?;
        let load = u32::from(u16::from_le_bytes(raw));

        let shadow = load / 10;
        self.load_shadow.store(shadow, Ordering::Release);
        let avg = self.load_avg.load(Ordering::Acquire);
        self.load_avg
            .store((9 * avg + shadow) / 10, Ordering::Release);
        Ok(())
    }

    /// Last sampled load, in percent.
    #[must_use]
    pub fn load_norm(&self) -> u32 {
        self.load_shadow.load(Ordering::Acquire)
    }

    /// Smoothed load, in percent.
    #[must_use]
    pub fn load_avg(&self) -> u32 {
        self.load_avg.load(Ordering::Acquire)
    }

    /// Threshold events seen since bring-up.
    #[must_use]
    pub fn perfmon_events(&self) -> u32 {
        self.perfmon_events.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn perfmon_ready(&self) -> bool {
        self.perfmon_ready.load(Ordering::Acquire)
    }

    /// DMEM offset of the load sample, once allocated.
    #[must_use]
    pub fn sample_buffer(&self) -> Option<u32> {
        match self.sample_buffer.load(Ordering::Acquire) {
            0 => None,
            offset => Some(offset),
        }
    }

    /// Raw `(busy, total)` cycle counts.
    #[must_use]
    pub fn load_counters(&self) -> (u32, u32) {
        let read = |counter| {
            let reg: InMemoryRegister<u32, IDLE_COUNT::Register> =
                InMemoryRegister::new(self.platform.read32(regs::idle_count(counter)));
            reg.read(IDLE_COUNT::VALUE)
        };
        let busy = read(RAW_BUSY_COUNTER);
        read_barrier();
        let total = read(RAW_TOTAL_COUNTER);
        (busy, total)
    }

    /// Zero the raw counters, total first.
    pub fn reset_load_counters(&self) -> Result<(), PmuError> {
        let _power = crate::platform::PowerRef::acquire(&self.platform)?;
        let reset = IDLE_COUNT::RESET::SET.value;
        self.platform
            .write32(regs::idle_count(RAW_TOTAL_COUNTER), reset);
        write_barrier();
        self.platform
            .write32(regs::idle_count(RAW_BUSY_COUNTER), reset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PmuConfig;
    use crate::sim::{SimFalcon, booted, booted_with, pump};
    use pmu_proto::abi::app_version;
    use pmu_proto::{ctrl_flags, unit};

    fn event(msg_type: u8, state_id: u8) -> PerfmonMsg {
        PerfmonMsg {
            msg_type,
            state_id,
            group_id: DOMAIN_GROUP_PSTATE,
            data: 42,
        }
    }

    #[test]
    fn test_init_wires_counters_and_gets_ready() {
        let ctx = booted(SimFalcon::new());
        let sim = ctx.platform();
        assert!(ctx.perfmon_ready());
        assert!(ctx.sample_buffer().is_some());

        let busy = sim.read_reg(regs::idle_ctrl(3));
        assert_eq!(busy & 0x7, 2);
        assert_eq!(sim.read_reg(regs::idle_ctrl(6)) & 0x7, 3);
        assert_eq!(sim.read_reg(regs::idle_mask(1)), (1 << 0) | (1 << 21));
        assert_eq!(sim.read_reg(regs::idle_ctrl(2)) & 0x7, 3);
        // INIT, then START once the firmware reported ready
        assert_eq!(sim.commands_seen(unit::PERFMON), 2);
        assert_eq!(sim.perfmon_starts(), alloc::vec![0]);
    }

    #[test]
    fn test_no_init_without_sampling() {
        let config = PmuConfig {
            perfmon_sampling: false,
            ..PmuConfig::new()
        };
        let ctx = booted_with(SimFalcon::new(), config);
        assert!(!ctx.perfmon_ready());
        assert_eq!(ctx.sample_buffer(), None);
        assert_eq!(ctx.platform().commands_seen(unit::PERFMON), 0);
    }

    #[test]
    fn test_events_restart_sampling() {
        let ctx = booted(SimFalcon::new());
        let sim = ctx.platform();
        sim.inject_message(unit::PERFMON, ctrl_flags::EVENT, 0, event(msg_id::INCREASE_EVENT, 3).as_bytes());
        sim.inject_message(unit::PERFMON, ctrl_flags::EVENT, 0, event(msg_id::DECREASE_EVENT, 2).as_bytes());
        pump(&ctx);

        assert_eq!(ctx.perfmon_events(), 2);
        // One START per event, carrying the last state id
        assert_eq!(sim.perfmon_starts(), alloc::vec![0, 3, 2]);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_disabled_sampling_stays_stopped() {
        let ctx = booted(SimFalcon::new());
        ctx.perfmon_enable(false).unwrap();
        pump(&ctx);
        ctx.platform().inject_message(
            unit::PERFMON,
            ctrl_flags::EVENT,
            0,
            event(msg_id::INCREASE_EVENT, 1).as_bytes(),
        );
        pump(&ctx);

        assert_eq!(ctx.perfmon_events(), 1);
        assert_eq!(ctx.platform().perfmon_starts(), alloc::vec![0]);
        // INIT, START, STOP
        assert_eq!(ctx.platform().commands_seen(unit::PERFMON), 3);
    }

    #[test]
    fn test_v3_firmware_uses_its_own_unit() {
        let ctx = booted(SimFalcon::with_version(app_version::GM206));
        assert!(ctx.perfmon_ready());
        assert_eq!(ctx.platform().commands_seen(unit::PERFMON_T18X), 2);
        assert_eq!(ctx.platform().commands_seen(unit::PERFMON), 0);
    }

    #[test]
    fn test_load_update_smooths() {
        let ctx = booted(SimFalcon::new());
        let buffer = ctx.sample_buffer().unwrap();
        ctx.platform().write_dmem(buffer, &500u16.to_le_bytes());

        ctx.load_update().unwrap();
        assert_eq!(ctx.load_norm(), 50);
        assert_eq!(ctx.load_avg(), 5);
        ctx.load_update().unwrap();
        assert_eq!(ctx.load_avg(), (9 * 5 + 50) / 10);
    }

    #[test]
    fn test_load_is_zero_until_ready() {
        let config = PmuConfig {
            perfmon_sampling: false,
            ..PmuConfig::new()
        };
        let ctx = booted_with(SimFalcon::new(), config);
        ctx.load_update().unwrap();
        assert_eq!(ctx.load_norm(), 0);
    }

    #[test]
    fn test_raw_counters() {
        let ctx = booted(SimFalcon::new());
        let sim = ctx.platform();
        sim.write_reg(regs::idle_count(1), 1234);
        sim.write_reg(regs::idle_count(2), (1 << 31) | 5678);
        assert_eq!(ctx.load_counters(), (1234, 5678));

        ctx.reset_load_counters().unwrap();
        assert_eq!(ctx.load_counters(), (0, 0));
        assert_eq!(sim.busy_refs(), 0);
    }
}
