//! Engine-level power gating
//!
//! Each gateable engine has a small state machine driven by ELPG ALLOW and
//! DISALLOW commands:
//!
//! ```text
//! Off --enable--> OnPending --ALLOW ack--> On
//! On  --disable-> OffPending --DISALLOW ack--> Off
//! ```
//!
//! Enables are fire-and-forget. Disables block until the firmware confirms,
//! first waiting out a pending enable, so a caller that disabled gating can
//! touch the engine straight away. Both are reference counted per engine and
//! only the first enable and the last disable reach the firmware.

use alloc::boxed::Box;
use core::sync::atomic::Ordering;

use log::{debug, error, warn};
use pmu_proto::pg::{ElpgCmd, ElpgMsg, PgStats, elpg_cmd, elpg_msg, engine};
use pmu_proto::unit;
use zerocopy::{FromBytes, IntoBytes};

use crate::PmuContext;
use crate::error::PmuError;
use crate::pg::PmuState;
use crate::platform::{Platform, PowerRef};
use crate::post::{Callback, Response};
use crate::queue::QueueId;

/// Gateable engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Graphics,
    /// Memory subsystem
    Ms,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Graphics, Engine::Ms];

    /// Firmware engine id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Engine::Graphics => engine::GRAPHICS,
            Engine::Ms => engine::MS,
        }
    }

    /// Index into per-engine host state.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        match self {
            Engine::Graphics => 0,
            Engine::Ms => 1,
        }
    }

    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            engine::GRAPHICS => Some(Engine::Graphics),
            engine::MS => Some(Engine::Ms),
            _ => None,
        }
    }
}

/// Host view of an engine's gating state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElpgState {
    Off = 0,
    /// DISALLOW posted
    OffPending,
    /// ALLOW posted
    OnPending,
    On,
    /// Disable requested while an enable was still in flight
    OffOnPending,
}

impl ElpgState {
    pub(crate) const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::OffPending,
            2 => Self::OnPending,
            3 => Self::On,
            4 => Self::OffOnPending,
            _ => Self::Off,
        }
    }
}

/// Gating residency counters of one engine, as kept by the firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PgStatsData {
    pub gating_cnt: u32,
    pub ingating_time_us: u32,
    pub ungating_time_us: u32,
    pub avg_entry_latency_us: u32,
    pub avg_exit_latency_us: u32,
}

impl From<&PgStats> for PgStatsData {
    fn from(stats: &PgStats) -> Self {
        Self {
            gating_cnt: stats.gating_cnt,
            ingating_time_us: stats.ingating_time_us,
            ungating_time_us: stats.ungating_time_us,
            avg_entry_latency_us: stats.avg_entry_time_us,
            avg_exit_latency_us: stats.avg_exit_time_us,
        }
    }
}

/// Graphics residency accumulated across firmware lifetimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Residency {
    pub ingating_time_us: u64,
    pub ungating_time_us: u64,
    pub gating_cnt: u64,
}

impl<P: Platform> PmuContext<P> {
    /// Engines gated with the current configuration.
    pub fn supported_engines(&self) -> impl Iterator<Item = Engine> {
        let ms = self.config.mscg_enabled;
        Engine::ALL
            .into_iter()
            .filter(move |&e| e == Engine::Graphics || ms)
    }

    #[must_use]
    pub fn engine_state(&self, engine: Engine) -> ElpgState {
        ElpgState::from_raw(self.engine_state[engine.slot()].load(Ordering::Acquire))
    }

    pub(crate) fn set_engine_state(&self, engine: Engine, state: ElpgState) {
        self.engine_state[engine.slot()].store(state as u8, Ordering::Release);
    }

    /// Outstanding enable references on `engine`.
    #[must_use]
    pub fn elpg_refcount(&self, engine: Engine) -> u32 {
        self.elpg.lock()[engine.slot()]
    }

    pub(crate) fn post_elpg(&self, engine: Engine, cmd: u16) -> Result<u32, PmuError> {
        let body = ElpgCmd::new(engine.id(), cmd);
        let on_ack: Callback<P> = Box::new(|ctx, resp| ctx.handle_elpg_msg(resp));
        self.post_command(unit::PG, body.as_bytes(), None, QueueId::Hpq, Some(on_ack))
    }

    fn handle_elpg_msg(&self, resp: &Response<'_>) {
        if !resp.is_ok() {
            error!("ELPG cmd aborted");
            return;
        }
        let msg = match resp.decode::<ElpgMsg>() {
            Ok(msg) => msg,
            Err(e) => {
                error!("bad ELPG message: {e}");
                return;
            }
        };
        let Some(engine) = Engine::from_id(msg.engine_id) else {
            error!("ELPG message for unknown engine {}", msg.engine_id);
            return;
        };

        match msg.msg {
            elpg_msg::INIT_ACK => debug!("INIT_PG is acknowledged, eng {}", msg.engine_id),
            elpg_msg::ALLOW_ACK => {
                debug!("ALLOW is acknowledged, eng {}", msg.engine_id);
                self.set_engine_state(engine, ElpgState::On);
            }
            elpg_msg::DISALLOW_ACK => {
                debug!("DISALLOW is acknowledged, eng {}", msg.engine_id);
                self.set_engine_state(engine, ElpgState::Off);
                if self.state() == PmuState::ElpgBooting {
                    self.set_state(PmuState::ElpgBooted);
                    self.schedule_pg_work();
                }
            }
            other => error!("unsupported ELPG message {other:#x}"),
        }
    }

    /// Take an enable reference on `engine`, allowing gating if it was off.
    pub fn engine_power_gate_enable(&self, engine: Engine) -> Result<(), PmuError> {
        let _power = PowerRef::acquire(&self.platform)?;
        let mut refs = self.elpg.lock();
        let count = &mut refs[engine.slot()];
        *count += 1;

        if !self.is_initialized() {
            debug!("elpg enable before bootstrap, eng {} refs {}", engine.id(), *count);
            return Ok(());
        }
        if self.engine_state(engine) != ElpgState::Off {
            return Ok(());
        }

        self.set_engine_state(engine, ElpgState::OnPending);
        debug!("cmd post ELPG ALLOW eng {}", engine.id());
        if let Err(e) = self.post_elpg(engine, elpg_cmd::ALLOW) {
            self.set_engine_state(engine, ElpgState::Off);
            *count -= 1;
            return Err(e);
        }
        Ok(())
    }

    /// Drop an enable reference on `engine`, disallowing gating and waiting
    /// for the firmware when it was the last one.
    pub fn engine_power_gate_disable(&self, engine: Engine) -> Result<(), PmuError> {
        let _power = PowerRef::acquire(&self.platform)?;
        let mut refs = self.elpg.lock();
        let count = &mut refs[engine.slot()];
        if *count == 0 {
            warn!("elpg disable with no enable outstanding, eng {}", engine.id());
            return Ok(());
        }
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }

        let timeout = self.config.gr_idle_timeout_us;
        match self.engine_state(engine) {
            ElpgState::OffOnPending => {
                self.set_engine_state(engine, ElpgState::Off);
                return Ok(());
            }
            ElpgState::OnPending => {
                let on = || self.engine_state(engine) == ElpgState::On;
                if self.wait_until(on, timeout).is_err() {
                    error!("ELPG_ALLOW_ACK failed, elpg state {:?}", self.engine_state(engine));
                    self.dump_elpg_stats(engine);
                    self.platform.dump_falcon_state();
                    return Err(PmuError::Timeout);
                }
            }
            ElpgState::On => {}
            _ => return Ok(()),
        }

        self.set_engine_state(engine, ElpgState::OffPending);
        debug!("cmd post ELPG DISALLOW eng {}", engine.id());
        if let Err(e) = self.post_elpg(engine, elpg_cmd::DISALLOW) {
            // Firmware is still gating
            self.set_engine_state(engine, ElpgState::On);
            *count += 1;
            return Err(e);
        }

        let off = || self.engine_state(engine) == ElpgState::Off;
        if self.wait_until(off, timeout).is_err() {
            error!("ELPG_DISALLOW_ACK failed");
            self.dump_elpg_stats(engine);
            self.platform.dump_falcon_state();
            return Err(PmuError::Timeout);
        }
        Ok(())
    }

    /// Enable gating on every supported engine.
    pub fn enable_elpg(&self) -> Result<(), PmuError> {
        for engine in self.supported_engines() {
            self.engine_power_gate_enable(engine)?;
        }
        Ok(())
    }

    /// Disable gating on every supported engine.
    pub fn disable_elpg(&self) -> Result<(), PmuError> {
        for engine in self.supported_engines() {
            self.engine_power_gate_disable(engine)?;
        }
        Ok(())
    }

    // -- Statistics

    fn read_pg_stats(&self, engine: Engine) -> Result<PgStats, PmuError> {
        let offset = self.stat_offset[engine.slot()].load(Ordering::Acquire);
        if offset == 0 {
            return Err(PmuError::NotReady);
        }
        let mut raw = [0u8; size_of::<PgStats>()];
        self.dmem.read(&self.platform, offset, &mut raw)?;
        PgStats::read_from_bytes(&raw[..]).map_err(|_| PmuError::Protocol)
    }

    /// Gating counters of `engine`; zeros until bootstrap has finished.
    pub fn elpg_statistics(&self, engine: Engine) -> Result<PgStatsData, PmuError> {
        if !self.is_initialized() {
            return Ok(PgStatsData::default());
        }
        let stats = self.read_pg_stats(engine)?;
        Ok(PgStatsData::from(&stats))
    }

    pub(crate) fn dump_elpg_stats(&self, engine: Engine) {
        match self.read_pg_stats(engine) {
            Ok(stats) => debug!(
                "pg stats eng {}: entry {}us/{} exit {}us/{} ingating {}us ungating {}us gating {} denied {}",
                engine.id(),
                stats.avg_entry_time_us,
                stats.ingating_cnt,
                stats.avg_exit_time_us,
                stats.ungating_count,
                stats.ingating_time_us,
                stats.ungating_time_us,
                stats.gating_cnt,
                stats.gating_deny_cnt
            ),
            Err(e) => debug!("pg stats eng {} unavailable: {}", engine.id(), e),
        }
    }

    /// Fold the current graphics counters into the running residency.
    pub(crate) fn collect_residency(&self) {
        if !self.is_initialized() {
            return;
        }
        match self.read_pg_stats(Engine::Graphics) {
            Ok(stats) => {
                let mut total = self.residency.lock();
                total.ingating_time_us += u64::from(stats.ingating_time_us);
                total.ungating_time_us += u64::from(stats.ungating_time_us);
                total.gating_cnt += u64::from(stats.gating_cnt);
            }
            Err(e) => warn!("failed to collect pg residency: {e}"),
        }
    }

    /// Graphics residency collected at previous shutdowns.
    #[must_use]
    pub fn residency(&self) -> Residency {
        *self.residency.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PmuConfig;
    use crate::mutex::MutexId;
    use crate::sim::{SimFalcon, booted, booted_with, pump};

    #[test]
    fn test_only_outer_transitions_reach_firmware() {
        let ctx = booted(SimFalcon::new());
        let sim = ctx.platform();
        // Bootstrap took the first reference
        assert_eq!(ctx.elpg_refcount(Engine::Graphics), 1);
        let allows = sim.elpg_commands(engine::GRAPHICS, elpg_cmd::ALLOW);
        let disallows = sim.elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW);

        ctx.engine_power_gate_enable(Engine::Graphics).unwrap();
        ctx.engine_power_gate_disable(Engine::Graphics).unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::On);
        assert_eq!(sim.elpg_commands(engine::GRAPHICS, elpg_cmd::ALLOW), allows);

        ctx.engine_power_gate_disable(Engine::Graphics).unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::Off);
        assert_eq!(
            sim.elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW),
            disallows + 1
        );
        assert_eq!(sim.busy_refs(), 0);
    }

    #[test]
    fn test_extra_disable_is_ignored() {
        let ctx = booted(SimFalcon::new());
        ctx.disable_elpg().unwrap();
        let disallows = ctx.platform().elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW);

        ctx.disable_elpg().unwrap();
        assert_eq!(ctx.elpg_refcount(Engine::Graphics), 0);
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::Off);
        assert_eq!(
            ctx.platform().elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW),
            disallows
        );

        // Balanced again: the next enable allows gating
        ctx.enable_elpg().unwrap();
        pump(&ctx);
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::On);
    }

    #[test]
    fn test_disable_waits_for_pending_allow() {
        let ctx = booted_with(
            SimFalcon::new(),
            PmuConfig {
                elpg_enabled: false,
                ..PmuConfig::new()
            },
        );
        ctx.platform().set_firmware_paused(true);
        ctx.engine_power_gate_enable(Engine::Graphics).unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::OnPending);

        // Firmware answers while the disable is polling
        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        ctx.engine_power_gate_disable(Engine::Graphics).unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::Off);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_disable_times_out_without_ack() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_drop_responses(true);
        assert_eq!(
            ctx.engine_power_gate_disable(Engine::Graphics),
            Err(PmuError::Timeout)
        );
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::OffPending);
        assert_eq!(ctx.platform().busy_refs(), 0);
    }

    #[test]
    fn test_disable_restores_state_when_disallow_cannot_be_posted() {
        let ctx = booted(SimFalcon::new());
        let sim = ctx.platform();
        let disallows = sim.elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW);

        // Someone else owns the high-priority queue
        sim.hold_mutex(MutexId::HPQ.index(), 0x7e);
        assert_eq!(
            ctx.engine_power_gate_disable(Engine::Graphics),
            Err(PmuError::Busy)
        );
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::On);
        assert_eq!(ctx.elpg_refcount(Engine::Graphics), 1);

        sim.hold_mutex(MutexId::HPQ.index(), 0);
        ctx.engine_power_gate_disable(Engine::Graphics).unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::Off);
        assert_eq!(
            sim.elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW),
            disallows + 1
        );

        ctx.engine_power_gate_enable(Engine::Graphics).unwrap();
        pump(&ctx);
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::On);
        assert_eq!(sim.tokens_outstanding(), 0);
        assert_eq!(sim.busy_refs(), 0);
    }

    #[test]
    fn test_statistics() {
        let ctx = PmuContext::new(SimFalcon::new(), PmuConfig::new());
        assert_eq!(
            ctx.elpg_statistics(Engine::Graphics),
            Ok(PgStatsData::default())
        );

        let ctx = booted(SimFalcon::new());
        let stats = ctx.elpg_statistics(Engine::Graphics).unwrap();
        let expected = ctx.platform().pg_stats(Engine::Graphics.id());
        assert_eq!(stats, PgStatsData::from(&expected));
        assert_ne!(stats.gating_cnt, 0);
    }

    #[test]
    fn test_engine_ids() {
        for engine in Engine::ALL {
            assert_eq!(Engine::from_id(engine.id()), Some(engine));
        }
        assert_eq!(Engine::from_id(engine::INVALID), None);
        assert_eq!(ElpgState::from_raw(ElpgState::OffOnPending as u8), ElpgState::OffOnPending);
    }
}
