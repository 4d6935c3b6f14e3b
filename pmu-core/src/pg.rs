//! Power-gating bootstrap
//!
//! After the init message the host walks the firmware through a fixed
//! chain, one step per acknowledgement:
//!
//! ```text
//! InitReceived --ELPG INIT/PG_STAT/DISALLOW--> ElpgBooting
//! ElpgBooting  --DISALLOW ack-->               ElpgBooted
//! ElpgBooted   --load FECS buffer-->           LoadingPgBuf
//! LoadingPgBuf --buffer ack, load ZBC-->       LoadingZbc
//! LoadingZbc   --buffer ack-->                 Started
//! ```
//!
//! Acks only schedule the next step ([`PmuContext::schedule_pg_work`]); the
//! step itself runs from [`PmuContext::run_deferred_work`], outside the ISR
//! lock, so it is free to post commands.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::Ordering;

use log::{debug, error, info, warn};
use pmu_proto::pg::{
    EngBufLoad, EngBufStat, PgStatCmd, PgStatMsg, dma_idx, elpg_cmd, eng_buf, pg_stat,
};
use pmu_proto::unit;
use zerocopy::IntoBytes;

use crate::PmuContext;
use crate::config::{PG_IDLE_FILTER, PG_PPU_IDLE_FILTER};
use crate::elpg::{ElpgState, Engine};
use crate::error::PmuError;
use crate::platform::{Platform, Surface};
use crate::post::{Callback, Response};
use crate::queue::QueueId;
use crate::regs;

/// Firmware bring-up state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuState {
    Off = 0,
    /// Booted, waiting for the init message
    Starting,
    InitReceived,
    ElpgBooting,
    ElpgBooted,
    LoadingPgBuf,
    LoadingZbc,
    Started,
}

impl PmuState {
    pub(crate) const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::InitReceived,
            3 => Self::ElpgBooting,
            4 => Self::ElpgBooted,
            5 => Self::LoadingPgBuf,
            6 => Self::LoadingZbc,
            7 => Self::Started,
            _ => Self::Off,
        }
    }
}

impl<P: Platform> PmuContext<P> {
    #[must_use]
    pub fn state(&self) -> PmuState {
        PmuState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PmuState) {
        let old = PmuState::from_raw(self.state.swap(state as u8, Ordering::AcqRel));
        if old != state {
            debug!("pmu state {old:?} -> {state:?}");
        }
    }

    /// Ask for the next bootstrap step to run.
    pub(crate) fn schedule_pg_work(&self) {
        self.pg_work.store(true, Ordering::Release);
    }

    /// Run bootstrap steps scheduled by acknowledgements.
    pub fn run_deferred_work(&self) {
        while self.pg_work.swap(false, Ordering::AcqRel) {
            self.pg_setup_step();
        }
    }

    fn pg_setup_step(&self) {
        let result = match self.state() {
            PmuState::InitReceived => {
                debug!("pmu starting ELPG bootstrap");
                self.init_powergating()
            }
            PmuState::ElpgBooted => {
                debug!("elpg booted, loading FECS pg buffer");
                self.bind_fecs()
            }
            PmuState::LoadingPgBuf => {
                debug!("pg buffer loaded, loading ZBC sequence buffer");
                self.load_zbc_buf()
            }
            PmuState::LoadingZbc => {
                self.finish_bootstrap();
                Ok(())
            }
            PmuState::Started => {
                debug!("pmu already booted");
                Ok(())
            }
            other => {
                debug!("no bootstrap step in state {other:?}");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("pmu bootstrap step failed in {:?}: {}", self.state(), e);
        }
    }

    /// ELPG INIT, statistics block and an initial DISALLOW for every engine.
    fn init_powergating(&self) -> Result<(), PmuError> {
        for engine in self.supported_engines() {
            self.pg_init_send(engine)?;
        }
        if self.state() == PmuState::InitReceived {
            self.set_state(PmuState::ElpgBooting);
        }
        Ok(())
    }

    fn pg_init_send(&self, engine: Engine) -> Result<(), PmuError> {
        let slot = engine.slot();
        self.platform
            .write32(regs::pg_idle_filter(slot), PG_IDLE_FILTER);
        self.platform
            .write32(regs::pg_ppu_idle_filter(slot), PG_PPU_IDLE_FILTER);

        debug!("cmd post PG ELPG INIT eng {}", engine.id());
        self.post_elpg(engine, elpg_cmd::INIT)?;

        self.stat_offset[slot].store(0, Ordering::Release);
        let cmd = PgStatCmd {
            cmd_type: pmu_proto::pg::cmd_id::PG_STAT,
            engine_id: engine.id(),
            sub_cmd_id: pg_stat::CMD_ALLOC_DMEM,
            data: 0,
        };
        let on_stat: Callback<P> = Box::new(move |ctx, resp| ctx.handle_pg_stat_msg(engine, resp));
        debug!("cmd post PG_STAT ALLOC_DMEM eng {}", engine.id());
        self.post_command(unit::PG, cmd.as_bytes(), None, QueueId::Lpq, Some(on_stat))?;

        // The firmware boots with gating disallowed; DISALLOW is what moves
        // the chain on, so the engine is already off from the host's view.
        self.set_engine_state(engine, ElpgState::Off);
        debug!("cmd post PG ELPG DISALLOW eng {}", engine.id());
        self.post_elpg(engine, elpg_cmd::DISALLOW)?;
        Ok(())
    }

    fn handle_pg_stat_msg(&self, engine: Engine, resp: &Response<'_>) {
        if !resp.is_ok() {
            error!("PG_STAT cmd aborted");
            return;
        }
        match resp.decode::<PgStatMsg>() {
            Ok(msg) if msg.sub_msg_id == pg_stat::MSG_RESP_DMEM_OFFSET => {
                debug!("ALLOC_DMEM_OFFSET acknowledged, eng {} offset {:#x}", engine.id(), msg.data);
                self.stat_offset[engine.slot()].store(msg.data, Ordering::Release);
            }
            Ok(msg) => warn!("unexpected PG_STAT message {:#x}", msg.sub_msg_id),
            Err(e) => error!("bad PG_STAT message: {e}"),
        }
    }

    fn post_eng_buf_load(&self, buf_idx: u8, surface: &Surface) -> Result<u32, PmuError> {
        let abi = self.abi()?;
        let load = EngBufLoad {
            engine_id: Engine::Graphics.id(),
            buf_idx,
            buf_size: surface.size,
            gpu_va: surface.gpu_va,
            dma_idx: dma_idx::VIRT,
        };
        let mut body = vec![0u8; abi.eng_buf_load_size()];
        abi.encode_eng_buf_load(&load, &mut body)?;

        self.buf_loaded.store(false, Ordering::Release);
        debug!("cmd post PG ENG_BUF_LOAD idx {} va {:#x}", buf_idx, surface.gpu_va);
        let on_load: Callback<P> = Box::new(|ctx, resp| ctx.handle_buf_config_msg(resp));
        self.post_command(unit::PG, &body, None, QueueId::Lpq, Some(on_load))
    }

    fn bind_fecs(&self) -> Result<(), PmuError> {
        let fw = self.firmware()?;
        self.post_eng_buf_load(eng_buf::IDX_FECS, &fw.pg_buf)?;
        self.set_state(PmuState::LoadingPgBuf);
        Ok(())
    }

    fn load_zbc_buf(&self) -> Result<(), PmuError> {
        let fw = self.firmware()?;
        self.post_eng_buf_load(eng_buf::IDX_ZBC, &fw.zbc_buf)?;
        self.set_state(PmuState::LoadingZbc);
        Ok(())
    }

    fn handle_buf_config_msg(&self, resp: &Response<'_>) {
        if !resp.is_ok() {
            error!("PGENG cmd aborted");
            return;
        }
        let msg = match resp.decode::<EngBufStat>() {
            Ok(msg) => msg,
            Err(e) => {
                error!("bad ENG_BUF_STAT message: {e}");
                return;
            }
        };
        let loaded = msg.status == eng_buf::STATUS_LOADED;
        debug!("buffer {} load status {}", msg.buf_idx, msg.status);
        self.buf_loaded.store(loaded, Ordering::Release);

        if !loaded && self.state() == PmuState::LoadingPgBuf {
            error!("failed to load PGENG buffer");
        } else {
            self.schedule_pg_work();
        }
    }

    fn finish_bootstrap(&self) {
        self.initialized.store(true, Ordering::Release);
        self.set_state(PmuState::Started);
        self.zbc_ready.store(true, Ordering::Release);
        info!("pmu booted, power gating initialised");

        if let Err(e) = self.post_zbc_update(self.config.zbc_entries) {
            warn!("initial zbc save: {e}");
        }
        if self.config.elpg_enabled
            && let Err(e) = self.enable_elpg()
        {
            warn!("enable elpg at boot: {e}");
        }
        if self.config.aelpg_enabled {
            if let Err(e) = self.aelpg_init() {
                warn!("aelpg init: {e}");
            }
            if let Err(e) = self.aelpg_init_and_enable(pmu_proto::pg::ap_ctrl::GRAPHICS) {
                warn!("aelpg graphics ctrl: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PmuConfig;
    use crate::sim::{SimFalcon, booted, booted_with, pump};
    use pmu_proto::pg::{cmd_id, engine};

    #[test]
    fn test_bootstrap_reaches_started() {
        let ctx = booted(SimFalcon::new());
        assert_eq!(ctx.state(), PmuState::Started);
        assert!(ctx.is_initialized());
        assert!(ctx.zbc_ready());
        assert!(ctx.buf_loaded());
        // Default config enables graphics gating at the end of the chain
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::On);
        assert_ne!(ctx.stat_offset(Engine::Graphics), 0);

        let sim = ctx.platform();
        assert_eq!(sim.elpg_commands(engine::GRAPHICS, elpg_cmd::INIT), 1);
        assert_eq!(sim.elpg_commands(engine::GRAPHICS, elpg_cmd::DISALLOW), 1);
        assert_eq!(sim.elpg_commands(engine::GRAPHICS, elpg_cmd::ALLOW), 1);
        assert_eq!(sim.pg_commands(cmd_id::ENG_BUF_LOAD), 2);
        assert_eq!(sim.read_reg(regs::pg_idle_filter(0)), PG_IDLE_FILTER);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_bootstrap_includes_ms_when_configured() {
        let config = PmuConfig {
            mscg_enabled: true,
            ..PmuConfig::new()
        };
        let ctx = booted_with(SimFalcon::new(), config);
        assert_eq!(ctx.state(), PmuState::Started);
        assert_eq!(ctx.platform().elpg_commands(engine::MS, elpg_cmd::INIT), 1);
        assert_eq!(ctx.engine_state(Engine::Ms), ElpgState::On);
        assert_ne!(ctx.stat_offset(Engine::Ms), 0);
    }

    #[test]
    fn test_failed_pg_buffer_halts_chain() {
        let sim = SimFalcon::new();
        sim.fail_buffer_load(eng_buf::IDX_FECS);
        let ctx = PmuContext::new(sim, PmuConfig::new());
        ctx.bring_up().unwrap();
        ctx.platform().boot();
        pump(&ctx);

        assert_eq!(ctx.state(), PmuState::LoadingPgBuf);
        assert!(!ctx.buf_loaded());
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn test_state_round_trips_through_raw() {
        for state in [
            PmuState::Off,
            PmuState::Starting,
            PmuState::InitReceived,
            PmuState::ElpgBooting,
            PmuState::ElpgBooted,
            PmuState::LoadingPgBuf,
            PmuState::LoadingZbc,
            PmuState::Started,
        ] {
            assert_eq!(PmuState::from_raw(state as u8), state);
        }
    }
}
