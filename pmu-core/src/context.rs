//! Engine context and lifecycle

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use log::{debug, error, info, warn};
use pmu_proto::init::SHA1_GID_SIZE;
use pmu_proto::{FirmwareAbi, select_abi};
use spin::Mutex;

use crate::config::{MAX_SEQUENCES, PmuConfig};
use crate::dmem::DmemPort;
use crate::dmem_alloc::DmemAllocator;
use crate::elpg::{ElpgState, Engine, Residency};
use crate::error::PmuError;
use crate::isr::IsrState;
use crate::mutex::MutexArbiter;
use crate::pg::PmuState;
use crate::platform::{FirmwareInfo, Platform, PowerRef};
use crate::post::Callback;
use crate::queue::{PmuQueue, QueueId};
use crate::seq::SeqTable;

/// Host side of one PMU falcon.
///
/// All operations take `&self`; the context is meant to be shared between
/// the interrupt path and any number of callers.
pub struct PmuContext<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: PmuConfig,

    pub(crate) abi: Mutex<Option<&'static dyn FirmwareAbi>>,
    pub(crate) fw: Mutex<Option<FirmwareInfo>>,
    pub(crate) gid: Mutex<Option<[u8; SHA1_GID_SIZE]>>,

    // -- Protocol plumbing
    pub(crate) dmem: DmemPort,
    pub(crate) dmem_alloc: Mutex<DmemAllocator>,
    pub(crate) mutexes: MutexArbiter,
    pub(crate) queues: [PmuQueue; 3],
    pub(crate) seq: Mutex<SeqTable<Callback<P>, MAX_SEQUENCES>>,
    pub(crate) isr: Mutex<IsrState>,

    // -- Bring-up and bootstrap
    pub(crate) state: AtomicU8,
    pub(crate) pmu_ready: AtomicBool,
    pub(crate) initialized: AtomicBool,
    pub(crate) pg_work: AtomicBool,
    pub(crate) buf_loaded: AtomicBool,
    pub(crate) zbc_ready: AtomicBool,
    pub(crate) zbc_save_done: AtomicBool,

    // -- Power gating
    pub(crate) elpg: Mutex<[u32; 2]>,
    pub(crate) engine_state: [AtomicU8; 2],
    pub(crate) stat_offset: [AtomicU32; 2],
    pub(crate) residency: Mutex<Residency>,

    // -- Perfmon
    pub(crate) perfmon_ready: AtomicBool,
    pub(crate) perfmon_sampling: AtomicBool,
    pub(crate) perfmon_state_id: AtomicU8,
    pub(crate) perfmon_events: AtomicU32,
    pub(crate) sample_buffer: AtomicU32,
    pub(crate) load_shadow: AtomicU32,
    pub(crate) load_avg: AtomicU32,
}

impl<P: Platform> PmuContext<P> {
    #[must_use]
    pub fn new(platform: P, config: PmuConfig) -> Self {
        Self {
            platform,
            config,
            abi: Mutex::new(None),
            fw: Mutex::new(None),
            gid: Mutex::new(None),
            dmem: DmemPort::new(0),
            dmem_alloc: Mutex::new(DmemAllocator::empty()),
            mutexes: MutexArbiter::new(),
            queues: QueueId::ALL.map(PmuQueue::new),
            seq: Mutex::new(SeqTable::new()),
            isr: Mutex::new(IsrState::default()),
            state: AtomicU8::new(PmuState::Off as u8),
            pmu_ready: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            pg_work: AtomicBool::new(false),
            buf_loaded: AtomicBool::new(false),
            zbc_ready: AtomicBool::new(false),
            zbc_save_done: AtomicBool::new(false),
            elpg: Mutex::new([0; 2]),
            engine_state: [
                AtomicU8::new(ElpgState::Off as u8),
                AtomicU8::new(ElpgState::Off as u8),
            ],
            stat_offset: [AtomicU32::new(0), AtomicU32::new(0)],
            residency: Mutex::new(Residency::default()),
            perfmon_ready: AtomicBool::new(false),
            perfmon_sampling: AtomicBool::new(false),
            perfmon_state_id: AtomicU8::new(0),
            perfmon_events: AtomicU32::new(0),
            sample_buffer: AtomicU32::new(0),
            load_shadow: AtomicU32::new(0),
            load_avg: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PmuConfig {
        &self.config
    }

    /// Whether the init message has been processed.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.pmu_ready.load(Ordering::Acquire)
    }

    /// Whether the power-gating bootstrap has completed.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Layouts of the running firmware.
    pub fn abi(&self) -> Result<&'static dyn FirmwareAbi, PmuError> {
        (*self.abi.lock()).ok_or(PmuError::NotReady)
    }

    pub(crate) fn firmware(&self) -> Result<FirmwareInfo, PmuError> {
        (*self.fw.lock()).ok_or(PmuError::NotReady)
    }

    /// Firmware build id, if the image carries one.
    #[must_use]
    pub fn gid(&self) -> Option<[u8; SHA1_GID_SIZE]> {
        *self.gid.lock()
    }

    /// Commands posted and not yet answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.seq.lock().in_flight()
    }

    /// Free bytes in the software-managed DMEM window.
    #[must_use]
    pub fn dmem_available(&self) -> u32 {
        self.dmem_alloc.lock().available()
    }

    /// Whether the last engine buffer load succeeded.
    #[must_use]
    pub fn buf_loaded(&self) -> bool {
        self.buf_loaded.load(Ordering::Acquire)
    }

    /// DMEM offset of the firmware statistics block of `engine`.
    #[must_use]
    pub fn stat_offset(&self, engine: Engine) -> u32 {
        self.stat_offset[engine.slot()].load(Ordering::Acquire)
    }

    fn reset_state(&self) {
        self.pmu_ready.store(false, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
        self.pg_work.store(false, Ordering::Release);
        self.buf_loaded.store(false, Ordering::Release);
        self.zbc_ready.store(false, Ordering::Release);
        self.zbc_save_done.store(false, Ordering::Release);

        *self.elpg.lock() = [0; 2];
        for engine in Engine::ALL {
            self.set_engine_state(engine, ElpgState::Off);
            self.stat_offset[engine.slot()].store(0, Ordering::Release);
        }

        self.perfmon_ready.store(false, Ordering::Release);
        self.perfmon_sampling
            .store(self.config.perfmon_sampling, Ordering::Release);
        self.perfmon_state_id.store(0, Ordering::Release);
        self.perfmon_events.store(0, Ordering::Release);
        self.sample_buffer.store(0, Ordering::Release);
        self.load_shadow.store(0, Ordering::Release);
        self.load_avg.store(0, Ordering::Release);

        *self.gid.lock() = None;
        self.mutexes.reset();
        for queue in &self.queues {
            queue.unconfigure();
        }
        self.release_sequences();
        *self.dmem_alloc.lock() = DmemAllocator::empty();
    }

    fn release_sequences(&self) {
        let drained = self.seq.lock().drain();
        if !drained.is_empty() {
            debug!("releasing {} outstanding commands", drained.len());
        }
        for done in drained {
            self.free_resources(done.res);
        }
    }

    /// Prepare for a freshly booted firmware.
    ///
    /// Picks the firmware layouts, resets all protocol state and unmasks the
    /// falcon interrupts. The init message the firmware sends once running
    /// is consumed by [`PmuContext::service_interrupt`], which then drives
    /// the power-gating bootstrap.
    pub fn bring_up(&self) -> Result<(), PmuError> {
        if self.state() != PmuState::Off {
            warn!("pmu bring-up while in state {:?}", self.state());
            return Err(PmuError::Busy);
        }
        let _power = PowerRef::acquire(&self.platform)?;

        let fw = self.platform.firmware_info()?;
        let abi = select_abi(fw.app_version).inspect_err(|_| {
            error!("unsupported pmu firmware version {}", fw.app_version);
        })?;
        *self.abi.lock() = Some(abi);
        *self.fw.lock() = Some(fw);

        self.reset_state();
        self.isr.lock().enabled = true;
        self.set_state(PmuState::Starting);
        self.enable_irq(true);

        info!("pmu bring-up: firmware {} ({})", fw.app_version, abi.version());
        Ok(())
    }

    /// Stop using the firmware.
    ///
    /// Gating is disabled and graphics residency collected first. Commands
    /// still in flight are dropped without running their callbacks.
    pub fn shutdown(&self) -> Result<(), PmuError> {
        if self.state() == PmuState::Off {
            return Ok(());
        }
        let _power = PowerRef::acquire(&self.platform)?;
        self.pg_work.store(false, Ordering::Release);

        self.collect_residency();
        if self.is_initialized()
            && let Err(e) = self.disable_elpg()
        {
            warn!("disable elpg at shutdown: {e}");
        }
        self.initialized.store(false, Ordering::Release);

        self.isr.lock().enabled = false;
        self.enable_irq(false);
        self.set_state(PmuState::Off);

        self.pmu_ready.store(false, Ordering::Release);
        self.perfmon_ready.store(false, Ordering::Release);
        self.zbc_ready.store(false, Ordering::Release);

        self.release_sequences();
        for queue in &self.queues {
            queue.unconfigure();
        }
        info!("pmu shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::Payload;
    use crate::sim::{ECHO_UNIT, SimFalcon, booted, echo_body, echo_offsets, pump};
    use alloc::vec;
    use pmu_mmio::RegisterIo;
    use pmu_proto::abi::app_version;

    #[test]
    fn test_bring_up_unmasks_and_waits_for_init() {
        let ctx = PmuContext::new(SimFalcon::new(), PmuConfig::new());
        ctx.bring_up().unwrap();
        assert_eq!(ctx.state(), PmuState::Starting);
        assert!(!ctx.is_ready());
        assert_eq!(
            ctx.platform().read32(crate::regs::IRQMASK),
            crate::regs::serviced_irqs()
        );
        assert_eq!(ctx.bring_up(), Err(PmuError::Busy));

        ctx.platform().boot();
        pump(&ctx);
        assert!(ctx.is_ready());
        assert!(ctx.gid().is_some());
        assert_eq!(ctx.platform().busy_refs(), 0);
    }

    #[test]
    fn test_unknown_firmware_is_rejected() {
        let ctx = PmuContext::new(SimFalcon::with_version(1), PmuConfig::new());
        assert_eq!(
            ctx.bring_up(),
            Err(PmuError::Abi(pmu_proto::AbiError::UnsupportedVersion(1)))
        );
        assert_eq!(ctx.state(), PmuState::Off);
    }

    #[test]
    fn test_every_abi_boots() {
        for version in [app_version::GK20A_0, app_version::GM20B, app_version::GM206] {
            let ctx = booted(SimFalcon::with_version(version));
            assert_eq!(ctx.state(), PmuState::Started, "version {version}");
            assert_eq!(ctx.in_flight(), 0);
        }
    }

    #[test]
    fn test_shutdown_drops_outstanding_commands() {
        let ctx = booted(SimFalcon::with_version(app_version::GM206));
        let free = ctx.dmem_available();
        ctx.platform().set_firmware_paused(true);

        let (in_at, _) = echo_offsets(&ctx);
        let mut payload = Payload::input(vec![1; 8], in_at);
        if let Some(input) = payload.input.as_mut() {
            input.fb_size = 0x100;
        }
        ctx.post_command(ECHO_UNIT, &echo_body(&ctx), Some(payload), QueueId::Lpq, None)
            .unwrap();
        assert_eq!(ctx.platform().surfaces_live(), 1);
        assert!(ctx.dmem_available() < free);

        // Gating cannot be disallowed with the firmware paused
        ctx.shutdown().unwrap();
        assert_eq!(ctx.state(), PmuState::Off);
        assert!(!ctx.is_ready());
        assert!(!ctx.is_initialized());
        assert_eq!(ctx.in_flight(), 0);
        assert_eq!(ctx.platform().surfaces_live(), 0);
        assert_eq!(ctx.platform().read32(crate::regs::IRQMASK), 0);
        assert_eq!(ctx.platform().busy_refs(), 0);
    }

    #[test]
    fn test_shutdown_collects_residency_and_reboots() {
        let ctx = booted(SimFalcon::new());
        let stats = ctx.elpg_statistics(Engine::Graphics).unwrap();
        ctx.shutdown().unwrap();
        assert_eq!(ctx.engine_state(Engine::Graphics), ElpgState::Off);

        let residency = ctx.residency();
        assert_eq!(residency.gating_cnt, u64::from(stats.gating_cnt));
        assert_eq!(residency.ingating_time_us, u64::from(stats.ingating_time_us));

        ctx.bring_up().unwrap();
        ctx.platform().boot();
        pump(&ctx);
        assert_eq!(ctx.state(), PmuState::Started);
        assert_eq!(ctx.elpg_refcount(Engine::Graphics), 1);
    }

    #[test]
    fn test_interrupts_ignored_after_shutdown() {
        let ctx = booted(SimFalcon::new());
        ctx.shutdown().unwrap();
        ctx.platform().raise_irq(crate::regs::swgen0());
        ctx.service_interrupt();
        assert!(!ctx.isr.lock().enabled);
        assert_eq!(ctx.state(), PmuState::Off);
    }
}
