//! Interrupt service and synchronous waits
//!
//! The falcon raises SWGEN0 whenever it publishes messages, HALT when it
//! stops and EXTERR on a bus error. [`PmuContext::service_interrupt`] is the
//! entry point for the platform's interrupt path; [`PmuContext::wait_until`]
//! services the same interrupts inline so a caller blocked on an ack makes
//! progress even when interrupts are not being delivered to it.

use log::{debug, error};
use tock_registers::interfaces::Readable;
use tock_registers::registers::InMemoryRegister;

use crate::PmuContext;
use crate::error::PmuError;
use crate::pg::PmuState;
use crate::platform::{Platform, PmuEvent};
use crate::regs::{self, EXTERRSTAT, IRQ};

/// State guarded by the ISR lock.
#[derive(Debug, Default)]
pub(crate) struct IsrState {
    pub(crate) enabled: bool,
}

impl<P: Platform> PmuContext<P> {
    /// Mask every interrupt, then unmask and route the serviced ones to the
    /// host if `enable`.
    pub fn enable_irq(&self, enable: bool) {
        self.platform.write32(regs::IRQMCLR, u32::MAX);
        if enable {
            let irqs = regs::serviced_irqs();
            self.platform.write32(regs::IRQDEST, irqs);
            self.platform.write32(regs::IRQMSET, irqs);
        }
    }

    /// Whether a serviced interrupt is pending.
    #[must_use]
    pub fn irq_pending(&self) -> bool {
        self.platform.read32(regs::IRQSTAT) & regs::serviced_irqs() != 0
    }

    /// Service pending interrupts, then run any power-gating work the
    /// processed messages scheduled.
    pub fn service_interrupt(&self) {
        {
            let isr = self.isr.lock();
            self.service_locked(&isr);
        }
        self.run_deferred_work();
    }

    pub(crate) fn service_locked(&self, isr: &IsrState) {
        if !isr.enabled {
            return;
        }

        let mask = self.platform.read32(regs::IRQMASK) & self.platform.read32(regs::IRQDEST);
        let intr = self.platform.read32(regs::IRQSTAT) & mask;
        if intr == 0 || self.state() == PmuState::Off {
            self.platform.write32(regs::IRQSCLR, intr);
            return;
        }

        let status: InMemoryRegister<u32, IRQ::Register> = InMemoryRegister::new(intr);
        let mut recheck = false;

        if status.is_set(IRQ::HALT) {
            error!("pmu falcon halted");
            self.platform.dump_falcon_state();
            self.platform.notify(PmuEvent::Halted);
        }
        if status.is_set(IRQ::EXTERR) {
            error!("pmu external bus error, clearing");
            self.platform.dump_falcon_state();
            self.platform.notify(PmuEvent::ExternalError);
            self.platform
                .clear_bits32(regs::EXTERRSTAT, EXTERRSTAT::VALID::SET.value);
        }
        if status.is_set(IRQ::SWGEN0) {
            self.process_messages();
            recheck = true;
        }

        self.platform.write32(regs::IRQSCLR, intr);

        if recheck && self.is_ready() && !self.queue_is_empty(crate::queue::QueueId::Message) {
            debug!("pmu msgq still has data, re-raising swgen0");
            self.platform.write32(regs::IRQSSET, regs::swgen0());
        }
    }

    /// Poll `cond` with exponential backoff until it holds or `timeout_us`
    /// elapses, servicing pending interrupts inline while waiting.
    pub fn wait_until<F>(&self, cond: F, timeout_us: u64) -> Result<(), PmuError>
    where
        F: Fn() -> bool,
    {
        let deadline = self.platform.now_us().saturating_add(timeout_us);
        let mut delay = self.config.poll_delay_min_us;

        loop {
            if cond() {
                return Ok(());
            }
            if self.irq_pending()
                && let Some(isr) = self.isr.try_lock()
            {
                self.service_locked(&isr);
            }
            if self.platform.now_us() >= deadline {
                break;
            }
            self.platform.sleep_us(delay, delay * 2);
            delay = (delay * 2).min(self.config.poll_delay_max_us);
        }

        if cond() { Ok(()) } else { Err(PmuError::Timeout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFalcon, booted};
    use core::sync::atomic::{AtomicU32, Ordering};
    use pmu_mmio::RegisterIo;

    #[test]
    fn test_wait_times_out_on_virtual_clock() {
        let ctx = booted(SimFalcon::new());
        let start = ctx.platform().now_us();
        assert_eq!(ctx.wait_until(|| false, 5_000), Err(PmuError::Timeout));
        assert!(ctx.platform().now_us() >= start + 5_000);
    }

    #[test]
    fn test_wait_backs_off_exponentially() {
        let ctx = booted(SimFalcon::new());
        let polls = AtomicU32::new(0);
        let _ = ctx.wait_until(
            || {
                polls.fetch_add(1, Ordering::SeqCst);
                false
            },
            100_000,
        );
        // 10, 20, ... capped at 1000 us: about 100 polls for 100 ms, far fewer
        // than the 10_000 a fixed minimum delay would need
        let n = polls.load(Ordering::SeqCst);
        assert!(n > 50 && n < 200, "{n} polls");
    }

    #[test]
    fn test_halt_and_exterr_are_reported_and_cleared() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().write32(regs::EXTERRSTAT, 1 << 31);
        ctx.platform().raise_irq((1 << 4) | (1 << 5));
        ctx.service_interrupt();

        assert_eq!(
            ctx.platform().events(),
            alloc::vec![PmuEvent::Halted, PmuEvent::ExternalError]
        );
        assert_eq!(ctx.platform().read32(regs::EXTERRSTAT) & (1 << 31), 0);
        assert!(!ctx.irq_pending());
    }

    #[test]
    fn test_disabled_isr_ignores_interrupts() {
        let ctx = booted(SimFalcon::new());
        ctx.isr.lock().enabled = false;
        ctx.platform().raise_irq(regs::swgen0());
        ctx.service_interrupt();
        assert!(ctx.irq_pending());
    }
}
