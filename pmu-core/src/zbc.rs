//! ZBC table delivery
//!
//! After the host changes the zero-bandwidth-clear table, the firmware has to
//! save the new entries into its restore sequence before the next gating
//! cycle.

use alloc::boxed::Box;
use core::sync::atomic::Ordering;

use log::{debug, error};
use pmu_proto::pg::{ZbcCmd, zbc_mask};
use pmu_proto::unit;
use zerocopy::IntoBytes;

use crate::PmuContext;
use crate::error::PmuError;
use crate::platform::Platform;
use crate::post::Callback;
use crate::queue::QueueId;

impl<P: Platform> PmuContext<P> {
    /// Post the table update for entries `1..=entries` without waiting.
    pub(crate) fn post_zbc_update(&self, entries: u32) -> Result<u32, PmuError> {
        let abi = self.abi()?;
        let cmd = ZbcCmd {
            cmd_type: abi.zbc_table_update_id(),
            pad: 0,
            entry_mask: zbc_mask(entries),
        };
        self.zbc_save_done.store(false, Ordering::Release);

        let on_ack: Callback<P> = Box::new(|ctx, resp| {
            if !resp.is_ok() {
                error!("ZBC save cmd aborted");
                return;
            }
            debug!("ZBC save acknowledged");
            ctx.zbc_save_done.store(true, Ordering::Release);
        });
        debug!("cmd post ZBC_TABLE_UPDATE mask {:#x}", cmd.entry_mask);
        self.post_command(unit::PG, cmd.as_bytes(), None, QueueId::Hpq, Some(on_ack))
    }

    /// Have the firmware save ZBC entries `1..=entries` and wait for it.
    ///
    /// A no-op until bootstrap has loaded the ZBC buffer, or when `entries`
    /// is zero.
    pub fn save_zbc(&self, entries: u32) -> Result<(), PmuError> {
        if !self.is_ready() || !self.zbc_ready() || entries == 0 {
            return Ok(());
        }
        self.post_zbc_update(entries)?;

        let done = || self.zbc_save_done.load(Ordering::Acquire);
        if self.wait_until(done, self.config.gr_idle_timeout_us).is_err() {
            error!("ZBC save timeout");
            return Err(PmuError::Timeout);
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn zbc_ready(&self) -> bool {
        self.zbc_ready.load(Ordering::Acquire)
    }

    /// Whether the last table update was acknowledged.
    #[inline]
    #[must_use]
    pub fn zbc_save_done(&self) -> bool {
        self.zbc_save_done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PmuConfig;
    use crate::sim::{SimFalcon, booted};
    use pmu_proto::abi::app_version;

    #[test]
    fn test_save_waits_for_ack() {
        let ctx = booted(SimFalcon::new());
        // Bootstrap already saved the default table
        assert!(ctx.zbc_save_done());
        assert_eq!(ctx.platform().zbc_masks(), alloc::vec![0xfffe]);

        ctx.save_zbc(3).unwrap();
        assert!(ctx.zbc_save_done());
        assert_eq!(ctx.platform().zbc_masks(), alloc::vec![0xfffe, 0x000e]);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_save_is_noop_until_ready() {
        let ctx = PmuContext::new(SimFalcon::new(), PmuConfig::new());
        assert_eq!(ctx.save_zbc(0xf), Ok(()));

        let ctx = booted(SimFalcon::new());
        assert_eq!(ctx.save_zbc(0), Ok(()));
        assert_eq!(ctx.platform().zbc_masks().len(), 1);
    }

    #[test]
    fn test_save_uses_versioned_command_id() {
        let ctx = booted(SimFalcon::with_version(app_version::GK20A_0));
        ctx.save_zbc(1).unwrap();
        assert_eq!(ctx.platform().zbc_command_ids(), alloc::vec![14, 14]);

        let ctx = booted(SimFalcon::with_version(app_version::GM206));
        assert_eq!(ctx.platform().zbc_command_ids(), alloc::vec![16]);
    }

    #[test]
    fn test_save_times_out() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_drop_responses(true);
        assert_eq!(ctx.save_zbc(2), Err(PmuError::Timeout));
        assert!(!ctx.zbc_save_done());
    }
}
