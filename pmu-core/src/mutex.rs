//! Hardware mutex arbiter
//!
//! The falcon provides a bank of mutexes shared between the host and the
//! firmware. Ownership is proven with a token: the host asks the token
//! generator (`MUTEX_ID`) for a fresh value, writes it into the mutex and
//! reads it back. If the read-back matches, the host owns the mutex; if not,
//! someone else does and the token goes back to the generator.
//!
//! Acquisition is reentrant for a caller that presents the token it already
//! owns, tracked by a per-mutex reference count.

use log::{debug, error, warn};
use spin::Mutex;

use crate::PmuContext;
use crate::config::MUTEX_COUNT;
use crate::error::PmuError;
use crate::platform::Platform;
use crate::regs::{self, MUTEX};

/// Hardware mutex index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexId(u8);

impl MutexId {
    pub const GPUSER: Self = Self(1);
    pub const QUEUE_BIOS: Self = Self(2);
    pub const QUEUE_SMI: Self = Self(3);
    pub const GPMUTEX: Self = Self(4);
    pub const I2C: Self = Self(5);
    pub const RMLOCK: Self = Self(6);
    pub const MSGBOX: Self = Self(7);
    pub const FIFO: Self = Self(8);
    pub const PG: Self = Self(9);
    pub const GR: Self = Self(10);
    pub const CLK: Self = Self(11);
    /// Arbitrates the high-priority command queue with the firmware
    pub const HPQ: Self = Self(0);

    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MUTEX_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Ownership token handed out by the generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutexToken(u8);

impl MutexToken {
    /// Holds nothing (the value of a released mutex)
    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

/// Host-side bookkeeping: reentrancy counts per mutex.
pub struct MutexArbiter {
    ref_cnt: Mutex<[u32; MUTEX_COUNT]>,
}

impl MutexArbiter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ref_cnt: Mutex::new([0; MUTEX_COUNT]),
        }
    }

    pub(crate) fn reset(&self) {
        *self.ref_cnt.lock() = [0; MUTEX_COUNT];
    }

    /// Current reentrancy count of `id`.
    #[must_use]
    pub fn ref_count(&self, id: MutexId) -> u32 {
        self.ref_cnt.lock()[id.index()]
    }
}

impl Default for MutexArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> PmuContext<P> {
    fn mutex_owner(&self, id: MutexId) -> u8 {
        regs::mutex_value(self.platform.read32(regs::mutex(id.index())))
    }

    /// Acquire hardware mutex `id`.
    ///
    /// If `token` already owns the mutex the reference count is bumped.
    /// Otherwise a fresh token is requested and exchanged, retrying with a
    /// sleep in between, and stored in `token` on success.
    pub fn mutex_acquire(&self, id: MutexId, token: &mut MutexToken) -> Result<(), PmuError> {
        if !self.is_ready() {
            return Err(PmuError::NotReady);
        }

        let owner = self.mutex_owner(id);
        if token.is_valid() && token.value() == owner {
            let mut refs = self.mutexes.ref_cnt.lock();
            refs[id.index()] += 1;
            debug!("mutex {} reacquired, refs {}", id.index(), refs[id.index()]);
            return Ok(());
        }

        let (min_us, max_us) = self.config.mutex_backoff_us;
        for _ in 0..=self.config.mutex_retries {
            let data = regs::mutex_value(self.platform.read32(regs::MUTEX_ID));
            if data == MUTEX::VALUE::Initial.value as u8 || data == MUTEX::VALUE::NotAvailable.value as u8 {
                warn!("fail to generate mutex token: val {data:#x}");
                self.platform.sleep_us(min_us, max_us);
                continue;
            }

            self.platform.write32(regs::mutex(id.index()), u32::from(data));
            if self.mutex_owner(id) == data {
                self.mutexes.ref_cnt.lock()[id.index()] = 1;
                *token = MutexToken(data);
                debug!("mutex {} acquired, token {:#x}", id.index(), data);
                return Ok(());
            }

            debug!("mutex {} busy, releasing token {:#x}", id.index(), data);
            self.platform.write32(regs::MUTEX_ID_RELEASE, u32::from(data));
            self.platform.sleep_us(min_us, max_us);
        }

        Err(PmuError::Busy)
    }

    /// Release one reference on mutex `id`.
    ///
    /// The hardware mutex is only freed, and `token` invalidated, when the
    /// last reference goes.
    pub fn mutex_release(&self, id: MutexId, token: &mut MutexToken) -> Result<(), PmuError> {
        if !self.is_ready() {
            return Err(PmuError::NotReady);
        }

        let owner = self.mutex_owner(id);
        if !token.is_valid() || token.value() != owner {
            error!(
                "requester {:#x} does not match owner {:#x} of mutex {}",
                token.value(),
                owner,
                id.index()
            );
            return Err(PmuError::InvalidArgument);
        }

        {
            let mut refs = self.mutexes.ref_cnt.lock();
            let count = &mut refs[id.index()];
            if *count == 0 {
                warn!("mutex {} released with no references", id.index());
            } else {
                *count -= 1;
                if *count > 0 {
                    return Ok(());
                }
            }
        }

        self.platform
            .write32(regs::mutex(id.index()), MUTEX::VALUE::Initial.value);
        self.platform.write32(regs::MUTEX_ID_RELEASE, u32::from(owner));
        debug!("mutex {} released, token {:#x}", id.index(), owner);
        *token = MutexToken::INVALID;
        Ok(())
    }
}
