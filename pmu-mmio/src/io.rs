//! Register Access Trait
//!
//! Everything above this crate talks to hardware through [`RegisterIo`], so
//! the same protocol code drives a real falcon through [`crate::MmioRegion`]
//! and an in-memory model under test.

/// 32-bit register access at byte offsets.
///
/// Implementations must make each `read32`/`write32` a single, side-effecting
/// access; callers rely on reads of status registers not being cached.
pub trait RegisterIo {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Modify a 32-bit register using read-modify-write.
    ///
    /// Note: This is NOT atomic - use with care for concurrent access.
    #[inline]
    fn modify32<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
        Self: Sized,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    /// Replace the bits selected by `mask` with `value`.
    #[inline]
    fn set_field32(&self, offset: usize, mask: u32, value: u32)
    where
        Self: Sized,
    {
        self.modify32(offset, |v| (v & !mask) | (value & mask));
    }

    /// Set bits in a 32-bit register.
    #[inline]
    fn set_bits32(&self, offset: usize, bits: u32)
    where
        Self: Sized,
    {
        self.modify32(offset, |v| v | bits);
    }

    /// Clear bits in a 32-bit register.
    #[inline]
    fn clear_bits32(&self, offset: usize, bits: u32)
    where
        Self: Sized,
    {
        self.modify32(offset, |v| v & !bits);
    }

    /// Poll a 32-bit register until a condition is met.
    ///
    /// Returns `true` if the condition was met, `false` on timeout.
    #[inline]
    fn poll32<F>(&self, offset: usize, condition: F, max_iterations: usize) -> bool
    where
        F: Fn(u32) -> bool,
        Self: Sized,
    {
        for _ in 0..max_iterations {
            if condition(self.read32(offset)) {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct RegFile {
        regs: [Cell<u32>; 4],
        reads: Cell<usize>,
    }

    impl RegFile {
        fn new() -> Self {
            Self {
                regs: Default::default(),
                reads: Cell::new(0),
            }
        }
    }

    impl RegisterIo for RegFile {
        fn read32(&self, offset: usize) -> u32 {
            self.reads.set(self.reads.get() + 1);
            self.regs[offset / 4].get()
        }

        fn write32(&self, offset: usize, value: u32) {
            self.regs[offset / 4].set(value);
        }
    }

    #[test]
    fn test_bit_helpers() {
        let regs = RegFile::new();
        regs.write32(4, 0xf0);
        regs.set_bits32(4, 0x0f);
        assert_eq!(regs.read32(4), 0xff);
        regs.clear_bits32(4, 0xf0);
        assert_eq!(regs.read32(4), 0x0f);
        regs.set_field32(4, 0xff00, 0xab00);
        assert_eq!(regs.read32(4), 0xab0f);
    }

    #[test]
    fn test_poll_gives_up() {
        let regs = RegFile::new();
        assert!(!regs.poll32(0, |v| v == 1, 8));
        assert_eq!(regs.reads.get(), 8);

        regs.write32(0, 1);
        assert!(regs.poll32(0, |v| v == 1, 8));
    }

    #[test]
    fn test_reference_forwarding() {
        let regs = RegFile::new();
        let by_ref = &regs;
        by_ref.write32(8, 7);
        assert_eq!(regs.read32(8), 7);
    }
}
