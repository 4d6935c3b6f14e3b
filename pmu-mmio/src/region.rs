//! MMIO Region Abstraction
//!
//! Volatile, offset-based access to a mapped register window. The falcon
//! register file is only ever accessed as aligned 32-bit words, so that is
//! the only access width offered here.
//!
//! # Safety
//!
//! The caller is responsible for ensuring the base address points to a valid,
//! mapped MMIO region with device memory attributes.

use core::ptr::{read_volatile, write_volatile};

use crate::io::RegisterIo;

/// A memory-mapped register window.
///
/// # Example
///
/// ```ignore
/// let pwr = unsafe { MmioRegion::new(0x1010_a000, 0x1000) };
/// let mailbox = pwr.read32(0x040);
/// ```
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to a valid, mapped MMIO region
    /// - The region has device memory attributes (non-cacheable)
    /// - The region is at least `size` bytes
    #[inline]
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get the base address of this region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Get the size of this region.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Create a subregion starting at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + size` would exceed the parent region's bounds.
    #[inline]
    #[must_use]
    pub const fn subregion(&self, offset: usize, size: usize) -> Self {
        assert!(
            offset + size <= self.size,
            "Subregion exceeds parent bounds"
        );
        Self {
            base: self.base + offset,
            size,
        }
    }
}

impl RegisterIo for MmioRegion {
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO read32 offset not aligned");
        // SAFETY: Caller of new() ensured base is valid MMIO, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO write32 offset not aligned");
        // SAFETY: Caller of new() ensured base is valid MMIO, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_access_on_plain_memory() {
        let mut backing = [0u32; 8];
        // SAFETY: backing outlives the region and is suitably aligned
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr() as usize, 32) };

        region.write32(0x8, 0xdead_beef);
        region.modify32(0x8, |v| v & 0xffff);
        assert_eq!(region.read32(0x8), 0xbeef);

        let sub = region.subregion(0x8, 0x10);
        assert_eq!(sub.read32(0), 0xbeef);
        sub.write32(4, 3);
        assert_eq!(backing[3], 3);
    }

    #[test]
    #[should_panic(expected = "Subregion exceeds parent bounds")]
    fn test_subregion_bounds() {
        // SAFETY: never dereferenced
        let region = unsafe { MmioRegion::new(0x1000, 0x100) };
        let _ = region.subregion(0xf0, 0x20);
    }
}
