//! DMEM window allocator
//!
//! First-fit allocator over the software-managed DMEM area the firmware
//! reports in its init message. Every block is 4-byte aligned and sized,
//! adjacent free blocks are merged on free.

use alloc::vec::Vec;

use log::warn;
use pmu_mmio::align_up;

use crate::error::PmuError;

/// Allocation granule and alignment.
pub const DMEM_ALIGNMENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: u32,
    size: u32,
}

impl Span {
    const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Free list over `[base, base + size)`, sorted by offset.
#[derive(Debug, Default)]
pub struct DmemAllocator {
    base: u32,
    size: u32,
    free: Vec<Span>,
}

impl DmemAllocator {
    /// Allocator with no window; every allocation fails until [`Self::reset`].
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: 0,
            size: 0,
            free: Vec::new(),
        }
    }

    /// Manage `[base, base + size)`, forgetting every outstanding block.
    pub fn reset(&mut self, base: u32, size: u32) {
        let start = align_up(base, DMEM_ALIGNMENT);
        let end = (base + size) & !(DMEM_ALIGNMENT - 1);
        self.base = start;
        self.size = end.saturating_sub(start);
        self.free.clear();
        if self.size > 0 {
            self.free.push(Span {
                offset: self.base,
                size: self.size,
            });
        }
    }

    /// Allocate `size` bytes, returning the DMEM offset.
    pub fn alloc(&mut self, size: u32) -> Result<u32, PmuError> {
        if size == 0 {
            return Err(PmuError::InvalidArgument);
        }
        let size = align_up(size, DMEM_ALIGNMENT);
        let idx = self
            .free
            .iter()
            .position(|span| span.size >= size)
            .ok_or(PmuError::OutOfDmem)?;

        let span = &mut self.free[idx];
        let offset = span.offset;
        if span.size == size {
            self.free.remove(idx);
        } else {
            span.offset += size;
            span.size -= size;
        }
        Ok(offset)
    }

    /// Return a block obtained from [`Self::alloc`] with the same `size`.
    pub fn free(&mut self, offset: u32, size: u32) {
        let block = Span {
            offset,
            size: align_up(size, DMEM_ALIGNMENT),
        };
        if block.size == 0 || offset < self.base || block.end() > self.base + self.size {
            warn!("dmem free of {offset:#x}+{size} outside the managed window");
            return;
        }

        let idx = self.free.partition_point(|span| span.offset < offset);
        let overlaps_next = self.free.get(idx).is_some_and(|next| block.end() > next.offset);
        let overlaps_prev = idx > 0 && self.free[idx - 1].end() > offset;
        if overlaps_next || overlaps_prev {
            warn!("dmem double free of {offset:#x}+{size}");
            return;
        }

        self.free.insert(idx, block);
        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].offset {
            self.free[idx].size += self.free[idx + 1].size;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].offset {
            self.free[idx - 1].size += self.free[idx].size;
            self.free.remove(idx);
        }
    }

    /// Free bytes across all holes.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.free.iter().map(|span| span.size).sum()
    }

    /// Managed window size.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.size
    }
}
