//! Payload allocation descriptors
//!
//! Commands that carry a payload embed an allocation descriptor at a
//! command-specific offset in their body. The descriptor tells the firmware
//! where in DMEM the host staged the bytes, and on newer layouts optionally
//! points at a framebuffer surface for payloads too large for DMEM.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Framebuffer surface descriptor (`params` packs size and DMA index).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FbDesc {
    pub address_lo: u32,
    pub address_hi: u32,
    /// Bits 23:0 size in bytes, bits 31:24 DMA index
    pub params: u32,
}

impl FbDesc {
    const SIZE_MASK: u32 = 0x00ff_ffff;
    const DMA_IDX_SHIFT: u32 = 24;

    /// Describe a surface at `gpu_va`.
    #[must_use]
    pub const fn new(gpu_va: u64, size: u32, dma_idx: u8) -> Self {
        Self {
            address_lo: gpu_va as u32,
            address_hi: (gpu_va >> 32) as u32,
            params: (size & Self::SIZE_MASK) | ((dma_idx as u32) << Self::DMA_IDX_SHIFT),
        }
    }

    /// Surface GPU virtual address.
    #[inline]
    #[must_use]
    pub const fn gpu_va(&self) -> u64 {
        ((self.address_hi as u64) << 32) | self.address_lo as u64
    }

    /// Surface size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.params & Self::SIZE_MASK
    }

    /// DMA aperture index.
    #[inline]
    #[must_use]
    pub const fn dma_idx(&self) -> u8 {
        (self.params >> Self::DMA_IDX_SHIFT) as u8
    }
}

/// DMEM-only allocation descriptor (v0 and v1 layouts).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AllocV1 {
    pub dmem_size: u16,
    pub pad: u16,
    pub dmem_offset: u32,
}

/// Allocation descriptor with an optional framebuffer surface (v3 layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AllocV3 {
    pub dmem_size: u16,
    pub pad: u16,
    pub dmem_offset: u32,
    pub fb: FbDesc,
}

/// Layout-independent view of an allocation descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadAlloc {
    /// Bytes reserved in DMEM
    pub dmem_size: u16,
    /// DMEM offset of the staged bytes
    pub dmem_offset: u32,
    /// Framebuffer surface, when the payload lives outside DMEM
    pub fb: Option<FbDesc>,
}
