//! PMU falcon register map
//!
//! Offsets are relative to the falcon register window handed to the
//! [`crate::Platform`]. Field layouts are described with `tock-registers`
//! bitfields and decoded through [`InMemoryRegister`] copies of the raw value.

use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

// -- Interrupt Registers

/// Raise interrupt bits (write 1 to set)
pub const IRQSSET: usize = 0x000;
/// Clear interrupt bits (write 1 to clear)
pub const IRQSCLR: usize = 0x004;
/// Pending interrupt status
pub const IRQSTAT: usize = 0x008;
/// Unmask interrupt bits
pub const IRQMSET: usize = 0x010;
/// Mask interrupt bits
pub const IRQMCLR: usize = 0x014;
/// Current interrupt mask
pub const IRQMASK: usize = 0x018;
/// Interrupt routing (host vs falcon)
pub const IRQDEST: usize = 0x01c;

// -- Mailboxes and Error Status

pub const MAILBOX0: usize = 0x040;
pub const MAILBOX1: usize = 0x044;
/// External bus error status
pub const EXTERRSTAT: usize = 0x16c;

// -- DMEM Access Ports

/// Number of DMEM access ports
pub const DMEM_PORTS: usize = 8;

/// DMEM control (address and auto-increment) of `port`
#[inline]
#[must_use]
pub const fn dmemc(port: usize) -> usize {
    0x1c0 + port * 8
}

/// DMEM data window of `port`
#[inline]
#[must_use]
pub const fn dmemd(port: usize) -> usize {
    0x1c4 + port * 8
}

/// Byte-address bits of DMEMC (`OFFS` and `BLK`)
pub const DMEMC_ADDRESS_MASK: u32 = 0x00ff_fffc;

// -- Queue Cursors

/// Number of command queue head/tail register pairs
pub const QUEUE_REGS: usize = 4;

#[inline]
#[must_use]
pub const fn queue_head(index: usize) -> usize {
    0x4a0 + index * 4
}

#[inline]
#[must_use]
pub const fn queue_tail(index: usize) -> usize {
    0x4b0 + index * 4
}

/// Message queue head (firmware writes)
pub const MSGQ_HEAD: usize = 0x4c8;
/// Message queue tail (host writes)
pub const MSGQ_TAIL: usize = 0x4cc;

// -- Hardware Mutexes

/// Reading hands out a fresh mutex token
pub const MUTEX_ID: usize = 0x488;
/// Writing returns a token to the generator
pub const MUTEX_ID_RELEASE: usize = 0x48c;

#[inline]
#[must_use]
pub const fn mutex(index: usize) -> usize {
    0x580 + index * 4
}

// -- Idle Counters and Power-Gating Filters

/// Number of idle counters
pub const IDLE_COUNTERS: usize = 8;

#[inline]
#[must_use]
pub const fn idle_mask(counter: usize) -> usize {
    0x504 + counter * 16
}

#[inline]
#[must_use]
pub const fn idle_count(counter: usize) -> usize {
    0x508 + counter * 16
}

#[inline]
#[must_use]
pub const fn idle_ctrl(counter: usize) -> usize {
    0x50c + counter * 16
}

/// Idle filter threshold of power-gating engine slot `engine`
#[inline]
#[must_use]
pub const fn pg_idle_filter(engine: usize) -> usize {
    0x6c0 + engine * 4
}

/// PPU idle filter threshold of power-gating engine slot `engine`
#[inline]
#[must_use]
pub const fn pg_ppu_idle_filter(engine: usize) -> usize {
    0x6e8 + engine * 4
}

register_bitfields![u32,
    /// Interrupt bits, shared by IRQSTAT/IRQSSET/IRQSCLR/IRQMASK/IRQDEST
    pub IRQ [
        /// General purpose timer
        GPTMR OFFSET(0) NUMBITS(1) [],
        /// Watchdog timer
        WDTMR OFFSET(1) NUMBITS(1) [],
        /// Method interface
        MTHD OFFSET(2) NUMBITS(1) [],
        /// Context switch
        CTXSW OFFSET(3) NUMBITS(1) [],
        /// Falcon halted
        HALT OFFSET(4) NUMBITS(1) [],
        /// External bus error
        EXTERR OFFSET(5) NUMBITS(1) [],
        /// Firmware message queue doorbell
        SWGEN0 OFFSET(6) NUMBITS(1) [],
        SWGEN1 OFFSET(7) NUMBITS(1) []
    ],

    /// DMEM port control
    pub DMEMC [
        /// Word offset within the block
        OFFS OFFSET(2) NUMBITS(6) [],
        /// 256-byte block index
        BLK OFFSET(8) NUMBITS(16) [],
        /// Auto-increment on write
        AINCW OFFSET(24) NUMBITS(1) [],
        /// Auto-increment on read
        AINCR OFFSET(25) NUMBITS(1) []
    ],

    /// Hardware mutex and token registers
    pub MUTEX [
        VALUE OFFSET(0) NUMBITS(8) [
            /// Released mutex, or no token generated
            Initial = 0x00,
            /// Token generator exhausted
            NotAvailable = 0xff
        ]
    ],

    pub EXTERRSTAT [
        VALID OFFSET(31) NUMBITS(1) []
    ],

    pub IDLE_MASK [
        GR OFFSET(0) NUMBITS(1) [],
        CE_2 OFFSET(21) NUMBITS(1) []
    ],

    pub IDLE_CTRL [
        VALUE OFFSET(0) NUMBITS(2) [
            Never = 0,
            Busy = 2,
            Always = 3
        ],
        FILTER OFFSET(2) NUMBITS(1) []
    ],

    pub IDLE_COUNT [
        VALUE OFFSET(0) NUMBITS(31) [],
        RESET OFFSET(31) NUMBITS(1) []
    ]
];

/// Interrupts the host unmasks and services.
#[must_use]
pub fn serviced_irqs() -> u32 {
    let reg: InMemoryRegister<u32, IRQ::Register> = InMemoryRegister::new(0);
    reg.write(IRQ::HALT::SET + IRQ::EXTERR::SET + IRQ::SWGEN0::SET);
    reg.get()
}

/// SWGEN0 as a raw mask.
#[must_use]
pub fn swgen0() -> u32 {
    let reg: InMemoryRegister<u32, IRQ::Register> = InMemoryRegister::new(0);
    reg.write(IRQ::SWGEN0::SET);
    reg.get()
}

/// DMEMC value addressing byte `offset` with auto-increment on `read` or write.
#[must_use]
pub fn dmemc_value(offset: u32, read: bool) -> u32 {
    let reg: InMemoryRegister<u32, DMEMC::Register> = InMemoryRegister::new(0);
    let incr = if read { DMEMC::AINCR::SET } else { DMEMC::AINCW::SET };
    reg.write(DMEMC::OFFS.val((offset >> 2) & 0x3f) + DMEMC::BLK.val(offset >> 8) + incr);
    reg.get()
}

/// Byte address a DMEMC value points at.
#[must_use]
pub fn dmemc_address(value: u32) -> u32 {
    value & DMEMC_ADDRESS_MASK
}

/// Mutex or token value field of a raw register read.
#[must_use]
pub fn mutex_value(raw: u32) -> u8 {
    let reg: InMemoryRegister<u32, MUTEX::Register> = InMemoryRegister::new(raw);
    reg.read(MUTEX::VALUE) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_masks() {
        assert_eq!(serviced_irqs(), (1 << 4) | (1 << 5) | (1 << 6));
        assert_eq!(swgen0(), 1 << 6);
    }

    #[test]
    fn test_dmemc_encoding() {
        let v = dmemc_value(0x1234, true);
        assert_eq!(dmemc_address(v), 0x1234);
        assert_eq!(v & (1 << 25), 1 << 25);
        assert_eq!(v & (1 << 24), 0);

        let v = dmemc_value(0x10, false);
        assert_eq!(v, 0x10 | (1 << 24));
    }

    #[test]
    fn test_register_layout() {
        assert_eq!(queue_head(1), 0x4a4);
        assert_eq!(queue_tail(3), 0x4bc);
        assert_eq!(mutex(15), 0x5bc);
        assert_eq!(idle_ctrl(6), 0x56c);
        assert_eq!(mutex_value(0xdead_be42), 0x42);
    }
}
