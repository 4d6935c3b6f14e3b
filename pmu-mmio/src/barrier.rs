//! Memory Barrier Helpers
//!
//! Ordering helpers for shared-memory rings and doorbell-style cursor
//! registers. These are compiler-and-CPU fences; the register accessors
//! themselves are volatile.
//!
//! # Usage Patterns
//!
//! ## Host writes a command, firmware reads it
//!
//! ```ignore
//! copy_to_dmem(head, &frame);
//! write_barrier();              // frame bytes visible before head moves
//! io.write32(QUEUE_HEAD, head + len);
//! ```
//!
//! ## Firmware writes a message, host reads it
//!
//! ```ignore
//! let head = io.read32(MSGQ_HEAD);
//! read_barrier();               // head observed before message bytes
//! copy_from_dmem(tail, &mut hdr);
//! ```

use core::sync::atomic::{Ordering, fence};

/// Read barrier (acquire semantics).
///
/// Use before reading shared memory that may have been written by the firmware.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier (release semantics).
///
/// Use before publishing a cursor that makes newly written bytes visible.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}
