//! Byte Ring Arithmetic
//!
//! Cursor math for the variable-length frame rings the PMU shares with the
//! host. Unlike fixed-entry submission queues, frames here have arbitrary
//! (4-byte aligned) lengths, so a frame that does not fit in the space left
//! before the end of the buffer is never split: the producer writes a small
//! rewind marker and continues at the start of the buffer.
//!
//! # Ring Model
//!
//! - The producer owns `head` (next byte to write)
//! - The consumer owns `tail` (next byte to read)
//! - `head == tail` means empty, so the producer never lets `head` catch up
//!   with `tail` from behind; one aligned slot is always left unused
//! - A producer at `head >= tail` must keep room for a rewind marker at the
//!   end of the buffer
//!
//! Both the host queue manager and the simulated firmware use this type so the
//! two ends agree on the geometry by construction.

/// Alignment of every frame and cursor in a ring.
pub const RING_ALIGNMENT: u32 = 4;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Result of a capacity check for a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    /// The frame fits at the current head.
    Fits,
    /// The frame fits only after wrapping to the start of the buffer.
    AfterRewind,
    /// Not enough free space in either position.
    Full,
}

/// Geometry of one ring inside a shared memory window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursor {
    /// Byte offset of the ring inside the shared memory
    offset: u32,
    /// Ring size in bytes
    size: u32,
}

impl RingCursor {
    /// Create a ring covering `[offset, offset + size)`.
    #[inline]
    #[must_use]
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// Start of the ring.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Size of the ring in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// One past the last byte of the ring.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// Whether `pos` is a valid cursor value for this ring.
    #[inline]
    #[must_use]
    pub const fn contains(&self, pos: u32) -> bool {
        pos >= self.offset && pos <= self.end()
    }

    /// Whether the ring holds no unread bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(head: u32, tail: u32) -> bool {
        head == tail
    }

    /// Check whether a frame of `len` bytes can be written at `head`.
    ///
    /// `marker` bytes at the end of the buffer are reserved for the rewind
    /// marker whenever the producer is ahead of the consumer.
    #[must_use]
    pub fn room(&self, head: u32, tail: u32, len: u32, marker: u32) -> Room {
        let len = align_up(len, RING_ALIGNMENT);
        let mut head = head;
        let mut rewind = false;
        let mut free = 0;

        if head >= tail {
            free = self.end().saturating_sub(head).saturating_sub(marker);
            if len > free {
                rewind = true;
                head = self.offset;
            }
        }

        if head < tail {
            free = tail - head - 1;
        }

        match (len <= free, rewind) {
            (false, _) => Room::Full,
            (true, true) => Room::AfterRewind,
            (true, false) => Room::Fits,
        }
    }

    /// Number of contiguous bytes readable at `tail`.
    ///
    /// When the producer has wrapped, this is the span up to the end of the
    /// buffer; the remainder is read after the consumer rewinds.
    #[inline]
    #[must_use]
    pub const fn readable(&self, head: u32, tail: u32) -> u32 {
        if head >= tail {
            head - tail
        } else {
            self.end() - tail
        }
    }

    /// Cursor value after consuming or producing `len` bytes at `pos`.
    #[inline]
    #[must_use]
    pub const fn advance(pos: u32, len: u32) -> u32 {
        pos + align_up(len, RING_ALIGNMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: u32 = 4;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(13, 4), 16);
    }

    #[test]
    fn test_room_in_empty_ring() {
        let ring = RingCursor::new(0x100, 0x80);
        assert_eq!(ring.room(0x100, 0x100, 0x40, MARKER), Room::Fits);
        // Whole ring minus the marker reservation
        assert_eq!(ring.room(0x100, 0x100, 0x7c, MARKER), Room::Fits);
        assert_eq!(ring.room(0x100, 0x100, 0x80, MARKER), Room::Full);
    }

    #[test]
    fn test_room_rewinds_when_trailing_space_is_short() {
        let ring = RingCursor::new(0x100, 0x80);
        // 16 bytes left before the wrap, the marker reservation makes that 12
        assert_eq!(ring.room(0x170, 0x140, 16, MARKER), Room::AfterRewind);
        assert_eq!(ring.room(0x170, 0x140, 12, MARKER), Room::Fits);
    }

    #[test]
    fn test_room_never_lets_head_reach_tail() {
        let ring = RingCursor::new(0, 0x40);
        // Producer behind consumer: tail - head - 1 bytes usable
        assert_eq!(ring.room(0x10, 0x20, 0x0c, MARKER), Room::Fits);
        assert_eq!(ring.room(0x10, 0x20, 0x10, MARKER), Room::Full);
        // Consumer still at the start, rewinding would collide with it
        assert_eq!(ring.room(0x38, 0x00, 0x10, MARKER), Room::Full);
    }

    #[test]
    fn test_readable_span() {
        let ring = RingCursor::new(0x200, 0x100);
        assert_eq!(ring.readable(0x240, 0x200), 0x40);
        assert_eq!(ring.readable(0x200, 0x200), 0);
        // Producer wrapped: read up to the end first
        assert_eq!(ring.readable(0x210, 0x2f0), 0x10);
        assert_eq!(RingCursor::advance(0x200, 6), 0x208);
        assert!(ring.contains(0x300));
        assert!(!ring.contains(0x1fc));
    }
}
