//! Queue manager
//!
//! Three rings live in DMEM: two command queues the host produces into and
//! the message queue the firmware produces into. Cursors live in falcon
//! registers; the producer owns the head, the consumer owns the tail.
//!
//! Access goes through a [`QueueSession`]: `open_write`/`open_read` take the
//! queue lock (plus, first, the hardware mutex for the high-priority queue,
//! which the firmware also arbitrates), the session moves a private cursor with
//! `push`/`pop`/`rewind`, and `close(commit)` publishes that cursor to the
//! hardware. Dropping a session without closing it abandons the transfer and
//! releases the locks.

use log::{debug, error, trace, warn};
use pmu_mmio::{RingCursor, Room, read_barrier};
use pmu_proto::{HDR_SIZE, PmuHdr, QueueInfo};
use spin::{Mutex, MutexGuard};
use zerocopy::IntoBytes;

use crate::PmuContext;
use crate::error::PmuError;
use crate::mutex::{MutexId, MutexToken};
use crate::platform::Platform;
use crate::regs;

/// The queues the host talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// High-priority command queue
    Hpq,
    /// Low-priority command queue
    Lpq,
    /// Firmware to host messages
    Message,
}

impl QueueId {
    pub(crate) const ALL: [QueueId; 3] = [QueueId::Hpq, QueueId::Lpq, QueueId::Message];

    #[inline]
    #[must_use]
    pub(crate) const fn slot(self) -> usize {
        match self {
            QueueId::Hpq => 0,
            QueueId::Lpq => 1,
            QueueId::Message => 2,
        }
    }

    /// Whether the host produces into this queue.
    #[inline]
    #[must_use]
    pub const fn is_command(self) -> bool {
        !matches!(self, QueueId::Message)
    }

    /// Hardware mutex shared with the firmware, if any.
    #[inline]
    #[must_use]
    pub const fn mutex_id(self) -> Option<MutexId> {
        match self {
            QueueId::Hpq => Some(MutexId::HPQ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    ring: RingCursor,
    /// Head/tail register pair serving this queue
    index: u8,
    configured: bool,
    /// Hardware mutex token while a write session is open
    token: MutexToken,
}

/// One DMEM ring and its lock.
pub struct PmuQueue {
    id: QueueId,
    state: Mutex<QueueState>,
}

impl PmuQueue {
    pub(crate) const fn new(id: QueueId) -> Self {
        Self {
            id,
            state: Mutex::new(QueueState {
                ring: RingCursor::new(0, 0),
                index: 0,
                configured: false,
                token: MutexToken::INVALID,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> QueueId {
        self.id
    }

    /// Place the ring where the firmware said it is.
    pub(crate) fn configure(&self, info: &QueueInfo) -> Result<(), PmuError> {
        if self.id.is_command() && usize::from(info.index) >= regs::QUEUE_REGS {
            error!("{:?}: register index {} out of range", self.id, info.index);
            return Err(PmuError::Protocol);
        }
        let mut state = self.state.lock();
        state.ring = RingCursor::new(info.offset, info.size);
        state.index = info.index;
        state.configured = true;
        debug!(
            "{:?}: offset {:#x} size {:#x} index {}",
            self.id, info.offset, info.size, info.index
        );
        Ok(())
    }

    pub(crate) fn unconfigure(&self) {
        let mut state = self.state.lock();
        state.configured = false;
        state.token = MutexToken::INVALID;
    }

    /// Ring geometry, once configured.
    #[must_use]
    pub fn ring(&self) -> Option<RingCursor> {
        let state = self.state.lock();
        state.configured.then_some(state.ring)
    }
}

/// An open transfer on one queue.
pub struct QueueSession<'a, P: Platform> {
    ctx: &'a PmuContext<P>,
    id: QueueId,
    state: MutexGuard<'a, QueueState>,
    mode: OpenMode,
    position: u32,
    /// Hardware mutex taken for this session
    locked: Option<MutexId>,
}

impl<P: Platform> PmuContext<P> {
    #[inline]
    pub(crate) fn queue(&self, id: QueueId) -> &PmuQueue {
        &self.queues[id.slot()]
    }

    fn read_head(&self, id: QueueId, index: u8) -> u32 {
        match id {
            QueueId::Message => self.platform.read32(regs::MSGQ_HEAD),
            _ => self.platform.read32(regs::queue_head(usize::from(index))),
        }
    }

    fn read_tail(&self, id: QueueId, index: u8) -> u32 {
        match id {
            QueueId::Message => self.platform.read32(regs::MSGQ_TAIL),
            _ => self.platform.read32(regs::queue_tail(usize::from(index))),
        }
    }

    fn write_head(&self, id: QueueId, index: u8, value: u32) {
        match id {
            QueueId::Message => self.platform.write32(regs::MSGQ_HEAD, value),
            _ => self.platform.write32(regs::queue_head(usize::from(index)), value),
        }
    }

    fn write_tail(&self, id: QueueId, index: u8, value: u32) {
        match id {
            QueueId::Message => self.platform.write32(regs::MSGQ_TAIL, value),
            _ => self.platform.write32(regs::queue_tail(usize::from(index)), value),
        }
    }

    /// Whether the queue holds nothing unread.
    pub fn queue_is_empty(&self, id: QueueId) -> bool {
        let index = self.queue(id).state.lock().index;
        RingCursor::is_empty(self.read_head(id, index), self.read_tail(id, index))
    }

    /// Open a command queue for writing a frame of `size` bytes.
    ///
    /// Fails with [`PmuError::QueueFull`] if the frame does not fit even
    /// after a rewind. When it only fits after a rewind, the marker is
    /// written here and the session starts at the ring offset.
    pub fn open_write(&self, id: QueueId, size: u32) -> Result<QueueSession<'_, P>, PmuError> {
        if !id.is_command() {
            return Err(PmuError::InvalidArgument);
        }
        // Arbitration sleeps between retries; never with the queue lock held
        let mut token = MutexToken::INVALID;
        let locked = match id.mutex_id() {
            Some(mutex) => {
                self.mutex_acquire(mutex, &mut token)?;
                Some(mutex)
            }
            None => None,
        };

        let mut state = self.queue(id).state.lock();
        if !state.configured {
            if let Some(mutex) = locked
                && let Err(e) = self.mutex_release(mutex, &mut token)
            {
                error!("{id:?}: failed to release queue mutex: {e}");
            }
            return Err(PmuError::NotReady);
        }
        state.token = token;

        let head = self.read_head(id, state.index);
        let tail = self.read_tail(id, state.index);
        let room = state.ring.room(head, tail, size, HDR_SIZE as u32);

        let mut session = QueueSession {
            ctx: self,
            id,
            state,
            mode: OpenMode::Write,
            position: head,
            locked,
        };

        match room {
            Room::Full => {
                debug!("{id:?}: queue full, head {head:#x} tail {tail:#x} size {size}");
                Err(PmuError::QueueFull)
            }
            Room::AfterRewind => {
                session.rewind()?;
                Ok(session)
            }
            Room::Fits => Ok(session),
        }
    }

    /// Open a queue for reading at its tail.
    pub fn open_read(&self, id: QueueId) -> Result<QueueSession<'_, P>, PmuError> {
        let queue = self.queue(id);
        let state = queue.state.lock();
        if !state.configured {
            return Err(PmuError::NotReady);
        }
        let position = self.read_tail(id, state.index);
        Ok(QueueSession {
            ctx: self,
            id,
            state,
            mode: OpenMode::Read,
            position,
            locked: None,
        })
    }
}

impl<P: Platform> QueueSession<'_, P> {
    /// Session cursor.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Whether the reader has caught up with the producer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = self.ctx.read_head(self.id, self.state.index);
        let reference = match self.mode {
            OpenMode::Read => self.position,
            OpenMode::Write => self.ctx.read_tail(self.id, self.state.index),
        };
        head == reference
    }

    /// Wrap the cursor to the start of the ring.
    ///
    /// A writer leaves a rewind marker at the old position first.
    pub fn rewind(&mut self) -> Result<(), PmuError> {
        if self.mode == OpenMode::Write {
            let marker = PmuHdr::rewind();
            self.push(marker.as_bytes())?;
            trace!("{:?}: rewind marker at {:#x}", self.id, self.position);
        }
        self.position = self.state.ring.offset();
        Ok(())
    }

    /// Write `data` at the cursor and advance it.
    pub fn push(&mut self, data: &[u8]) -> Result<(), PmuError> {
        if self.mode != OpenMode::Write {
            error!("{:?}: push on a queue not opened for write", self.id);
            return Err(PmuError::InvalidArgument);
        }
        self.ctx.dmem.write(&self.ctx.platform, self.position, data)?;
        self.position = RingCursor::advance(self.position, data.len() as u32);
        Ok(())
    }

    /// Read up to `out.len()` bytes at the cursor and advance it.
    ///
    /// Returns the number of bytes read, which is clamped to what the
    /// producer has published contiguously.
    pub fn pop(&mut self, out: &mut [u8]) -> Result<usize, PmuError> {
        if self.mode != OpenMode::Read {
            error!("{:?}: pop on a queue not opened for read", self.id);
            return Err(PmuError::InvalidArgument);
        }
        let head = self.ctx.read_head(self.id, self.state.index);
        read_barrier();
        if head == self.position {
            return Ok(0);
        }

        let used = self.state.ring.readable(head, self.position) as usize;
        let mut len = out.len();
        if len > used {
            warn!("{:?}: queue holds {} bytes, {} requested", self.id, used, len);
            len = used;
        }
        if len == 0 {
            return Ok(0);
        }

        self.ctx
            .dmem
            .read(&self.ctx.platform, self.position, &mut out[..len])?;
        self.position = RingCursor::advance(self.position, len as u32);
        Ok(len)
    }

    /// End the session, publishing the cursor if `commit`.
    pub fn close(self, commit: bool) {
        if commit {
            let index = self.state.index;
            match self.mode {
                OpenMode::Read => self.ctx.write_tail(self.id, index, self.position),
                OpenMode::Write => self.ctx.write_head(self.id, index, self.position),
            }
        }
    }
}

impl<P: Platform> Drop for QueueSession<'_, P> {
    fn drop(&mut self) {
        if let Some(mutex) = self.locked.take()
            && let Err(e) = self.ctx.mutex_release(mutex, &mut self.state.token)
        {
            error!("{:?}: failed to release queue mutex: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFalcon, booted};

    #[test]
    fn test_write_then_read_back() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let ring = ctx.queue(QueueId::Lpq).ring().unwrap();

        let mut session = ctx.open_write(QueueId::Lpq, 8).unwrap();
        let start = session.position();
        session.push(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        session.close(true);

        assert!(ring.contains(start));
        assert_eq!(ctx.platform().queue_head(QueueId::Lpq), start + 8);
        assert_eq!(ctx.platform().dmem(start, 8), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_abandoned_session_leaves_head() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let before = ctx.platform().queue_head(QueueId::Hpq);

        let mut session = ctx.open_write(QueueId::Hpq, 4).unwrap();
        session.push(&[0xaa; 4]).unwrap();
        drop(session);

        assert_eq!(ctx.platform().queue_head(QueueId::Hpq), before);
        // The queue mutex went back with the session
        assert_eq!(ctx.platform().mutex_value(MutexId::HPQ.index()), 0);
        assert_eq!(ctx.platform().tokens_outstanding(), 0);
    }

    #[test]
    fn test_arbitration_failure_leaves_queue_unlocked() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        ctx.platform().hold_mutex(MutexId::HPQ.index(), 0x7e);

        assert!(matches!(ctx.open_write(QueueId::Hpq, 4), Err(PmuError::Busy)));
        assert!(!ctx.queue(QueueId::Hpq).state.is_locked());
        assert_eq!(ctx.platform().tokens_outstanding(), 0);

        ctx.platform().hold_mutex(MutexId::HPQ.index(), 0);
        let session = ctx.open_write(QueueId::Hpq, 4).unwrap();
        let token = session.state.token;
        assert!(token.is_valid());
        assert_eq!(ctx.platform().mutex_value(MutexId::HPQ.index()), token.value());
        drop(session);
        assert_eq!(ctx.mutexes.ref_count(MutexId::HPQ), 0);
    }

    #[test]
    fn test_write_rewinds_with_marker() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let ring = ctx.queue(QueueId::Lpq).ring().unwrap();
        // 16 bytes of trailing space, 12 usable once the marker is reserved
        let near_end = ring.end() - 16;
        ctx.platform().set_command_cursors(QueueId::Lpq, near_end);

        let mut session = ctx.open_write(QueueId::Lpq, 16).unwrap();
        assert_eq!(session.position(), ring.offset());
        session.push(&[0x5a; 16]).unwrap();
        session.close(true);

        assert_eq!(ctx.platform().dmem(near_end, 4), PmuHdr::rewind().as_bytes());
        assert_eq!(ctx.platform().queue_head(QueueId::Lpq), ring.offset() + 16);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let ring = ctx.queue(QueueId::Lpq).ring().unwrap();

        assert!(matches!(
            ctx.open_write(QueueId::Lpq, ring.size()),
            Err(PmuError::QueueFull)
        ));
        assert!(matches!(
            ctx.open_write(QueueId::Message, 4),
            Err(PmuError::InvalidArgument)
        ));
    }

    #[test]
    fn test_pop_clamps_to_published_bytes() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().inject_raw_message(&[0x11, 0x22, 0x33, 0x44]);

        let mut session = ctx.open_read(QueueId::Message).unwrap();
        assert!(!session.is_empty());
        let mut buf = [0u8; 12];
        assert_eq!(session.pop(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert!(session.is_empty());
        assert_eq!(session.pop(&mut buf).unwrap(), 0);
        session.close(true);
        assert!(ctx.queue_is_empty(QueueId::Message));
    }
}
