//! Sequence table
//!
//! Every posted command occupies a slot until its response arrives. The slot
//! index travels in the frame header (`seq_id`) and the firmware echoes it
//! back, which is how responses are matched to their callbacks. Each slot
//! also owns the DMEM blocks and surfaces staged for the command, freed when
//! the slot completes.
//!
//! # Lifecycle
//!
//! ```text
//! Free --acquire--> Pending --arm--> Used --complete--> Free
//!                      |              |
//!                      +--release-->  +--cancel--> Cancelled --complete--> Free
//! ```

use alloc::vec::Vec;

use crate::error::PmuError;
use crate::platform::Surface;

/// Descriptor value never handed out.
pub const INVALID_DESC: u32 = u32::MAX;

/// Slot state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeqState {
    #[default]
    Free,
    /// Reserved, command not yet in the queue
    Pending,
    /// Command in the queue, response outstanding
    Used,
    /// Response outstanding but the callback will be dropped
    Cancelled,
}

/// A block of DMEM owned by a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmemBlock {
    pub offset: u32,
    pub size: u32,
}

/// Where the output payload is read back from once the response lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutLocation {
    Dmem { offset: u32, len: u32 },
    Surface { surface: Surface, len: u32 },
}

/// Memory staged for one command.
#[derive(Debug, Default)]
pub struct SeqResources {
    pub in_dmem: Option<DmemBlock>,
    /// `None` when the output shares the input block
    pub out_dmem: Option<DmemBlock>,
    pub in_surface: Option<Surface>,
    /// `None` when the output shares the input surface
    pub out_surface: Option<Surface>,
    pub out: Option<OutLocation>,
}

/// One slot.
#[derive(Debug)]
pub struct Slot<C> {
    state: SeqState,
    desc: u32,
    callback: Option<C>,
    res: SeqResources,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            state: SeqState::Free,
            desc: INVALID_DESC,
            callback: None,
            res: SeqResources::default(),
        }
    }
}

/// Contents of a slot handed back on completion.
pub struct Completed<C> {
    pub state: SeqState,
    pub desc: u32,
    pub callback: Option<C>,
    pub res: SeqResources,
}

/// Fixed table of `N` slots with a monotonically increasing descriptor.
pub struct SeqTable<C, const N: usize> {
    slots: [Slot<C>; N],
    next_desc: u32,
    in_flight: usize,
}

impl<C, const N: usize> SeqTable<C, N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::default()),
            next_desc: 0,
            in_flight: 0,
        }
    }

    /// Reserve the lowest free slot, returning its id and descriptor.
    pub fn acquire(&mut self) -> Result<(u8, u32), PmuError> {
        let id = self
            .slots
            .iter()
            .position(|slot| slot.state == SeqState::Free)
            .ok_or(PmuError::NoFreeSequence)?;

        let desc = self.next_desc;
        self.next_desc = self.next_desc.wrapping_add(1);
        if self.next_desc == INVALID_DESC {
            self.next_desc = 0;
        }

        let slot = &mut self.slots[id];
        slot.state = SeqState::Pending;
        slot.desc = desc;
        slot.callback = None;
        slot.res = SeqResources::default();
        self.in_flight += 1;
        Ok((id as u8, desc))
    }

    /// Attach the callback and staged memory and mark the slot in flight.
    pub fn arm(&mut self, id: u8, callback: Option<C>, res: SeqResources) {
        if let Some(slot) = self.slots.get_mut(usize::from(id))
            && slot.state == SeqState::Pending
        {
            slot.state = SeqState::Used;
            slot.callback = callback;
            slot.res = res;
        }
    }

    /// State of slot `id` (out-of-range ids read as free).
    #[must_use]
    pub fn state(&self, id: u8) -> SeqState {
        self.slots
            .get(usize::from(id))
            .map_or(SeqState::Free, |slot| slot.state)
    }

    /// Descriptor of slot `id`.
    #[must_use]
    pub fn desc(&self, id: u8) -> Option<u32> {
        self.slots
            .get(usize::from(id))
            .filter(|slot| slot.state != SeqState::Free)
            .map(|slot| slot.desc)
    }

    /// Mark the in-flight command with `desc` as cancelled.
    ///
    /// Returns the dropped callback so it is not destroyed under the table lock.
    pub fn cancel(&mut self, desc: u32) -> Result<Option<C>, PmuError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.state == SeqState::Used && slot.desc == desc)
            .ok_or(PmuError::InvalidArgument)?;
        slot.state = SeqState::Cancelled;
        Ok(slot.callback.take())
    }

    /// Free slot `id` after its response, if it was in flight.
    pub fn complete(&mut self, id: u8) -> Option<Completed<C>> {
        let slot = self.slots.get_mut(usize::from(id))?;
        if !matches!(slot.state, SeqState::Used | SeqState::Cancelled) {
            return None;
        }
        Some(self.take(usize::from(id)))
    }

    /// Free a slot that never made it into a queue.
    pub fn release(&mut self, id: u8) -> Option<Completed<C>> {
        if self.state(id) == SeqState::Free {
            return None;
        }
        Some(self.take(usize::from(id)))
    }

    /// Free every slot, returning what they held.
    pub fn drain(&mut self) -> Vec<Completed<C>> {
        let busy: Vec<usize> = (0..N)
            .filter(|&i| self.slots[i].state != SeqState::Free)
            .collect();
        busy.into_iter().map(|i| self.take(i)).collect()
    }

    fn take(&mut self, idx: usize) -> Completed<C> {
        let slot = core::mem::take(&mut self.slots[idx]);
        self.in_flight -= 1;
        Completed {
            state: slot.state,
            desc: slot.desc,
            callback: slot.callback,
            res: slot.res,
        }
    }

    #[inline]
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.in_flight == 0
    }
}

impl<C, const N: usize> Default for SeqTable<C, N> {
    fn default() -> Self {
        Self::new()
    }
}
