use std::fmt::{Display, Formatter, Result as FmtResult};

/// Why a `(index, generation)` pair was rejected by a `FreeSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The index is outside `[0, capacity)`.
    OutOfRange { index: u32, capacity: u32 },
    /// The slot is currently free.
    NotAllocated { index: u32 },
    /// The slot was released and possibly reissued since the handle was minted.
    StaleGeneration { index: u32, handle: u32, current: u32 },
}

impl Display for SlotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SlotError::OutOfRange { index, capacity } => {
                write!(f, "index {} out of range ({} pages)", index, capacity)
            }
            SlotError::NotAllocated { index } => {
                write!(f, "page {} is not currently allocated", index)
            }
            SlotError::StaleGeneration {
                index,
                handle,
                current,
            } => write!(
                f,
                "page {} handle generation {} is stale (slot is at {})",
                index, handle, current
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    allocated: bool,
    generation: u32,
}

/// Free/issued bookkeeping for the pages of one device.
///
/// Free indices live on a LIFO stack; each slot records whether it is issued
/// and its generation. Every index is either on the stack or issued, never
/// both, and their union is always `[0, capacity)`.
#[derive(Debug)]
pub struct FreeSet {
    free: Vec<u32>,
    slots: Vec<Slot>,
}

impl FreeSet {
    pub fn new(capacity: u32) -> Self {
        // Reverse so the first pops hand out 0, 1, 2, ...
        let free: Vec<u32> = (0..capacity).rev().collect();
        Self {
            free,
            slots: vec![Slot::default(); capacity as usize],
        }
    }

    /// Issue one page. Returns `(index, generation)`.
    pub fn pop(&mut self) -> Option<(u32, u32)> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.allocated, "free stack held an issued page {index}");
        slot.allocated = true;
        Some((index, slot.generation))
    }

    /// Issue `count` pages, or none at all if fewer are free.
    pub fn take(&mut self, count: usize) -> Option<Vec<(u32, u32)>> {
        if self.free.len() < count {
            return None;
        }
        let mut issued = Vec::with_capacity(count);
        for _ in 0..count {
            // Length checked above.
            issued.push(self.pop()?);
        }
        Some(issued)
    }

    /// Check that `(index, generation)` names a currently issued page.
    pub fn validate(&self, index: u32, generation: u32) -> Result<(), SlotError> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(SlotError::OutOfRange {
                index,
                capacity: self.capacity(),
            })?;
        if slot.generation != generation {
            return Err(SlotError::StaleGeneration {
                index,
                handle: generation,
                current: slot.generation,
            });
        }
        if !slot.allocated {
            return Err(SlotError::NotAllocated { index });
        }
        Ok(())
    }

    /// Return an issued page to the free stack and bump its generation.
    pub fn release(&mut self, index: u32, generation: u32) -> Result<(), SlotError> {
        self.validate(index, generation)?;
        let slot = &mut self.slots[index as usize];
        slot.allocated = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }
}
