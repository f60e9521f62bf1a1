//! Descriptor Table (spec.md §4.2): owns the vector of per-trace slots and
//! enforces slot-state invariants. Linear scan for the first free slot,
//! grounded on the teacher's own comment in `memory::buddy_allocator`
//! about preferring simple, debuggable linear structures over cleverness
//! when N is small (spec.md §9: "ordering determinism aids debugging").

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::collaborators::{DmaBuffer, Owner};
use crate::consts::MAX_ADDR_RANGES;
use crate::error::{IptError, IptResult};

/// Saved hardware register state for one trace slot (spec.md §3).
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceRegisters {
    pub ctl: u64,
    pub status: u64,
    pub output_base: u64,
    pub output_mask_ptrs: u64,
    pub cr3_match: u64,
    pub addr_ranges: [(u64, u64); MAX_ADDR_RANGES],
}

pub struct TraceSlot {
    pub owner: Option<Owner>,
    pub allocated: bool,
    pub assigned: bool,

    pub num_chunks: u32,
    pub chunk_order: u32,
    pub is_circular: bool,
    pub num_tables: u32,

    pub chunks: Vec<Box<dyn DmaBuffer>>,
    pub topas: Vec<Box<dyn DmaBuffer>>,

    pub regs: TraceRegisters,
}

impl Default for TraceSlot {
    fn default() -> Self {
        Self {
            owner: None,
            allocated: false,
            assigned: false,
            num_chunks: 0,
            chunk_order: 0,
            is_circular: false,
            num_tables: 0,
            chunks: Vec::new(),
            topas: Vec::new(),
            regs: TraceRegisters::default(),
        }
    }
}

/// Owns the slot vector for a bound device (spec.md §4.2).
#[derive(Default)]
pub struct DescriptorTable {
    slots: Option<Vec<TraceSlot>>,
}

impl DescriptorTable {
    pub fn is_present(&self) -> bool {
        self.slots.is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, |s| s.len())
    }

    /// Creates `n` zeroed slots. Fails if a trace array already exists.
    pub fn allocate_vector(&mut self, n: u32) -> IptResult<()> {
        if self.slots.is_some() {
            return Err(IptError::BadState);
        }
        let mut slots = Vec::with_capacity(n as usize);
        slots.resize_with(n as usize, TraceSlot::default);
        self.slots = Some(slots);
        Ok(())
    }

    /// Returns the first index with `allocated == false`.
    pub fn find_free(&mut self) -> IptResult<usize> {
        let slots = self.slots.as_ref().ok_or(IptError::BadState)?;
        slots
            .iter()
            .position(|s| !s.allocated)
            .ok_or(IptError::NoResources)
    }

    pub fn slot(&self, i: usize) -> IptResult<&TraceSlot> {
        self.slots
            .as_ref()
            .and_then(|s| s.get(i))
            .ok_or(IptError::InvalidArgs)
    }

    pub fn slot_mut(&mut self, i: usize) -> IptResult<&mut TraceSlot> {
        self.slots
            .as_mut()
            .and_then(|s| s.get_mut(i))
            .ok_or(IptError::InvalidArgs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceSlot> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TraceSlot> {
        self.slots.iter_mut().flatten()
    }

    /// Destroys the vector iff no slot is currently assigned.
    pub fn clear(&mut self) -> IptResult<()> {
        if self.slots.is_none() {
            return Err(IptError::BadState);
        }
        if self.iter().any(|s| s.assigned) {
            return Err(IptError::BadState);
        }
        self.slots = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_free_returns_no_resources_when_full() {
        let mut table = DescriptorTable::default();
        table.allocate_vector(2).unwrap();
        table.slot_mut(0).unwrap().allocated = true;
        table.slot_mut(1).unwrap().allocated = true;
        assert_eq!(table.find_free().unwrap_err(), IptError::NoResources);
    }

    #[test]
    fn find_free_picks_lowest_index() {
        let mut table = DescriptorTable::default();
        table.allocate_vector(3).unwrap();
        table.slot_mut(1).unwrap().allocated = true;
        assert_eq!(table.find_free().unwrap(), 0);
        table.slot_mut(0).unwrap().allocated = true;
        assert_eq!(table.find_free().unwrap(), 2);
    }

    #[test]
    fn clear_rejects_when_assigned() {
        let mut table = DescriptorTable::default();
        table.allocate_vector(1).unwrap();
        table.slot_mut(0).unwrap().assigned = true;
        assert_eq!(table.clear().unwrap_err(), IptError::BadState);
    }

    #[test]
    fn double_allocate_vector_is_bad_state() {
        let mut table = DescriptorTable::default();
        table.allocate_vector(1).unwrap();
        assert_eq!(table.allocate_vector(1).unwrap_err(), IptError::BadState);
    }
}
