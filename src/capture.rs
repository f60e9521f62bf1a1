//! Capture Walker (spec.md §4.4): computes bytes captured by walking a
//! slot's tables until the entry named by its saved `output_mask_ptrs`
//! register is found.

use crate::consts::{TABLE_ENTRIES, TOPA_SIZE_SHIFT};
use crate::descriptor_table::TraceSlot;

const OUTPUT_MASK_ENTRY_SHIFT: u32 = 7;
const OUTPUT_MASK_ENTRY_BITS: u64 = (1 << 25) - 1; // bits 7..31
const OUTPUT_MASK_OFFSET_SHIFT: u32 = 32;

/// Walks table 0..num_tables, summing `2^size_log2` for each data entry
/// until the entry at (current table, current entry index) is found, then
/// adds the saved byte offset. A traversal that completes without a match
/// indicates a corrupt register snapshot: logged and reported as 0 bytes
/// captured (spec.md §9: non-fatal data-quality issue).
pub fn compute_capture(slot: &TraceSlot) -> usize {
    let current_entry_idx = ((slot.regs.output_mask_ptrs >> OUTPUT_MASK_ENTRY_SHIFT)
        & OUTPUT_MASK_ENTRY_BITS) as usize;
    let byte_offset = (slot.regs.output_mask_ptrs >> OUTPUT_MASK_OFFSET_SHIFT) as usize;
    let current_table_phys = slot.regs.output_base;

    let data_capacity = TABLE_ENTRIES - 1;
    let mut total = 0usize;

    for table in &slot.topas {
        let words = table_words(table.as_ref());
        let is_current_table = table.phys_addr().as_u64() == current_table_phys;

        for (entry_idx, &word) in words.iter().enumerate().take(data_capacity) {
            if is_current_table && entry_idx == current_entry_idx {
                return total + byte_offset;
            }
            let size_log2 = (word >> TOPA_SIZE_SHIFT) & 0xFF;
            total += 1usize << size_log2;
        }
    }

    crate::error!("capture walker: current entry not found, returning 0");
    0
}

fn table_words(table: &dyn crate::collaborators::DmaBuffer) -> &[u64] {
    // SAFETY: tables are always allocated as exactly `TABLE_ENTRIES` 64-bit
    // words (see topa::allocate_tables); software has exclusive read access
    // once `active == false`, the only time this is called.
    unsafe { core::slice::from_raw_parts(table.virt_ptr() as *const u64, TABLE_ENTRIES) }
}
