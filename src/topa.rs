//! ToPA (Table of Physical Addresses) Builder (spec.md §4.3). Packs N
//! naturally-aligned physical chunks into linked circular descriptor
//! tables with END/STOP markers, the way the teacher's buddy allocator
//! (`memory::buddy_allocator::BuddyAllocator`) packs frames into
//! size-classed blocks: allocate first, link second, roll back everything
//! on any failed step.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::collaborators::{DmaAllocator, DmaBuffer};
use crate::consts::{
    MAX_CHUNK_ORDER, MAX_NUM_CHUNKS, MAX_PER_TRACE_SPACE, PAGE_SHIFT, PAGE_SIZE, TABLE_ENTRIES,
    TOPA_END_BIT, TOPA_PHYS_MASK, TOPA_SIZE_SHIFT, TOPA_STOP_BIT,
};
use crate::descriptor_table::TraceSlot;
use crate::error::{IptError, IptResult};

/// `num_tables` per I6: `ceil((num_chunks + num_end_entries) / TABLE_ENTRIES)`
/// with `num_end_entries = ceil((num_chunks - 1) / (TABLE_ENTRIES - 1))`.
fn compute_num_tables(num_chunks: u32) -> u32 {
    let n = num_chunks as u64;
    let t = TABLE_ENTRIES as u64;
    let num_end_entries = div_ceil(n - 1, t - 1);
    div_ceil(n + num_end_entries, t) as u32
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Builds a slot's ToPA tables in place. On any failure, everything
/// allocated by this call is released before returning, leaving the slot
/// untouched (spec.md §4.3, rollback order: topas then chunks).
pub fn build(
    slot: &mut TraceSlot,
    allocator: &dyn DmaAllocator,
    num_chunks: u32,
    chunk_order: u32,
    is_circular: bool,
    output_topa_multi: bool,
) -> IptResult<()> {
    if num_chunks == 0 || num_chunks > MAX_NUM_CHUNKS {
        return Err(IptError::InvalidArgs);
    }
    if chunk_order > MAX_CHUNK_ORDER {
        return Err(IptError::InvalidArgs);
    }
    let chunk_pages = 1usize << chunk_order;
    let chunk_bytes = chunk_pages * PAGE_SIZE;
    let total_bytes = chunk_bytes
        .checked_mul(num_chunks as usize)
        .ok_or(IptError::InvalidArgs)?;
    if total_bytes > MAX_PER_TRACE_SPACE {
        return Err(IptError::InvalidArgs);
    }

    let align_bytes = 1usize << (chunk_order + PAGE_SHIFT);

    let num_tables = compute_num_tables(num_chunks);
    if !output_topa_multi && num_tables > 1 {
        return Err(IptError::NotSupported);
    }
    let entry_count = num_chunks as u64 + num_tables as u64;
    if !output_topa_multi && entry_count > 2 {
        return Err(IptError::NotSupported);
    }

    let chunks = match allocate_chunks(allocator, num_chunks, chunk_bytes, align_bytes) {
        Ok(chunks) => chunks,
        Err(e) => return Err(e),
    };

    let mut topas = match allocate_tables(allocator, num_tables) {
        Ok(topas) => topas,
        Err(e) => {
            release_chunks(chunks);
            return Err(e);
        }
    };

    fill_tables(&mut topas, &chunks, chunk_order, is_circular);

    slot.num_chunks = num_chunks;
    slot.chunk_order = chunk_order;
    slot.is_circular = is_circular;
    slot.num_tables = num_tables;
    slot.chunks = chunks;
    slot.topas = topas;
    slot.allocated = true;

    Ok(())
}

fn allocate_chunks(
    allocator: &dyn DmaAllocator,
    num_chunks: u32,
    chunk_bytes: usize,
    align_bytes: usize,
) -> IptResult<Vec<Box<dyn DmaBuffer>>> {
    let mut chunks = Vec::with_capacity(num_chunks as usize);
    for _ in 0..num_chunks {
        let chunk = match allocator.allocate(chunk_bytes, align_bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                release_chunks(chunks);
                return Err(e);
            }
        };
        if chunk.phys_addr().as_u64() & (align_bytes as u64 - 1) != 0 {
            release_chunks(chunks);
            return Err(IptError::Internal);
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn allocate_tables(
    allocator: &dyn DmaAllocator,
    num_tables: u32,
) -> IptResult<Vec<Box<dyn DmaBuffer>>> {
    let table_bytes = TABLE_ENTRIES * 8;
    let mut topas = Vec::with_capacity(num_tables as usize);
    for _ in 0..num_tables {
        match allocator.allocate(table_bytes, PAGE_SIZE) {
            Ok(table) => topas.push(table),
            Err(e) => {
                release_tables(topas);
                return Err(e);
            }
        }
    }
    Ok(topas)
}

/// Writes data entries left to right, one table's worth (`TABLE_ENTRIES -
/// 1` data slots) at a time, then overwrites the END slot of every table
/// and STOP on the final data entry when non-circular (spec.md §4.3 steps
/// 4-7).
fn fill_tables(
    topas: &mut [Box<dyn DmaBuffer>],
    chunks: &[Box<dyn DmaBuffer>],
    chunk_order: u32,
    is_circular: bool,
) {
    let size_log2 = chunk_order + PAGE_SHIFT;
    let data_capacity = TABLE_ENTRIES - 1;
    let num_tables = topas.len();

    // Addresses are captured up front so that writing into one table's
    // words never needs a live borrow of another table's `Box`.
    let table_phys: Vec<u64> = topas
        .iter()
        .map(|t| t.phys_addr().as_u64() & TOPA_PHYS_MASK)
        .collect();

    let mut chunk_iter = chunks.iter();
    let mut last_data_entry: Option<(usize, usize)> = None;

    for table_idx in 0..num_tables {
        let words = table_words_mut(&mut *topas[table_idx]);
        let mut filled = 0usize;
        while filled < data_capacity {
            let chunk = match chunk_iter.next() {
                Some(c) => c,
                None => break,
            };
            let entry = (chunk.phys_addr().as_u64() & TOPA_PHYS_MASK)
                | ((size_log2 as u64) << TOPA_SIZE_SHIFT);
            words[filled] = entry;
            last_data_entry = Some((table_idx, filled));
            filled += 1;
        }

        let next_table = (table_idx + 1) % num_tables;
        let end_entry = table_phys[next_table] | TOPA_END_BIT;
        words[filled] = end_entry;
    }
    debug_assert!(chunk_iter.next().is_none(), "fill_tables: chunks left over");

    if !is_circular {
        if let Some((table_idx, slot)) = last_data_entry {
            let words = table_words_mut(&mut *topas[table_idx]);
            words[slot] |= TOPA_STOP_BIT;
        }
    }
}

/// Borrows `table`'s backing memory as ToPA words for writing, tying the
/// slice's lifetime to the borrow of `table` itself so two calls can never
/// alias.
fn table_words_mut(table: &mut dyn DmaBuffer) -> &mut [u64] {
    // SAFETY: `table` is a freshly allocated, exclusively owned DMA buffer
    // sized for exactly `TABLE_ENTRIES` 64-bit words (see `allocate_tables`);
    // the `&mut` borrow of `table` excludes any other reference to its
    // backing memory for the lifetime of the returned slice.
    unsafe { core::slice::from_raw_parts_mut(table.virt_ptr() as *mut u64, TABLE_ENTRIES) }
}

/// Read-only counterpart of `table_words_mut`, for inspecting a table
/// without needing exclusive access to it.
fn table_words(table: &dyn DmaBuffer) -> &[u64] {
    // SAFETY: see `table_words_mut`; software has read access to ToPA
    // tables any time it is not racing hardware, i.e. whenever it holds
    // even a shared reference to the owning `DmaBuffer`.
    unsafe { core::slice::from_raw_parts(table.virt_ptr() as *const u64, TABLE_ENTRIES) }
}

fn release_chunks(chunks: Vec<Box<dyn DmaBuffer>>) {
    drop(chunks);
}

fn release_tables(topas: Vec<Box<dyn DmaBuffer>>) {
    drop(topas);
}

/// Releases a slot's chunks and tables and clears its sizing fields
/// (spec.md §4.3 free path).
pub fn free(slot: &mut TraceSlot) {
    release_tables(core::mem::take(&mut slot.topas));
    release_chunks(core::mem::take(&mut slot.chunks));
    slot.num_chunks = 0;
    slot.num_tables = 0;
    slot.chunk_order = 0;
    slot.is_circular = false;
    slot.allocated = false;
}
