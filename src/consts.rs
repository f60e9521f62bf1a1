//! Platform constants fixed by the ToPA hardware layout and the trace
//! object's request surface. Collected here the way the teacher kernel
//! gathers its magic numbers at the top of the owning module
//! (`memory::buddy_allocator::MAX_ORDER`, `drivers::pci::CONFIG_ADDRESS`).

/// log2(bytes per page).
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const MAX_NUM_CHUNKS: u32 = 4096;
pub const MAX_CHUNK_ORDER: u32 = 8;
pub const MAX_PER_TRACE_SPACE: usize = 256 * 1024 * 1024;

pub const MAX_NUM_TRACES: u32 = 64;
pub const MAX_ADDR_RANGES: usize = 4;

/// Entries per ToPA table, driven from the hardware's fixed 4 KiB table size:
/// one 64-bit entry per 8 bytes.
pub const TABLE_ENTRIES: usize = PAGE_SIZE / 8;

/// Bit position of the `size_log2` field within a ToPA entry.
pub const TOPA_SIZE_SHIFT: u32 = 6;
pub const TOPA_END_BIT: u64 = 1 << 0;
pub const TOPA_STOP_BIT: u64 = 1 << 4;
pub const TOPA_PHYS_MASK: u64 = !0xFFFu64;

/// IA32_RTIT_STATUS error bit, checked after STOP (spec.md §4.6).
pub const STATUS_ERROR_MASK: u64 = 1 << 4;
