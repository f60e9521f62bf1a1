//! External collaborators the core consumes but does not implement
//! (spec.md §1): CPU identification, a contiguous/aligned DMA allocator, a
//! privileged control channel, a CPU count query, and handle duplication
//! with rights masking. Modeled as traits the way the teacher isolates
//! hardware access behind small structs (`arch::x86_64::registers`,
//! `drivers::pci::PCIDevice`) rather than inlining `asm!`/port I/O at call
//! sites.

use alloc::vec::Vec;
use x86_64::PhysAddr;

use crate::error::IptResult;

/// One `cpuid` leaf/subleaf result.
#[derive(Debug, Copy, Clone, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub trait CpuId {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// A single physically-contiguous, naturally-aligned DMA buffer.
///
/// `phys` is the base physical address; `virt` is the mapping the core uses
/// to fill ToPA table contents. The buffer owns its backing memory for as
/// long as it is alive; dropping it (or calling `free` on the allocator) is
/// the only release path.
pub trait DmaBuffer {
    fn phys_addr(&self) -> PhysAddr;
    fn virt_ptr(&self) -> *mut u8;
    fn size_bytes(&self) -> usize;
    /// A duplicable reference to the buffer's backing memory object, used by
    /// `get_chunk_handle` (spec.md §4.8).
    fn handle(&self) -> Handle;
}

pub trait DmaAllocator {
    /// Allocates `size_bytes` (a multiple of `PAGE_SIZE`) of physically
    /// contiguous memory, naturally aligned to `align_bytes`
    /// (`2^(chunk_order + PAGE_SHIFT)`, also a power of two).
    fn allocate(
        &self,
        size_bytes: usize,
        align_bytes: usize,
    ) -> IptResult<alloc::boxed::Box<dyn DmaBuffer>>;
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Rights: u32 {
        const TRANSFER = 1 << 0;
        const WAIT = 1 << 1;
        const INSPECT = 1 << 2;
        const GET_PROPERTY = 1 << 3;
        const READ = 1 << 4;
        const MAP = 1 << 5;
        const WRITE = 1 << 6;
        const DUPLICATE = 1 << 7;
    }
}

/// Rights chunk handles are narrowed to before being handed to a caller
/// (spec.md §4.8): read-only mapping plus the bookkeeping rights, nothing
/// that would let a consumer mutate hardware-owned trace data.
pub const CHUNK_HANDLE_RIGHTS: Rights = Rights::from_bits_truncate(
    Rights::TRANSFER.bits()
        | Rights::WAIT.bits()
        | Rights::INSPECT.bits()
        | Rights::GET_PROPERTY.bits()
        | Rights::READ.bits()
        | Rights::MAP.bits(),
);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Handle {
    pub raw: u32,
    pub rights: Rights,
}

pub trait HandleDuplicator {
    /// Duplicates `handle`, narrowing its rights to `rights & handle.rights`.
    fn duplicate(&self, handle: Handle, rights: Rights) -> IptResult<Handle>;
}

pub trait CpuCounter {
    fn num_cpus(&self) -> u32;
}

/// Identifies a per-CPU/per-thread owner the way spec.md §3 tags `owner` by
/// `mode` without reading both fields of a union.
#[derive(Debug, Copy, Clone)]
pub enum Owner {
    Cpu(u32),
    Thread(Handle),
}

/// The privileged trace-control syscall: `(kind, action, descriptor,
/// payload) -> reply`. `kind` is fixed to `INSNTRACE` by the bridge
/// (spec.md §4.7); collaborators only need to implement dispatch on
/// `action`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlAction {
    AllocTrace,
    FreeTrace,
    StageTraceData,
    GetTraceData,
    Start,
    Stop,
}

pub trait ControlChannel {
    /// `descriptor` addresses a trace slot for STAGE/GET; it is unused
    /// (pass `0`) for trace-wide actions. `payload` carries the register
    /// block for STAGE (in) and GET (out); callers pre-size `payload` for
    /// GET replies.
    fn call(
        &self,
        action: ControlAction,
        descriptor: u32,
        payload: &mut Vec<u8>,
    ) -> IptResult<()>;
}
