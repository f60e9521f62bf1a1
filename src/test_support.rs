//! Mock collaborators for unit tests. `no_std` + `alloc` alone cannot fake
//! physical memory or a privileged syscall, so these are only compiled
//! under `#[cfg(test)]`, where the crate pulls in `std`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use x86_64::PhysAddr;

use crate::collaborators::{
    ControlAction, ControlChannel, CpuCounter, CpuId, CpuidResult, DmaAllocator, DmaBuffer,
    Handle, HandleDuplicator, Rights,
};
use crate::error::{IptError, IptResult};

/// A DMA buffer backed by a plain heap allocation. Physical and virtual
/// addresses coincide since there is no real MMU here; alignment is still
/// enforced by the allocator below, matching the real contract.
struct FakeDmaBuffer {
    ptr: *mut u8,
    layout: std::alloc::Layout,
    id: u32,
    live: Arc<AtomicUsize>,
}

// SAFETY: `ptr` is an exclusively owned heap allocation; no aliasing
// references exist while this buffer is alive.
unsafe impl Send for FakeDmaBuffer {}
unsafe impl Sync for FakeDmaBuffer {}

impl DmaBuffer for FakeDmaBuffer {
    fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.ptr as u64)
    }

    fn virt_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn size_bytes(&self) -> usize {
        self.layout.size()
    }

    fn handle(&self) -> Handle {
        Handle {
            raw: self.id,
            rights: Rights::all(),
        }
    }
}

impl Drop for FakeDmaBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeDmaAllocator {
    fail_after: AtomicUsize,
    allocations: AtomicUsize,
    live: Arc<AtomicUsize>,
    next_id: AtomicU32,
}

impl FakeDmaAllocator {
    pub fn new() -> Self {
        Self {
            fail_after: AtomicUsize::new(usize::MAX),
            allocations: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU32::new(1),
        }
    }

    /// Makes the `n`th allocation (0-indexed) fail with `NoMemory`.
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl DmaAllocator for FakeDmaAllocator {
    fn allocate(&self, size_bytes: usize, align_bytes: usize) -> IptResult<Box<dyn DmaBuffer>> {
        let idx = self.allocations.fetch_add(1, Ordering::SeqCst);
        if idx >= self.fail_after.load(Ordering::SeqCst) {
            return Err(IptError::NoMemory);
        }

        let layout = std::alloc::Layout::from_size_align(size_bytes, align_bytes)
            .map_err(|_| IptError::InvalidArgs)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(IptError::NoMemory);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDmaBuffer {
            ptr,
            layout,
            id,
            live: self.live.clone(),
        }))
    }
}

pub struct FakeCpuCounter(pub u32);

impl CpuCounter for FakeCpuCounter {
    fn num_cpus(&self) -> u32 {
        self.0
    }
}

pub struct FakeHandleDuplicator;

impl HandleDuplicator for FakeHandleDuplicator {
    fn duplicate(&self, handle: Handle, rights: Rights) -> IptResult<Handle> {
        Ok(Handle {
            raw: handle.raw,
            rights: handle.rights & rights,
        })
    }
}

/// Records every call it receives and can be told to fail the `n`th
/// invocation of a given action, so tests can assert on both the staged
/// sequence and rollback behavior.
pub struct FakeControlChannel {
    fail: StdMutex<Option<(ControlAction, usize)>>,
    action_counts: StdMutex<Vec<(ControlAction, usize)>>,
    pub calls: StdMutex<Vec<(ControlAction, u32)>>,
}

impl FakeControlChannel {
    pub fn new() -> Self {
        Self {
            fail: StdMutex::new(None),
            action_counts: StdMutex::new(Vec::new()),
            calls: StdMutex::new(Vec::new()),
        }
    }

    /// Fails `action`'s `n`th call (0-indexed); earlier and later calls to
    /// `action`, and all other actions, succeed.
    pub fn fail_nth_call(&self, action: ControlAction, n: usize) {
        *self.fail.lock().unwrap() = Some((action, n));
    }

    /// Fails every call to `action`.
    pub fn fail_action(&self, action: ControlAction) {
        self.fail_nth_call(action, 0);
    }

    fn next_count(&self, action: ControlAction) -> usize {
        let mut counts = self.action_counts.lock().unwrap();
        match counts.iter_mut().find(|(a, _)| *a == action) {
            Some((_, n)) => {
                let this_call = *n;
                *n += 1;
                this_call
            }
            None => {
                counts.push((action, 1));
                0
            }
        }
    }
}

impl ControlChannel for FakeControlChannel {
    fn call(&self, action: ControlAction, descriptor: u32, payload: &mut Vec<u8>) -> IptResult<()> {
        self.calls.lock().unwrap().push((action, descriptor));
        let this_call = self.next_count(action);

        if *self.fail.lock().unwrap() == Some((action, this_call)) {
            return Err(IptError::Internal);
        }
        if action == ControlAction::GetTraceData {
            payload.iter_mut().for_each(|b| *b = 0);
        }
        Ok(())
    }
}

pub struct FakeCpuId {
    pub ipt: bool,
}

impl CpuId for FakeCpuId {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        match (leaf, subleaf) {
            (0x00, _) => CpuidResult { eax: 0x16, ..Default::default() },
            (0x07, 0) => CpuidResult {
                ebx: if self.ipt { 1 << 25 } else { 0 },
                ..Default::default()
            },
            (0x01, _) => CpuidResult { eax: 0x000906EA, ..Default::default() },
            // bit 0 (cr3_filtering) clear: `cr3_filter_rejected_without_capability`
            // relies on this capability being absent. `CAPS` is a process-wide
            // cache (capabilities::probe), so every integration test shares
            // whichever bits are set here — no other test requests CR3_FILTER.
            (0x14, 0) => CpuidResult {
                ebx: 0b0001_1110,
                ecx: 0b0000_0011,
                ..Default::default()
            },
            (0x14, 1) => CpuidResult {
                eax: 0x0004_0004,
                ebx: 0x0004_0004,
                ..Default::default()
            },
            (0x15, _) => CpuidResult { eax: 1, ebx: 1, ..Default::default() },
            _ => CpuidResult::default(),
        }
    }
}
