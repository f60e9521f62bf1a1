//! Lifecycle State Machine (spec.md §4.6): the operation surface under a
//! single mutex, rejecting any operation whose precondition is not met.
//! One `Mutex` held for the full operation, no nested locking, matching
//! §5's concurrency model and the teacher's habit of a single `spin::Mutex`
//! guarding one piece of shared state for its entire critical section
//! (`drivers::pci::CONFIG_ADDRESS_PORT`, `memory::INSTANCE`).

use alloc::vec::Vec;
use spin::Mutex;

use crate::bridge;
use crate::capabilities::{self, Capabilities};
use crate::capture;
use crate::collaborators::{
    ControlChannel, CpuCounter, CpuId, DmaAllocator, Handle, HandleDuplicator, Owner,
    CHUNK_HANDLE_RIGHTS,
};
use crate::consts::{MAX_NUM_TRACES, STATUS_ERROR_MASK};
use crate::descriptor_table::DescriptorTable;
use crate::error::{IptError, IptResult};
use crate::protocol::{BufferConfig, BufferInfo, TraceConfig, TraceMode};
use crate::topa;
use crate::validate::{self, Ctl};

struct Inner {
    mode: Option<TraceMode>,
    traces: DescriptorTable,
    active: bool,
    /// Set when best-effort teardown could not fully release privileged
    /// state; further operations become `BadState` rather than retrying
    /// (spec.md §5, §9).
    degraded: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            mode: None,
            traces: DescriptorTable::default(),
            active: false,
            degraded: false,
        }
    }
}

/// One open IPT trace device. Holds references to the host's collaborators
/// (spec.md §1) for its entire lifetime; construction probes capabilities
/// once.
pub struct IptDevice<'a> {
    caps: Capabilities,
    dma: &'a dyn DmaAllocator,
    control: &'a dyn ControlChannel,
    cpus: &'a dyn CpuCounter,
    handles: &'a dyn HandleDuplicator,
    inner: Mutex<Inner>,
}

impl<'a> IptDevice<'a> {
    pub fn new(
        cpuid: &dyn CpuId,
        dma: &'a dyn DmaAllocator,
        control: &'a dyn ControlChannel,
        cpus: &'a dyn CpuCounter,
        handles: &'a dyn HandleDuplicator,
    ) -> IptResult<Self> {
        let caps = capabilities::probe(cpuid).map_err(|_| IptError::NotSupported)?;
        Ok(Self {
            caps,
            dma,
            control,
            cpus,
            handles,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn alloc_trace(&self, mode: TraceMode, num_traces: u32) -> IptResult<()> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if !self.caps.supported || !self.caps.output_topa || inner.traces.is_present() {
            return Err(IptError::BadState);
        }

        if mode == TraceMode::Threads {
            return Err(IptError::NotSupported);
        }
        if num_traces != self.cpus.num_cpus() || num_traces > MAX_NUM_TRACES {
            return Err(IptError::InvalidArgs);
        }

        inner.traces.allocate_vector(num_traces)?;

        if let Err(e) = bridge::alloc_trace(self.control) {
            inner.traces = DescriptorTable::default();
            return Err(e);
        }

        inner.mode = Some(mode);
        Ok(())
    }

    pub fn free_trace(&self) -> IptResult<()> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if inner.active || inner.traces.iter().any(|s| s.assigned) {
            return Err(IptError::BadState);
        }
        if !inner.traces.is_present() {
            return Err(IptError::BadState);
        }

        bridge::free_trace(self.control)?;
        inner.traces.clear()?;
        inner.mode = None;
        Ok(())
    }

    pub fn get_trace_config(&self) -> IptResult<TraceConfig> {
        let inner = self.inner.lock();
        self.check_not_degraded(&inner)?;
        if !inner.traces.is_present() {
            return Err(IptError::BadState);
        }
        Ok(TraceConfig {
            mode: inner.mode.unwrap_or(TraceMode::Cpus),
            num_traces: inner.traces.len() as u32,
        })
    }

    pub fn alloc_buffer(
        &self,
        num_chunks: u32,
        chunk_order: u32,
        is_circular: bool,
        ctl: u64,
        cr3_match: u64,
        addr_ranges: &[(u64, u64)],
    ) -> IptResult<u32> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if !inner.traces.is_present() {
            return Err(IptError::BadState);
        }

        validate::validate_ctl(&self.caps, ctl, cr3_match, addr_ranges)?;

        let idx = inner.traces.find_free()?;
        let slot = inner.traces.slot_mut(idx)?;

        topa::build(
            slot,
            self.dma,
            num_chunks,
            chunk_order,
            is_circular,
            self.caps.output_topa_multi,
        )?;

        slot.regs.ctl = ctl;
        slot.regs.output_base = slot.topas[0].phys_addr().as_u64();
        slot.regs.output_mask_ptrs = 0;
        slot.regs.cr3_match = cr3_match;
        for (dst, src) in slot.regs.addr_ranges.iter_mut().zip(addr_ranges.iter()) {
            *dst = *src;
        }

        Ok(idx as u32)
    }

    pub fn free_buffer(&self, descriptor: u32) -> IptResult<()> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if inner.active {
            return Err(IptError::BadState);
        }
        let slot = inner.traces.slot_mut(descriptor as usize)?;
        if !slot.allocated || slot.assigned {
            return Err(IptError::BadState);
        }

        topa::free(slot);
        Ok(())
    }

    /// Thread-mode semantics are unspecified (spec.md §9 Open Question);
    /// this path always rejects, matching the source's stub.
    pub fn assign_thread_buffer(&self) -> IptResult<()> {
        Err(IptError::NotSupported)
    }

    /// See `assign_thread_buffer`.
    pub fn release_thread_buffer(&self) -> IptResult<()> {
        Err(IptError::NotSupported)
    }

    pub fn get_buffer_config(&self, descriptor: u32) -> IptResult<BufferConfig> {
        let inner = self.inner.lock();
        self.check_not_degraded(&inner)?;
        let slot = inner.traces.slot(descriptor as usize)?;
        if !slot.allocated {
            return Err(IptError::BadState);
        }
        Ok(BufferConfig {
            num_chunks: slot.num_chunks,
            chunk_order: slot.chunk_order,
            is_circular: slot.is_circular,
            ctl: slot.regs.ctl,
            cr3_match: slot.regs.cr3_match,
            addr_ranges: slot.regs.addr_ranges,
        })
    }

    pub fn get_buffer_info(&self, descriptor: u32) -> IptResult<BufferInfo> {
        let inner = self.inner.lock();
        self.check_not_degraded(&inner)?;
        let slot = inner.traces.slot(descriptor as usize)?;
        if !slot.allocated {
            return Err(IptError::BadState);
        }
        let threads_mode = inner.mode == Some(TraceMode::Threads);
        if !threads_mode && inner.active {
            return Err(IptError::BadState);
        }
        Ok(BufferInfo {
            capture_end: capture::compute_capture(slot) as u64,
        })
    }

    pub fn get_chunk_handle(&self, descriptor: u32, chunk_num: u32) -> IptResult<Handle> {
        let inner = self.inner.lock();
        self.check_not_degraded(&inner)?;
        let slot = inner.traces.slot(descriptor as usize)?;
        if !slot.allocated {
            return Err(IptError::BadState);
        }
        if chunk_num >= slot.num_chunks {
            return Err(IptError::InvalidArgs);
        }
        let handle = slot.chunks[chunk_num as usize].handle();
        self.handles.duplicate(handle, CHUNK_HANDLE_RIGHTS)
    }

    pub fn start(&self) -> IptResult<()> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if inner.active || inner.mode != Some(TraceMode::Cpus) {
            return Err(IptError::BadState);
        }
        if inner
            .traces
            .iter()
            .any(|s| !s.allocated || s.assigned)
        {
            return Err(IptError::BadState);
        }

        let num_traces = inner.traces.len();
        let mut staged = Vec::with_capacity(num_traces);
        let mut stage_err = None;

        for i in 0..num_traces {
            let slot = inner.traces.slot_mut(i)?;
            let mut staged_regs = slot.regs;
            staged_regs.ctl |= Ctl::TOPA.bits() | Ctl::TRACE_EN.bits();

            match bridge::stage_trace_data(self.control, i as u32, &staged_regs) {
                Ok(()) => {
                    slot.owner = Some(Owner::Cpu(i as u32));
                    slot.regs = staged_regs;
                    slot.assigned = true;
                    staged.push(i);
                }
                Err(e) => {
                    stage_err = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = stage_err {
            self.unstage(&mut inner, &staged);
            return Err(e);
        }

        bridge::start(self.control)?;
        inner.active = true;
        Ok(())
    }

    /// Best-effort unwind of partially-staged slots after a mid-loop
    /// failure in `start` (spec.md §9: "either unstage successfully-staged
    /// slots before returning, or seal the device"). Falls back to sealing
    /// the device if unstaging itself fails.
    fn unstage(&self, inner: &mut Inner, staged: &[usize]) {
        for &i in staged {
            let slot = match inner.traces.slot_mut(i) {
                Ok(s) => s,
                Err(_) => continue,
            };
            slot.regs.ctl &= !(Ctl::TOPA.bits() | Ctl::TRACE_EN.bits());
            if bridge::stage_trace_data(self.control, i as u32, &slot.regs).is_err() {
                crate::error!("start: failed to unstage slot {} after partial failure", i);
                inner.degraded = true;
                continue;
            }
            slot.assigned = false;
        }
    }

    pub fn stop(&self) -> IptResult<()> {
        let mut inner = self.inner.lock();
        self.check_not_degraded(&inner)?;

        if !inner.active {
            return Err(IptError::BadState);
        }

        bridge::stop(self.control)?;
        inner.active = false;

        if inner.mode == Some(TraceMode::Cpus) {
            let num_traces = inner.traces.len();
            for i in 0..num_traces {
                let regs = bridge::get_trace_data(self.control, i as u32)?;
                let slot = inner.traces.slot_mut(i)?;
                if regs.status & STATUS_ERROR_MASK != 0 {
                    crate::error!("stop: trace slot {} reported a hardware error", i);
                }
                slot.regs = regs;
                slot.assigned = false;
            }
        }

        Ok(())
    }

    /// Forces STOP and FREE_TRACE, ignoring their errors, and always
    /// releases memory the device still owns (spec.md §5, §7). Marks the
    /// device permanently unusable if the privileged FREE_TRACE fails.
    pub fn release(&self) {
        let mut inner = self.inner.lock();

        if inner.active {
            let _ = bridge::stop(self.control);
            inner.active = false;
        }

        if inner.traces.is_present() {
            for slot in inner.traces.iter_mut() {
                slot.assigned = false;
                if slot.allocated {
                    topa::free(slot);
                }
            }
            if bridge::free_trace(self.control).is_err() {
                crate::error!("release: privileged FREE_TRACE failed, sealing device");
                inner.degraded = true;
            }
            inner.traces = DescriptorTable::default();
            inner.mode = None;
        }
    }

    fn check_not_degraded(&self, inner: &Inner) -> IptResult<()> {
        if inner.degraded {
            Err(IptError::BadState)
        } else {
            Ok(())
        }
    }
}
