//! Capability Probe (spec.md §4.1). Reads CPU identification once per
//! process and caches the result, the way the teacher's
//! `drivers::cpuid::CPUInfo::instance` guards a `OnceCell` with
//! `try_init_once` so a second probe is a no-op rather than redoing `cpuid`.

use conquer_once::spin::OnceCell;

use crate::collaborators::CpuId;

const LEAF_FEATURES: u32 = 0x01;
const LEAF_EXT_FEATURES: u32 = 0x07;
const LEAF_PT: u32 = 0x14;
const LEAF_TSC_FREQ: u32 = 0x15;

const LEAF7_EBX_IPT_BIT: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported;

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supported: bool,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,

    pub addr_cfg_max: u32,
    pub mtc_freq_mask: u32,
    pub cyc_thresh_mask: u32,
    pub psb_freq_mask: u32,
    pub num_addr_ranges: u32,
    pub bus_freq: Option<f64>,

    pub cr3_filtering: bool,
    pub psb: bool,
    pub ip_filtering: bool,
    pub mtc: bool,
    pub ptwrite: bool,
    pub power_events: bool,
    pub output_topa: bool,
    pub output_topa_multi: bool,
    pub output_single: bool,
    pub output_transport: bool,
    pub lip: bool,
}

static CAPS: OnceCell<Capabilities> = OnceCell::uninit();

/// Probes CPU identification leaves 0x01, 0x07/0, 0x14/0, 0x14/1 and 0x15,
/// caching the result process-wide. Idempotent: later calls return the
/// cached value without touching `cpuid` again.
pub fn probe(cpuid: &dyn CpuId) -> Result<Capabilities, Unsupported> {
    if let Some(caps) = CAPS.get() {
        return Ok(*caps);
    }

    let caps = probe_uncached(cpuid)?;
    // Another thread may have won the race; either outcome is the same
    // cached value, so ignore a losing `try_init_once`.
    let _ = CAPS.try_init_once(|| caps);
    Ok(*CAPS.get().unwrap())
}

fn probe_uncached(cpuid: &dyn CpuId) -> Result<Capabilities, Unsupported> {
    let leaf0 = cpuid.cpuid(0x00, 0);
    if leaf0.eax < LEAF_PT {
        return Err(Unsupported);
    }

    let leaf7 = cpuid.cpuid(LEAF_EXT_FEATURES, 0);
    if leaf7.ebx & (1 << LEAF7_EBX_IPT_BIT) == 0 {
        return Err(Unsupported);
    }

    let leaf1 = cpuid.cpuid(LEAF_FEATURES, 0);
    let stepping = leaf1.eax & 0xF;
    let base_model = (leaf1.eax >> 4) & 0xF;
    let base_family = (leaf1.eax >> 8) & 0xF;
    let ext_model = (leaf1.eax >> 16) & 0xF;
    let ext_family = (leaf1.eax >> 20) & 0xFF;
    let family = if base_family == 0xF {
        base_family + ext_family
    } else {
        base_family
    };
    let model = if base_family == 0x6 || base_family == 0xF {
        (ext_model << 4) | base_model
    } else {
        base_model
    };

    let pt0 = cpuid.cpuid(LEAF_PT, 0);
    let pt1 = cpuid.cpuid(LEAF_PT, 1);

    let num_addr_ranges = pt1.eax & 0x7;

    let bus_freq = {
        let freq = cpuid.cpuid(LEAF_TSC_FREQ, 0);
        if freq.eax != 0 && freq.ebx != 0 {
            Some(freq.eax as f64 / freq.ebx as f64)
        } else {
            None
        }
    };

    Ok(Capabilities {
        supported: true,
        family,
        model,
        stepping,

        addr_cfg_max: pt1.eax & 0x7,
        mtc_freq_mask: (pt1.eax >> 16) & 0xFFFF,
        cyc_thresh_mask: pt1.ebx & 0xFFFF,
        psb_freq_mask: (pt1.ebx >> 16) & 0xFFFF,
        num_addr_ranges,
        bus_freq,

        cr3_filtering: pt0.ebx & (1 << 0) != 0,
        psb: pt0.ebx & (1 << 1) != 0,
        ip_filtering: pt0.ebx & (1 << 2) != 0,
        mtc: pt0.ebx & (1 << 3) != 0,
        ptwrite: pt0.ebx & (1 << 4) != 0,
        power_events: pt0.ebx & (1 << 5) != 0,
        output_topa: pt0.ecx & (1 << 0) != 0,
        output_topa_multi: pt0.ecx & (1 << 1) != 0,
        output_single: pt0.ecx & (1 << 2) != 0,
        output_transport: pt0.ecx & (1 << 3) != 0,
        lip: pt0.ecx & (1 << 31) != 0,
    })
}
