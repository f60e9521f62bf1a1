//! Control-Bit Validator (spec.md §4.5): masks user-requested control bits
//! against the feature-dependent settable mask and checks sub-field values
//! against hardware-reported masks.

use crate::capabilities::Capabilities;
use crate::error::{IptError, IptResult};

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Ctl: u64 {
        const TRACE_EN = 1 << 0;
        const OS_ALLOWED = 1 << 2;
        const USER_ALLOWED = 1 << 3;
        const CR3_FILTER = 1 << 7;
        const TOPA = 1 << 8;
        const TSC_EN = 1 << 10;
        const DIS_RETC = 1 << 11;
        const BRANCH_EN = 1 << 13;
        const MTC_EN = 1 << 9;
        const PTW_EN = 1 << 12;
        const FUP_ON_PTW = 1 << 5;
        const POWER_EVENT_EN = 1 << 4;
    }
}

const MTC_FREQ_SHIFT: u32 = 14;
const MTC_FREQ_BITS: u64 = 0xF;
const CYC_THRESH_SHIFT: u32 = 19;
const CYC_THRESH_BITS: u64 = 0xF;
const PSB_FREQ_SHIFT: u32 = 24;
const PSB_FREQ_BITS: u64 = 0xF;
const CYC_EN: u64 = 1 << 1;
const ADDR_RANGE_MASK_SHIFT: u32 = 32;
const ADDR_RANGE_MASK_BITS_PER_RANGE: u32 = 4;

/// Builds the settable mask for this feature set (spec.md §4.5).
fn settable_mask(caps: &Capabilities) -> u64 {
    let mut mask =
        Ctl::OS_ALLOWED.bits() | Ctl::USER_ALLOWED.bits() | Ctl::TSC_EN.bits() | Ctl::DIS_RETC.bits() | Ctl::BRANCH_EN.bits();

    if caps.ptwrite {
        mask |= Ctl::PTW_EN.bits() | Ctl::FUP_ON_PTW.bits();
    }
    if caps.cr3_filtering {
        mask |= Ctl::CR3_FILTER.bits();
    }
    if caps.mtc {
        mask |= Ctl::MTC_EN.bits() | (MTC_FREQ_BITS << MTC_FREQ_SHIFT);
    }
    if caps.power_events {
        mask |= Ctl::POWER_EVENT_EN.bits();
    }
    if caps.ip_filtering {
        for k in 0..caps.num_addr_ranges {
            mask |= ((1u64 << ADDR_RANGE_MASK_BITS_PER_RANGE) - 1)
                << (ADDR_RANGE_MASK_SHIFT + k * ADDR_RANGE_MASK_BITS_PER_RANGE);
        }
    }
    if caps.psb {
        mask |= CYC_EN | (PSB_FREQ_BITS << PSB_FREQ_SHIFT) | (CYC_THRESH_BITS << CYC_THRESH_SHIFT);
    }

    mask
}

/// Validates a requested `ctl` value (and, trivially, the CR3/address-range
/// fields, which carry no hardware-mask constraints of their own) against
/// `caps`. `requested_cr3`/`requested_addr_ranges` are accepted as-is once
/// `ctl`'s `CR3_FILTER`/`ADDRk` bits have cleared the settable-mask check;
/// they have no further legality constraints beyond being u64/range pairs.
pub fn validate_ctl(
    caps: &Capabilities,
    requested_ctl: u64,
    _requested_cr3: u64,
    _requested_addr_ranges: &[(u64, u64)],
) -> IptResult<()> {
    let settable = settable_mask(caps);
    if requested_ctl & !settable != 0 {
        return Err(IptError::InvalidArgs);
    }

    let mtc_freq = (requested_ctl >> MTC_FREQ_SHIFT) & MTC_FREQ_BITS;
    if mtc_freq != 0 && (1u64 << mtc_freq) & caps.mtc_freq_mask as u64 == 0 {
        return Err(IptError::InvalidArgs);
    }

    let cyc_thresh = (requested_ctl >> CYC_THRESH_SHIFT) & CYC_THRESH_BITS;
    if cyc_thresh != 0 && (1u64 << cyc_thresh) & caps.cyc_thresh_mask as u64 == 0 {
        return Err(IptError::InvalidArgs);
    }

    let psb_freq = (requested_ctl >> PSB_FREQ_SHIFT) & PSB_FREQ_BITS;
    if psb_freq != 0 && (1u64 << psb_freq) & caps.psb_freq_mask as u64 == 0 {
        return Err(IptError::InvalidArgs);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_all_off() -> Capabilities {
        Capabilities {
            supported: true,
            family: 6,
            model: 0,
            stepping: 0,
            addr_cfg_max: 0,
            mtc_freq_mask: 0,
            cyc_thresh_mask: 0,
            psb_freq_mask: 0,
            num_addr_ranges: 0,
            bus_freq: None,
            cr3_filtering: false,
            psb: false,
            ip_filtering: false,
            mtc: false,
            ptwrite: false,
            power_events: false,
            output_topa: true,
            output_topa_multi: true,
            output_single: false,
            output_transport: false,
            lip: false,
        }
    }

    #[test]
    fn baseline_bits_always_accepted() {
        let caps = caps_all_off();
        let ctl = Ctl::OS_ALLOWED.bits() | Ctl::USER_ALLOWED.bits() | Ctl::TSC_EN.bits() | Ctl::BRANCH_EN.bits();
        assert!(validate_ctl(&caps, ctl, 0, &[]).is_ok());
    }

    #[test]
    fn cr3_filter_rejected_without_capability() {
        let caps = caps_all_off();
        assert_eq!(
            validate_ctl(&caps, Ctl::CR3_FILTER.bits(), 0, &[]).unwrap_err(),
            IptError::InvalidArgs
        );
    }

    #[test]
    fn cr3_filter_accepted_with_capability() {
        let mut caps = caps_all_off();
        caps.cr3_filtering = true;
        assert!(validate_ctl(&caps, Ctl::CR3_FILTER.bits(), 0, &[]).is_ok());
    }

    #[test]
    fn mtc_freq_subfield_checked_against_hw_mask() {
        let mut caps = caps_all_off();
        caps.mtc = true;
        caps.mtc_freq_mask = 0b0010; // only log2 value 1 legal
        let ctl_legal = Ctl::MTC_EN.bits() | (1u64 << MTC_FREQ_SHIFT);
        assert!(validate_ctl(&caps, ctl_legal, 0, &[]).is_ok());

        let ctl_illegal = Ctl::MTC_EN.bits() | (2u64 << MTC_FREQ_SHIFT);
        assert_eq!(
            validate_ctl(&caps, ctl_illegal, 0, &[]).unwrap_err(),
            IptError::InvalidArgs
        );
    }

    #[test]
    fn psb_group_gated_by_capability() {
        let mut caps = caps_all_off();
        caps.psb = true;
        caps.psb_freq_mask = 0b0001;
        caps.cyc_thresh_mask = 0b0001;
        let ctl = CYC_EN | (0u64 << PSB_FREQ_SHIFT) | (0u64 << CYC_THRESH_SHIFT);
        assert!(validate_ctl(&caps, ctl, 0, &[]).is_ok());

        let caps_no_psb = caps_all_off();
        assert_eq!(
            validate_ctl(&caps_no_psb, CYC_EN, 0, &[]).unwrap_err(),
            IptError::InvalidArgs
        );
    }
}
