//! Privileged Bridge (spec.md §4.7): a thin wrapper forwarding
//! staging/retrieval/start/stop/free to the external control channel. The
//! register block it stages/retrieves has a fixed layout (ctl, status,
//! output_base, output_mask_ptrs, cr3_match, addr_ranges[]) so the payload
//! is built/parsed in one place rather than at every call site.

use alloc::vec;
use alloc::vec::Vec;

use crate::collaborators::{ControlAction, ControlChannel};
use crate::descriptor_table::TraceRegisters;
use crate::error::{IptError, IptResult};

const REGISTER_BLOCK_LEN: usize = 6 + 2 * crate::consts::MAX_ADDR_RANGES;

fn encode(regs: &TraceRegisters) -> Vec<u8> {
    let mut words = Vec::with_capacity(REGISTER_BLOCK_LEN);
    words.push(regs.ctl);
    words.push(regs.status);
    words.push(regs.output_base);
    words.push(regs.output_mask_ptrs);
    words.push(regs.cr3_match);
    for (base, mask) in regs.addr_ranges {
        words.push(base);
        words.push(mask);
    }

    let mut bytes = Vec::with_capacity(REGISTER_BLOCK_LEN * 8);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

/// Parses a register block reply. Fails with `BufferTooSmall` rather than
/// panicking if the control channel returned a short payload.
fn decode(bytes: &[u8]) -> IptResult<TraceRegisters> {
    if bytes.len() < REGISTER_BLOCK_LEN * 8 {
        return Err(IptError::BufferTooSmall);
    }

    let word = |i: usize| -> u64 {
        let start = i * 8;
        u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap())
    };

    let mut regs = TraceRegisters {
        ctl: word(0),
        status: word(1),
        output_base: word(2),
        output_mask_ptrs: word(3),
        cr3_match: word(4),
        addr_ranges: Default::default(),
    };
    for (i, slot) in regs.addr_ranges.iter_mut().enumerate() {
        *slot = (word(5 + 2 * i), word(5 + 2 * i + 1));
    }
    Ok(regs)
}

pub fn alloc_trace(channel: &dyn ControlChannel) -> IptResult<()> {
    channel.call(ControlAction::AllocTrace, 0, &mut Vec::new())
}

pub fn free_trace(channel: &dyn ControlChannel) -> IptResult<()> {
    channel.call(ControlAction::FreeTrace, 0, &mut Vec::new())
}

pub fn start(channel: &dyn ControlChannel) -> IptResult<()> {
    channel.call(ControlAction::Start, 0, &mut Vec::new())
}

pub fn stop(channel: &dyn ControlChannel) -> IptResult<()> {
    channel.call(ControlAction::Stop, 0, &mut Vec::new())
}

/// Stages `regs` for `descriptor` so the upcoming START will load it into
/// hardware.
pub fn stage_trace_data(
    channel: &dyn ControlChannel,
    descriptor: u32,
    regs: &TraceRegisters,
) -> IptResult<()> {
    let mut payload = encode(regs);
    channel.call(ControlAction::StageTraceData, descriptor, &mut payload)
}

/// Retrieves the post-stop register snapshot for `descriptor`.
pub fn get_trace_data(channel: &dyn ControlChannel, descriptor: u32) -> IptResult<TraceRegisters> {
    let mut payload = vec![0u8; REGISTER_BLOCK_LEN * 8];
    channel.call(ControlAction::GetTraceData, descriptor, &mut payload)?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShortReplyChannel;

    impl ControlChannel for ShortReplyChannel {
        fn call(&self, action: ControlAction, _descriptor: u32, payload: &mut Vec<u8>) -> IptResult<()> {
            if action == ControlAction::GetTraceData {
                payload.truncate(REGISTER_BLOCK_LEN * 8 - 1);
            }
            Ok(())
        }
    }

    #[test]
    fn get_trace_data_rejects_undersized_reply() {
        let channel = ShortReplyChannel;
        assert_eq!(
            get_trace_data(&channel, 0).unwrap_err(),
            IptError::BufferTooSmall
        );
    }
}
