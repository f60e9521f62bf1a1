//! User-space control plane for an Intel Processor Trace driver: capability
//! discovery, ToPA descriptor-table construction, the buffer lifecycle
//! state machine, and control-bit validation. Device-driver host bindings
//! (open/close/ioctl dispatch), the kernel-side MSR programming that
//! actually runs tracing, and trace decoding are external collaborators,
//! not part of this crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bridge;
pub mod capabilities;
pub mod capture;
pub mod collaborators;
pub mod consts;
pub mod descriptor_table;
pub mod error;
pub mod lifecycle;
#[macro_use]
pub mod logging;
pub mod protocol;
#[cfg(test)]
mod test_support;
pub mod topa;
pub mod validate;

pub use capabilities::Capabilities;
pub use error::{IptError, IptResult};
pub use lifecycle::IptDevice;
