//! Logging is an external collaborator (spec.md §1): the core must not
//! assume any particular backend exists. This keeps the teacher's
//! `info!`/`warn!`/`error!` call-site shape (`vga_buffer.rs`) but routes
//! through a pluggable sink registered once by the host, instead of a
//! hardcoded VGA writer.

use core::fmt::Arguments;
use spin::Once;

pub trait LogSink: Sync {
    fn log(&self, level: Level, args: Arguments);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Registers the host's log sink. Idempotent: later calls are ignored, the
/// same way `Capabilities` probing below is a one-shot.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

#[doc(hidden)]
pub fn dispatch(level: Level, args: Arguments) {
    if let Some(sink) = SINK.get() {
        sink.log(level, args);
    }
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logging::dispatch($crate::logging::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logging::dispatch($crate::logging::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::dispatch($crate::logging::Level::Error, format_args!($($arg)*))
    };
}
