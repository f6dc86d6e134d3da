pub mod alt_stack;
pub mod artifact;
pub mod child_stack;
pub mod crash_context;
pub mod demangle;
mod dispatcher;
pub mod errors;
pub mod handler;
pub mod registry;
pub mod rendezvous;
pub mod signals;
pub mod tombstone;
pub mod tracer;

pub type Pid = i32;

pub use {
    crash_context::{CpuContext, CrashContext, Register},
    handler::{
        DumpCallback, DumpEvent, ExceptionHandler, ExceptionHandlerConfig, make_dump_callback,
    },
    signals::CrashSignal,
    tombstone::{JsonTombstoneWriter, Tombstone, TombstoneRequest, TombstoneWriter},
};

/// Tests that change the process wide signal dispositions take this first
#[cfg(test)]
pub(crate) static DISPOSITION_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
