use {
    crate::serializers::*,
    error_graph::ErrorList,
    std::{ffi::OsString, path::PathBuf},
    thiserror::Error,
};

/// Failures while setting up or registering a handler.
///
/// These only ever occur in a normal context; nothing on the crash path
/// returns an error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("the dump directory path is empty")]
    EmptyDirectory,
    #[error("the dump directory {0:?} contains an interior nul byte")]
    DirectoryContainsNul(OsString),
    #[error("the dump directory {0:?} is too long for a {1} byte artifact path")]
    DirectoryTooLong(PathBuf, usize),
    #[error("failed to create the dump directory {0:?}")]
    CreateDirectory(PathBuf, #[source] std::io::Error),
    #[error("failed to determine the local time offset")]
    LocalTime(#[source] std::io::Error),
    #[error("failed to install the alternate signal stack")]
    AltStack(#[source] nix::Error),
    #[error("failed to save the disposition of signal {0}")]
    SaveDisposition(i32, #[source] nix::Error),
    #[error("failed to install the crash handler for signal {0}")]
    InstallDisposition(i32, #[source] nix::Error),
    #[error("failed to reserve the tracer stack")]
    ReserveTracerStack(#[source] nix::Error),
}

/// Failures while writing a tombstone.
///
/// The fatal ones are returned from
/// [`TombstoneWriter::write_tombstone`](super::tombstone::TombstoneWriter), everything else is
/// collected into the tombstone's soft error list.
#[derive(Debug, Error, serde::Serialize)]
pub enum WriterError {
    #[error("failed to create the tombstone file {0:?}")]
    CreateFile(
        PathBuf,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("failed to write the tombstone")]
    WriteFile(
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("failed to serialize the tombstone")]
    Serialize(
        #[source]
        #[serde(serialize_with = "serialize_json_error")]
        serde_json::Error,
    ),
    #[error("IO error reading {0}")]
    IOError(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("failed to read the memory maps of the crashed process")]
    ReadMapsFailed(
        #[source]
        #[serde(serialize_with = "serialize_proc_error")]
        procfs_core::ProcError,
    ),
    #[error("failed to read a process task entry")]
    ReadProcessThreadEntryFailed(
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("process task entry {0:?} could not be parsed as a TID")]
    ProcessTaskEntryNotTid(OsString),
    #[error("failed to read thread name")]
    ReadThreadNameFailed(
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("failed to read {1} bytes of stack at {0:#x}")]
    ReadStackFailed(
        usize,
        usize,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("ptrace attach of thread {0} failed")]
    PtraceAttachError(
        i32,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("ptrace detach of thread {0} failed")]
    PtraceDetachError(
        i32,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("waitpid for thread {0} failed")]
    WaitPidError(
        i32,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("reading the registers of thread {0} failed")]
    GetRegsFailed(
        i32,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("errors occurred while enumerating threads")]
    EnumerateThreadsErrors(ErrorList<WriterError>),
    #[error("errors occurred while suspending threads")]
    SuspendThreadsErrors(ErrorList<WriterError>),
    #[error("errors occurred while resuming threads")]
    ResumeThreadsErrors(ErrorList<WriterError>),
}
