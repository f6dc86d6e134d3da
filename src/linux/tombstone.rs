//! Tombstone writing.
//!
//! The tracer child hands the crash over to a [`TombstoneWriter`]. The
//! default one, [`JsonTombstoneWriter`], records the crashing thread, every
//! other thread and the memory maps of the crashed process as a JSON
//! document.

use {
    super::{
        Pid,
        crash_context::{CpuContext, CrashContext, Register},
        errors::WriterError,
        signals::signal_name,
    },
    crate::serializers::serialize_hex,
    error_graph::{ErrorList, WriteErrorList},
    nix::sys::uio::{RemoteIoVec, process_vm_readv},
    std::{
        io::{IoSliceMut, Write},
        path::Path,
    },
};

mod maps;
mod threads;

pub use {maps::Mapping, threads::Thread};

/// Bumped whenever the layout of the JSON tombstone changes
pub const TOMBSTONE_VERSION: u32 = 1;

/// What a tombstone writer is asked to record
#[derive(Copy, Clone)]
pub struct TombstoneRequest<'a> {
    /// The crashed process
    pub pid: Pid,
    /// The thread that received the signal
    pub tid: Pid,
    pub signal: i32,
    pub context: &'a CrashContext,
    /// Where the tombstone goes. Nothing exists there yet.
    pub path: &'a Path,
}

/// Writes the artifact for a crash.
///
/// Called from the tracer child, which is a separate process that may
/// ptrace the crashed one. Returning an error marks the dump as failed.
pub trait TombstoneWriter: Send + Sync {
    fn write_tombstone(&self, request: &TombstoneRequest<'_>) -> Result<(), WriterError>;
}

impl<F> TombstoneWriter for F
where
    F: Fn(&TombstoneRequest<'_>) -> Result<(), WriterError> + Send + Sync,
{
    fn write_tombstone(&self, request: &TombstoneRequest<'_>) -> Result<(), WriterError> {
        self(request)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SignalInfo {
    pub number: i32,
    pub name: &'static str,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pid: Option<u32>,
}

impl SignalInfo {
    fn new(signal: i32, siginfo: &libc::signalfd_siginfo) -> Self {
        let user = siginfo.ssi_code <= 0;
        Self {
            number: signal,
            name: signal_name(signal),
            code: siginfo.ssi_code,
            fault_address: (!user).then(|| format!("{:#018x}", siginfo.ssi_addr)),
            sender_pid: user.then_some(siginfo.ssi_pid),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StackContents {
    #[serde(serialize_with = "serialize_hex")]
    pub start: u64,
    /// Hex encoded bytes starting at `start`
    pub bytes: String,
}

#[derive(Debug, serde::Serialize)]
pub struct CrashingThread {
    pub tid: Pid,
    pub name: Option<String>,
    #[serde(serialize_with = "serialize_hex")]
    pub instruction_pointer: u64,
    #[serde(serialize_with = "serialize_hex")]
    pub stack_pointer: u64,
    pub registers: Vec<Register>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackContents>,
}

/// The JSON document written by [`JsonTombstoneWriter`]
#[derive(Debug, serde::Serialize)]
pub struct Tombstone {
    pub version: u32,
    pub timestamp: u64,
    pub pid: Pid,
    pub tid: Pid,
    pub process_name: Option<String>,
    pub cmdline: Vec<String>,
    pub signal: SignalInfo,
    pub crashing_thread: CrashingThread,
    pub threads: Vec<Thread>,
    pub mappings: Vec<Mapping>,
    pub soft_errors: ErrorList<WriterError>,
}

/// Writes a [`Tombstone`] as pretty printed JSON
#[derive(Debug, Clone)]
pub struct JsonTombstoneWriter {
    stack_bytes: usize,
    suspend_threads: bool,
}

impl Default for JsonTombstoneWriter {
    fn default() -> Self {
        Self {
            stack_bytes: 256,
            suspend_threads: true,
        }
    }
}

impl JsonTombstoneWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many bytes above the crashing thread's stack pointer are recorded
    pub fn stack_bytes(&mut self, stack_bytes: usize) -> &mut Self {
        self.stack_bytes = stack_bytes;
        self
    }

    /// Whether the other threads are stopped with ptrace while the tombstone
    /// is gathered, which also provides their registers on some architectures
    pub fn suspend_threads(&mut self, suspend_threads: bool) -> &mut Self {
        self.suspend_threads = suspend_threads;
        self
    }

    /// Gathers everything about the crashed process. Nothing in here is
    /// fatal, failures end up in the soft error list.
    pub fn gather(&self, request: &TombstoneRequest<'_>) -> Tombstone {
        let mut soft_errors = ErrorList::default();
        let pid = request.pid;

        let mut threads = match threads::enumerate_threads(
            pid,
            soft_errors.subwriter(WriterError::EnumerateThreadsErrors),
        ) {
            Ok(threads) => threads,
            Err(e) => {
                soft_errors.push(e);
                Vec::new()
            }
        };

        if self.suspend_threads {
            threads::suspend_threads(
                &mut threads,
                soft_errors.subwriter(WriterError::SuspendThreadsErrors),
            );
            threads::read_registers(&mut threads, request.tid, &mut soft_errors);
        }

        let crashing_thread = self.crashing_thread(request, &threads, &mut soft_errors);

        let mappings = match maps::read_mappings(pid) {
            Ok(mappings) => mappings,
            Err(e) => {
                soft_errors.push(e);
                Vec::new()
            }
        };

        threads::resume_threads(
            &mut threads,
            soft_errors.subwriter(WriterError::ResumeThreadsErrors),
        );

        let process_name = match read_proc_string(pid, "comm") {
            Ok(name) => Some(name.trim_end().to_owned()),
            Err(e) => {
                soft_errors.push(e);
                None
            }
        };
        let cmdline = match read_proc_string(pid, "cmdline") {
            Ok(cmdline) => cmdline
                .split('\0')
                .filter(|arg| !arg.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(e) => {
                soft_errors.push(e);
                Vec::new()
            }
        };

        Tombstone {
            version: TOMBSTONE_VERSION,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            pid,
            tid: request.tid,
            process_name,
            cmdline,
            signal: SignalInfo::new(request.signal, &request.context.siginfo),
            crashing_thread,
            threads,
            mappings,
            soft_errors,
        }
    }

    fn crashing_thread(
        &self,
        request: &TombstoneRequest<'_>,
        threads: &[Thread],
        soft_errors: &mut ErrorList<WriterError>,
    ) -> CrashingThread {
        let ctx = request.context;
        let mut registers = Vec::new();
        ctx.fill_registers(&mut registers);

        let stack_pointer = ctx.get_stack_pointer();
        let stack = if self.stack_bytes > 0 && stack_pointer != 0 {
            match read_memory(request.pid, stack_pointer, self.stack_bytes) {
                Ok(bytes) => Some(StackContents {
                    start: stack_pointer as u64,
                    bytes: to_hex(&bytes),
                }),
                Err(e) => {
                    soft_errors.push(e);
                    None
                }
            }
        } else {
            None
        };

        CrashingThread {
            tid: request.tid,
            name: threads
                .iter()
                .find(|t| t.tid == request.tid)
                .and_then(|t| t.name.clone()),
            instruction_pointer: ctx.get_instruction_pointer() as u64,
            stack_pointer: stack_pointer as u64,
            registers,
            stack,
        }
    }
}

impl TombstoneWriter for JsonTombstoneWriter {
    fn write_tombstone(&self, request: &TombstoneRequest<'_>) -> Result<(), WriterError> {
        // Claim the path before doing any work, we never overwrite
        let file = std::fs::File::create_new(request.path)
            .map_err(|e| WriterError::CreateFile(request.path.to_owned(), e))?;

        let tombstone = self.gather(request);
        log::debug!(
            "writing tombstone for pid {} to {:?}",
            tombstone.pid,
            request.path
        );

        let mut out = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &tombstone).map_err(WriterError::Serialize)?;
        out.write_all(b"\n").map_err(WriterError::WriteFile)?;
        out.into_inner()
            .map_err(|e| WriterError::WriteFile(e.into_error()))?
            .sync_all()
            .map_err(WriterError::WriteFile)
    }
}

/// Copies `len` bytes at `address` out of the crashed process.
fn read_memory(pid: Pid, address: usize, len: usize) -> Result<Vec<u8>, WriterError> {
    let mut buf = vec![0u8; len];
    let read = process_vm_readv(
        nix::unistd::Pid::from_raw(pid),
        &mut [IoSliceMut::new(&mut buf)],
        &[RemoteIoVec { base: address, len }],
    )
    .map_err(|e| WriterError::ReadStackFailed(address, len, e))?;
    buf.truncate(read);
    Ok(buf)
}

fn read_proc_string(pid: Pid, file: &str) -> Result<String, WriterError> {
    let path = format!("/proc/{pid}/{file}");
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => Err(WriterError::IOError(path, e)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
