//! The tracer child.
//!
//! The crashing thread can't be trusted to do much, so the actual tombstone
//! is written from a process cloned off it. The clone gets a copy of our
//! memory (including the crash context), shares our file descriptor table,
//! and is allowed to ptrace us once we grant it permission.

use {
    super::{
        Pid,
        artifact::ArtifactPath,
        child_stack::StackLease,
        crash_context::CrashContext,
        rendezvous::Channel,
        signals,
        tombstone::{TombstoneRequest, TombstoneWriter},
    },
    failspot::failspot,
    nix::{
        errno::Errno,
        sys::{
            signal::{Signal, kill},
            wait::{WaitPidFlag, WaitStatus, waitpid},
        },
    },
    std::time::{Duration, Instant},
};

/// Exit status of the tracer when the tombstone was written
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status of the tracer when the writer reported an error
pub const EXIT_WRITER_FAILED: i32 = 1;
/// Exit status of the tracer when the writer panicked
pub const EXIT_WRITER_PANICKED: i32 = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Everything the tracer needs. It lives on the crashing thread's stack,
/// which the child sees a copy of.
pub struct DumpRequest<'a> {
    /// The crashing process
    pub pid: Pid,
    pub signal: i32,
    pub context: &'a CrashContext,
    pub path: &'a ArtifactPath,
    pub writer: &'a dyn TombstoneWriter,
    pub channel: &'a Channel,
}

/// Entry point of the cloned child
extern "C" fn tracer_entry(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: `arg` is the DumpRequest passed to clone, which the parent keeps
    // alive until we have exited
    let request = unsafe { &*arg.cast::<DumpRequest<'_>>() };

    // Our copy of the dispositions still points at the dispatcher, whose
    // state belongs to the crashed process
    // SAFETY: syscalls
    unsafe { signals::reset_handled_to_default() };

    // Block until we're allowed to ptrace the crashing process
    request.channel.wait_for_go();

    let tombstone = TombstoneRequest {
        pid: request.pid,
        tid: request.context.tid,
        signal: request.signal,
        context: request.context,
        path: request.path.as_path(),
    };

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        request.writer.write_tombstone(&tombstone)
    })) {
        Ok(Ok(())) => EXIT_SUCCESS,
        Ok(Err(e)) => {
            log::error!("failed to write tombstone {:?}: {e}", tombstone.path);
            EXIT_WRITER_FAILED
        }
        Err(_) => EXIT_WRITER_PANICKED,
    }
}

/// Clones the tracer onto the leased stack. Returns `None` if the clone
/// failed.
///
/// # Safety
///
/// `request` must stay alive, and the lease held, until the child has been
/// reaped by [`wait_for_tracer`].
pub unsafe fn spawn(request: &DumpRequest<'_>, stack: &StackLease<'_>) -> Option<Pid> {
    let child = failspot!(if SpawnTracer {
        -1
    } else {
        // No SIGCHLD in the flags: nobody else should be told about this
        // child, which is why it has to be waited on with __WALL
        // SAFETY: the stack and argument outlive the child per our contract
        unsafe {
            libc::clone(
                tracer_entry,
                stack.top(),
                libc::CLONE_FILES | libc::CLONE_FS | libc::CLONE_UNTRACED,
                (request as *const DumpRequest<'_>)
                    .cast_mut()
                    .cast::<libc::c_void>(),
            )
        }
    });

    (child != -1).then_some(child)
}

/// Waits for the tracer to exit and returns true if it wrote the tombstone.
///
/// With a timeout the child is killed once it expires, so a wedged writer
/// can't keep the crashed process alive forever.
pub fn wait_for_tracer(child: Pid, timeout: Option<Duration>) -> bool {
    let pid = nix::unistd::Pid::from_raw(child);
    let deadline = timeout.map(|t| Instant::now() + t);

    let status = loop {
        let flags = if deadline.is_some() {
            WaitPidFlag::__WALL | WaitPidFlag::WNOHANG
        } else {
            WaitPidFlag::__WALL
        };

        match waitpid(pid, Some(flags)) {
            Ok(WaitStatus::StillAlive) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    debug_print!("the tracer timed out, killing it");
                    let _ = kill(pid, Signal::SIGKILL);
                    reap(pid);
                    return false;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => break status,
            // Stops and ptrace events don't end the wait
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(_) => {
                debug_print!("waitpid on the tracer failed");
                return false;
            }
        }
    };

    matches!(status, WaitStatus::Exited(_, EXIT_SUCCESS))
}

fn reap(pid: nix::unistd::Pid) {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => {}
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
