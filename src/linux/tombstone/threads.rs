use {
    super::super::{Pid, crash_context::Register, errors::WriterError},
    error_graph::{ErrorList, WriteErrorList},
    failspot::failspot,
    nix::{
        errno::Errno,
        sys::{ptrace, wait},
    },
    std::path,
};

/// A thread of the crashed process
#[derive(Debug, serde::Serialize)]
pub struct Thread {
    pub tid: Pid,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub registers: Vec<Register>,
    #[serde(skip)]
    suspended: bool,
}

/// Parse /proc/$pid/task to list all the threads of the process identified by
/// pid.
pub fn enumerate_threads(
    pid: Pid,
    mut soft_errors: impl WriteErrorList<WriterError>,
) -> Result<Vec<Thread>, WriterError> {
    let filename = format!("/proc/{pid}/task");
    let task_path = path::PathBuf::from(&filename);

    let mut threads = Vec::new();
    for entry in std::fs::read_dir(task_path).map_err(|e| WriterError::IOError(filename, e))? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                soft_errors.push(WriterError::ReadProcessThreadEntryFailed(e));
                continue;
            }
        };
        let file_name = entry.file_name();
        let tid = match file_name.to_str().and_then(|name| name.parse::<Pid>().ok()) {
            Some(tid) => tid,
            None => {
                soft_errors.push(WriterError::ProcessTaskEntryNotTid(file_name));
                continue;
            }
        };

        let name_result = failspot!(if ThreadName {
            Err(std::io::Error::other(
                "testing requested failure reading thread name",
            ))
        } else {
            std::fs::read_to_string(format!("/proc/{pid}/task/{tid}/comm"))
        });

        let name = match name_result {
            Ok(name) => Some(name.trim_end().to_string()),
            Err(e) => {
                soft_errors.push(WriterError::ReadThreadNameFailed(e));
                None
            }
        };

        threads.push(Thread {
            tid,
            name,
            registers: Vec::new(),
            suspended: false,
        });
    }

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Stops a thread by attaching to it.
fn suspend_thread(child: Pid) -> Result<(), WriterError> {
    use WriterError::PtraceAttachError as AttachErr;

    let pid = nix::unistd::Pid::from_raw(child);
    // This may fail if the thread has just died or is being debugged.
    ptrace::attach(pid).map_err(|e| AttachErr(child, e))?;
    loop {
        match wait::waitpid(pid, Some(wait::WaitPidFlag::__WALL)) {
            Ok(wait::WaitStatus::Stopped(_, status)) => {
                // Any signal will stop the thread, make sure it is SIGSTOP. Otherwise, this
                // signal will be delivered after PTRACE_DETACH, and the thread will enter
                // the "T (stopped)" state.
                if status == nix::sys::signal::SIGSTOP {
                    return Ok(());
                }

                // Signals other than SIGSTOP that are received need to be reinjected,
                // or they will otherwise get lost.
                if let Err(err) = ptrace::cont(pid, status) {
                    return Err(WriterError::WaitPidError(child, err));
                }
            }
            Ok(_) => {
                ptrace_detach(child)?;
                return Err(WriterError::WaitPidError(child, Errno::UnknownErrno));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                ptrace_detach(child)?;
                return Err(WriterError::WaitPidError(child, e));
            }
        }
    }
}

fn ptrace_detach(child: Pid) -> Result<(), WriterError> {
    let pid = nix::unistd::Pid::from_raw(child);
    ptrace::detach(pid, None).or_else(|e| {
        // errno is set to ESRCH if the pid no longer exists, but we don't want to error in that
        // case.
        if e == nix::Error::ESRCH {
            Ok(())
        } else {
            Err(WriterError::PtraceDetachError(child, e))
        }
    })
}

/// Attaches to every thread. Threads that can't be attached to stay in the
/// list, they just won't have any registers.
pub fn suspend_threads(threads: &mut [Thread], mut soft_errors: impl WriteErrorList<WriterError>) {
    for thread in threads.iter_mut() {
        match suspend_thread(thread.tid) {
            Ok(()) => thread.suspended = true,
            Err(e) => soft_errors.push(e),
        }
    }

    failspot::failspot!(<crate::FailSpotName>::SuspendThreads soft_errors.push(
        WriterError::PtraceAttachError(1234, nix::Error::EPERM)
    ))
}

pub fn resume_threads(threads: &mut [Thread], mut soft_errors: impl WriteErrorList<WriterError>) {
    for thread in threads.iter_mut().filter(|t| t.suspended) {
        if let Err(e) = ptrace_detach(thread.tid) {
            soft_errors.push(e);
        }
        thread.suspended = false;
    }
}

/// Reads the registers of every suspended thread except the crashing one,
/// whose registers at the time of the crash come from the crash context.
#[cfg(target_arch = "x86_64")]
pub fn read_registers(
    threads: &mut [Thread],
    crashing_tid: Pid,
    soft_errors: &mut ErrorList<WriterError>,
) {
    for thread in threads
        .iter_mut()
        .filter(|t| t.suspended && t.tid != crashing_tid)
    {
        match ptrace::getregs(nix::unistd::Pid::from_raw(thread.tid)) {
            Ok(regs) => {
                thread.registers = vec![
                    Register::new("rax", regs.rax),
                    Register::new("rbx", regs.rbx),
                    Register::new("rcx", regs.rcx),
                    Register::new("rdx", regs.rdx),
                    Register::new("rsi", regs.rsi),
                    Register::new("rdi", regs.rdi),
                    Register::new("rbp", regs.rbp),
                    Register::new("rsp", regs.rsp),
                    Register::new("r8", regs.r8),
                    Register::new("r9", regs.r9),
                    Register::new("r10", regs.r10),
                    Register::new("r11", regs.r11),
                    Register::new("r12", regs.r12),
                    Register::new("r13", regs.r13),
                    Register::new("r14", regs.r14),
                    Register::new("r15", regs.r15),
                    Register::new("rip", regs.rip),
                    Register::new("eflags", regs.eflags),
                ];
            }
            Err(e) => soft_errors.push(WriterError::GetRegsFailed(thread.tid, e)),
        }
    }
}

// TODO: read registers with PTRACE_GETREGSET on architectures other than x86_64
#[cfg(not(target_arch = "x86_64"))]
pub fn read_registers(
    _threads: &mut [Thread],
    _crashing_tid: Pid,
    _soft_errors: &mut ErrorList<WriterError>,
) {
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lists_our_own_threads() {
        let mut client = crate::FailSpotName::testing_client();
        client.set_enabled(crate::FailSpotName::ThreadName, false);

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let helper = std::thread::Builder::new()
            .name("helper".into())
            .spawn(move || {
                // The name is only set once the thread itself is running
                started_tx.send(()).unwrap();
                let _ = rx.recv();
            })
            .unwrap();
        started_rx.recv().unwrap();

        let mut soft_errors = ErrorList::default();
        let threads = enumerate_threads(
            std::process::id() as Pid,
            soft_errors.subwriter(WriterError::EnumerateThreadsErrors),
        )
        .unwrap();

        assert!(threads.len() >= 2);
        assert!(threads.iter().any(|t| t.name.as_deref() == Some("helper")));
        assert!(threads.iter().any(|t| t.tid == std::process::id() as Pid));

        tx.send(()).unwrap();
        helper.join().unwrap();
    }

    #[test]
    fn thread_name_failures_are_soft() {
        let mut client = crate::FailSpotName::testing_client();
        client.set_enabled(crate::FailSpotName::ThreadName, true);

        let mut soft_errors = ErrorList::default();
        let threads = enumerate_threads(
            std::process::id() as Pid,
            soft_errors.subwriter(WriterError::EnumerateThreadsErrors),
        )
        .unwrap();

        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| t.name.is_none()));

        let json = serde_json::to_value(&soft_errors).unwrap();
        assert!(json.to_string().contains("ReadThreadNameFailed"));
    }
}
