//! Signal dispositions for the set of signals we intercept.
//!
//! Everything in here that is reachable from the signal handler only uses raw
//! `sigaction`/`signal` calls and stack memory.

use {super::errors::HandlerError, nix::errno::Errno, std::mem, std::ptr};

/// The signals a crash handler intercepts, in the order their previous
/// dispositions are saved.
pub const HANDLED_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGBUS,
];

/// The saved dispositions of [`HANDLED_SIGNALS`]
pub type SavedDispositions = [libc::sigaction; HANDLED_SIGNALS.len()];

/// One of the fatal signals that is intercepted
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CrashSignal {
    Segv = libc::SIGSEGV,
    Abort = libc::SIGABRT,
    Fpe = libc::SIGFPE,
    Ill = libc::SIGILL,
    Bus = libc::SIGBUS,
}

impl CrashSignal {
    pub const ALL: [Self; 5] = [Self::Segv, Self::Abort, Self::Fpe, Self::Ill, Self::Bus];

    #[inline]
    pub fn from_raw(sig: libc::c_int) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as libc::c_int == sig)
    }

    #[inline]
    pub fn as_raw(self) -> libc::c_int {
        self as libc::c_int
    }

    #[inline]
    pub fn name(self) -> &'static str {
        signal_name(self as libc::c_int)
    }
}

/// The conventional name of a signal, for reporting.
pub fn signal_name(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGBUS => "SIGBUS",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGKILL => "SIGKILL",
        libc::SIGTERM => "SIGTERM",
        _ => "UNKNOWN",
    }
}

/// Resets the disposition of `sig` to `SIG_DFL`.
///
/// # Safety
///
/// Performs syscalls, safe to call from a signal handler
pub unsafe fn install_default_handler(sig: libc::c_int) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones, and those ignore requests to set SIG_DFL, which would leave us
    // looping on re-delivered signals. Go straight to the kernel there.
    unsafe {
        if cfg!(target_os = "android") {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_sigaction = libc::SIG_DFL;
            sa.sa_flags = libc::SA_RESTART;
            libc::syscall(
                libc::SYS_rt_sigaction,
                sig,
                &sa,
                ptr::null::<libc::sigaction>(),
                mem::size_of::<libc::sigset_t>(),
            );
        } else {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// Resets every handled signal to `SIG_DFL`.
///
/// # Safety
///
/// Performs syscalls, safe to call from a signal handler or a cloned child
pub unsafe fn reset_handled_to_default() {
    for sig in HANDLED_SIGNALS {
        unsafe { install_default_handler(sig) };
    }
}

/// Queries the current disposition of every handled signal.
///
/// Fails if any of them can't be read, in which case nothing has been changed.
pub fn save_dispositions() -> Result<SavedDispositions, HandlerError> {
    // SAFETY: sigaction is POD, all zeroes is a valid bit pattern
    let mut saved: SavedDispositions = unsafe { mem::zeroed() };

    for (sig, old) in HANDLED_SIGNALS.iter().copied().zip(saved.iter_mut()) {
        // SAFETY: syscall, querying only
        if unsafe { libc::sigaction(sig, ptr::null(), old) } == -1 {
            return Err(HandlerError::SaveDisposition(sig, Errno::last()));
        }
    }

    Ok(saved)
}

/// The action our dispatcher is installed with: siginfo delivery, the
/// alternate stack, and every handled signal masked while one is handled.
fn dispatcher_action(handler: libc::sighandler_t) -> libc::sigaction {
    // SAFETY: sigaction is POD
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        for sig in HANDLED_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig);
        }

        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        sa
    }
}

/// Installs `handler` for every handled signal.
///
/// If any installation fails the dispositions in `saved` are put back before
/// returning the error.
pub fn install_dispatcher(
    handler: libc::sighandler_t,
    saved: &SavedDispositions,
) -> Result<(), HandlerError> {
    let sa = dispatcher_action(handler);

    for sig in HANDLED_SIGNALS {
        // SAFETY: syscall
        if unsafe { libc::sigaction(sig, &sa, ptr::null_mut()) } == -1 {
            let err = Errno::last();
            // SAFETY: syscalls
            unsafe { restore_dispositions(saved) };
            return Err(HandlerError::InstallDisposition(sig, err));
        }
    }

    Ok(())
}

/// Restores all of the saved dispositions, or the default for any signal
/// whose previous disposition can't be restored.
///
/// # Safety
///
/// Performs syscalls, safe to call from a signal handler
pub unsafe fn restore_dispositions(saved: &SavedDispositions) {
    for (sig, action) in HANDLED_SIGNALS.iter().copied().zip(saved.iter()) {
        unsafe {
            if libc::sigaction(sig, action, ptr::null_mut()) == -1 {
                install_default_handler(sig);
            }
        }
    }
}

/// Returns true if `sig` is still routed to `handler` but has lost
/// `SA_SIGINFO`.
///
/// This happens when other code saves and restores a handler with `signal`
/// instead of `sigaction`, in which case the `info` and `uc` arguments we
/// received are garbage.
///
/// # Safety
///
/// Performs syscalls, safe to call from a signal handler
pub unsafe fn lost_siginfo(sig: libc::c_int, handler: libc::sighandler_t) -> bool {
    unsafe {
        let mut cur: libc::sigaction = mem::zeroed();
        libc::sigaction(sig, ptr::null(), &mut cur) == 0
            && cur.sa_sigaction == handler
            && cur.sa_flags & libc::SA_SIGINFO == 0
    }
}

/// Reinstalls `handler` for `sig` with the correct flags, falling back to the
/// default disposition if that fails so the re-delivered signal can't loop.
///
/// # Safety
///
/// Performs syscalls, safe to call from a signal handler
pub unsafe fn reinstall_dispatcher(sig: libc::c_int, handler: libc::sighandler_t) {
    unsafe {
        let sa = dispatcher_action(handler);
        if libc::sigaction(sig, &sa, ptr::null_mut()) == -1 {
            install_default_handler(sig);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crash_signal_round_trips_raw_values() {
        for sig in HANDLED_SIGNALS {
            let cs = CrashSignal::from_raw(sig).expect("handled signal");
            assert_eq!(cs.as_raw(), sig);
        }

        assert_eq!(CrashSignal::from_raw(libc::SIGTERM), None);
        assert_eq!(CrashSignal::Bus.name(), "SIGBUS");
        assert_eq!(signal_name(12345), "UNKNOWN");
    }

    #[test]
    fn dispatcher_action_masks_every_handled_signal() {
        let sa = dispatcher_action(libc::SIG_IGN);

        assert_eq!(sa.sa_flags, libc::SA_ONSTACK | libc::SA_SIGINFO);
        for sig in HANDLED_SIGNALS {
            // SAFETY: reading an initialized sigset
            assert_eq!(unsafe { libc::sigismember(&sa.sa_mask, sig) }, 1);
        }
        // SAFETY: as above
        assert_eq!(unsafe { libc::sigismember(&sa.sa_mask, libc::SIGTERM) }, 0);
    }
}
