//! The function installed as the handler for every intercepted signal.

use super::{
    crash_context::SI_USER,
    registry::{DispatchOutcome, HandlerRegistry},
};

/// The process wide registry the installed signal handler dispatches to
pub(crate) static REGISTRY: HandlerRegistry = HandlerRegistry::new(signal_handler);

pub(crate) unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    // SAFETY: we are the signal handler and pass along what we were given
    let outcome = unsafe { REGISTRY.dispatch(sig, info, uc) };

    if outcome == DispatchOutcome::Reinstalled {
        // The kernel raises the signal again, this time with proper arguments
        return;
    }

    // SAFETY: the kernel always passes siginfo along with SA_SIGINFO
    let si_code = if info.is_null() {
        SI_USER
    } else {
        unsafe { (*info).si_code }
    };

    // SAFETY: syscalls
    unsafe { redeliver(sig, si_code) };
}

/// Makes sure the signal reaches its new disposition once we return.
///
/// A signal that was sent with kill() or friends, and SIGABRT (which the
/// kernel may also send on a SysRq request), won't happen again by itself so
/// it is queued again for this thread. A hardware fault simply re-triggers
/// when the faulting instruction is resumed.
///
/// # Safety
///
/// Performs syscalls, only meant to be called from the signal handler
unsafe fn redeliver(sig: libc::c_int, si_code: libc::c_int) {
    if si_code > 0 && sig != libc::SIGABRT {
        return;
    }

    unsafe {
        let tid = libc::syscall(libc::SYS_gettid);
        if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) < 0 {
            // We may be sandboxed in a way that prevents us from signaling
            // ourselves. Exiting gives the wrong exit status but at least
            // doesn't leave the process running.
            debug_print!("unable to re-raise the signal, exiting");
            libc::_exit(1);
        }
    }
}
