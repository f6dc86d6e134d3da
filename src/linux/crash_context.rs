// The kernel hands us the crashing thread's state as a raw ucontext_t and a
// siginfo_t. These are copied into a preallocated crash_context::CrashContext
// so the tracer child can read them from its copy of our memory.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
    } else if #[cfg(target_arch = "x86")] {
        mod x86;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
    } else if #[cfg(target_arch = "arm")] {
        mod arm;
    }
}

use {crate::serializers::serialize_hex, std::ptr};

pub use crash_context::CrashContext;

/// `si_code` for a signal sent with `kill`
pub const SI_USER: i32 = 0;
/// `si_code` for a signal sent with `tkill` or `tgkill`
pub const SI_TKILL: i32 = -6;

/// A named register value of the crashing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Register {
    pub name: &'static str,
    #[serde(serialize_with = "serialize_hex")]
    pub value: u64,
}

impl Register {
    #[inline]
    pub fn new(name: &'static str, value: u64) -> Self {
        Self { name, value }
    }
}

pub trait CpuContext {
    fn get_instruction_pointer(&self) -> usize;
    fn get_stack_pointer(&self) -> usize;
    fn fill_registers(&self, out: &mut Vec<Register>);
}

/// Converts the siginfo the kernel delivered into the fixed layout stored in
/// the crash context.
///
/// For signals sent by a process the sender is recorded, for faults the
/// faulting address.
///
/// # Safety
///
/// `info` must be a siginfo_t delivered by the kernel for the current signal.
/// Safe to call from a signal handler.
pub unsafe fn siginfo_from_raw(info: &libc::siginfo_t) -> libc::signalfd_siginfo {
    // SAFETY: signalfd_siginfo is POD
    let mut out: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    out.ssi_signo = info.si_signo as u32;
    out.ssi_errno = info.si_errno;
    out.ssi_code = info.si_code;

    // SAFETY: the union member that is valid depends on si_code
    unsafe {
        if info.si_code <= 0 {
            out.ssi_pid = info.si_pid() as u32;
            out.ssi_uid = info.si_uid();
        } else {
            out.ssi_addr = info.si_addr() as usize as u64;
        }
    }

    out
}

/// Builds the siginfo for a signal this process sends to itself.
pub fn synthetic_siginfo(sig: libc::c_int) -> libc::signalfd_siginfo {
    // SAFETY: signalfd_siginfo is POD
    let mut out: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    out.ssi_signo = sig as u32;
    out.ssi_code = SI_USER;
    out.ssi_pid = std::process::id();
    // SAFETY: syscall
    out.ssi_uid = unsafe { libc::getuid() };
    out
}

/// Returns true if the signal was generated by the kernel, or was sent by
/// this very process, as opposed to having been sent by someone else.
pub fn is_trusted(siginfo: &libc::signalfd_siginfo) -> bool {
    siginfo.ssi_code > 0
        || ((siginfo.ssi_code == SI_USER || siginfo.ssi_code == SI_TKILL)
            && siginfo.ssi_pid == std::process::id())
}

/// Fills `ctx` with the state of the calling thread at the time of the signal.
///
/// The previous contents are wiped first. The floating point state is only
/// copied if the machine context carries a valid one.
///
/// # Safety
///
/// `uc` must point to the ucontext_t delivered with the signal, or one filled
/// by `getcontext`. Safe to call from a signal handler, nothing is allocated.
pub unsafe fn capture(
    ctx: &mut CrashContext,
    siginfo: &libc::signalfd_siginfo,
    uc: *const libc::c_void,
) {
    unsafe {
        ptr::write_bytes(ctx as *mut CrashContext, 0, 1);

        ctx.siginfo = *siginfo;

        let uc = uc.cast::<crash_context::ucontext_t>();
        ptr::copy_nonoverlapping(uc, &mut ctx.context, 1);

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                let fp = (*uc)
                    .uc_mcontext
                    .__reserved
                    .as_ptr()
                    .cast::<crash_context::fpsimd_context>();
                if (*fp).head.magic == crash_context::FPSIMD_MAGIC {
                    ptr::copy_nonoverlapping(fp, &mut ctx.float_state, 1);
                }
            } else if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
                let fp = (*uc).uc_mcontext.fpregs;
                if !fp.is_null() {
                    ptr::copy_nonoverlapping(fp, &mut ctx.float_state, 1);
                }
            }
        }

        ctx.pid = libc::getpid();
        ctx.tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
    }
}

/// Allocates a zeroed crash context on the heap.
///
/// The context is large, so it must never live on the alternate signal stack.
pub fn allocate() -> Box<CrashContext> {
    // SAFETY: CrashContext is POD, all zeroes is a valid bit pattern
    let mut ctx: Box<CrashContext> = Box::new(unsafe { std::mem::zeroed() });
    // Touch every page up front so the crash path doesn't fault them in
    // SAFETY: writing within the allocation
    unsafe { ptr::write_bytes(&mut *ctx as *mut CrashContext, 0, 1) };
    ctx
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_signals_from_ourselves_are_trusted() {
        let info = synthetic_siginfo(libc::SIGABRT);
        assert_eq!(info.ssi_signo, libc::SIGABRT as u32);
        assert!(is_trusted(&info));

        let mut foreign = info;
        foreign.ssi_pid = std::process::id().wrapping_add(1);
        assert!(!is_trusted(&foreign));

        let mut fault = foreign;
        fault.ssi_code = 1; // SEGV_MAPERR
        assert!(is_trusted(&fault));
    }

    #[test]
    fn capture_records_the_calling_thread() {
        let mut ctx = allocate();
        // Leave garbage behind to check it gets wiped
        ctx.pid = -1;

        // SAFETY: ucontext_t is POD
        let mut uc: crash_context::ucontext_t = unsafe { std::mem::zeroed() };
        // SAFETY: uc is a valid ucontext_t
        unsafe { crash_context::crash_context_getcontext(&mut uc) };

        let info = synthetic_siginfo(libc::SIGSEGV);
        // SAFETY: uc was filled by getcontext
        unsafe {
            capture(
                &mut ctx,
                &info,
                (&uc as *const crash_context::ucontext_t).cast(),
            )
        };

        assert_eq!(ctx.pid, std::process::id() as i32);
        assert_eq!(ctx.tid, unsafe { libc::syscall(libc::SYS_gettid) } as i32);
        assert_eq!(ctx.siginfo.ssi_signo, libc::SIGSEGV as u32);
        assert_ne!(ctx.get_instruction_pointer(), 0);
        assert_ne!(ctx.get_stack_pointer(), 0);

        let mut regs = Vec::new();
        ctx.fill_registers(&mut regs);
        assert!(!regs.is_empty());
        assert!(
            regs.iter()
                .any(|r| r.value == ctx.get_stack_pointer() as u64)
        );
    }
}
