use {
    super::errors::HandlerError,
    failspot::failspot,
    nix::errno::Errno,
    std::{mem, ptr},
};

/// The smallest alternate stack we are willing to run the dispatcher on
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// The size of the alternate stack we allocate, never smaller than what the
/// platform asks for.
#[inline]
pub fn stack_size() -> usize {
    MIN_STACK_SIZE.max(libc::SIGSTKSZ)
}

/// An alternate signal stack we installed, along with the one it replaced.
///
/// Signal handlers run on this stack so that a crash caused by a stack
/// overflow can still be handled.
pub struct AltStack {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
    /// Start of the mapping, including the guard page
    mapping: *mut libc::c_void,
    mapping_len: usize,
}

// SAFETY: the raw pointers only refer to our own mapping, which is never
// accessed through this type
unsafe impl Send for AltStack {}

impl std::fmt::Debug for AltStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AltStack")
            .field("sp", &self.new.ss_sp)
            .field("size", &self.new.ss_size)
            .field("replaced", &self.old.is_some())
            .finish()
    }
}

impl AltStack {
    /// Installs an alternate stack for the calling thread, unless the current
    /// one is already enabled and large enough, in which case `None` is
    /// returned and nothing changes.
    pub fn install() -> Result<Option<Self>, HandlerError> {
        // SAFETY: stack_t is POD
        let mut old_stack: libc::stack_t = unsafe { mem::zeroed() };
        // SAFETY: syscall, querying only
        if unsafe { libc::sigaltstack(ptr::null(), &mut old_stack) } == -1 {
            return Err(HandlerError::AltStack(Errno::last()));
        }

        let size = stack_size();
        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= size {
            return Ok(None);
        }

        failspot!(AltStackInstall bail(HandlerError::AltStack(Errno::ENOMEM)));

        // SAFETY: syscall
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mapping_len = page_size + size;

        // SAFETY: syscall, we get back either MAP_FAILED or a fresh mapping
        // that nothing else refers to
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(HandlerError::AltStack(Errno::last()));
        }

        // The lowest page stays inaccessible as a guard
        let stack_ptr = (mapping as usize + page_size) as *mut libc::c_void;

        // SAFETY: syscalls on the mapping we just created
        unsafe {
            if libc::mprotect(stack_ptr, size, libc::PROT_READ | libc::PROT_WRITE) == -1 {
                let err = Errno::last();
                libc::munmap(mapping, mapping_len);
                return Err(HandlerError::AltStack(err));
            }
        }

        let new = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: size,
        };

        // SAFETY: syscall, `new` describes memory we own
        unsafe {
            if libc::sigaltstack(&new, ptr::null_mut()) == -1 {
                let err = Errno::last();
                libc::munmap(mapping, mapping_len);
                return Err(HandlerError::AltStack(err));
            }
        }

        log::debug!("installed a {size} byte alternate signal stack at {stack_ptr:p}");

        Ok(Some(Self {
            old: (old_stack.ss_flags & libc::SS_DISABLE == 0 && !old_stack.ss_sp.is_null())
                .then_some(old_stack),
            new,
            mapping,
            mapping_len,
        }))
    }

    /// Puts back the alternate stack that was active when this one was
    /// installed, or disables alternate stacks if there was none.
    ///
    /// The alternate stack is per thread, so if the calling thread is not
    /// running with our stack it is left in place and the mapping is leaked
    /// rather than pulled out from under the thread that still uses it.
    pub fn restore(self) {
        // SAFETY: stack_t is POD
        let mut current: libc::stack_t = unsafe { mem::zeroed() };
        // SAFETY: syscall, querying only
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } == -1 {
            log::warn!(
                "unable to query the alternate signal stack: {}",
                Errno::last()
            );
            return;
        }

        if current.ss_sp != self.new.ss_sp {
            log::warn!(
                "the alternate signal stack at {:p} is not active on this thread, leaking it",
                self.new.ss_sp
            );
            return;
        }

        let replacement = self.old.unwrap_or_else(|| {
            // SAFETY: stack_t is POD
            let mut disable: libc::stack_t = unsafe { mem::zeroed() };
            disable.ss_flags = libc::SS_DISABLE;
            disable
        });

        // SAFETY: syscall
        if unsafe { libc::sigaltstack(&replacement, ptr::null_mut()) } == -1 {
            log::warn!(
                "unable to restore the previous alternate signal stack: {}",
                Errno::last()
            );
            return;
        }

        // SAFETY: the mapping is no longer the alternate stack of this thread
        let r = unsafe { libc::munmap(self.mapping, self.mapping_len) };
        debug_assert_eq!(r, 0, "munmap of the alternate signal stack failed");
    }

    /// The usable (non guard) part of the stack
    #[inline]
    pub fn stack(&self) -> (*mut libc::c_void, usize) {
        (self.new.ss_sp, self.new.ss_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn current() -> libc::stack_t {
        unsafe {
            let mut cur: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut cur), 0);
            cur
        }
    }

    #[test]
    fn install_and_restore_on_a_fresh_thread() {
        let _client = crate::FailSpotName::testing_client();

        std::thread::spawn(|| {
            let before = current();

            let Some(stack) = AltStack::install().expect("failed to install") else {
                // The thread already runs with a large enough stack
                assert!(before.ss_size >= stack_size());
                return;
            };

            let (sp, size) = stack.stack();
            let cur = current();
            assert_eq!(cur.ss_sp, sp);
            assert_eq!(cur.ss_size, size);
            assert!(size >= MIN_STACK_SIZE);

            // A second install sees a big enough stack and does nothing
            assert!(AltStack::install().expect("failed to query").is_none());

            stack.restore();
            let after = current();
            assert_eq!(
                after.ss_flags & libc::SS_DISABLE,
                before.ss_flags & libc::SS_DISABLE
            );
            if before.ss_flags & libc::SS_DISABLE == 0 {
                assert_eq!(after.ss_sp, before.ss_sp);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn restore_from_another_thread_leaves_the_stack_alone() {
        let _client = crate::FailSpotName::testing_client();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let owner = std::thread::spawn(move || {
            let Some(stack) = AltStack::install().unwrap() else {
                return;
            };
            let sp = stack.stack().0 as usize;
            tx.send(stack).unwrap();
            done_rx.recv().unwrap();
            assert_eq!(current().ss_sp as usize, sp);
        });

        let Ok(stack) = rx.recv() else {
            owner.join().unwrap();
            return;
        };
        std::thread::spawn(move || stack.restore()).join().unwrap();
        done_tx.send(()).unwrap();
        owner.join().unwrap();
    }
}
