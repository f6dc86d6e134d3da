use {
    super::errors::HandlerError,
    failspot::failspot,
    nix::errno::Errno,
    std::{
        ptr,
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// Stack size given to the tracer child. The tombstone writer runs on it, so
/// it is a good deal larger than the alternate signal stack.
pub const CHILD_STACK_SIZE: usize = 256 * 1024;

/// Memory reserved up front for the tracer child's stack, since the crash
/// path can't allocate.
pub struct ChildStack {
    mapping: *mut libc::c_void,
    mapping_len: usize,
    guard_len: usize,
    in_use: AtomicBool,
}

// SAFETY: the mapping is only handed out through the `in_use` flag
unsafe impl Send for ChildStack {}
unsafe impl Sync for ChildStack {}

impl std::fmt::Debug for ChildStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildStack")
            .field("mapping", &self.mapping)
            .field("size", &(self.mapping_len - self.guard_len))
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChildStack {
    pub fn reserve() -> Result<Self, HandlerError> {
        failspot!(ChildStackReserve bail(HandlerError::ReserveTracerStack(Errno::ENOMEM)));

        // SAFETY: syscall
        let guard_len = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mapping_len = guard_len + CHILD_STACK_SIZE;

        // SAFETY: syscalls creating and protecting a fresh private mapping
        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(HandlerError::ReserveTracerStack(Errno::last()));
            }

            // The stack grows down, so the guard is the lowest page
            if libc::mprotect(mapping, guard_len, libc::PROT_NONE) == -1 {
                let err = Errno::last();
                libc::munmap(mapping, mapping_len);
                return Err(HandlerError::ReserveTracerStack(err));
            }

            // Fault every page in now rather than in the crash path
            ptr::write_bytes(
                mapping.cast::<u8>().add(guard_len),
                0,
                mapping_len - guard_len,
            );

            Ok(Self {
                mapping,
                mapping_len,
                guard_len,
                in_use: AtomicBool::new(false),
            })
        }
    }

    /// Hands out the stack, unless it is already in use. Safe to call from a
    /// signal handler.
    pub fn claim(&self) -> Option<StackLease<'_>> {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        // clone() wants the top of the stack, 16 byte aligned, and the
        // topmost bytes scrubbed
        let top = (self.mapping as usize + self.mapping_len) & !15;
        // SAFETY: the range lies within the mapping, above the guard page
        unsafe { ptr::write_bytes((top - 16) as *mut u8, 0, 16) };

        Some(StackLease {
            stack: self,
            top: top as *mut libc::c_void,
        })
    }
}

impl Drop for ChildStack {
    fn drop(&mut self) {
        // SAFETY: the mapping is ours and no lease can outlive `self`
        unsafe { libc::munmap(self.mapping, self.mapping_len) };
    }
}

/// Exclusive use of a [`ChildStack`], released when dropped
pub struct StackLease<'s> {
    stack: &'s ChildStack,
    top: *mut libc::c_void,
}

impl StackLease<'_> {
    #[inline]
    pub fn top(&self) -> *mut libc::c_void {
        self.top
    }
}

impl Drop for StackLease<'_> {
    fn drop(&mut self) {
        self.stack.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_one_lease_at_a_time() {
        let _client = crate::FailSpotName::testing_client();
        let stack = ChildStack::reserve().unwrap();

        let lease = stack.claim().expect("stack should be free");
        assert_eq!(lease.top() as usize % 16, 0);
        assert!(stack.claim().is_none());

        drop(lease);
        assert!(stack.claim().is_some());
    }

    #[test]
    fn reserve_failure_is_reported() {
        let mut client = crate::FailSpotName::testing_client();
        client.set_enabled(crate::FailSpotName::ChildStackReserve, true);

        assert!(matches!(
            ChildStack::reserve(),
            Err(HandlerError::ReserveTracerStack(Errno::ENOMEM))
        ));
    }
}
