use {
    super::{
        alt_stack::AltStack,
        crash_context::{self, CrashContext},
        errors::HandlerError,
        signals::{self, SavedDispositions},
    },
    std::sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// The signature of the function installed as the signal handler
pub type SignalEntry = unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Something that wants a look at fatal signals
pub trait HandleSignal: Send + Sync {
    /// Handles a signal, returning true if it was dealt with and no other
    /// handler needs to see it.
    ///
    /// # Safety
    ///
    /// Called from a signal handler with the registry lock held. `uc` points
    /// to the ucontext_t of the interrupted thread, `ctx` is the process wide
    /// crash context for the handler to fill. Implementations must not
    /// allocate or take locks.
    unsafe fn handle_signal(
        &self,
        sig: libc::c_int,
        siginfo: &libc::signalfd_siginfo,
        uc: *const libc::c_void,
        ctx: &mut CrashContext,
    ) -> bool;
}

/// What [`HandlerRegistry::dispatch`] did with a signal
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Our disposition had lost `SA_SIGINFO` and was reinstalled. The
    /// signal's arguments were garbage so nobody looked at it.
    Reinstalled,
    /// A handler dealt with the signal
    Handled,
    /// No handler dealt with the signal
    Unhandled,
}

struct RegistryState {
    /// Oldest first
    handlers: Vec<Arc<dyn HandleSignal>>,
    /// Set while our entry point is installed for the handled signals
    old_handlers: Option<SavedDispositions>,
    alt_stack: Option<AltStack>,
    /// Allocated on first registration and kept for the life of the process,
    /// it's far too big for the alternate stack
    crash_context: Option<Box<CrashContext>>,
}

/// The ordered set of live crash handlers, along with the process state they
/// share: the signal dispositions, the alternate stack and the crash context.
///
/// A single lock serializes registration, unregistration and the handling of
/// crashes from any number of threads.
pub struct HandlerRegistry {
    entry: SignalEntry,
    state: Mutex<RegistryState>,
}

impl HandlerRegistry {
    /// Creates an empty registry that installs `entry` as the signal handler
    pub const fn new(entry: SignalEntry) -> Self {
        Self {
            entry,
            state: Mutex::new(RegistryState {
                handlers: Vec::new(),
                old_handlers: None,
                alt_stack: None,
                crash_context: None,
            }),
        }
    }

    #[inline]
    fn entry(&self) -> libc::sighandler_t {
        self.entry as libc::sighandler_t
    }

    /// A panic while the lock was held doesn't leave the state inconsistent,
    /// and crashes must still be handled after one
    #[inline]
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a handler, installing the signal handler and alternate stack first
    /// if requested and not done already.
    ///
    /// Nothing is changed if this fails.
    pub fn register(
        &self,
        handler: Arc<dyn HandleSignal>,
        install_handlers: bool,
    ) -> Result<(), HandlerError> {
        let mut state = self.lock();

        if state.crash_context.is_none() {
            state.crash_context = Some(crash_context::allocate());
        }

        if install_handlers && state.old_handlers.is_none() {
            let alt_stack = if state.alt_stack.is_none() {
                AltStack::install()?
            } else {
                None
            };

            let installed = signals::save_dispositions().and_then(|saved| {
                signals::install_dispatcher(self.entry(), &saved).map(|()| saved)
            });

            match installed {
                Ok(saved) => {
                    state.old_handlers = Some(saved);
                    if alt_stack.is_some() {
                        state.alt_stack = alt_stack;
                    }
                    log::debug!("installed crash signal handlers");
                }
                Err(e) => {
                    if let Some(stack) = alt_stack {
                        stack.restore();
                    }
                    return Err(e);
                }
            }
        }

        state.handlers.push(handler);
        Ok(())
    }

    /// Removes a handler. When the last one goes the previous signal
    /// dispositions and alternate stack are put back.
    ///
    /// Returns false if the handler wasn't registered.
    pub fn unregister(&self, handler: &Arc<dyn HandleSignal>) -> bool {
        let mut state = self.lock();

        let Some(index) = state
            .handlers
            .iter()
            .position(|h| std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(handler)))
        else {
            return false;
        };

        state.handlers.remove(index);

        if state.handlers.is_empty() {
            if let Some(saved) = state.old_handlers.take() {
                // SAFETY: syscalls
                unsafe { signals::restore_dispositions(&saved) };
                log::debug!("restored the previous signal dispositions");
            }

            if let Some(stack) = state.alt_stack.take() {
                stack.restore();
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while our entry point is installed for the handled signals
    pub fn is_installed(&self) -> bool {
        self.lock().old_handlers.is_some()
    }

    /// Offers a signal to the handlers, newest first, until one handles it.
    ///
    /// Afterwards, if we installed the dispositions, a handled signal is reset
    /// to its default so that re-delivering it terminates the process, while
    /// an unhandled one gets every previous disposition back so that whoever
    /// was there before us sees it.
    ///
    /// # Safety
    ///
    /// Must be called from the signal handler with the arguments it received
    pub unsafe fn dispatch(
        &self,
        sig: libc::c_int,
        info: *mut libc::siginfo_t,
        uc: *mut libc::c_void,
    ) -> DispatchOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;

        // SAFETY: syscalls
        unsafe {
            if signals::lost_siginfo(sig, self.entry()) {
                signals::reinstall_dispatcher(sig, self.entry());
                return DispatchOutcome::Reinstalled;
            }
        }

        let siginfo = if info.is_null() {
            crash_context::synthetic_siginfo(sig)
        } else {
            // SAFETY: delivered by the kernel along with `sig`
            unsafe { crash_context::siginfo_from_raw(&*info) }
        };

        let handled = match state.crash_context.as_deref_mut() {
            Some(ctx) => state
                .handlers
                .iter()
                .rev()
                // SAFETY: we are in the signal handler, holding the lock
                .any(|h| unsafe { h.handle_signal(sig, &siginfo, uc, ctx) }),
            None => false,
        };

        if state.old_handlers.is_some() {
            if handled {
                // SAFETY: syscall
                unsafe { signals::install_default_handler(sig) };
            } else if let Some(saved) = state.old_handlers.take() {
                // SAFETY: syscalls
                unsafe { signals::restore_dispositions(&saved) };
            }
        }

        if handled {
            DispatchOutcome::Handled
        } else {
            DispatchOutcome::Unhandled
        }
    }

    /// Runs `f` with the crash context while holding the lock, the same way a
    /// handler runs during a real crash.
    pub fn with_crash_context<R>(&self, f: impl FnOnce(&mut CrashContext) -> R) -> R {
        let mut state = self.lock();
        let ctx = state.crash_context.get_or_insert_with(crash_context::allocate);
        f(ctx)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    unsafe extern "C" fn dummy_entry(
        _: libc::c_int,
        _: *mut libc::siginfo_t,
        _: *mut libc::c_void,
    ) {
    }

    struct Recorder {
        id: usize,
        handles: bool,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl HandleSignal for Recorder {
        unsafe fn handle_signal(
            &self,
            sig: libc::c_int,
            siginfo: &libc::signalfd_siginfo,
            _uc: *const libc::c_void,
            _ctx: &mut CrashContext,
        ) -> bool {
            assert_eq!(siginfo.ssi_signo, sig as u32);
            self.calls.lock().unwrap().push(self.id);
            self.handles
        }
    }

    fn recorders(
        registry: &HandlerRegistry,
        handles: &[bool],
    ) -> (Vec<Arc<dyn HandleSignal>>, Arc<Mutex<Vec<usize>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handlers = handles
            .iter()
            .enumerate()
            .map(|(id, handles)| {
                let h: Arc<dyn HandleSignal> = Arc::new(Recorder {
                    id,
                    handles: *handles,
                    calls: calls.clone(),
                });
                registry.register(h.clone(), false).unwrap();
                h
            })
            .collect();
        (handlers, calls)
    }

    fn raw_siginfo(sig: libc::c_int) -> libc::siginfo_t {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = sig;
        info.si_code = crash_context::SI_TKILL;
        info
    }

    fn dispatch(registry: &HandlerRegistry, sig: libc::c_int) -> DispatchOutcome {
        let mut info = raw_siginfo(sig);
        unsafe { registry.dispatch(sig, &mut info, std::ptr::null_mut()) }
    }

    #[test]
    fn newest_handler_goes_first() {
        let registry = HandlerRegistry::new(dummy_entry);
        let (_handlers, calls) = recorders(&registry, &[false, false, false]);

        assert_eq!(dispatch(&registry, libc::SIGSEGV), DispatchOutcome::Unhandled);
        assert_eq!(*calls.lock().unwrap(), [2, 1, 0]);
    }

    #[test]
    fn first_handler_to_handle_wins() {
        let registry = HandlerRegistry::new(dummy_entry);
        let (_handlers, calls) = recorders(&registry, &[true, true, false]);

        assert_eq!(dispatch(&registry, libc::SIGBUS), DispatchOutcome::Handled);
        assert_eq!(*calls.lock().unwrap(), [2, 1]);
    }

    #[test]
    fn unregister_by_identity() {
        let registry = HandlerRegistry::new(dummy_entry);
        let (handlers, calls) = recorders(&registry, &[false, false]);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&handlers[1]));
        assert!(!registry.unregister(&handlers[1]));
        assert_eq!(registry.len(), 1);

        dispatch(&registry, libc::SIGILL);
        assert_eq!(*calls.lock().unwrap(), [0]);

        assert!(registry.unregister(&handlers[0]));
        assert!(registry.is_empty());
        assert_eq!(dispatch(&registry, libc::SIGILL), DispatchOutcome::Unhandled);
    }

    fn gettid() -> libc::pid_t {
        unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
    }

    /// Captures every crash into the shared context and checks that nothing
    /// else wrote to it while the capture was in use
    struct Capturing {
        active: AtomicUsize,
        max_active: AtomicUsize,
        captured: Mutex<Vec<(libc::pid_t, u32)>>,
    }

    impl HandleSignal for Capturing {
        unsafe fn handle_signal(
            &self,
            sig: libc::c_int,
            siginfo: &libc::signalfd_siginfo,
            uc: *const libc::c_void,
            ctx: &mut CrashContext,
        ) -> bool {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            unsafe { crash_context::capture(ctx, siginfo, uc) };
            std::thread::sleep(std::time::Duration::from_millis(5));

            assert_eq!(ctx.tid, gettid());
            assert_eq!(ctx.siginfo.ssi_signo, sig as u32);
            self.captured
                .lock()
                .unwrap()
                .push((ctx.tid, ctx.siginfo.ssi_signo));

            self.active.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn crashes_on_several_threads_are_serialized() {
        let registry = Arc::new(HandlerRegistry::new(dummy_entry));
        let capturing = Arc::new(Capturing {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        });
        registry.register(capturing.clone(), false).unwrap();

        let threads: Vec<_> = signals::HANDLED_SIGNALS[..4]
            .iter()
            .copied()
            .map(|sig| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let mut uc: ::crash_context::ucontext_t =
                            unsafe { std::mem::zeroed() };
                        unsafe { ::crash_context::crash_context_getcontext(&mut uc) };
                        let mut info = raw_siginfo(sig);
                        let uc = (&mut uc as *mut ::crash_context::ucontext_t).cast();
                        let outcome = unsafe { registry.dispatch(sig, &mut info, uc) };
                        assert_eq!(outcome, DispatchOutcome::Handled);
                    }
                    (gettid(), sig as u32)
                })
            })
            .collect();

        let expected: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(capturing.max_active.load(Ordering::SeqCst), 1);

        let captured = capturing.captured.lock().unwrap();
        assert_eq!(captured.len(), 20);
        for thread in &expected {
            assert_eq!(captured.iter().filter(|c| *c == thread).count(), 5);
        }
    }

    fn current_action(sig: libc::c_int) -> libc::sigaction {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(sig, std::ptr::null(), &mut sa), 0);
            sa
        }
    }

    #[test]
    fn dispositions_installed_once_and_restored_by_the_last() {
        let _lock = super::super::DISPOSITION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _client = crate::FailSpotName::testing_client();

        let before: Vec<_> = signals::HANDLED_SIGNALS
            .iter()
            .map(|sig| current_action(*sig).sa_sigaction)
            .collect();

        let registry = HandlerRegistry::new(dummy_entry);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<Arc<dyn HandleSignal>> = (0..3)
            .map(|id| {
                Arc::new(Recorder {
                    id,
                    handles: false,
                    calls: calls.clone(),
                }) as Arc<dyn HandleSignal>
            })
            .collect();

        for h in &handlers {
            registry.register(h.clone(), true).unwrap();
            assert!(registry.is_installed());
            for sig in signals::HANDLED_SIGNALS {
                let sa = current_action(sig);
                assert_eq!(sa.sa_sigaction, dummy_entry as libc::sighandler_t);
                assert_ne!(sa.sa_flags & libc::SA_SIGINFO, 0);
                assert_ne!(sa.sa_flags & libc::SA_ONSTACK, 0);
            }
        }

        for h in &handlers[..2] {
            registry.unregister(h);
            assert!(registry.is_installed());
        }
        registry.unregister(&handlers[2]);
        assert!(!registry.is_installed());

        let after: Vec<_> = signals::HANDLED_SIGNALS
            .iter()
            .map(|sig| current_action(*sig).sa_sigaction)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn lost_siginfo_is_reinstalled() {
        let _lock = super::super::DISPOSITION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _client = crate::FailSpotName::testing_client();

        let registry = HandlerRegistry::new(dummy_entry);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn HandleSignal> = Arc::new(Recorder {
            id: 0,
            handles: false,
            calls: calls.clone(),
        });
        registry.register(handler.clone(), true).unwrap();

        // Someone saved and restored our handler with signal() instead of
        // sigaction(), dropping SA_SIGINFO
        unsafe { libc::signal(libc::SIGILL, dummy_entry as libc::sighandler_t) };
        let sa = current_action(libc::SIGILL);
        assert_eq!(sa.sa_sigaction, dummy_entry as libc::sighandler_t);
        assert_eq!(sa.sa_flags & libc::SA_SIGINFO, 0);

        assert_eq!(dispatch(&registry, libc::SIGILL), DispatchOutcome::Reinstalled);
        assert!(calls.lock().unwrap().is_empty());

        let sa = current_action(libc::SIGILL);
        assert_eq!(sa.sa_sigaction, dummy_entry as libc::sighandler_t);
        assert_ne!(sa.sa_flags & libc::SA_SIGINFO, 0);
        assert_ne!(sa.sa_flags & libc::SA_ONSTACK, 0);

        // The next delivery reaches the handler, which passes it on to the
        // previous dispositions
        assert_eq!(dispatch(&registry, libc::SIGILL), DispatchOutcome::Unhandled);
        assert_eq!(*calls.lock().unwrap(), [0]);
        assert!(!registry.is_installed());

        assert!(registry.unregister(&handler));
    }

    #[test]
    fn failed_alt_stack_installs_nothing() {
        let _lock = super::super::DISPOSITION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut client = crate::FailSpotName::testing_client();
        client.set_enabled(crate::FailSpotName::AltStackInstall, true);

        // A fresh thread's alternate stack is normally too small, so a new
        // one is needed
        std::thread::spawn(|| {
            let mut cur: libc::stack_t = unsafe { std::mem::zeroed() };
            unsafe { libc::sigaltstack(std::ptr::null(), &mut cur) };
            if cur.ss_flags & libc::SS_DISABLE == 0
                && cur.ss_size >= super::super::alt_stack::stack_size()
            {
                return;
            }

            let before = current_action(libc::SIGSEGV).sa_sigaction;
            let registry = HandlerRegistry::new(dummy_entry);
            let handler: Arc<dyn HandleSignal> = Arc::new(Recorder {
                id: 0,
                handles: false,
                calls: Arc::new(Mutex::new(Vec::new())),
            });

            assert!(matches!(
                registry.register(handler, true),
                Err(HandlerError::AltStack(_))
            ));
            assert!(registry.is_empty());
            assert!(!registry.is_installed());
            assert_eq!(current_action(libc::SIGSEGV).sa_sigaction, before);
        })
        .join()
        .unwrap();
    }
}
