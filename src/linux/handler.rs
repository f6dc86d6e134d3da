//! The exception handler: capturing a crash and having the tracer child
//! write a tombstone for it.

use {
    super::{
        artifact::{self, LocalClock, MAX_DIR_LEN, PATH_CAPACITY, ReentrancyMarker},
        child_stack::ChildStack,
        crash_context::{self, CrashContext},
        dispatcher::REGISTRY,
        errors::HandlerError,
        registry::HandleSignal,
        rendezvous::Channel,
        signals::CrashSignal,
        tombstone::{JsonTombstoneWriter, TombstoneWriter},
        tracer::{self, DumpRequest},
    },
    std::{
        os::unix::ffi::OsStrExt,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
};

/// How long the crashed process waits for the tracer by default
pub const DEFAULT_TRACER_TIMEOUT: Duration = Duration::from_secs(30);

/// The stages of a dump reported to a [`DumpCallback`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DumpEvent {
    /// A dump is about to be written
    Begin = 0,
    /// The tracer is done, successfully or not
    End = 1,
    /// A dump was already in progress, or an earlier one never finished
    GiveUp = 2,
}

/// User implemented trait notified of the progress of a dump.
///
/// # Safety
///
/// [`DumpEvent::Begin`] and [`DumpEvent::GiveUp`] are reported from the
/// signal handler, in a compromised context. Only async signal safe
/// functions may be called there, which notably excludes `malloc`.
/// [`DumpEvent::End`] is reported once the tracer has exited, but still
/// before the signal is re-raised.
pub unsafe trait DumpCallback: Send + Sync {
    /// Returns whether the dump should be considered a success. Only the
    /// value returned for [`DumpEvent::End`] has any effect.
    fn on_dump_event(&self, event: DumpEvent, path: &Path, succeeded: bool) -> bool;
}

/// Creates a [`DumpCallback`] using the supplied closure as the
/// implementation.
///
/// # Safety
///
/// See the [`DumpCallback`] Safety section.
#[inline]
pub unsafe fn make_dump_callback<F>(closure: F) -> Box<dyn DumpCallback>
where
    F: Send + Sync + Fn(DumpEvent, &Path, bool) -> bool + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> DumpCallback for Wrapper<F>
    where
        F: Send + Sync + Fn(DumpEvent, &Path, bool) -> bool,
    {
        fn on_dump_event(&self, event: DumpEvent, path: &Path, succeeded: bool) -> bool {
            (self.inner)(event, path, succeeded)
        }
    }

    Box::new(Wrapper { inner: closure })
}

/// Configures an [`ExceptionHandler`]
pub struct ExceptionHandlerConfig {
    directory: PathBuf,
    callback: Option<Box<dyn DumpCallback>>,
    install_handlers: bool,
    tracer_timeout: Option<Duration>,
    writer: Option<Box<dyn TombstoneWriter>>,
}

impl ExceptionHandlerConfig {
    /// Tombstones will be written to `directory`, which is created if needed
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            callback: None,
            install_handlers: true,
            tracer_timeout: Some(DEFAULT_TRACER_TIMEOUT),
            writer: None,
        }
    }

    pub fn set_callback(&mut self, callback: Box<dyn DumpCallback>) -> &mut Self {
        self.callback = Some(callback);
        self
    }

    /// Whether the signal handlers are installed. Without them the handler
    /// only dumps through [`ExceptionHandler::simulate_signal`].
    pub fn install_handlers(&mut self, install: bool) -> &mut Self {
        self.install_handlers = install;
        self
    }

    /// How long to wait for the tracer before killing it. `None` waits
    /// forever.
    pub fn tracer_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.tracer_timeout = timeout;
        self
    }

    /// Replaces the default [`JsonTombstoneWriter`]
    pub fn set_tombstone_writer(&mut self, writer: Box<dyn TombstoneWriter>) -> &mut Self {
        self.writer = Some(writer);
        self
    }

    /// Sets everything up that the crash path will need, then registers the
    /// handler.
    pub fn attach(self) -> Result<ExceptionHandler, HandlerError> {
        let dir_bytes = self.directory.as_os_str().as_bytes().to_vec();
        if dir_bytes.is_empty() {
            return Err(HandlerError::EmptyDirectory);
        }
        if dir_bytes.contains(&0) {
            return Err(HandlerError::DirectoryContainsNul(
                self.directory.into_os_string(),
            ));
        }
        if dir_bytes.len() > MAX_DIR_LEN {
            return Err(HandlerError::DirectoryTooLong(
                self.directory,
                PATH_CAPACITY,
            ));
        }

        std::fs::create_dir_all(&self.directory)
            .map_err(|e| HandlerError::CreateDirectory(self.directory.clone(), e))?;

        let clock = LocalClock::new()?;
        let marker = ReentrancyMarker::new(&dir_bytes).ok_or_else(|| {
            HandlerError::DirectoryTooLong(self.directory.clone(), PATH_CAPACITY)
        })?;
        let child_stack = ChildStack::reserve()?;

        let inner = Arc::new(HandlerInner {
            directory: self.directory,
            dir_bytes,
            marker,
            clock,
            callback: self.callback,
            writer: self
                .writer
                .unwrap_or_else(|| Box::new(JsonTombstoneWriter::new())),
            tracer_timeout: self.tracer_timeout,
            child_stack,
        });

        REGISTRY.register(inner.clone(), self.install_handlers)?;

        log::info!(
            "crash handler attached, tombstones go to {:?}",
            inner.directory
        );

        Ok(ExceptionHandler { inner })
    }
}

/// Writes a tombstone to a directory whenever the process receives one of
/// the [`CrashSignal`]s.
///
/// Any number of handlers may be alive at once. The newest one sees a crash
/// first. The signal handlers are uninstalled once the last one is dropped.
pub struct ExceptionHandler {
    inner: Arc<HandlerInner>,
}

impl ExceptionHandler {
    /// Attaches a handler with the default configuration
    pub fn new(
        directory: impl Into<PathBuf>,
        callback: Option<Box<dyn DumpCallback>>,
        install_handlers: bool,
    ) -> Result<Self, HandlerError> {
        let mut config = ExceptionHandlerConfig::new(directory);
        config.install_handlers(install_handlers);
        if let Some(callback) = callback {
            config.set_callback(callback);
        }
        config.attach()
    }

    /// Detaches the handler. Same as dropping it.
    #[inline]
    pub fn detach(self) {
        drop(self);
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Writes a tombstone as if the calling thread had received `signal`,
    /// without re-raising anything.
    ///
    /// Returns whether the dump succeeded, as adjusted by the callback.
    pub fn simulate_signal(&self, signal: CrashSignal) -> bool {
        let sig = signal.as_raw();

        REGISTRY.with_crash_context(|ctx| {
            // SAFETY: ucontext_t is POD
            let mut uc: ::crash_context::ucontext_t = unsafe { std::mem::zeroed() };
            // SAFETY: uc is a valid ucontext_t
            unsafe { ::crash_context::crash_context_getcontext(&mut uc) };

            let siginfo = crash_context::synthetic_siginfo(sig);
            // SAFETY: we hold the registry lock, same as the signal handler
            let outcome = unsafe {
                self.inner.generate_dump(
                    sig,
                    &siginfo,
                    (&uc as *const ::crash_context::ucontext_t).cast(),
                    ctx,
                )
            };
            outcome.handled && outcome.succeeded
        })
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        let handler: Arc<dyn HandleSignal> = self.inner.clone();
        if REGISTRY.unregister(&handler) {
            log::info!("crash handler for {:?} detached", self.inner.directory);
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct DumpOutcome {
    /// A dump was attempted, the signal must not be offered to other handlers
    handled: bool,
    succeeded: bool,
}

impl DumpOutcome {
    const NOT_HANDLED: Self = Self {
        handled: false,
        succeeded: false,
    };
}

struct HandlerInner {
    directory: PathBuf,
    dir_bytes: Vec<u8>,
    marker: ReentrancyMarker,
    clock: LocalClock,
    callback: Option<Box<dyn DumpCallback>>,
    writer: Box<dyn TombstoneWriter>,
    tracer_timeout: Option<Duration>,
    child_stack: ChildStack,
}

impl HandlerInner {
    #[inline]
    fn report(&self, event: DumpEvent, path: &Path, succeeded: bool) -> bool {
        match &self.callback {
            Some(callback) => callback.on_dump_event(event, path, succeeded),
            None => succeeded,
        }
    }

    /// Runs a dump.
    ///
    /// # Safety
    ///
    /// Must be called with the registry lock held, from the signal handler
    /// or with `uc` filled by getcontext. Nothing here allocates until the
    /// tracer has exited.
    unsafe fn generate_dump(
        &self,
        sig: libc::c_int,
        siginfo: &libc::signalfd_siginfo,
        uc: *const libc::c_void,
        ctx: &mut CrashContext,
    ) -> DumpOutcome {
        let Some(path) = artifact::artifact_path(&self.dir_bytes, &self.clock) else {
            debug_print!("unable to build the artifact path");
            return DumpOutcome::NOT_HANDLED;
        };

        let Some(marker) = self.marker.acquire() else {
            self.report(DumpEvent::GiveUp, path.as_path(), false);
            return DumpOutcome::NOT_HANDLED;
        };

        self.report(DumpEvent::Begin, path.as_path(), false);

        // SAFETY: syscalls, and `uc` is valid per our contract
        unsafe {
            // A setuid process isn't dumpable, which would stop the tracer
            // from attaching. Only trust signals we didn't get from elsewhere.
            if crash_context::is_trusted(siginfo) {
                libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            crash_context::capture(ctx, siginfo, uc);
        }

        let Some(stack) = self.child_stack.claim() else {
            debug_print!("the tracer stack is already in use");
            drop(marker);
            return DumpOutcome::NOT_HANDLED;
        };

        let mut channel = Channel::open();
        let request = DumpRequest {
            pid: ctx.pid,
            signal: sig,
            context: &*ctx,
            path: &path,
            writer: &*self.writer,
            channel: &channel,
        };

        // SAFETY: the request and stack outlive the child, which is reaped
        // before either goes out of scope
        let Some(child) = (unsafe { tracer::spawn(&request, &stack) }) else {
            debug_print!("failed to spawn the tracer");
            channel.close();
            drop(stack);
            drop(marker);
            self.report(DumpEvent::End, path.as_path(), false);
            return DumpOutcome::NOT_HANDLED;
        };

        // Yama may only allow our ancestors to ptrace us
        // SAFETY: syscall
        unsafe { libc::prctl(libc::PR_SET_PTRACER, child as libc::c_ulong, 0, 0, 0) };

        channel.send_go();
        let succeeded = tracer::wait_for_tracer(child, self.tracer_timeout);

        channel.close();
        drop(stack);
        drop(marker);

        let succeeded = self.report(DumpEvent::End, path.as_path(), succeeded);
        DumpOutcome {
            handled: true,
            succeeded,
        }
    }
}

impl HandleSignal for HandlerInner {
    unsafe fn handle_signal(
        &self,
        sig: libc::c_int,
        siginfo: &libc::signalfd_siginfo,
        uc: *const libc::c_void,
        ctx: &mut CrashContext,
    ) -> bool {
        // SAFETY: forwarded from the dispatcher
        unsafe { self.generate_dump(sig, siginfo, uc, ctx) }.handled
    }
}
