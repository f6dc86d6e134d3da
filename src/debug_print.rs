//! Diagnostics that are safe to emit from a compromised context.
//!
//! `log` can't be used while handling a crash since its backends are free to
//! allocate or lock, so the crash path only ever writes fixed strings straight
//! to stderr, and only when the `debug-print` feature is enabled.

#[cfg(feature = "debug-print")]
macro_rules! debug_print {
    ($s:literal) => {
        $crate::debug_print::write_stderr(concat!($s, "\n"))
    };
}

#[cfg(not(feature = "debug-print"))]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
#[cfg(feature = "debug-print")]
#[inline]
pub(crate) fn write_stderr(s: &'static str) {
    // SAFETY: `s` is a valid buffer of `s.len()` bytes
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}
