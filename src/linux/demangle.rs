//! C++ symbol demangling through the platform's `__cxa_demangle`.
//!
//! The demangler is looked up once per process, first among the images that
//! are already loaded and then in the usual C++ runtime libraries. If none of
//! them provide it, every call reports failure. This allocates and takes the
//! loader lock, so it must never be used from the crash path.

use std::{
    ffi::{CStr, CString, c_char, c_int, c_void},
    sync::OnceLock,
};

type CxaDemangle = unsafe extern "C" fn(
    mangled_name: *const c_char,
    output_buffer: *mut c_char,
    length: *mut usize,
    status: *mut c_int,
) -> *mut c_char;

/// Libraries that may provide `__cxa_demangle`, in the order they are tried
const LIBRARIES: [&CStr; 3] = [c"libstdc++.so.6", c"libc++.so.1", c"libgccdemangle.so"];
const SYMBOL: &CStr = c"__cxa_demangle";

static DEMANGLER: OnceLock<Option<CxaDemangle>> = OnceLock::new();

fn resolve() -> Option<CxaDemangle> {
    // SAFETY: dlsym/dlopen with valid nul terminated names. Libraries we open
    // are never closed, the resolved function has to stay valid.
    unsafe {
        let mut sym = libc::dlsym(libc::RTLD_DEFAULT, SYMBOL.as_ptr());

        if sym.is_null() {
            for lib in LIBRARIES {
                let handle = libc::dlopen(lib.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
                if handle.is_null() {
                    continue;
                }

                sym = libc::dlsym(handle, SYMBOL.as_ptr());
                if !sym.is_null() {
                    log::debug!("using __cxa_demangle from {lib:?}");
                    break;
                }
                libc::dlclose(handle);
            }
        }

        if sym.is_null() {
            log::debug!("no __cxa_demangle available, symbols will not be demangled");
            return None;
        }

        Some(std::mem::transmute::<*mut c_void, CxaDemangle>(sym))
    }
}

/// Returns true if a demangler could be found in this process
pub fn is_available() -> bool {
    DEMANGLER.get_or_init(resolve).is_some()
}

/// Demangles a C++ symbol name.
///
/// Returns `None` if no demangler is available, the name contains a nul
/// byte, or it isn't a valid mangled name.
pub fn demangle(mangled: &str) -> Option<String> {
    let demangler = (*DEMANGLER.get_or_init(resolve))?;
    let mangled = CString::new(mangled).ok()?;

    let mut status: c_int = -1;
    // SAFETY: with a null output buffer the demangler allocates the result
    // with malloc, which we free below
    unsafe {
        let out = demangler(
            mangled.as_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut status,
        );
        if out.is_null() {
            return None;
        }

        let demangled = (status == 0).then(|| CStr::from_ptr(out).to_string_lossy().into_owned());
        libc::free(out.cast());
        demangled
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demangles_when_available() {
        if !is_available() {
            assert_eq!(demangle("_ZN3foo3barEv"), None);
            return;
        }

        assert_eq!(demangle("_ZN3foo3barEv").as_deref(), Some("foo::bar()"));
        assert_eq!(demangle("_Z1fi").as_deref(), Some("f(int)"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(demangle("not a mangled name"), None);
        assert_eq!(demangle("_Z\0oops"), None);
        assert_eq!(demangle(""), None);
    }
}
