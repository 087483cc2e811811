//! C ABI for hosts that preload the runtime
//!
//! Null or non-UTF-8 names are ignored. Errors are logged; in strict mode
//! they abort the host, since a C caller has no way to observe them.

use crate::error::Result;
use std::ffi::CStr;
use std::os::raw::c_char;

/// Borrow a C string as UTF-8
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn check<T>(operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!("{operation}: {err}");
            if crate::runtime().config().strict {
                std::process::abort();
            }
            None
        }
    }
}

/// # Safety
/// `mode` and `argv0` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn critrace_init(
    mode: *const c_char,
    is_binary_rewrite: bool,
    argv0: *const c_char,
) {
    // SAFETY: forwarded caller contract
    let (Some(mode), Some(argv0)) = (unsafe { to_str(mode) }, unsafe { to_str(argv0) }) else {
        return;
    };
    check("critrace_init", crate::init(mode, is_binary_rewrite, argv0));
}

#[no_mangle]
pub extern "C" fn critrace_init_library() {
    check("critrace_init_library", crate::init_library());
}

#[no_mangle]
pub extern "C" fn critrace_init_tooling() -> bool {
    check("critrace_init_tooling", crate::init_tooling()).unwrap_or(false)
}

/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn critrace_push_trace(name: *const c_char) {
    // SAFETY: forwarded caller contract
    if let Some(name) = unsafe { to_str(name) } {
        check("critrace_push_trace", crate::push_trace(name));
    }
}

/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn critrace_pop_trace(name: *const c_char) {
    // SAFETY: forwarded caller contract
    if let Some(name) = unsafe { to_str(name) } {
        check("critrace_pop_trace", crate::pop_trace(name));
    }
}

/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn critrace_push_region(name: *const c_char) {
    // SAFETY: forwarded caller contract
    if let Some(name) = unsafe { to_str(name) } {
        check("critrace_push_region", crate::push_region(name));
    }
}

/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn critrace_pop_region(name: *const c_char) {
    // SAFETY: forwarded caller contract
    if let Some(name) = unsafe { to_str(name) } {
        check("critrace_pop_region", crate::pop_region(name));
    }
}

/// # Safety
/// `name` and `value` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn critrace_set_env(name: *const c_char, value: *const c_char) {
    // SAFETY: forwarded caller contract
    let (Some(name), Some(value)) = (unsafe { to_str(name) }, unsafe { to_str(value) }) else {
        return;
    };
    check("critrace_set_env", crate::set_env(name, value));
}

#[no_mangle]
pub extern "C" fn critrace_set_mpi(use_mpi: bool, attached: bool) {
    check("critrace_set_mpi", crate::set_mpi(use_mpi, attached));
}

#[no_mangle]
pub extern "C" fn critrace_finalize() {
    check("critrace_finalize", crate::finalize());
}
