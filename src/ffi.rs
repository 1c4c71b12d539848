/// C ABI for the exported global fields
/// Operates on the process-wide default installed with `ProcessState::install`
/// (or `tierstate_init`). Strings returned to C must be freed with
/// `tierstate_free_string`.
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use tracing::warn;

use crate::config::RuntimeConfig;
use crate::state::ProcessState;

fn into_c_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Install a process state built from the discovered configuration.
///
/// Returns 0 on success or if a process state is already installed, -1 if
/// the configuration or declarations are invalid.
#[no_mangle]
pub extern "C" fn tierstate_init() -> c_int {
    if ProcessState::global().is_some() {
        return 0;
    }
    let config = match RuntimeConfig::discover(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(target: "tierstate::registry", error = %err, "tierstate_init: bad config");
            return -1;
        }
    };
    match ProcessState::new(&config) {
        Ok(state) => {
            ProcessState::install(&state);
            0
        }
        Err(err) => {
            warn!(target: "tierstate::registry", error = %err, "tierstate_init: bad declarations");
            -1
        }
    }
}

/// Whether the process restores from a dump image: 1 or 0, or -1 when no
/// process state is installed.
#[no_mangle]
pub extern "C" fn tierstate_do_undump() -> c_int {
    match ProcessState::global() {
        Some(state) => c_int::from(state.do_undump()),
        None => -1,
    }
}

/// Current shell path, or null when unavailable.
///
/// The returned pointer must be freed using tierstate_free_string
#[no_mangle]
pub extern "C" fn tierstate_sh_path() -> *mut c_char {
    match ProcessState::global().map(|state| state.sh_path()) {
        Some(Ok(path)) => into_c_string(path),
        _ => std::ptr::null_mut(),
    }
}

/// Current program name, or null when unavailable.
///
/// The returned pointer must be freed using tierstate_free_string
#[no_mangle]
pub extern "C" fn tierstate_program_name() -> *mut c_char {
    match ProcessState::global().map(|state| state.program_name()) {
        Some(Ok(name)) => into_c_string(name),
        _ => std::ptr::null_mut(),
    }
}

/// Replace the program name. Returns 0 on success, -1 on a null or
/// non-UTF-8 argument or when no process state is usable.
///
/// # Safety
/// - name must be null or a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn tierstate_set_program_name(name: *const c_char) -> c_int {
    if name.is_null() {
        return -1;
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return -1;
    };
    match ProcessState::global().map(|state| state.set_program_name(name)) {
        Some(Ok(_)) => 0,
        _ => -1,
    }
}

/// Free a string returned by this module
///
/// # Safety
/// - ptr must be a pointer returned by a tierstate_* function
/// - ptr must not be used after calling this function
#[no_mangle]
pub unsafe extern "C" fn tierstate_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_installed() {
        assert_eq!(tierstate_init(), 0);
        assert!(ProcessState::global().is_some());
    }

    #[test]
    fn test_ffi_sh_path() {
        ensure_installed();
        let ptr = tierstate_sh_path();
        assert!(!ptr.is_null());
        unsafe {
            let path = CStr::from_ptr(ptr).to_str().unwrap();
            assert!(!path.is_empty());
            tierstate_free_string(ptr);
        }
    }

    #[test]
    fn test_ffi_program_name_round_trip() {
        ensure_installed();
        let name = CString::new("embedded-runtime").unwrap();
        unsafe {
            assert_eq!(tierstate_set_program_name(name.as_ptr()), 0);
            let ptr = tierstate_program_name();
            assert!(!ptr.is_null());
            assert_eq!(CStr::from_ptr(ptr).to_str().unwrap(), "embedded-runtime");
            tierstate_free_string(ptr);
        }
    }

    #[test]
    fn test_ffi_do_undump() {
        ensure_installed();
        assert!(matches!(tierstate_do_undump(), 0 | 1));
    }

    #[test]
    fn test_ffi_null_name() {
        unsafe {
            assert_eq!(tierstate_set_program_name(std::ptr::null()), -1);
        }
    }

    #[test]
    fn test_ffi_free_null() {
        // Should not crash
        unsafe {
            tierstate_free_string(std::ptr::null_mut());
        }
    }
}
