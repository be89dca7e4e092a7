//! C ABI.
//!
//! Handles are opaque `uint64_t` tokens into the process-wide [`Bridge`]; `0` is never a valid
//! handle and is returned on failure. Strings are NUL-terminated UTF-8. Strings returned by this
//! module are owned by the caller and must be released with [`evalbridge_free_string`].
//!
//! No panic unwinds across this boundary: every function catches it, logs it, and returns its
//! failure value.
use std::{
    ffi::{c_char, CStr, CString},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
};

use serde::Serialize;

use crate::{
    handle::{ClientHandle, Handle, HandleTarget, OptionsHandle, UserHandle},
    init_response::ClientInitResponseOptions,
    Bridge, HashAlgorithm, Result, UserFields,
};

fn guard<R>(function: &'static str, failure: R, f: impl FnOnce() -> R) -> R {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        log::error!(target: "evalbridge", function; "panic caught at the C boundary");
        failure
    })
}

fn ok_or_log<T>(function: &'static str, result: Result<T>) -> Option<T> {
    result
        .inspect_err(|err| log::warn!(target: "evalbridge", function; "{err}"))
        .ok()
}

/// Read an optional C string. Null and invalid UTF-8 both read as `None`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(err) => {
            log::warn!(target: "evalbridge", "ignoring non-UTF-8 string argument: {err}");
            None
        }
    }
}

fn into_c_string(s: String) -> *mut c_char {
    // Serialized JSON escapes NUL, so this only fails on a broken invariant.
    match CString::new(s) {
        Ok(s) => s.into_raw(),
        Err(err) => {
            log::error!(target: "evalbridge", "string contains an interior NUL: {err}");
            ptr::null_mut()
        }
    }
}

fn json_c_string<T: Serialize>(function: &'static str, result: Result<T>) -> *mut c_char {
    let json = result.and_then(|value| Ok(serde_json::to_string(&value)?));
    ok_or_log(function, json).map_or(ptr::null_mut(), into_c_string)
}

fn handle<T: HandleTarget>(raw: u64) -> Result<Handle<T>> {
    Handle::from_raw(raw)
}

/// Null or empty selects no hashing.
///
/// # Safety
///
/// `hash_algorithm` must be null or a valid NUL-terminated string.
unsafe fn init_response_options(
    hash_algorithm: *const c_char,
) -> Result<ClientInitResponseOptions> {
    let hash_algorithm = read_str(hash_algorithm)
        .unwrap_or_default()
        .parse::<HashAlgorithm>()?;
    Ok(ClientInitResponseOptions { hash_algorithm })
}

/// Install a logger that writes to stderr, filtered by `RUST_LOG` (default `evalbridge=info`).
///
/// Does nothing if a logger is already installed.
#[no_mangle]
pub extern "C" fn evalbridge_init_logger() {
    guard("evalbridge_init_logger", (), || {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::new().default_filter_or("evalbridge=info"),
        )
        .try_init();
    })
}

/// Create options. A null or empty `specs_url` selects the default URL.
///
/// Returns `0` if `specs_url` is not an absolute URL.
///
/// # Safety
///
/// `specs_url` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_options_create(specs_url: *const c_char) -> u64 {
    guard("evalbridge_options_create", 0, || {
        let specs_url = read_str(specs_url);
        ok_or_log(
            "evalbridge_options_create",
            Bridge::global().create_options(specs_url),
        )
        .map_or(0, OptionsHandle::to_raw)
    })
}

/// Release options. Clients created from them are not affected.
#[no_mangle]
pub extern "C" fn evalbridge_options_release(options: u64) {
    guard("evalbridge_options_release", (), || {
        let result = handle(options).and_then(|options| Bridge::global().release_options(options));
        ok_or_log("evalbridge_options_release", result);
    })
}

/// Create a client for `sdk_key`.
///
/// Returns `0` if `sdk_key` is null or empty, or if `options` is not a live options handle.
///
/// # Safety
///
/// `sdk_key` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_create(sdk_key: *const c_char, options: u64) -> u64 {
    guard("evalbridge_create", 0, || {
        let sdk_key = read_str(sdk_key).unwrap_or_default();
        let result = handle(options)
            .and_then(|options| Bridge::global().create_client(sdk_key, options));
        ok_or_log("evalbridge_create", result).map_or(0, ClientHandle::to_raw)
    })
}

/// Release a client.
#[no_mangle]
pub extern "C" fn evalbridge_release(client: u64) {
    guard("evalbridge_release", (), || {
        let result = handle(client).and_then(|client| Bridge::global().release_client(client));
        ok_or_log("evalbridge_release", result);
    })
}

/// Start client initialization without blocking.
///
/// `callback`, if not null, is invoked exactly once when initialization completes, possibly on
/// another thread. If initialization had already completed, it is invoked before this function
/// returns. It is not invoked if `client` is not a live client handle.
#[no_mangle]
pub extern "C" fn evalbridge_initialize(client: u64, callback: Option<extern "C" fn()>) {
    guard("evalbridge_initialize", (), || {
        let result = handle(client).and_then(|client| match callback {
            Some(callback) => Bridge::global().initialize_with_callback(client, move |_| callback()),
            None => Bridge::global().initialize(client),
        });
        ok_or_log("evalbridge_initialize", result);
    })
}

/// Stop background specs sync without blocking. The handle stays valid.
///
/// `callback`, if not null, is invoked once the sync thread has exited, possibly on another
/// thread. It is not invoked if `client` is not a live client handle.
#[no_mangle]
pub extern "C" fn evalbridge_shutdown(client: u64, callback: Option<extern "C" fn()>) {
    guard("evalbridge_shutdown", (), || {
        let result = handle(client).and_then(|client| {
            Bridge::global().shutdown_client_with_callback(client, move |result| {
                if let Err(err) = result {
                    log::warn!(target: "evalbridge", "shutdown failed: {err}");
                }
                if let Some(callback) = callback {
                    callback();
                }
            })
        });
        ok_or_log("evalbridge_shutdown", result);
    })
}

/// Summary of the specs a client currently holds, as JSON. Returns null on an invalid handle.
#[no_mangle]
pub extern "C" fn evalbridge_get_current_values(client: u64) -> *mut c_char {
    guard("evalbridge_get_current_values", ptr::null_mut(), || {
        let result = handle(client).and_then(|client| Bridge::global().get_current_values(client));
        ok_or_log("evalbridge_get_current_values", result).map_or(ptr::null_mut(), into_c_string)
    })
}

/// Create a user. Every argument may be null or empty.
///
/// Returns `0` if `custom_ids_json`, `custom_json`, or `private_json` is not a valid JSON
/// object.
///
/// # Safety
///
/// Every argument must be null or a valid NUL-terminated string.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn evalbridge_user_create(
    user_id: *const c_char,
    custom_ids_json: *const c_char,
    email: *const c_char,
    ip: *const c_char,
    user_agent: *const c_char,
    country: *const c_char,
    locale: *const c_char,
    app_version: *const c_char,
    custom_json: *const c_char,
    private_json: *const c_char,
) -> u64 {
    guard("evalbridge_user_create", 0, || {
        let fields = UserFields {
            user_id: read_str(user_id),
            custom_ids_json: read_str(custom_ids_json),
            email: read_str(email),
            ip: read_str(ip),
            user_agent: read_str(user_agent),
            country: read_str(country),
            locale: read_str(locale),
            app_version: read_str(app_version),
            custom_json: read_str(custom_json),
            private_json: read_str(private_json),
        };
        ok_or_log("evalbridge_user_create", Bridge::global().create_user(fields))
            .map_or(0, UserHandle::to_raw)
    })
}

/// Release a user and set `*user` to `0`.
///
/// # Safety
///
/// `user` must be null or point to a valid, writable `uint64_t`.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_user_release(user: *mut u64) {
    guard("evalbridge_user_release", (), || {
        if user.is_null() {
            return;
        }
        let raw = std::mem::replace(&mut *user, 0);
        let result = handle(raw).and_then(|user| Bridge::global().release_user(user));
        ok_or_log("evalbridge_user_release", result);
    })
}

/// Evaluate a gate. Returns `false` on any failure.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_check_gate(
    client: u64,
    user: u64,
    name: *const c_char,
) -> bool {
    guard("evalbridge_check_gate", false, || {
        let Some(name) = read_str(name) else {
            return false;
        };
        match (handle(client), handle(user)) {
            (Ok(client), Ok(user)) => Bridge::global().check_gate(client, user, name),
            (Err(err), _) | (_, Err(err)) => {
                log::warn!(target: "evalbridge", name; "check_gate failed closed: {err}");
                false
            }
        }
    })
}

/// Evaluate a gate, returning the full result as JSON. Returns null on an invalid handle.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_feature_gate(
    client: u64,
    user: u64,
    name: *const c_char,
) -> *mut c_char {
    guard("evalbridge_get_feature_gate", ptr::null_mut(), || {
        let name = read_str(name).unwrap_or_default();
        let result = handle(client).and_then(|client| {
            Bridge::global().get_feature_gate(client, handle(user)?, name)
        });
        json_c_string("evalbridge_get_feature_gate", result)
    })
}

/// Evaluate an experiment as JSON. Unknown experiments yield an empty `value`; an invalid
/// handle yields null.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_experiment(
    client: u64,
    user: u64,
    name: *const c_char,
) -> *mut c_char {
    guard("evalbridge_get_experiment", ptr::null_mut(), || {
        let name = read_str(name).unwrap_or_default();
        let result = handle(client)
            .and_then(|client| Bridge::global().get_experiment(client, handle(user)?, name));
        json_c_string("evalbridge_get_experiment", result)
    })
}

/// Evaluate a dynamic config as JSON. Returns null on an invalid handle.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_dynamic_config(
    client: u64,
    user: u64,
    name: *const c_char,
) -> *mut c_char {
    guard("evalbridge_get_dynamic_config", ptr::null_mut(), || {
        let name = read_str(name).unwrap_or_default();
        let result = handle(client).and_then(|client| {
            Bridge::global().get_dynamic_config(client, handle(user)?, name)
        });
        json_c_string("evalbridge_get_dynamic_config", result)
    })
}

/// Evaluate a layer as JSON. Returns null on an invalid handle.
///
/// # Safety
///
/// `name` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_layer(
    client: u64,
    user: u64,
    name: *const c_char,
) -> *mut c_char {
    guard("evalbridge_get_layer", ptr::null_mut(), || {
        let name = read_str(name).unwrap_or_default();
        let result = handle(client)
            .and_then(|client| Bridge::global().get_layer(client, handle(user)?, name));
        json_c_string("evalbridge_get_layer", result)
    })
}

/// Every gate, config and layer evaluated for `user`, as JSON.
///
/// `hash_algorithm` is `"none"`, `"djb2"` or `"sha256"`; null selects `"none"`. Returns null on
/// an invalid handle or an unknown algorithm.
///
/// # Safety
///
/// `hash_algorithm` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_client_init_response(
    client: u64,
    user: u64,
    hash_algorithm: *const c_char,
) -> *mut c_char {
    guard("evalbridge_get_client_init_response", ptr::null_mut(), || {
        let result = handle(client).and_then(|client| {
            let options = init_response_options(hash_algorithm)?;
            Bridge::global().get_client_init_response(client, handle(user)?, options)
        });
        ok_or_log("evalbridge_get_client_init_response", result)
            .map_or(ptr::null_mut(), into_c_string)
    })
}

/// Copy the payload of [`evalbridge_get_client_init_response`] into `buffer`.
///
/// Writes at most `buffer_size` bytes and no NUL terminator. Returns the size of the full
/// payload; a value greater than `buffer_size` means the copy was truncated and should be
/// retried with a larger buffer. Returns `0` on an invalid handle or an unknown algorithm.
///
/// # Safety
///
/// `hash_algorithm` must be null or a valid NUL-terminated string. `buffer` must be null (only
/// if `buffer_size` is `0`) or valid for writes of `buffer_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_get_client_init_response_buffer(
    client: u64,
    user: u64,
    hash_algorithm: *const c_char,
    buffer: *mut c_char,
    buffer_size: usize,
) -> usize {
    guard("evalbridge_get_client_init_response_buffer", 0, || {
        let buffer: &mut [u8] = if buffer.is_null() || buffer_size == 0 {
            &mut []
        } else {
            std::slice::from_raw_parts_mut(buffer.cast::<u8>(), buffer_size)
        };
        let result = handle(client).and_then(|client| {
            let options = init_response_options(hash_algorithm)?;
            Bridge::global().get_client_init_response_into(client, handle(user)?, options, buffer)
        });
        ok_or_log("evalbridge_get_client_init_response_buffer", result).unwrap_or(0)
    })
}

/// Release a string returned by this library. Null is ignored.
///
/// # Safety
///
/// `s` must be null or a pointer returned by an `evalbridge_*` function that has not been
/// freed yet.
#[no_mangle]
pub unsafe extern "C" fn evalbridge_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
