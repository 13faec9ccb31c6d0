//! Foreign-function boundary
//!
//! C ABI exports for the host. Handles are raw `Session` pointers obtained
//! from [`ssl_new`] and released with [`ssl_free`]; every failure collapses
//! to a null handle or a negative status code, with the details sent to the
//! host's debug sink.
//!
//! On `wasm32` the host surface comes from the module imports. Native hosts
//! register a [`HostCallbacks`] table once with [`shim_register_host`].

use std::alloc::{alloc, dealloc, Layout};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use super::codes::ERR_SSL_BAD_INPUT_DATA;
use super::config::SessionOptions;
use super::host::{HostCallbacks, HostImports};
use super::session::Session;
use super::sizes;

static HOST: OnceLock<Arc<dyn HostImports>> = OnceLock::new();

/// Register the process-wide host surface
///
/// The first registration wins; a later one hands its argument back.
pub fn register_host(host: Arc<dyn HostImports>) -> Result<(), Arc<dyn HostImports>> {
    HOST.set(host)
}

/// The registered host surface
#[cfg(not(target_arch = "wasm32"))]
pub fn host() -> Option<Arc<dyn HostImports>> {
    HOST.get().cloned()
}

/// The registered host surface, defaulting to the module imports
#[cfg(target_arch = "wasm32")]
pub fn host() -> Option<Arc<dyn HostImports>> {
    Some(
        HOST.get_or_init(|| Arc::new(super::host::wasm_imports()))
            .clone(),
    )
}

/// Register a host dispatch table
///
/// The table is copied. Returns 0 on success and `ERR_SSL_BAD_INPUT_DATA`
/// for a null table or when a host is already registered.
///
/// # Safety
///
/// `table` must be null or point to a valid `HostCallbacks` whose function
/// pointers stay callable for the life of the process.
#[no_mangle]
pub unsafe extern "C" fn shim_register_host(table: *const HostCallbacks) -> c_int {
    if table.is_null() {
        return ERR_SSL_BAD_INPUT_DATA;
    }
    match register_host(Arc::new(*table)) {
        Ok(()) => 0,
        Err(_) => {
            warn!("host dispatch table already registered");
            ERR_SSL_BAD_INPUT_DATA
        }
    }
}

/// Create a session
///
/// `cert_pem` and `sk_pem` are NUL-terminated PEM strings. `client_id` is a
/// NUL-terminated transport identifier, or null for none. Returns null on any
/// failure.
///
/// # Safety
///
/// Every non-null pointer must reference a NUL-terminated string that stays
/// valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn ssl_new(
    cert_pem: *const c_char,
    sk_pem: *const c_char,
    is_server: c_char,
    is_udp: c_char,
    client_id: *const c_char,
) -> *mut Session {
    if cert_pem.is_null() || sk_pem.is_null() {
        warn!("ssl_new: null PEM input");
        return ptr::null_mut();
    }
    let Some(host) = host() else {
        warn!("ssl_new: no host registered");
        return ptr::null_mut();
    };

    let cert = CStr::from_ptr(cert_pem).to_bytes();
    let key = CStr::from_ptr(sk_pem).to_bytes();

    let mut options = SessionOptions::from_flags(is_server != 0, is_udp != 0);
    if !client_id.is_null() {
        options.client_id = CStr::from_ptr(client_id).to_bytes().to_vec();
    }

    match Session::new(cert, key, options, host) {
        Ok(session) => Box::into_raw(session),
        Err(err) => {
            debug!("ssl_new failed: {}", err);
            ptr::null_mut()
        }
    }
}

/// Protocol context of a session, or null for a null handle
///
/// # Safety
///
/// `handle` must be null or a live handle from [`ssl_new`].
#[no_mangle]
pub unsafe extern "C" fn ssl_ctx(handle: *mut Session) -> *mut openssl_sys::SSL {
    match handle.as_ref() {
        Some(session) => session.context_ptr(),
        None => ptr::null_mut(),
    }
}

/// Release a session; null is ignored
///
/// # Safety
///
/// `handle` must be null or a live handle from [`ssl_new`], and must not be
/// used afterwards.
#[no_mangle]
pub unsafe extern "C" fn ssl_free(handle: *mut Session) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Size of the type at `index` in the size table, 0 past its end
#[export_name = "sizeof"]
pub extern "C" fn shim_sizeof(index: u32) -> usize {
    sizes::size_of_index(index as usize)
}

/// Run one handshake step
///
/// # Safety
///
/// `handle` must be null or a live handle from [`ssl_new`].
#[no_mangle]
pub unsafe extern "C" fn ssl_handshake(handle: *mut Session) -> c_int {
    match handle.as_mut() {
        Some(session) => session.handshake(),
        None => ERR_SSL_BAD_INPUT_DATA,
    }
}

/// Read up to `len` bytes of application data into `buf`
///
/// # Safety
///
/// `handle` must be null or a live handle from [`ssl_new`]; `buf` must be
/// valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn ssl_read(handle: *mut Session, buf: *mut u8, len: usize) -> c_int {
    let Some(session) = handle.as_mut() else {
        return ERR_SSL_BAD_INPUT_DATA;
    };
    if len == 0 {
        return session.read(&mut []);
    }
    if buf.is_null() {
        return ERR_SSL_BAD_INPUT_DATA;
    }
    session.read(slice::from_raw_parts_mut(buf, len))
}

/// Write `len` bytes of application data from `buf`
///
/// # Safety
///
/// `handle` must be null or a live handle from [`ssl_new`]; `buf` must be
/// valid for `len` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn ssl_write(handle: *mut Session, buf: *const u8, len: usize) -> c_int {
    let Some(session) = handle.as_mut() else {
        return ERR_SSL_BAD_INPUT_DATA;
    };
    if len == 0 {
        return session.write(&[]);
    }
    if buf.is_null() {
        return ERR_SSL_BAD_INPUT_DATA;
    }
    session.write(slice::from_raw_parts(buf, len))
}

/// Allocate `len` bytes for the host to fill; null for 0 or on failure
#[no_mangle]
pub extern "C" fn shim_alloc(len: usize) -> *mut u8 {
    match Layout::array::<u8>(len) {
        Ok(layout) if layout.size() > 0 => unsafe { alloc(layout) },
        _ => ptr::null_mut(),
    }
}

/// Release a buffer from [`shim_alloc`]
///
/// # Safety
///
/// `ptr` must be null or come from `shim_alloc(len)` with the same `len`.
#[no_mangle]
pub unsafe extern "C" fn shim_dealloc(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    if let Ok(layout) = Layout::array::<u8>(len) {
        if layout.size() > 0 {
            dealloc(ptr, layout);
        }
    }
}
