//! C ABI export tests
//!
//! Registers a function-pointer host table once for the whole binary and
//! drives sessions through the exported symbols only.

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int, c_uchar};
use std::ptr;
use std::sync::{Mutex, Once};

use tls_shim::shim::codes::{ERR_SSL_BAD_INPUT_DATA, ERR_SSL_WANT_READ};
use tls_shim::shim::ffi::{
    shim_alloc, shim_dealloc, shim_register_host, shim_sizeof, ssl_ctx, ssl_free, ssl_handshake,
    ssl_new, ssl_read, ssl_write,
};
use tls_shim::shim::SizedType;
use tls_shim::HostCallbacks;

mod common;

static SENT: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());
static TIMERS: Mutex<Vec<(usize, u32, u32)>> = Mutex::new(Vec::new());
static DEBUG: Mutex<Vec<c_int>> = Mutex::new(Vec::new());

unsafe extern "C" fn host_random(buf: *mut c_uchar, len: usize) {
    common::fill_random(std::slice::from_raw_parts_mut(buf, len));
}

unsafe extern "C" fn host_rng(_ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int {
    common::fill_random(std::slice::from_raw_parts_mut(buf, len));
    len as c_int
}

unsafe extern "C" fn host_debug(_ctx: *mut c_void, level: c_int, _file: *const c_char, _line: c_int, _msg: *const c_char) {
    DEBUG.lock().unwrap().push(level);
}

unsafe extern "C" fn host_send(ctx: *mut c_void, _buf: *const c_uchar, len: usize) -> c_int {
    SENT.lock().unwrap().push((ctx as usize, len));
    len as c_int
}

unsafe extern "C" fn host_recv(_ctx: *mut c_void, _buf: *mut c_uchar, _len: usize) -> c_int {
    ERR_SSL_WANT_READ
}

unsafe extern "C" fn host_timer_set(ctx: *mut c_void, intermediate_ms: u32, final_ms: u32) {
    TIMERS.lock().unwrap().push((ctx as usize, intermediate_ms, final_ms));
}

unsafe extern "C" fn host_timer_get(_ctx: *mut c_void) -> c_int {
    -1
}

unsafe extern "C" fn host_time(_timer: *mut i64) -> i64 {
    0
}

fn register() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let table = HostCallbacks {
            random: host_random,
            rng: host_rng,
            debug: host_debug,
            send: host_send,
            recv: host_recv,
            timer_set: host_timer_set,
            timer_get: host_timer_get,
            time: host_time,
        };
        assert_eq!(unsafe { shim_register_host(&table) }, 0);
        // Second registration is refused
        assert_eq!(unsafe { shim_register_host(&table) }, ERR_SSL_BAD_INPUT_DATA);
    });
}

fn pem_pair(cn: &str) -> (CString, CString) {
    let (cert, key) = common::identity(cn);
    (CString::new(cert).unwrap(), CString::new(key).unwrap())
}

#[test]
fn test_new_ctx_free() {
    register();
    let (cert, key) = pem_pair("server.test");

    unsafe {
        let handle = ssl_new(cert.as_ptr(), key.as_ptr(), 1, 0, ptr::null());
        assert!(!handle.is_null());
        assert!(!ssl_ctx(handle).is_null());

        // Binding resets the timer with the handle as context
        assert!(TIMERS.lock().unwrap().contains(&(handle as usize, 0, 0)));

        ssl_free(handle);
    }
}

#[test]
fn test_new_failures_return_null() {
    register();
    let (cert, key) = pem_pair("server.test");
    let bogus = CString::new("-----BEGIN CERTIFICATE-----\nZm9v\n-----END CERTIFICATE-----\n").unwrap();

    unsafe {
        assert!(ssl_new(bogus.as_ptr(), key.as_ptr(), 1, 0, ptr::null()).is_null());
        assert!(ssl_new(cert.as_ptr(), bogus.as_ptr(), 1, 0, ptr::null()).is_null());
    }
    assert!(DEBUG.lock().unwrap().contains(&1));
}

#[test]
fn test_independent_handles() {
    register();
    let (cert, key) = pem_pair("server.test");
    let client_id = CString::new("192.0.2.44:5684").unwrap();

    unsafe {
        let a = ssl_new(cert.as_ptr(), key.as_ptr(), 1, 1, client_id.as_ptr());
        let b = ssl_new(cert.as_ptr(), key.as_ptr(), 1, 1, client_id.as_ptr());
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_ne!(ssl_ctx(a), ssl_ctx(b));

        ssl_free(a);
        assert!(!ssl_ctx(b).is_null());
        ssl_free(b);
    }
}

#[test]
fn test_client_drivers() {
    register();
    let (cert, key) = pem_pair("client.test");

    unsafe {
        let handle = ssl_new(cert.as_ptr(), key.as_ptr(), 0, 0, ptr::null());
        assert!(!handle.is_null());

        assert_eq!(ssl_handshake(handle), ERR_SSL_WANT_READ);
        assert!(SENT.lock().unwrap().iter().any(|&(ctx, len)| ctx == handle as usize && len > 0));

        let mut buf = [0u8; 16];
        assert_eq!(ssl_read(handle, ptr::null_mut(), 16), ERR_SSL_BAD_INPUT_DATA);
        assert!(ssl_read(handle, buf.as_mut_ptr(), buf.len()) < 0);
        assert_eq!(ssl_write(handle, ptr::null(), 4), ERR_SSL_BAD_INPUT_DATA);

        ssl_free(handle);
    }
}

#[test]
fn test_sizeof_table() {
    assert_eq!(
        shim_sizeof(SizedType::HostCallbacks as u32),
        std::mem::size_of::<HostCallbacks>()
    );
    assert_eq!(shim_sizeof(SizedType::HostCallbacks as u32), 8 * std::mem::size_of::<usize>());
    assert_eq!(shim_sizeof(SizedType::DelayContext as u32), 8);
    assert_eq!(shim_sizeof(SizedType::TimeVal as u32), std::mem::size_of::<libc::timeval>());
    assert_eq!(shim_sizeof(SizedType::ALL.len() as u32), 0);
    assert_eq!(shim_sizeof(u32::MAX), 0);
}

#[test]
fn test_linear_memory_for_pem() {
    register();
    let (cert, key) = common::identity("server.test");

    unsafe {
        let place = |bytes: &[u8]| {
            let buf = shim_alloc(bytes.len() + 1);
            assert!(!buf.is_null());
            ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
            *buf.add(bytes.len()) = 0;
            buf
        };
        let cert_buf = place(&cert);
        let key_buf = place(&key);

        let handle = ssl_new(cert_buf.cast(), key_buf.cast(), 1, 0, ptr::null());
        assert!(!handle.is_null());
        ssl_free(handle);

        shim_dealloc(cert_buf, cert.len() + 1);
        shim_dealloc(key_buf, key.len() + 1);
    }
}
