//! Host imports
//!
//! Everything the shim needs from its embedder goes through [`HostImports`]:
//! entropy, the per-config random generator, the debug sink, the transport,
//! the retransmission timer and the wall clock. [`HostCallbacks`] is the
//! C-layout table of function pointers a native host registers; on `wasm32`
//! the same table is filled from the module's imports.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int, c_uchar};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::callbacks::DelayContext;
use super::codes::{TIMER_CANCELLED, TIMER_FINAL, TIMER_INTERMEDIATE, TIMER_PENDING};

/// Opaque context pointer handed back to the host on every callback
///
/// For transport and timer callbacks this is the address of the owning
/// [`Session`](super::Session); config-level callbacks (random generator,
/// debug sink) receive a null context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HostContext(*mut c_void);

impl HostContext {
    pub const NULL: HostContext = HostContext(std::ptr::null_mut());

    pub fn new(ptr: *mut c_void) -> Self {
        HostContext(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Address as an integer, handy as a map key on the host side
    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

/// Functions the host must supply
///
/// Every call is synchronous: the library is blocked until the host returns.
/// Return values are passed through to the library unchanged.
pub trait HostImports: Send + Sync {
    /// Fill `buf` with entropy
    fn random(&self, buf: &mut [u8]);

    /// Random generator bound to the configuration; returns bytes written
    fn rng(&self, ctx: HostContext, buf: &mut [u8]) -> c_int;

    /// Diagnostic sink
    fn debug(&self, ctx: HostContext, level: c_int, file: &CStr, line: c_int, message: &CStr);

    /// Transmit `buf`; returns bytes sent or a negative code
    fn send(&self, ctx: HostContext, buf: &[u8]) -> c_int;

    /// Receive into `buf`; returns bytes received or a negative code
    fn recv(&self, ctx: HostContext, buf: &mut [u8]) -> c_int;

    /// Arm (or with `final_ms == 0`, cancel) the retransmission timer
    fn timer_set(&self, ctx: HostContext, intermediate_ms: u32, final_ms: u32);

    /// Timer state: -1 cancelled, 0 pending, 1 intermediate, 2 final
    fn timer_get(&self, ctx: HostContext) -> c_int;

    /// Wall-clock seconds since the Unix epoch
    ///
    /// Used as the certificate verification time. Zero or negative leaves
    /// the library on its own clock.
    fn time(&self) -> i64;
}

pub type RandomFn = unsafe extern "C" fn(buf: *mut c_uchar, len: usize);
pub type RngFn = unsafe extern "C" fn(ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int;
pub type DebugFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    level: c_int,
    file: *const c_char,
    line: c_int,
    message: *const c_char,
);
pub type SendFn = unsafe extern "C" fn(ctx: *mut c_void, buf: *const c_uchar, len: usize) -> c_int;
pub type RecvFn = unsafe extern "C" fn(ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int;
pub type TimerSetFn = unsafe extern "C" fn(ctx: *mut c_void, intermediate_ms: u32, final_ms: u32);
pub type TimerGetFn = unsafe extern "C" fn(ctx: *mut c_void) -> c_int;
pub type TimeFn = unsafe extern "C" fn(timer: *mut i64) -> i64;

/// Host dispatch table
///
/// Registered once per process; every session forwards through it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostCallbacks {
    pub random: RandomFn,
    pub rng: RngFn,
    pub debug: DebugFn,
    pub send: SendFn,
    pub recv: RecvFn,
    pub timer_set: TimerSetFn,
    pub timer_get: TimerGetFn,
    pub time: TimeFn,
}

impl HostImports for HostCallbacks {
    fn random(&self, buf: &mut [u8]) {
        unsafe { (self.random)(buf.as_mut_ptr(), buf.len()) }
    }

    fn rng(&self, ctx: HostContext, buf: &mut [u8]) -> c_int {
        unsafe { (self.rng)(ctx.as_ptr(), buf.as_mut_ptr(), buf.len()) }
    }

    fn debug(&self, ctx: HostContext, level: c_int, file: &CStr, line: c_int, message: &CStr) {
        unsafe { (self.debug)(ctx.as_ptr(), level, file.as_ptr(), line, message.as_ptr()) }
    }

    fn send(&self, ctx: HostContext, buf: &[u8]) -> c_int {
        unsafe { (self.send)(ctx.as_ptr(), buf.as_ptr(), buf.len()) }
    }

    fn recv(&self, ctx: HostContext, buf: &mut [u8]) -> c_int {
        unsafe { (self.recv)(ctx.as_ptr(), buf.as_mut_ptr(), buf.len()) }
    }

    fn timer_set(&self, ctx: HostContext, intermediate_ms: u32, final_ms: u32) {
        unsafe { (self.timer_set)(ctx.as_ptr(), intermediate_ms, final_ms) }
    }

    fn timer_get(&self, ctx: HostContext) -> c_int {
        unsafe { (self.timer_get)(ctx.as_ptr()) }
    }

    fn time(&self) -> i64 {
        unsafe { (self.time)(std::ptr::null_mut()) }
    }
}

#[cfg(target_arch = "wasm32")]
mod wasm {
    use std::ffi::c_void;
    use std::os::raw::{c_char, c_int, c_uchar};

    #[link(wasm_import_module = "mbedtls")]
    extern "C" {
        fn random(buf: *mut c_uchar, len: usize);
        fn get_time(timer: *mut i64) -> i64;
    }

    #[link(wasm_import_module = "env")]
    extern "C" {
        fn rng(ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int;
        fn dbg(ctx: *mut c_void, level: c_int, file: *const c_char, line: c_int, message: *const c_char);
    }

    #[link(wasm_import_module = "ssl")]
    extern "C" {
        fn ssl_send(ctx: *mut c_void, buf: *const c_uchar, len: usize) -> c_int;
        fn ssl_recv(ctx: *mut c_void, buf: *mut c_uchar, len: usize) -> c_int;
        fn ssl_timer_set(ctx: *mut c_void, intermediate_ms: u32, final_ms: u32);
        fn ssl_timer_get(ctx: *mut c_void) -> c_int;
    }

    pub(super) fn imported() -> super::HostCallbacks {
        super::HostCallbacks {
            random,
            rng,
            debug: dbg,
            send: ssl_send,
            recv: ssl_recv,
            timer_set: ssl_timer_set,
            timer_get: ssl_timer_get,
            time: get_time,
        }
    }
}

/// Dispatch table backed by the module's WASM imports
#[cfg(target_arch = "wasm32")]
pub fn wasm_imports() -> HostCallbacks {
    wasm::imported()
}

/// Wall-clock implementation of the timer hooks
///
/// Hosts without an event loop timer of their own can back
/// [`HostImports::timer_set`] and [`HostImports::timer_get`] with this.
#[derive(Debug, Default)]
pub struct ClockTimer {
    armed: Mutex<Option<(Instant, DelayContext)>>,
}

impl ClockTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, or cancel it when `final_ms` is zero
    pub fn set(&self, intermediate_ms: u32, final_ms: u32) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        *armed = if final_ms == 0 {
            None
        } else {
            Some((Instant::now(), DelayContext { intermediate_ms, final_ms }))
        };
    }

    pub fn get(&self) -> c_int {
        let armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        match *armed {
            None => TIMER_CANCELLED,
            Some((start, delay)) => {
                let elapsed = start.elapsed();
                if elapsed >= Duration::from_millis(delay.final_ms.into()) {
                    TIMER_FINAL
                } else if elapsed >= Duration::from_millis(delay.intermediate_ms.into()) {
                    TIMER_INTERMEDIATE
                } else {
                    TIMER_PENDING
                }
            }
        }
    }
}
