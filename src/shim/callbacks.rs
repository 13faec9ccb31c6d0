//! Callback adapters
//!
//! Fixed-signature forwarders between the library's callback expectations
//! and [`HostImports`]. None of them buffer, retry or transform: buffers,
//! lengths, context pointers and return values cross unchanged. The only
//! translation happens where the library consumes `std::io` traits, which is
//! [`HostBio`]'s `Read`/`Write` façade.

use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::io::{self, Read, Write};
use std::os::raw::{c_double, c_int, c_uchar};
use std::slice;
use std::sync::{Arc, Once, OnceLock, RwLock};
use std::time::Duration;

use log::{trace, warn};
use openssl::error::ErrorStack;
use openssl::ssl::{SslContextBuilder, SslVerifyMode};
use thiserror::Error;

use super::codes::{
    ERR_NET_RECV_FAILED, ERR_NET_SEND_FAILED, ERR_SSL_CONN_EOF, ERR_SSL_WANT_READ,
    ERR_SSL_WANT_WRITE,
};
use super::host::{HostContext, HostImports};

/// Bytes of host entropy mixed into the library's pool
pub const ENTROPY_SEED_LEN: usize = 48;

/// `RAND_METHOD` layout; openssl-sys does not bind the method table
#[repr(C)]
struct RandMethod {
    seed: Option<unsafe extern "C" fn(buf: *const c_void, num: c_int) -> c_int>,
    bytes: Option<unsafe extern "C" fn(buf: *mut c_uchar, num: c_int) -> c_int>,
    cleanup: Option<unsafe extern "C" fn()>,
    add: Option<unsafe extern "C" fn(buf: *const c_void, num: c_int, entropy: c_double) -> c_int>,
    pseudorand: Option<unsafe extern "C" fn(buf: *mut c_uchar, num: c_int) -> c_int>,
    status: Option<unsafe extern "C" fn() -> c_int>,
}

extern "C" {
    fn RAND_set_rand_method(meth: *const RandMethod) -> c_int;
}

static HOST_RAND: RandMethod = RandMethod {
    seed: Some(rand_accept),
    bytes: Some(rand_bytes),
    cleanup: None,
    add: Some(rand_add),
    pseudorand: Some(rand_bytes),
    status: Some(rand_status),
};

thread_local! {
    static ACTIVE: RefCell<Option<RngAdapter>> = const { RefCell::new(None) };
}

/// Generator used outside any session scope; the latest installed wins
static FALLBACK: RwLock<Option<RngAdapter>> = RwLock::new(None);

fn current_rng() -> Option<RngAdapter> {
    let active = ACTIVE.try_with(|active| active.borrow().clone()).ok().flatten();
    active.or_else(|| FALLBACK.read().unwrap_or_else(|e| e.into_inner()).clone())
}

unsafe extern "C" fn rand_bytes(buf: *mut c_uchar, num: c_int) -> c_int {
    if buf.is_null() || num < 0 {
        return 0;
    }
    match current_rng() {
        Some(rng) => {
            rng.fill(slice::from_raw_parts_mut(buf, num as usize));
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn rand_accept(_buf: *const c_void, _num: c_int) -> c_int {
    1
}

unsafe extern "C" fn rand_add(_buf: *const c_void, _num: c_int, _entropy: c_double) -> c_int {
    1
}

unsafe extern "C" fn rand_status() -> c_int {
    1
}

/// Random generator adapter
///
/// Bound at configuration level, so the host sees a null context. Once
/// [`install`](Self::install)ed, every random byte the library draws is
/// requested from the adapter of the innermost [`RngScope`] on the calling
/// thread, or from the most recently installed adapter outside any scope.
#[derive(Clone)]
pub struct RngAdapter {
    host: Arc<dyn HostImports>,
}

impl RngAdapter {
    pub fn new(host: Arc<dyn HostImports>) -> Self {
        RngAdapter { host }
    }

    /// Fill `buf` from the host generator
    ///
    /// Always reports success (0). A short write from the host is logged and
    /// the unwritten tail keeps whatever the buffer held before.
    pub fn fill(&self, buf: &mut [u8]) -> c_int {
        let written = self.host.rng(HostContext::NULL, buf);
        if written >= 0 && (written as usize) < buf.len() {
            warn!("host rng wrote {} of {} requested bytes", written, buf.len());
        }
        0
    }

    /// Mix host entropy into the library's random pool, once per process
    pub fn seed_library(&self) {
        static SEEDED: Once = Once::new();

        SEEDED.call_once(|| {
            let mut seed = [0u8; ENTROPY_SEED_LEN];
            self.host.random(&mut seed);
            let len = seed.len() as c_int;
            unsafe { openssl_sys::RAND_add(seed.as_ptr().cast(), len, c_double::from(len)) };
            trace!("seeded library pool with {} bytes of host entropy", seed.len());
        });
    }

    /// Make this adapter the library's random source
    ///
    /// The method table is registered once per process.
    pub fn install(&self) -> Result<(), ErrorStack> {
        static INSTALLED: OnceLock<bool> = OnceLock::new();

        *FALLBACK.write().unwrap_or_else(|e| e.into_inner()) = Some(self.clone());
        let installed = *INSTALLED.get_or_init(|| {
            let ok = unsafe { RAND_set_rand_method(&HOST_RAND) } == 1;
            trace!("host random method installed: {}", ok);
            ok
        });
        if installed {
            Ok(())
        } else {
            Err(ErrorStack::get())
        }
    }

    /// Route the calling thread's library draws to this adapter
    pub fn enter(&self) -> RngScope {
        let previous = ACTIVE.with(|active| active.replace(Some(self.clone())));
        RngScope { previous }
    }
}

/// Guard returned by [`RngAdapter::enter`]; restores the previous routing
pub struct RngScope {
    previous: Option<RngAdapter>,
}

impl Drop for RngScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = ACTIVE.try_with(|active| active.replace(previous));
    }
}

/// Diagnostic logging adapter
///
/// Messages of level `L` reach the host when `L <= threshold`. Levels follow
/// the usual scale: 1 error, 2 state change, 3 informational, 4 verbose.
#[derive(Clone)]
pub struct DebugAdapter {
    host: Arc<dyn HostImports>,
    threshold: c_int,
}

impl DebugAdapter {
    pub fn new(host: Arc<dyn HostImports>, threshold: c_int) -> Self {
        DebugAdapter { host, threshold }
    }

    pub fn threshold(&self) -> c_int {
        self.threshold
    }

    pub fn enabled(&self, level: c_int) -> bool {
        level <= self.threshold
    }

    /// Forward one message to the host sink
    pub fn emit(&self, level: c_int, file: &str, line: u32, message: &str) {
        trace!("debug[{}] {}:{}: {}", level, file, line, message);
        if !self.enabled(level) {
            return;
        }
        let file = lossy_cstring(file);
        let message = lossy_cstring(message);
        self.host.debug(HostContext::NULL, level, &file, line as c_int, &message);
    }

    /// Forward every entry of a library error stack at error level
    pub fn error_stack(&self, stack: &ErrorStack) {
        for err in stack.errors() {
            self.emit(1, &*err.file(), err.line(), &err.to_string());
        }
    }

    /// Install the certificate verification observer
    ///
    /// The observer reports every verification result to the sink and hands
    /// the library's verdict back unchanged.
    pub fn install_verify(&self, builder: &mut SslContextBuilder, mode: SslVerifyMode) {
        let debug = self.clone();
        builder.set_verify_callback(mode, move |preverified, store| {
            if preverified {
                debug.emit(3, file!(), line!(), &format!("x509 verify ok at depth {}", store.error_depth()));
            } else {
                debug.emit(
                    1,
                    file!(),
                    line!(),
                    &format!("x509 verify failed at depth {}: {}", store.error_depth(), store.error()),
                );
            }
            preverified
        });
    }
}

fn lossy_cstring(s: &str) -> CString {
    let bytes: Vec<u8> = s.bytes().take_while(|&b| b != 0).collect();
    CString::new(bytes).unwrap_or_default()
}

/// Transport adapter
///
/// Holds the session's context pointer and forwards send/receive to the host.
pub struct HostBio {
    host: Arc<dyn HostImports>,
    ctx: HostContext,
}

impl HostBio {
    pub fn new(host: Arc<dyn HostImports>, ctx: HostContext) -> Self {
        HostBio { host, ctx }
    }

    pub fn context(&self) -> HostContext {
        self.ctx
    }

    /// Forward to the host's send import
    pub fn send(&self, buf: &[u8]) -> c_int {
        self.host.send(self.ctx, buf)
    }

    /// Forward to the host's receive import
    pub fn recv(&self, buf: &mut [u8]) -> c_int {
        self.host.recv(self.ctx, buf)
    }
}

/// Host transport status carried through `std::io`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("host transport status {0:#x}")]
pub struct TransportStatus(pub c_int);

/// Translate a host transport status into `std::io` terms
///
/// Negative codes other than the would-block pair travel inside the error
/// so they can be handed back to the caller unchanged. A count larger than
/// the buffer becomes `overflow`.
pub(crate) fn status_to_io(status: c_int, len: usize, overflow: c_int) -> io::Result<usize> {
    match status {
        n if n >= 0 && n as usize <= len => Ok(n as usize),
        n if n >= 0 => {
            warn!("host transport reported {} bytes for a {} byte buffer", n, len);
            Err(io::Error::new(io::ErrorKind::InvalidData, TransportStatus(overflow)))
        }
        ERR_SSL_WANT_READ | ERR_SSL_WANT_WRITE => Err(io::ErrorKind::WouldBlock.into()),
        ERR_SSL_CONN_EOF => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            TransportStatus(ERR_SSL_CONN_EOF),
        )),
        code => Err(io::Error::new(io::ErrorKind::Other, TransportStatus(code))),
    }
}

/// Host status carried by a transport error, if any
pub(crate) fn host_status(err: &io::Error) -> Option<c_int> {
    err.get_ref()?.downcast_ref::<TransportStatus>().map(|status| status.0)
}

impl Read for HostBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(c_int::MAX as usize);
        let status = self.recv(&mut buf[..len]);
        status_to_io(status, len, ERR_NET_RECV_FAILED)
    }
}

impl Write for HostBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(c_int::MAX as usize);
        let status = self.send(&buf[..len]);
        status_to_io(status, len, ERR_NET_SEND_FAILED)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Last delays handed to the host timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DelayContext {
    pub intermediate_ms: u32,
    pub final_ms: u32,
}

/// Timer adapter
pub struct TimerAdapter {
    host: Arc<dyn HostImports>,
    ctx: HostContext,
    armed: Option<DelayContext>,
}

impl TimerAdapter {
    pub fn new(host: Arc<dyn HostImports>, ctx: HostContext) -> Self {
        TimerAdapter { host, ctx, armed: None }
    }

    /// Create the adapter and reset the host timer, as binding does
    pub fn bind(host: Arc<dyn HostImports>, ctx: HostContext) -> Self {
        let mut timer = Self::new(host, ctx);
        timer.set(0, 0);
        timer
    }

    /// Forward to the host's timer-set import
    pub fn set(&mut self, intermediate_ms: u32, final_ms: u32) {
        self.host.timer_set(self.ctx, intermediate_ms, final_ms);
        self.armed = if final_ms == 0 {
            None
        } else {
            Some(DelayContext { intermediate_ms, final_ms })
        };
    }

    /// Forward to the host's timer-get import
    pub fn get(&self) -> c_int {
        self.host.timer_get(self.ctx)
    }

    /// Arm for `delay`, with the intermediate mark at a quarter of it
    pub fn arm(&mut self, delay: Duration) {
        let final_ms = delay.as_millis().clamp(1, u32::MAX as u128) as u32;
        self.set(final_ms / 4, final_ms);
    }

    pub fn cancel(&mut self) {
        if self.armed.is_some() {
            self.set(0, 0);
        }
    }

    pub fn armed(&self) -> Option<DelayContext> {
        self.armed
    }
}
