//! Session aggregate
//!
//! A [`Session`] exclusively owns the four library objects a connection
//! needs: the protocol context, its configuration, the certificate chain and
//! the private key. Construction runs the library's setup calls in a fixed
//! order. Every step yields an owned value, so a failing step drops exactly
//! the steps before it, in reverse order, and nothing half-built escapes.

use std::alloc::{alloc, dealloc, Layout};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use foreign_types::ForeignTypeRef;
use log::{debug, trace};
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::ssl::{self, ErrorCode, Ssl, SslContext, SslRef, SslStream};

use super::callbacks::{self, DebugAdapter, DelayContext, HostBio, RngAdapter, TimerAdapter};
use super::cert::{self, CertChain};
use super::codes::{ERR_SSL_FATAL, ERR_SSL_WANT_READ, ERR_SSL_WANT_WRITE, TIMER_FINAL};
use super::config::{self, Role, SessionOptions, ShimError};
use super::cookie::{self, CookieKey};
use super::host::{HostContext, HostImports};
use super::Result;

const DTLS_CTRL_GET_TIMEOUT: c_int = 73;
const DTLS_CTRL_HANDLE_TIMEOUT: c_int = 74;

/// TLS/DTLS session bound to a host
///
/// Field order is teardown order: context, config, key, chain.
pub struct Session {
    stream: SslStream<HostBio>,
    timer: TimerAdapter,
    config: SslContext,
    key: PKey<Private>,
    chain: CertChain,
    options: SessionOptions,
    diag: DebugAdapter,
    rng: RngAdapter,
    host: Arc<dyn HostImports>,
    handshake_done: bool,
}

impl Session {
    /// Build a session from PEM certificate chain and key
    ///
    /// The session's heap address is reserved first and handed to the
    /// transport and timer adapters as their context pointer, so the host
    /// can recover the session from any callback.
    pub fn new(
        cert_pem: &[u8],
        key_pem: &[u8],
        options: SessionOptions,
        host: Arc<dyn HostImports>,
    ) -> Result<Box<Session>> {
        let layout = Layout::new::<Session>();
        // SAFETY: Session is not zero-sized.
        let slot = unsafe { alloc(layout) }.cast::<Session>();
        if slot.is_null() {
            return Err(ShimError::Allocation(format!("session ({} bytes)", layout.size())));
        }

        let ctx = HostContext::new(slot.cast());
        match Session::init(ctx, cert_pem, key_pem, options, host) {
            // SAFETY: `slot` was allocated above with the layout of Session
            // and is written exactly once before being owned by the Box.
            Ok(session) => unsafe {
                slot.write(session);
                Ok(Box::from_raw(slot))
            },
            Err(err) => {
                // SAFETY: nothing was written to `slot`.
                unsafe { dealloc(slot.cast(), layout) };
                Err(err)
            }
        }
    }

    fn init(
        ctx: HostContext,
        cert_pem: &[u8],
        key_pem: &[u8],
        options: SessionOptions,
        host: Arc<dyn HostImports>,
    ) -> Result<Session> {
        let diag = DebugAdapter::new(host.clone(), options.debug_threshold());

        Session::setup(ctx, cert_pem, key_pem, options, host, diag.clone()).map_err(|err| {
            diag.emit(1, file!(), line!(), &format!("session setup failed: {}", err));
            if let Some(stack) = err.error_stack() {
                diag.error_stack(stack);
            }
            err
        })
    }

    fn setup(
        ctx: HostContext,
        cert_pem: &[u8],
        key_pem: &[u8],
        options: SessionOptions,
        host: Arc<dyn HostImports>,
        diag: DebugAdapter,
    ) -> Result<Session> {
        let rng = RngAdapter::new(host.clone());
        let _rng = rng.enter();

        // Certificate
        let chain = CertChain::from_pem(cert_pem)?;
        diag.emit(
            3,
            file!(),
            line!(),
            &format!(
                "own certificate chain: {} certificate(s), leaf {}",
                chain.len(),
                chain.leaf_info().subject
            ),
        );

        // Secret key
        let key = cert::parse_private_key(key_pem)?;

        // Config
        let mut builder = config::config_defaults(&options)?;
        config::bind_own_cert(&mut builder, &chain, &key)?;

        rng.seed_library();
        rng.install().map_err(|source| ShimError::Setup {
            stage: "bind rng",
            source,
        })?;
        if options.is_datagram_server() {
            cookie::install(&mut builder, CookieKey::generate(&rng));
        }

        diag.install_verify(&mut builder, options.verify_mode());
        let config = builder.build();

        // Context
        let mut ssl = Ssl::new(&config).map_err(|source| ShimError::Setup {
            stage: "context init",
            source,
        })?;
        apply_host_time(&ssl, host.as_ref(), &diag);
        match options.role() {
            Role::Server => ssl.set_accept_state(),
            Role::Client => ssl.set_connect_state(),
        }
        if options.role().is_server() {
            cookie::bind_client_id(&mut ssl, options.client_id())?;
        }

        let stream = SslStream::new(ssl, HostBio::new(host.clone(), ctx)).map_err(|source| {
            ShimError::Setup {
                stage: "bind transport",
                source,
            }
        })?;
        let timer = TimerAdapter::bind(host.clone(), ctx);

        debug!(
            "session {:p} ready: {} over {}",
            ctx.as_ptr(),
            options.role().as_str(),
            options.transport().as_str()
        );

        Ok(Session {
            stream,
            timer,
            config,
            key,
            chain,
            options,
            diag,
            rng,
            host,
            handshake_done: false,
        })
    }

    /// Protocol context (non-owning)
    pub fn context(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Raw protocol context for the foreign boundary
    pub fn context_ptr(&self) -> *mut openssl_sys::SSL {
        self.stream.ssl().as_ptr()
    }

    /// Protocol context together with its transport
    pub fn stream_mut(&mut self) -> &mut SslStream<HostBio> {
        &mut self.stream
    }

    pub fn config(&self) -> &SslContext {
        &self.config
    }

    pub fn certificate_chain(&self) -> &CertChain {
        &self.chain
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Context pointer handed to the host on transport and timer callbacks
    pub fn host_context(&self) -> HostContext {
        self.stream.get_ref().context()
    }

    /// Delays of the currently armed retransmission timer
    pub fn timer(&self) -> Option<DelayContext> {
        self.timer.armed()
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Run one handshake step
    ///
    /// Returns 0 once the handshake is complete, `ERR_SSL_WANT_READ` or
    /// `ERR_SSL_WANT_WRITE` when the transport would block, the host's own
    /// status when its transport failed, and `ERR_SSL_FATAL` otherwise.
    /// Datagram sessions service the retransmission timer around the step.
    pub fn handshake(&mut self) -> c_int {
        let _rng = self.rng.enter();
        apply_host_time(self.stream.ssl(), self.host.as_ref(), &self.diag);

        let datagram = self.options.transport().is_datagram();
        if datagram {
            self.service_retransmit();
        }

        let status = match self.stream.do_handshake() {
            Ok(()) => {
                self.handshake_done = true;
                0
            }
            Err(err) => self.status_of(&err),
        };

        if datagram {
            self.sync_timer(status);
        }

        self.diag.emit(
            2,
            file!(),
            line!(),
            &format!(
                "handshake step: {} ({:#x})",
                self.stream.ssl().state_string_long(),
                status
            ),
        );
        status
    }

    /// Read application data
    ///
    /// Returns the number of bytes read, 0 once the peer closed the
    /// connection, or a negative status as for [`handshake`](Self::handshake).
    pub fn read(&mut self, buf: &mut [u8]) -> c_int {
        let _rng = self.rng.enter();
        let len = buf.len().min(c_int::MAX as usize);
        match self.stream.ssl_read(&mut buf[..len]) {
            Ok(n) => n as c_int,
            Err(err) if err.code() == ErrorCode::ZERO_RETURN => 0,
            Err(err) => self.status_of(&err),
        }
    }

    /// Write application data
    pub fn write(&mut self, buf: &[u8]) -> c_int {
        let _rng = self.rng.enter();
        let len = buf.len().min(c_int::MAX as usize);
        match self.stream.ssl_write(&buf[..len]) {
            Ok(n) => n as c_int,
            Err(err) => self.status_of(&err),
        }
    }

    fn status_of(&self, err: &ssl::Error) -> c_int {
        let code = err.code();
        if code == ErrorCode::WANT_READ {
            return ERR_SSL_WANT_READ;
        }
        if code == ErrorCode::WANT_WRITE {
            return ERR_SSL_WANT_WRITE;
        }

        if let Some(io) = err.io_error() {
            self.diag.emit(1, file!(), line!(), &format!("transport failed: {}", io));
            if let Some(status) = callbacks::host_status(io) {
                return status;
            }
        } else if let Some(stack) = err.ssl_error() {
            self.diag.error_stack(stack);
        } else {
            self.diag.emit(1, file!(), line!(), &format!("library error code {}", code.as_raw()));
        }
        ERR_SSL_FATAL
    }

    fn service_retransmit(&mut self) {
        if self.timer.armed().is_none() || self.timer.get() != TIMER_FINAL {
            return;
        }

        let ret = unsafe {
            openssl_sys::SSL_ctrl(self.context_ptr(), DTLS_CTRL_HANDLE_TIMEOUT, 0, ptr::null_mut())
        };
        self.diag.emit(2, file!(), line!(), &format!("retransmission timer expired ({})", ret));
        self.timer.cancel();
    }

    fn sync_timer(&mut self, status: c_int) {
        if status == ERR_SSL_WANT_WRITE {
            return;
        }
        if status != ERR_SSL_WANT_READ {
            self.timer.cancel();
            return;
        }

        match dtls_timeout(self.stream.ssl()) {
            Some(delay) if self.timer.armed().is_none() => self.timer.arm(delay),
            Some(_) => {}
            None => self.timer.cancel(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!("releasing session {:p}", self.host_context().as_ptr());
    }
}

/// Pin certificate verification to the host clock, when it has one
fn apply_host_time(ssl: &SslRef, host: &dyn HostImports, diag: &DebugAdapter) {
    let now = host.time();
    if now <= 0 {
        return;
    }
    unsafe {
        let param = openssl_sys::SSL_get0_param(ssl.as_ptr());
        openssl_sys::X509_VERIFY_PARAM_set_time(param, now as libc::time_t);
    }
    diag.emit(4, file!(), line!(), &format!("verification time {}", now));
}

/// Remaining time on the library's DTLS retransmission timer
fn dtls_timeout(ssl: &SslRef) -> Option<Duration> {
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let ret = unsafe {
        openssl_sys::SSL_ctrl(
            ssl.as_ptr(),
            DTLS_CTRL_GET_TIMEOUT,
            0,
            (&mut tv as *mut libc::timeval).cast(),
        )
    };
    if ret <= 0 {
        return None;
    }
    Some(Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64))
}
