//! Session binding shim
//!
//! This module binds OpenSSL sessions to a host that lives on the other side
//! of a foreign-function boundary. The host supplies the transport, the
//! timers, the entropy and the diagnostic sink; OpenSSL does everything else.
//!
//! # Architecture
//!
//! 1. `SessionOptions` selects the role (server/client) and transport
//!    (stream/datagram) and carries the client transport identifier
//! 2. `Session::new` builds the four owned sub-objects in a fixed order:
//!    certificate chain, private key, configuration, protocol context
//! 3. The callback adapters in `callbacks` forward every library callback to
//!    the `HostImports` implementation, passing the session's own address as
//!    the opaque context pointer. The host generator replaces the library's
//!    random source while a session runs
//! 4. `ffi` exports the constructor, accessor, teardown and size table to the
//!    host (`ssl_new`, `ssl_ctx`, `ssl_free`, `sizeof`), plus handshake and
//!    record drivers and linear-memory helpers
//!
//! Failure at any construction step releases only what was already built.
//! The boundary collapses every failure to a null handle; the reason goes to
//! the host's debug sink.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use tls_shim::shim::{HostCallbacks, Session, SessionOptions, Transport};
//!
//! # fn host_table() -> HostCallbacks { unimplemented!() }
//! let cert_pem = std::fs::read("server.crt").unwrap();
//! let key_pem = std::fs::read("server.key").unwrap();
//!
//! let options = SessionOptions::server()
//!     .transport(Transport::Datagram)
//!     .client_id(b"192.0.2.7:5684".to_vec())
//!     .build()
//!     .unwrap();
//!
//! let mut session = Session::new(&cert_pem, &key_pem, options, Arc::new(host_table())).unwrap();
//! let status = session.handshake();
//! ```

pub mod callbacks;
pub mod cert;
pub mod config;
pub mod cookie;
pub mod ffi;
pub mod host;
pub mod session;
pub mod sizes;

pub use callbacks::{DebugAdapter, DelayContext, HostBio, RngAdapter, TimerAdapter};
pub use cert::{CertChain, CertInfo};
pub use config::{Role, SessionOptions, SessionOptionsBuilder, ShimError, Transport};
pub use cookie::{ClientId, CookieKey};
pub use host::{ClockTimer, HostCallbacks, HostContext, HostImports};
pub use session::Session;
pub use sizes::SizedType;

/// Result type for shim operations
pub type Result<T> = std::result::Result<T, ShimError>;

/// Return codes shared with the host.
///
/// Values use mbedtls numbering, so host transports written for mbedtls
/// signal "would block" with the values they already use.
pub mod codes {
    use std::os::raw::c_int;

    /// No data available yet; retry once the transport is readable.
    pub const ERR_SSL_WANT_READ: c_int = -0x6900;
    /// Transport cannot accept data yet; retry once it is writable.
    pub const ERR_SSL_WANT_WRITE: c_int = -0x6880;
    /// The transport reached end of stream.
    pub const ERR_SSL_CONN_EOF: c_int = -0x7280;
    /// Invalid argument at the boundary (null handle, bad length).
    pub const ERR_SSL_BAD_INPUT_DATA: c_int = -0x7100;
    /// Fatal library error; details were sent to the debug sink.
    pub const ERR_SSL_FATAL: c_int = -0x7780;
    /// Host transport failure on send.
    pub const ERR_NET_SEND_FAILED: c_int = -0x004E;
    /// Host transport failure on receive.
    pub const ERR_NET_RECV_FAILED: c_int = -0x004C;

    /// Timer result: no timer armed.
    pub const TIMER_CANCELLED: c_int = -1;
    /// Timer result: armed, nothing expired.
    pub const TIMER_PENDING: c_int = 0;
    /// Timer result: the intermediate delay passed.
    pub const TIMER_INTERMEDIATE: c_int = 1;
    /// Timer result: the final delay passed.
    pub const TIMER_FINAL: c_int = 2;
}
