//! tls-shim - Session binding shim
//!
//! This crate exposes an OpenSSL (D)TLS session to a host runtime across a
//! foreign-function boundary: WASM imports/exports on `wasm32`, the C ABI
//! everywhere else. The handshake, record layer and X.509 handling all live
//! in OpenSSL; this crate only builds sessions and wires the host's
//! randomness, clock, transport, timer and logging callbacks into them.

pub mod shim;

pub use shim::{
    HostCallbacks, HostContext, HostImports, Role, Session, SessionOptions, ShimError,
    Transport,
};
