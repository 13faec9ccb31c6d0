//! Shared fixtures for the integration tests
//!
//! `LoopbackHost` implements the host surface in memory: every session gets
//! an inbox keyed by its context pointer, and `connect` pairs two sessions so
//! whatever one sends lands in the other's inbox.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};

use tls_shim::shim::codes::{
    ERR_SSL_WANT_READ, ERR_SSL_WANT_WRITE, TIMER_CANCELLED, TIMER_FINAL, TIMER_PENDING,
};
use tls_shim::{HostContext, HostImports, Session};

/// Self-signed identity, returned as `(certificate_pem, private_key_pem)`
pub fn identity(cn: &str) -> (Vec<u8>, Vec<u8>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(7).unwrap()).unwrap();
    builder.append_extension(BasicConstraints::new().build().unwrap()).unwrap();
    let san = SubjectAlternativeName::new()
        .dns(cn)
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (
        builder.build().to_pem().unwrap(),
        key.private_key_to_pem_pkcs8().unwrap(),
    )
}

/// Process-wide splitmix64 stream
///
/// Test hosts must not call back into the library for randomness: once a
/// session is built the library draws its own random bytes from the host.
pub fn fill_random(buf: &mut [u8]) {
    const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
    static STATE: AtomicU64 = AtomicU64::new(0x2545_F491_4F6C_DD1D);

    for chunk in buf.chunks_mut(8) {
        let mut z = STATE.fetch_add(GAMMA, Ordering::Relaxed).wrapping_add(GAMMA);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
    }
}

/// One message delivered to the debug sink
#[derive(Debug, Clone)]
pub struct DebugLine {
    pub ctx: usize,
    pub level: c_int,
    pub file: String,
    pub line: c_int,
    pub message: String,
}

#[derive(Default)]
struct State {
    inbox: HashMap<usize, VecDeque<Vec<u8>>>,
    peers: HashMap<usize, usize>,
    debug: Vec<DebugLine>,
    timer_sets: Vec<(usize, u32, u32)>,
    timers: HashMap<usize, c_int>,
    recv_failures: HashMap<usize, c_int>,
    rng_calls: Vec<(usize, usize, ThreadId)>,
    random_calls: usize,
    now: i64,
}

/// In-memory host connecting sessions back to back
#[derive(Default)]
pub struct LoopbackHost {
    state: Mutex<State>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route traffic between two sessions in both directions
    pub fn connect(&self, a: HostContext, b: HostContext) {
        let mut state = self.state.lock().unwrap();
        state.peers.insert(a.addr(), b.addr());
        state.peers.insert(b.addr(), a.addr());
    }

    /// Queue raw bytes for a session as if its peer had sent them
    pub fn inject(&self, ctx: HostContext, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.inbox.entry(ctx.addr()).or_default().push_back(bytes.to_vec());
    }

    /// Report the final delay of a session's timer as expired
    pub fn expire(&self, ctx: HostContext) {
        let mut state = self.state.lock().unwrap();
        state.timers.insert(ctx.addr(), TIMER_FINAL);
    }

    /// Drop everything queued for a session
    pub fn drain(&self, ctx: HostContext) -> usize {
        let mut state = self.state.lock().unwrap();
        state.inbox.remove(&ctx.addr()).map_or(0, |q| q.len())
    }

    /// Make every receive for a session fail with `status`
    pub fn fail_recv(&self, ctx: HostContext, status: c_int) {
        let mut state = self.state.lock().unwrap();
        state.recv_failures.insert(ctx.addr(), status);
    }

    /// Seconds since the epoch reported by the time import
    pub fn set_time(&self, now: i64) {
        self.state.lock().unwrap().now = now;
    }

    pub fn debug_lines(&self) -> Vec<DebugLine> {
        self.state.lock().unwrap().debug.clone()
    }

    pub fn timer_sets(&self) -> Vec<(usize, u32, u32)> {
        self.state.lock().unwrap().timer_sets.clone()
    }

    pub fn timer_sets_for(&self, ctx: HostContext) -> Vec<(u32, u32)> {
        self.timer_sets()
            .into_iter()
            .filter(|(addr, _, _)| *addr == ctx.addr())
            .map(|(_, i, f)| (i, f))
            .collect()
    }

    /// `(context, length)` of every rng request
    pub fn rng_calls(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock().unwrap();
        state.rng_calls.iter().map(|&(ctx, len, _)| (ctx, len)).collect()
    }

    /// Rng requests made on the calling thread
    pub fn rng_calls_here(&self) -> Vec<(usize, usize)> {
        let me = thread::current().id();
        let state = self.state.lock().unwrap();
        state
            .rng_calls
            .iter()
            .filter(|&&(_, _, id)| id == me)
            .map(|&(ctx, len, _)| (ctx, len))
            .collect()
    }
}

impl HostImports for LoopbackHost {
    fn random(&self, buf: &mut [u8]) {
        fill_random(buf);
        self.state.lock().unwrap().random_calls += 1;
    }

    fn rng(&self, ctx: HostContext, buf: &mut [u8]) -> c_int {
        fill_random(buf);
        let id = thread::current().id();
        self.state.lock().unwrap().rng_calls.push((ctx.addr(), buf.len(), id));
        buf.len() as c_int
    }

    fn debug(&self, ctx: HostContext, level: c_int, file: &CStr, line: c_int, message: &CStr) {
        self.state.lock().unwrap().debug.push(DebugLine {
            ctx: ctx.addr(),
            level,
            file: file.to_string_lossy().into_owned(),
            line,
            message: message.to_string_lossy().into_owned(),
        });
    }

    fn send(&self, ctx: HostContext, buf: &[u8]) -> c_int {
        let mut state = self.state.lock().unwrap();
        if let Some(peer) = state.peers.get(&ctx.addr()).copied() {
            state.inbox.entry(peer).or_default().push_back(buf.to_vec());
        }
        buf.len() as c_int
    }

    fn recv(&self, ctx: HostContext, buf: &mut [u8]) -> c_int {
        let mut state = self.state.lock().unwrap();
        if let Some(&status) = state.recv_failures.get(&ctx.addr()) {
            return status;
        }
        let Some(queue) = state.inbox.get_mut(&ctx.addr()) else {
            return ERR_SSL_WANT_READ;
        };
        let Some(mut chunk) = queue.pop_front() else {
            return ERR_SSL_WANT_READ;
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            queue.push_front(chunk.split_off(n));
        }
        n as c_int
    }

    fn timer_set(&self, ctx: HostContext, intermediate_ms: u32, final_ms: u32) {
        let mut state = self.state.lock().unwrap();
        state.timer_sets.push((ctx.addr(), intermediate_ms, final_ms));
        let status = if final_ms == 0 { TIMER_CANCELLED } else { TIMER_PENDING };
        state.timers.insert(ctx.addr(), status);
    }

    fn timer_get(&self, ctx: HostContext) -> c_int {
        let state = self.state.lock().unwrap();
        state.timers.get(&ctx.addr()).copied().unwrap_or(TIMER_CANCELLED)
    }

    fn time(&self) -> i64 {
        self.state.lock().unwrap().now
    }
}

/// Step both handshakes until they complete
///
/// Returns the final `(client, server)` statuses if either side fails or the
/// exchange stalls.
pub fn drive_handshake(client: &mut Session, server: &mut Session) -> Result<(), (c_int, c_int)> {
    let mut last = (ERR_SSL_WANT_READ, ERR_SSL_WANT_READ);

    for _ in 0..64 {
        if !client.is_handshake_done() {
            last.0 = client.handshake();
        }
        if !server.is_handshake_done() {
            last.1 = server.handshake();
        }
        if client.is_handshake_done() && server.is_handshake_done() {
            return Ok(());
        }
        if is_fatal(last.0) || is_fatal(last.1) {
            return Err(last);
        }
    }
    Err(last)
}

/// Read until data arrives or the session stops asking for input
pub fn read_some(session: &mut Session, buf: &mut [u8]) -> c_int {
    for _ in 0..8 {
        let n = session.read(buf);
        if n != ERR_SSL_WANT_READ {
            return n;
        }
    }
    ERR_SSL_WANT_READ
}

pub fn is_fatal(status: c_int) -> bool {
    status < 0 && status != ERR_SSL_WANT_READ && status != ERR_SSL_WANT_WRITE
}
