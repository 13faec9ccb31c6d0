//! Datagram client demultiplexing
//!
//! A DTLS server sharing one socket between many peers binds each session to
//! the peer's transport identifier (typically its address). The library's
//! cookie exchange then ties the HelloVerifyRequest cookie to that
//! identifier, so a ClientHello replayed from another address is rejected.

use std::sync::OnceLock;

use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::ssl::{Ssl, SslContextBuilder, SslRef};

use super::callbacks::RngAdapter;
use super::config::ShimError;

/// Length of the cookie secret
pub const COOKIE_SECRET_LEN: usize = 32;

/// Client transport identifier bound to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    /// Copy a caller-supplied identifier
    pub fn copy_from(id: &[u8]) -> Result<Self, ShimError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(id.len())
            .map_err(|e| ShimError::Allocation(format!("client id: {}", e)))?;
        bytes.extend_from_slice(id);
        Ok(ClientId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Secret keying the cookies of one configuration
#[derive(Clone)]
pub struct CookieKey {
    secret: [u8; COOKIE_SECRET_LEN],
}

impl CookieKey {
    /// Draw a fresh secret from the configuration's random generator
    pub fn generate(rng: &RngAdapter) -> Self {
        let mut secret = [0u8; COOKIE_SECRET_LEN];
        rng.fill(&mut secret);
        CookieKey { secret }
    }

    pub fn from_secret(secret: [u8; COOKIE_SECRET_LEN]) -> Self {
        CookieKey { secret }
    }

    /// HMAC-SHA256 of the client identifier under the secret
    pub fn cookie(&self, client_id: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let key = PKey::hmac(&self.secret)?;
        let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
        signer.update(client_id)?;
        signer.sign_to_vec()
    }

    /// Check a cookie echoed back by a client
    pub fn verify(&self, client_id: &[u8], cookie: &[u8]) -> bool {
        match self.cookie(client_id) {
            Ok(expected) => expected.len() == cookie.len() && memcmp::eq(&expected, cookie),
            Err(_) => false,
        }
    }
}

fn client_id_index() -> Result<Index<Ssl, ClientId>, ErrorStack> {
    static INDEX: OnceLock<Index<Ssl, ClientId>> = OnceLock::new();

    if let Some(index) = INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*INDEX.get_or_init(|| index))
}

/// Identifier bound to `ssl`, empty when none was bound
pub fn client_id_of(ssl: &SslRef) -> &[u8] {
    client_id_index()
        .ok()
        .and_then(|index| ssl.ex_data(index))
        .map(ClientId::as_bytes)
        .unwrap_or(&[])
}

/// Bind a client transport identifier to a protocol context
pub(crate) fn bind_client_id(ssl: &mut SslRef, id: &[u8]) -> Result<(), ShimError> {
    let index = client_id_index().map_err(|source| ShimError::Setup {
        stage: "bind client id",
        source,
    })?;
    ssl.set_ex_data(index, ClientId::copy_from(id)?);
    Ok(())
}

/// Install the cookie generate/verify callbacks on a configuration
pub(crate) fn install(builder: &mut SslContextBuilder, key: CookieKey) {
    let generate_key = key.clone();
    builder.set_cookie_generate_cb(move |ssl, out| {
        let cookie = generate_key.cookie(client_id_of(ssl))?;
        let len = cookie.len().min(out.len());
        out[..len].copy_from_slice(&cookie[..len]);
        Ok(len)
    });
    builder.set_cookie_verify_cb(move |ssl, cookie| key.verify(client_id_of(ssl), cookie));
}
