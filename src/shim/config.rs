//! Session configuration
//!
//! This module provides the role and transport flags, the options builder
//! used by [`Session::new`](super::Session::new), and the library
//! configuration defaults derived from them.

use openssl::error::ErrorStack;
use openssl::pkey::{PKeyRef, Private};
use openssl::ssl::{SslContextBuilder, SslMethod, SslOptions, SslVerifyMode, SslVersion};

use super::cert::CertChain;

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections
    Server,
    /// Initiates connections
    Client,
}

impl Role {
    /// Parse a role from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, ShimError> {
        match s.to_lowercase().as_str() {
            "server" | "srv" => Ok(Role::Server),
            "client" | "cli" => Ok(Role::Client),
            _ => Err(ShimError::InvalidRole(s.to_string())),
        }
    }

    /// Map the boundary's `is_server` flag
    pub fn from_flag(is_server: bool) -> Self {
        if is_server {
            Role::Server
        } else {
            Role::Client
        }
    }

    /// Whether this role accepts connections
    pub fn is_server(&self) -> bool {
        *self == Role::Server
    }

    /// Lowercase name, as used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Transport flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TLS over a reliable byte stream
    Stream,
    /// DTLS over datagrams
    Datagram,
}

impl Transport {
    /// Parse a transport from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, ShimError> {
        match s.to_lowercase().as_str() {
            "stream" | "tcp" | "tls" => Ok(Transport::Stream),
            "datagram" | "udp" | "dtls" => Ok(Transport::Datagram),
            _ => Err(ShimError::InvalidTransport(s.to_string())),
        }
    }

    /// Map the boundary's `is_udp` flag
    pub fn from_flag(is_datagram: bool) -> Self {
        if is_datagram {
            Transport::Datagram
        } else {
            Transport::Stream
        }
    }

    /// Whether records travel over datagrams (DTLS)
    pub fn is_datagram(&self) -> bool {
        *self == Transport::Datagram
    }

    /// Lowercase name, as used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stream => "stream",
            Transport::Datagram => "datagram",
        }
    }

    /// Library method for this transport
    pub fn method(&self) -> SslMethod {
        match self {
            Transport::Stream => SslMethod::tls(),
            Transport::Datagram => SslMethod::dtls(),
        }
    }

    /// Lowest protocol version of the default preset
    pub fn min_version(&self) -> Option<SslVersion> {
        match self {
            Transport::Stream => Some(SslVersion::TLS1_2),
            Transport::Datagram => Some(SslVersion::DTLS1_2),
        }
    }
}

/// Shim errors
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: ErrorStack,
    },

    #[error("No certificate found in PEM input")]
    NoCertificate,

    #[error("Configuration failed at {stage}: {source}")]
    Config {
        stage: &'static str,
        #[source]
        source: ErrorStack,
    },

    #[error("Session setup failed at {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: ErrorStack,
    },

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Invalid transport: {0}")]
    InvalidTransport(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

impl ShimError {
    /// The library error stack behind this error, if any
    pub fn error_stack(&self) -> Option<&ErrorStack> {
        match self {
            ShimError::OpenSsl(stack)
            | ShimError::Parse { source: stack, .. }
            | ShimError::Config { source: stack, .. }
            | ShimError::Setup { source: stack, .. } => Some(stack),
            _ => None,
        }
    }
}

/// Highest debug level understood by the diagnostic sink
pub const MAX_DEBUG_LEVEL: i32 = 4;

/// Default debug threshold (errors only)
pub const DEFAULT_DEBUG_THRESHOLD: i32 = 1;

/// Session options (immutable after building)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub(crate) role: Role,
    pub(crate) transport: Transport,
    pub(crate) client_id: Vec<u8>,
    pub(crate) verify_peer: Option<bool>,
    pub(crate) debug_threshold: i32,
}

impl SessionOptions {
    /// Create a server options builder
    pub fn server() -> SessionOptionsBuilder {
        SessionOptionsBuilder::new(Role::Server)
    }

    /// Create a client options builder
    pub fn client() -> SessionOptionsBuilder {
        SessionOptionsBuilder::new(Role::Client)
    }

    /// Options from the boundary's role and transport flags
    pub fn from_flags(is_server: bool, is_datagram: bool) -> Self {
        SessionOptions {
            role: Role::from_flag(is_server),
            transport: Transport::from_flag(is_datagram),
            client_id: Vec::new(),
            verify_peer: None,
            debug_threshold: DEFAULT_DEBUG_THRESHOLD,
        }
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Transport flavour
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Client transport identifier (datagram servers only)
    pub fn client_id(&self) -> &[u8] {
        &self.client_id
    }

    /// Highest level forwarded to the host debug sink
    pub fn debug_threshold(&self) -> i32 {
        self.debug_threshold
    }

    /// Whether this session demultiplexes clients by transport identifier
    pub fn is_datagram_server(&self) -> bool {
        self.role.is_server() && self.transport.is_datagram()
    }

    /// Peer verification mode
    ///
    /// Without an override, servers do not request a client certificate and
    /// clients require a verifiable server certificate.
    pub fn verify_mode(&self) -> SslVerifyMode {
        let verify = self.verify_peer.unwrap_or(!self.role.is_server());
        match (verify, self.role) {
            (false, _) => SslVerifyMode::NONE,
            (true, Role::Client) => SslVerifyMode::PEER,
            (true, Role::Server) => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        }
    }
}

/// Session options builder
pub struct SessionOptionsBuilder {
    options: SessionOptions,
}

impl SessionOptionsBuilder {
    fn new(role: Role) -> Self {
        let mut options = SessionOptions::from_flags(role.is_server(), false);
        options.role = role;
        SessionOptionsBuilder { options }
    }

    /// Set the transport
    pub fn transport(mut self, transport: Transport) -> Self {
        self.options.transport = transport;
        self
    }

    /// Set the client transport identifier
    ///
    /// Only meaningful for datagram servers, where it binds the connection to
    /// one peer address on a shared socket.
    pub fn client_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.options.client_id = id.into();
        self
    }

    /// Override the preset peer verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.options.verify_peer = Some(verify);
        self
    }

    /// Set the debug threshold (0 disables forwarding)
    pub fn debug_threshold(mut self, threshold: i32) -> Self {
        self.options.debug_threshold = threshold;
        self
    }

    /// Build the options
    pub fn build(self) -> Result<SessionOptions, ShimError> {
        let threshold = self.options.debug_threshold;
        if !(0..=MAX_DEBUG_LEVEL).contains(&threshold) {
            return Err(ShimError::InvalidOption(format!(
                "debug threshold {} outside 0..={}",
                threshold, MAX_DEBUG_LEVEL
            )));
        }
        Ok(self.options)
    }
}

/// Create a configuration populated with the defaults for a role/transport
pub(crate) fn config_defaults(options: &SessionOptions) -> Result<SslContextBuilder, ShimError> {
    let stage = "config defaults";
    let mut builder = SslContextBuilder::new(options.transport.method())
        .map_err(|source| ShimError::Config { stage, source })?;

    builder
        .set_min_proto_version(options.transport.min_version())
        .map_err(|source| ShimError::Config { stage, source })?;
    builder.set_verify(options.verify_mode());

    if options.is_datagram_server() {
        builder.set_options(SslOptions::COOKIE_EXCHANGE);
    }

    Ok(builder)
}

/// Bind the certificate chain and its private key into a configuration
pub(crate) fn bind_own_cert(
    builder: &mut SslContextBuilder,
    chain: &CertChain,
    key: &PKeyRef<Private>,
) -> Result<(), ShimError> {
    let stage = "bind own certificate";
    let config_err = |source| ShimError::Config { stage, source };

    builder.set_certificate(chain.leaf()).map_err(config_err)?;
    for cert in chain.intermediates() {
        builder.add_extra_chain_cert(cert.clone()).map_err(config_err)?;
    }
    builder.set_private_key(key).map_err(config_err)?;
    builder.check_private_key().map_err(config_err)?;

    Ok(())
}
