//! Certificate and key loading
//!
//! This module parses the PEM buffers handed over by the host into the
//! certificate chain and private key a [`Session`](super::Session) owns.

use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509NameRef, X509Ref};

use super::config::ShimError;

/// Leaf certificate followed by its intermediates
#[derive(Clone)]
pub struct CertChain {
    certs: Vec<X509>,
}

impl CertChain {
    /// Parse every certificate of a PEM buffer
    ///
    /// The first certificate is the leaf. A buffer without any certificate is
    /// rejected.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ShimError> {
        let certs = X509::stack_from_pem(pem).map_err(|source| ShimError::Parse {
            what: "certificate chain",
            source,
        })?;

        if certs.is_empty() {
            return Err(ShimError::NoCertificate);
        }

        Ok(CertChain { certs })
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> &X509Ref {
        &self.certs[0]
    }

    /// Certificates after the leaf
    pub fn intermediates(&self) -> &[X509] {
        &self.certs[1..]
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Summary of the leaf, used in diagnostics
    pub fn leaf_info(&self) -> CertInfo {
        CertInfo::from_x509_ref(self.leaf())
    }
}

/// Parse a PEM private key
pub fn parse_private_key(pem: &[u8]) -> Result<PKey<Private>, ShimError> {
    PKey::private_key_from_pem(pem).map_err(|source| ShimError::Parse {
        what: "private key",
        source,
    })
}

/// Read a PEM file for hosts that keep their identity on disk
pub fn load_pem_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, ShimError> {
    let mut pem = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut pem)?;
    Ok(pem)
}

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509_ref(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
        }
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                if let Ok(octets) = <[u8; 4]>::try_from(ip) {
                    names.push(format!("IP:{}", Ipv4Addr::from(octets)));
                } else if let Ok(octets) = <[u8; 16]>::try_from(ip) {
                    names.push(format!("IP:{}", Ipv6Addr::from(octets)));
                }
            }
        }
    }

    names
}
