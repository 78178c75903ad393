//! Validation of proxy client certificates.

use mesh_ads_controller_core::{CommonName, CommonNameError, ProxyIdentity, SerialNumber};
use std::sync::Arc;

/// The identity of a connected proxy, taken from the leaf of its verified certificate chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate {
    pub cn: CommonName,
    pub serial: SerialNumber,
    pub identity: ProxyIdentity,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerValidationError {
    #[error("no client certificate presented")]
    Missing,

    #[error("failed to parse client certificate: {0}")]
    Parse(String),

    #[error("client certificate has no common name")]
    NoCommonName,

    #[error(transparent)]
    CommonName(#[from] CommonNameError),

    #[error("client certificate trust domain {found:?} does not match {expected:?}")]
    TrustDomain {
        expected: String,
        found: Option<String>,
    },
}

/// Validates the certificate a proxy presented when opening a stream.
pub trait ValidatePeer {
    /// Validates a DER-encoded leaf certificate.
    fn validate(&self, leaf: Option<&[u8]>) -> Result<PeerCertificate, PeerValidationError>;
}

/// Accepts proxy certificates issued in a single trust domain.
///
/// Chain verification is performed by the TLS layer; this only checks that the verified
/// certificate names a proxy in the expected trust domain.
#[derive(Clone, Debug)]
pub struct TrustDomainValidator {
    trust_domain: Arc<str>,
}

// === impl TrustDomainValidator ===

impl TrustDomainValidator {
    pub fn new(trust_domain: impl Into<Arc<str>>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
        }
    }
}

impl ValidatePeer for TrustDomainValidator {
    fn validate(&self, leaf: Option<&[u8]>) -> Result<PeerCertificate, PeerValidationError> {
        let der = leaf.ok_or(PeerValidationError::Missing)?;
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| PeerValidationError::Parse(e.to_string()))?;

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or(PeerValidationError::NoCommonName)?;
        let cn = CommonName::from(cn);
        let identity = ProxyIdentity::parse(&cn)?;

        if identity.trust_domain.as_deref() != Some(&*self.trust_domain) {
            return Err(PeerValidationError::TrustDomain {
                expected: self.trust_domain.to_string(),
                found: identity.trust_domain,
            });
        }

        Ok(PeerCertificate {
            serial: SerialNumber::new(cert.raw_serial_as_string()),
            cn,
            identity,
        })
    }
}
