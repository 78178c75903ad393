use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// PEM files that configure mutual TLS for proxy streams.
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct TlsPaths {
    /// The server's certificate chain.
    #[clap(long = "ads-tls-cert")]
    cert: PathBuf,

    /// The server's private key.
    #[clap(long = "ads-tls-key")]
    key: PathBuf,

    /// Roots used to verify proxy client certificates.
    #[clap(long = "ads-tls-ca")]
    ca: PathBuf,
}

impl TlsPaths {
    /// Reads the configured files. Proxies must present a certificate issued by the CA.
    pub(crate) fn load(&self) -> Result<ServerTlsConfig> {
        let cert = read(&self.cert)?;
        let key = read(&self.key)?;
        let ca = read(&self.ca)?;
        Ok(ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca))
            .client_auth_optional(false))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    let pem = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    anyhow::ensure!(!pem.is_empty(), "{} is empty", path.display());
    Ok(pem)
}
