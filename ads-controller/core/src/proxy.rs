use crate::{
    pod::PodMetadata, CommonName, ProxyIdentity, ResourceType, SerialNumber, Session,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{fmt, net::SocketAddr};

/// A connected Envoy proxy.
#[derive(Debug)]
pub struct Proxy {
    cn: CommonName,
    identity: ProxyIdentity,
    serial: SerialNumber,
    addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    pod: RwLock<Option<PodMetadata>>,
    session: Session,
}

impl Proxy {
    pub fn new(
        cn: CommonName,
        identity: ProxyIdentity,
        serial: SerialNumber,
        addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            cn,
            identity,
            serial,
            addr,
            connected_at: Utc::now(),
            pod: RwLock::new(None),
            session: Session::default(),
        }
    }

    pub fn common_name(&self) -> &CommonName {
        &self.cn
    }

    pub fn identity(&self) -> &ProxyIdentity {
        &self.identity
    }

    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pod(&self) -> Option<PodMetadata> {
        self.pod.read().clone()
    }

    pub fn set_pod(&self, pod: PodMetadata) {
        *self.pod.write() = Some(pod);
    }

    /// A proxy has finished its initial handshake once it has been sent clusters and listeners.
    /// Until then, pushed configuration could not be applied coherently.
    pub fn is_past_init(&self) -> bool {
        !self.session.last_sent_nonce(ResourceType::Cds).is_empty()
            && !self.session.last_sent_nonce(ResourceType::Lds).is_empty()
    }

    /// Returns true if a certificate with the given common name belongs to this proxy.
    pub fn owns_certificate(&self, cn: &CommonName) -> bool {
        *cn == self.cn || self.identity.owns_certificate(cn)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cn)?;
        if let Some(addr) = self.addr {
            write!(f, " ({addr})")?;
        }
        Ok(())
    }
}
