use crate::ResourceType;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Per-connection xDS bookkeeping.
///
/// A session is written only by the stream that owns the connection (and by the response jobs it
/// waits on), but may be read concurrently for diagnostics.
#[derive(Debug, Default)]
pub struct Session {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    types: HashMap<ResourceType, TypeState>,
    nonces_issued: u64,
}

#[derive(Clone, Debug, Default)]
struct TypeState {
    last_sent_nonce: String,
    last_sent_version: u64,
    last_applied_version: u64,
    subscribed: BTreeSet<String>,
}

// === impl Session ===

impl Session {
    /// The nonce most recently sent for the type, or an empty string if nothing has been sent.
    pub fn last_sent_nonce(&self, ty: ResourceType) -> String {
        self.read(ty, |t| t.last_sent_nonce.clone())
    }

    /// Allocates and records a fresh nonce for the type.
    ///
    /// Nonces combine the wall-clock time with a per-session sequence number, so they are never
    /// reused on a connection even if the clock stalls or steps backwards.
    pub fn new_nonce(&self, ty: ResourceType) -> String {
        let mut state = self.state.write();
        state.nonces_issued += 1;
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let nonce = format!("{nanos:x}.{}", state.nonces_issued);
        state.types.entry(ty).or_default().last_sent_nonce = nonce.clone();
        nonce
    }

    pub fn last_sent_version(&self, ty: ResourceType) -> u64 {
        self.read(ty, |t| t.last_sent_version)
    }

    pub fn set_last_sent_version(&self, ty: ResourceType, version: u64) {
        self.state.write().types.entry(ty).or_default().last_sent_version = version;
    }

    /// Increments the sent version for the type, returning the new version.
    pub fn increment_last_sent_version(&self, ty: ResourceType) -> u64 {
        let mut state = self.state.write();
        let t = state.types.entry(ty).or_default();
        t.last_sent_version = t.last_sent_version.saturating_add(1);
        t.last_sent_version
    }

    pub fn last_applied_version(&self, ty: ResourceType) -> u64 {
        self.read(ty, |t| t.last_applied_version)
    }

    pub fn set_last_applied_version(&self, ty: ResourceType, version: u64) {
        self.state
            .write()
            .types
            .entry(ty)
            .or_default()
            .last_applied_version = version;
    }

    pub fn subscribed_resources(&self, ty: ResourceType) -> BTreeSet<String> {
        self.read(ty, |t| t.subscribed.clone())
    }

    pub fn set_subscribed_resources(&self, ty: ResourceType, names: BTreeSet<String>) {
        self.state.write().types.entry(ty).or_default().subscribed = names;
    }

    fn read<T: Default>(&self, ty: ResourceType, f: impl FnOnce(&TypeState) -> T) -> T {
        self.state.read().types.get(&ty).map(f).unwrap_or_default()
    }
}
