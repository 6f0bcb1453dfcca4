use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::SessionChannelTransport;

struct SessionEntry {
    transport: Arc<SessionChannelTransport>,
    client_id_hint: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    reserved_names: HashSet<String>,
    /// Hints with a grant in flight or a live session.
    claimed_hints: HashSet<String>,
    sessions: HashMap<String, SessionEntry>,
}

/// Live server-side sessions, keyed by session id.
///
/// Owned by the embedding application and shared with listeners. Channel
/// names stay reserved after their session is removed so they are never
/// handed out twice. A client id hint is claimed while its session is live
/// and freed again by [`SessionRegistry::remove`].
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a channel name. Returns false if it was ever claimed before.
    pub fn reserve(&self, channel_name: &str) -> bool {
        self.inner
            .lock()
            .reserved_names
            .insert(channel_name.to_string())
    }

    pub fn is_reserved(&self, channel_name: &str) -> bool {
        self.inner.lock().reserved_names.contains(channel_name)
    }

    /// Claims a client id hint for a grant. Returns false while another grant
    /// for the same hint is in flight or its session is still registered.
    pub fn claim_hint(&self, client_id_hint: &str) -> bool {
        self.inner
            .lock()
            .claimed_hints
            .insert(client_id_hint.to_string())
    }

    /// Gives back a hint whose grant did not go through.
    pub fn release_hint(&self, client_id_hint: &str) {
        self.inner.lock().claimed_hints.remove(client_id_hint);
    }

    pub fn is_hint_claimed(&self, client_id_hint: &str) -> bool {
        self.inner.lock().claimed_hints.contains(client_id_hint)
    }

    pub fn insert(&self, session_id: &str, transport: Arc<SessionChannelTransport>) {
        self.insert_entry(session_id, transport, None);
    }

    /// Registers a session granted to `client_id_hint`; the hint stays claimed
    /// until the session is removed.
    pub fn insert_granted(
        &self,
        session_id: &str,
        client_id_hint: &str,
        transport: Arc<SessionChannelTransport>,
    ) {
        self.insert_entry(session_id, transport, Some(client_id_hint.to_string()));
    }

    fn insert_entry(
        &self,
        session_id: &str,
        transport: Arc<SessionChannelTransport>,
        client_id_hint: Option<String>,
    ) {
        let mut inner = self.inner.lock();
        inner
            .reserved_names
            .insert(transport.channel_name().to_string());
        if let Some(hint) = &client_id_hint {
            inner.claimed_hints.insert(hint.clone());
        }
        let previous = inner.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                transport,
                client_id_hint,
            },
        );
        if let Some(hint) = previous.and_then(|entry| entry.client_id_hint) {
            inner.claimed_hints.remove(&hint);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionChannelTransport>> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.transport.clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionChannelTransport>> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.remove(session_id)?;
        if let Some(hint) = &entry.client_id_hint {
            inner.claimed_hints.remove(hint);
        }
        Some(entry.transport)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionRegistry")
            .field("sessions", &inner.sessions.len())
            .field("reserved_names", &inner.reserved_names.len())
            .field("claimed_hints", &inner.claimed_hints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;

    #[test]
    fn removed_names_stay_reserved() {
        let registry = SessionRegistry::new();
        assert!(registry.reserve("mcp-session-a"));
        assert!(!registry.reserve("mcp-session-a"));

        let transport = Arc::new(
            SessionChannelTransport::new(LocalBus::shared(), "mcp-session-a").expect("transport"),
        );
        registry.insert("a", transport);
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("a").is_some());
        assert!(registry.is_empty());
        assert!(registry.is_reserved("mcp-session-a"));
        assert!(!registry.reserve("mcp-session-a"));
    }

    #[test]
    fn hints_are_freed_with_their_session() {
        let registry = SessionRegistry::new();
        assert!(registry.claim_hint("tab-1"));
        assert!(!registry.claim_hint("tab-1"));

        let transport = Arc::new(
            SessionChannelTransport::new(LocalBus::shared(), "mcp-session-b").expect("transport"),
        );
        registry.insert_granted("b", "tab-1", transport);
        assert!(registry.is_hint_claimed("tab-1"));
        assert!(!registry.claim_hint("tab-1"));

        registry.remove("b").expect("registered");
        assert!(!registry.is_hint_claimed("tab-1"));
        assert!(registry.claim_hint("tab-1"));

        registry.release_hint("tab-1");
        assert!(!registry.is_hint_claimed("tab-1"));
    }
}
