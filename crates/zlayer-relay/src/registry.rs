//! Session registry
//!
//! The [`SessionRegistry`] maps each public key to the origin binding it was
//! registered with and, for relay bindings, to the tunnel session currently
//! serving it. It is shared by all handlers and never holds a lock across I/O.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::keys::{KeyAllocator, KeyStrategy, PublicKey};
use crate::session::{CloseReason, SessionInfo, TunnelSession};

/// How requests for a key reach the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginBinding {
    /// The broker calls the origin URL itself
    Direct {
        /// Origin base URL
        url: String,
    },
    /// The origin connects a tunnel and requests are relayed over it
    Relay,
}

impl OriginBinding {
    /// Short label used in logs
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Relay => "relay",
        }
    }
}

/// Registry of key bindings and live tunnel sessions
#[derive(Debug)]
pub struct SessionRegistry {
    bindings: DashMap<PublicKey, OriginBinding>,
    sessions: DashMap<PublicKey, Arc<TunnelSession>>,
    allocator: KeyAllocator,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(KeyStrategy::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry allocating keys with `strategy`
    #[must_use]
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            bindings: DashMap::new(),
            sessions: DashMap::new(),
            allocator: KeyAllocator::new(strategy),
        }
    }

    // -------------------------------------------------------------------------
    // Bindings
    // -------------------------------------------------------------------------

    /// Allocate a fresh key and bind it to `binding`
    pub fn register(&self, binding: OriginBinding) -> PublicKey {
        loop {
            let key = self.allocator.next_key();
            if let Entry::Vacant(entry) = self.bindings.entry(key.clone()) {
                tracing::info!(key = %key, mode = binding.mode(), "registered origin");
                entry.insert(binding);
                return key;
            }
            tracing::debug!(key = %key, "key already taken, allocating another");
        }
    }

    /// Bind an explicit key, replacing any previous binding
    pub fn insert_binding(&self, key: PublicKey, binding: OriginBinding) -> Option<OriginBinding> {
        tracing::info!(key = %key, mode = binding.mode(), "bound origin");
        self.bindings.insert(key, binding)
    }

    /// Binding for `key`
    #[must_use]
    pub fn binding(&self, key: &str) -> Option<OriginBinding> {
        self.bindings.get(key).map(|b| b.value().clone())
    }

    /// Number of bound keys
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Install `session` for its key, returning the session it replaced
    ///
    /// The caller is responsible for closing the returned session.
    pub fn put_session(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let key = session.key().clone();
        let session_id = session.id();
        let previous = self.sessions.insert(key.clone(), session);

        tracing::info!(
            key = %key,
            session_id = %session_id,
            replaced = previous.is_some(),
            "tunnel session installed"
        );

        previous
    }

    /// Live session for `key`
    #[must_use]
    pub fn session(&self, key: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Remove `session` if it is still the one installed for its key
    ///
    /// Returns `false` when a newer session has taken over, leaving it in place.
    pub fn remove_session(&self, session: &Arc<TunnelSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.key(), |_, current| Arc::ptr_eq(current, session))
            .is_some();

        if removed {
            tracing::info!(
                key = %session.key(),
                session_id = %session.id(),
                "tunnel session removed"
            );
        }

        removed
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of all live sessions
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().info()).collect()
    }

    /// Close every live session
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        let count = sessions.len();
        for session in sessions {
            session.close(reason.clone());
        }
        if count > 0 {
            tracing::info!(count, reason = %reason, "closed tunnel sessions");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_registry() -> SessionRegistry {
        SessionRegistry::new(KeyStrategy::Sequential)
    }

    fn create_test_session(key: &str) -> Arc<TunnelSession> {
        TunnelSession::new(PublicKey::parse(key).unwrap()).0
    }

    #[test]
    fn test_register_sequential_keys() {
        let registry = create_test_registry();
        let first = registry.register(OriginBinding::Direct {
            url: "http://localhost:3000".to_string(),
        });
        let second = registry.register(OriginBinding::Relay);

        assert_eq!(first.as_str(), "1");
        assert_eq!(second.as_str(), "2");
        assert_eq!(registry.binding_count(), 2);
        assert_eq!(registry.binding("2"), Some(OriginBinding::Relay));
        assert!(registry.binding("3").is_none());
    }

    #[test]
    fn test_register_skips_taken_keys() {
        let registry = create_test_registry();
        registry.insert_binding(PublicKey::parse("1").unwrap(), OriginBinding::Relay);

        let key = registry.register(OriginBinding::Relay);
        assert_eq!(key.as_str(), "2");
    }

    #[test]
    fn test_register_random_keys_unique() {
        let registry = SessionRegistry::default();
        let keys: std::collections::HashSet<_> = (0..100)
            .map(|_| registry.register(OriginBinding::Relay))
            .collect();
        assert_eq!(keys.len(), 100);
        assert_eq!(registry.binding_count(), 100);
    }

    #[test]
    fn test_put_and_get_session() {
        let registry = create_test_registry();
        let session = create_test_session("42");

        assert!(registry.put_session(session.clone()).is_none());
        let found = registry.session("42").unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.session("43").is_none());
    }

    #[test]
    fn test_put_session_returns_previous() {
        let registry = create_test_registry();
        let old = create_test_session("42");
        let new = create_test_session("42");

        registry.put_session(old.clone());
        let previous = registry.put_session(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &old));
        assert!(Arc::ptr_eq(&registry.session("42").unwrap(), &new));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_remove_session_is_conditional() {
        let registry = create_test_registry();
        let old = create_test_session("42");
        let new = create_test_session("42");

        registry.put_session(old.clone());
        registry.put_session(new.clone());

        // The replaced session's cleanup must not evict its successor
        assert!(!registry.remove_session(&old));
        assert!(Arc::ptr_eq(&registry.session("42").unwrap(), &new));

        assert!(registry.remove_session(&new));
        assert!(registry.session("42").is_none());
        assert!(!registry.remove_session(&new));
    }

    #[test]
    fn test_close_all() {
        let registry = create_test_registry();
        let a = create_test_session("a");
        let b = create_test_session("b");
        registry.put_session(a.clone());
        registry.put_session(b.clone());

        assert_eq!(registry.close_all(&CloseReason::Shutdown), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_list_sessions() {
        let registry = create_test_registry();
        registry.put_session(create_test_session("x"));

        let sessions = registry.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].key.as_str(), "x");
    }
}
