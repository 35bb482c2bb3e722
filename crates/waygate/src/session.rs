//! Session management: binding client identities to long-lived records.
//!
//! The session id is the client's authorization value (bearer prefix
//! stripped) and is stable across requests. With DIFC on, sessions exist
//! only after an explicit `sys___init`; with DIFC off they are created
//! lazily on first authenticated request. Sessions live until shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// One client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Stable client identity (authorization value, bearer prefix stripped)
    pub id: String,
    /// Optional token supplied to `sys___init`
    pub token: Option<String>,
}

/// Maps client identities to session records.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    difc_enabled: bool,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(difc_enabled: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            difc_enabled,
        }
    }

    /// Resolve the session for a client identity.
    ///
    /// With DIFC off the session is auto-created on first use (the map's
    /// entry API makes concurrent first requests collapse to one record).
    /// With DIFC on, `None` means `sys___init` has not been called.
    pub fn resolve(&self, client_id: &str) -> Option<Arc<Session>> {
        if self.difc_enabled {
            self.sessions.get(client_id).map(|s| Arc::clone(&s))
        } else {
            Some(Arc::clone(
                &self
                    .sessions
                    .entry(client_id.to_string())
                    .or_insert_with(|| {
                        debug!(session = client_id, "session auto-created");
                        Arc::new(Session {
                            id: client_id.to_string(),
                            token: None,
                        })
                    }),
            ))
        }
    }

    /// Explicitly create a session (`sys___init`). Idempotent per id; an
    /// existing session keeps its original token.
    pub fn init(&self, client_id: &str, token: Option<String>) -> Arc<Session> {
        Arc::clone(
            &self
                .sessions
                .entry(client_id.to_string())
                .or_insert_with(|| {
                    debug!(session = client_id, "session initialized");
                    Arc::new(Session {
                        id: client_id.to_string(),
                        token,
                    })
                }),
        )
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Derive the stable client identity from an authorization header value:
/// the trimmed value after `"Bearer "`, or the raw (trimmed) header when no
/// bearer prefix is present. Empty results reject the connection upstream.
pub fn client_identity_from_header(header: &str) -> Option<String> {
    let value = match header.strip_prefix("Bearer ") {
        Some(token) => token.trim(),
        None => header.trim(),
    };
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
