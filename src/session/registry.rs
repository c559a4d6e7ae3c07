//! Process-wide session registry
//!
//! Engines never hold a pointer back into the session. They get an
//! [`EventSink`] carrying an opaque [`SessionKey`]; the registry resolves the
//! key to the session's context when an event arrives. Events for a key that
//! is no longer registered are dropped.

use super::adapter::SessionContext;
use crate::engine::RawEvent;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Opaque handle identifying one registered session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Arena of live session contexts
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<SessionContext>>>,
    next_key: AtomicU64,
    initialized: AtomicBool,
}

static REGISTRY: Lazy<SessionRegistry> = Lazy::new(SessionRegistry::default);

/// The registry shared by every session in the process
pub fn global() -> &'static SessionRegistry {
    &REGISTRY
}

/// Process-wide initialization; safe to call repeatedly
pub fn lib_init() {
    if !REGISTRY.initialized.swap(true, Ordering::SeqCst) {
        info!("Session registry initialized");
    }
}

/// Drop every registered session context.
///
/// Sessions still alive afterwards keep working on the command side but no
/// longer receive events.
pub fn lib_cleanup() {
    let dropped = REGISTRY.clear();
    REGISTRY.initialized.store(false, Ordering::SeqCst);
    info!(dropped, "Session registry cleaned up");
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context: Arc<SessionContext>) -> SessionKey {
        let key = SessionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(key, context);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, context);
            }
        }
        debug!(%key, "Session registered");
        key
    }

    pub fn unregister(&self, key: SessionKey) -> Option<Arc<SessionContext>> {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(&key),
            Err(poisoned) => poisoned.into_inner().remove(&key),
        };
        if removed.is_some() {
            debug!(%key, "Session unregistered");
        }
        removed
    }

    pub fn lookup(&self, key: SessionKey) -> Option<Arc<SessionContext>> {
        match self.sessions.read() {
            Ok(sessions) => sessions.get(&key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&key).cloned(),
        }
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.lookup(key).is_some()
    }

    pub fn len(&self) -> usize {
        match self.sessions.read() {
            Ok(sessions) => sessions.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route an event to its session; callbacks run outside the lock
    pub fn dispatch(&self, key: SessionKey, event: RawEvent) {
        match self.lookup(key) {
            Some(context) => context.handle(event),
            None => debug!(%key, ?event, "Dropping event for unknown session"),
        }
    }

    fn clear(&self) -> usize {
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(poisoned) => {
                warn!("Session registry lock was poisoned");
                poisoned.into_inner()
            }
        };
        let count = sessions.len();
        sessions.clear();
        count
    }
}

/// Event slot handed to an engine
#[derive(Debug, Clone, Copy)]
pub struct EventSink {
    key: SessionKey,
    registry: &'static SessionRegistry,
}

impl EventSink {
    pub fn new(key: SessionKey, registry: &'static SessionRegistry) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn emit(&self, event: RawEvent) {
        self.registry.dispatch(self.key, event);
    }
}
