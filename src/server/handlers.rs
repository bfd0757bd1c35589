//! Handler table: tag -> handler, with a default for unregistered tags.
//!
//! Lookups vastly outnumber installs, so the maps sit behind reader/writer
//! locks. Handlers receive the connection handle, the tag, and a payload
//! view, and return an optional reply to be re-framed and sent back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::net::TcpConnection;

/// A handler's response: re-framed as `(tag, payload)` and sent on the
/// originating connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub tag: String,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(tag: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

/// Handler signature. Runs on a worker thread, never on the reactor thread;
/// blocking inside a handler is allowed. Returning `None` sends nothing.
pub type ProtocolHandler =
    Arc<dyn Fn(&Arc<TcpConnection>, &str, &[u8]) -> Option<Reply> + Send + Sync>;

pub struct HandlerTable {
    handlers: RwLock<HashMap<String, ProtocolHandler>>,
    default_handler: RwLock<Option<ProtocolHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
        }
    }

    /// Install a handler for `tag`, replacing any previous one.
    pub fn register(&self, tag: impl Into<String>, handler: ProtocolHandler) {
        let tag = tag.into();
        tracing::debug!(%tag, "handler registered");
        self.handlers.write().insert(tag, handler);
    }

    /// Install the handler for tags nothing else matched.
    pub fn set_default(&self, handler: ProtocolHandler) {
        tracing::debug!("default handler set");
        *self.default_handler.write() = Some(handler);
    }

    /// Handler for `tag`, falling back to the default handler.
    pub fn lookup(&self, tag: &str) -> Option<ProtocolHandler> {
        if let Some(handler) = self.handlers.read().get(tag) {
            return Some(Arc::clone(handler));
        }
        self.default_handler.read().clone()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &'static str) -> ProtocolHandler {
        Arc::new(move |_conn, _tag, _payload| Some(Reply::new(tag, Vec::new())))
    }

    #[test]
    fn test_register_and_lookup() {
        let table = HandlerTable::new();
        table.register("Hello", tagged("Hello"));

        assert!(table.lookup("Hello").is_some());
        assert!(table.lookup("missing").is_none());
    }

    #[test]
    fn test_default_fallback() {
        let table = HandlerTable::new();
        table.register("known", tagged("known"));
        table.set_default(tagged("default"));

        assert!(table.lookup("known").is_some());
        assert!(table.lookup("anything-else").is_some());
    }

    #[test]
    fn test_reregistration_replaces() {
        let table = HandlerTable::new();
        table.register("tag", tagged("first"));
        table.register("tag", tagged("second"));
        assert!(table.lookup("tag").is_some());
        assert_eq!(table.handlers.read().len(), 1);
    }
}
