//! Client-driven cancellation of in-flight inbound calls.
//!
//! Calls are keyed by the JSON form of their id. A client may reuse an id
//! while the earlier call is still running; the later registration then
//! overwrites the earlier, which keeps running but can no longer be
//! cancelled. Each registration carries a cookie so that cleanup for the
//! earlier call cannot erase the later call's entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::envelope::RequestId;

pub(crate) struct CancelRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, (CancellationToken, u32)>,
    next_cookie: u32,
}

impl CancelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_cookie: 0,
            }),
        }
    }

    /// Register an inbound call, overwriting any live entry for the same id.
    /// The returned scope erases the entry when dropped, cookie permitting.
    pub(crate) fn register(self: &Arc<Self>, id: &RequestId) -> (CancellationToken, CancelScope) {
        let key = id.registry_key();
        let token = CancellationToken::new();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cookie = inner.next_cookie;
        inner.next_cookie = inner.next_cookie.wrapping_add(1);
        inner.entries.insert(key.clone(), (token.clone(), cookie));
        drop(inner);

        let scope = CancelScope {
            registry: Arc::clone(self),
            key,
            cookie,
        };
        (token, scope)
    }

    /// Fire the cancel signal for `key` if such a call is still registered.
    /// Firing is idempotent; a finished or unknown call is a no-op.
    pub(crate) fn cancel(&self, key: &str) {
        let token = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entries.get(key).map(|(token, _)| token.clone())
        };
        match token {
            Some(token) => token.cancel(),
            None => tracing::debug!(id = key, "cancel for unknown or finished request"),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

/// Erases a cancel entry when the request's context is fully released.
pub(crate) struct CancelScope {
    registry: Arc<CancelRegistry>,
    key: String,
    cookie: u32,
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        let mut inner = self
            .registry
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Only reap our own registration: a reused id belongs to the
        // successor by now.
        if let Some((_, cookie)) = inner.entries.get(&self.key)
            && *cookie == self.cookie
        {
            inner.entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<CancelRegistry> {
        Arc::new(CancelRegistry::new())
    }

    #[test]
    fn cancel_fires_the_registered_token() {
        let registry = registry();
        let (token, _scope) = registry.register(&RequestId::Number(1));
        assert!(!token.is_cancelled());

        registry.cancel("1");
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_id_is_a_no_op() {
        registry().cancel("999");
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = registry();
        let (token, _scope) = registry.register(&RequestId::Number(1));
        registry.cancel("1");
        registry.cancel("1");
        assert!(token.is_cancelled());
    }

    #[test]
    fn scope_drop_erases_the_entry() {
        let registry = registry();
        let (_token, scope) = registry.register(&RequestId::Number(1));
        assert_eq!(registry.len(), 1);
        drop(scope);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reused_id_cancels_only_the_later_call() {
        let registry = registry();
        let (first_token, _first_scope) = registry.register(&RequestId::Number(5));
        let (second_token, _second_scope) = registry.register(&RequestId::Number(5));

        registry.cancel("5");
        assert!(!first_token.is_cancelled());
        assert!(second_token.is_cancelled());
    }

    #[test]
    fn stale_scope_does_not_reap_the_successor() {
        let registry = registry();
        let (_first_token, first_scope) = registry.register(&RequestId::Number(5));
        let (second_token, _second_scope) = registry.register(&RequestId::Number(5));

        // The earlier call finishing must leave the successor cancellable.
        drop(first_scope);
        assert_eq!(registry.len(), 1);
        registry.cancel("5");
        assert!(second_token.is_cancelled());
    }

    #[test]
    fn number_and_string_ids_do_not_collide() {
        let registry = registry();
        let (number_token, _a) = registry.register(&RequestId::Number(5));
        let (string_token, _b) = registry.register(&RequestId::String("5".to_owned()));

        registry.cancel("5");
        assert!(number_token.is_cancelled());
        assert!(!string_token.is_cancelled());
    }
}
