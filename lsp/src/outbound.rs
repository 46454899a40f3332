//! Server-originated calls awaiting client replies.
//!
//! The population is bounded: clients are not obliged to reply, and an
//! unbounded table would leak for every ignored request. When the bound is
//! exceeded the oldest continuation is failed and dropped. The deque is
//! scanned linearly on claim; it never holds more than the bound, and FIFO
//! eviction order is part of the contract, so a map would be wrong here.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::CallError;

pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<Value, CallError>) + Send>;

pub(crate) struct OutboundCalls {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    next_id: i64,
    pending: VecDeque<(i64, ReplyCallback)>,
}

impl OutboundCalls {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                pending: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Store a continuation and allocate the id to send it under. If the
    /// table overflows, the oldest continuation is invoked with an eviction
    /// error, outside the lock since it is arbitrary user code.
    pub(crate) fn register(&self, callback: ReplyCallback) -> i64 {
        let (id, evicted) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.push_back((id, callback));
            let evicted = if inner.pending.len() > self.capacity {
                inner.pending.pop_front()
            } else {
                None
            };
            (id, evicted)
        };

        if let Some((evicted_id, evicted_callback)) = evicted {
            tracing::warn!(
                limit = self.capacity,
                dropped = evicted_id,
                "too many outstanding calls to the client, dropping the oldest"
            );
            evicted_callback(Err(CallError::Evicted(evicted_id)));
        }
        id
    }

    /// Remove and return the continuation for `id`, if it is still pending.
    pub(crate) fn claim(&self, id: i64) -> Option<ReplyCallback> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let index = inner.pending.iter().position(|(pending_id, _)| *pending_id == id)?;
        inner.pending.remove(index).map(|(_, callback)| callback)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recording(
        tx: &mpsc::Sender<(&'static str, Result<Value, String>)>,
        tag: &'static str,
    ) -> ReplyCallback {
        let tx = tx.clone();
        Box::new(move |outcome| {
            let _ = tx.send((tag, outcome.map_err(|e| e.to_string())));
        })
    }

    #[test]
    fn ids_are_allocated_in_sequence() {
        let calls = OutboundCalls::new(10);
        let (tx, _rx) = mpsc::channel();
        assert_eq!(calls.register(recording(&tx, "a")), 0);
        assert_eq!(calls.register(recording(&tx, "b")), 1);
        assert_eq!(calls.register(recording(&tx, "c")), 2);
    }

    #[test]
    fn claim_returns_the_matching_continuation() {
        let calls = OutboundCalls::new(10);
        let (tx, rx) = mpsc::channel();
        calls.register(recording(&tx, "a"));
        let b = calls.register(recording(&tx, "b"));

        let callback = calls.claim(b).expect("b is pending");
        callback(Ok(Value::from(41)));
        assert_eq!(rx.try_recv().unwrap(), ("b", Ok(Value::from(41))));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn claim_unknown_id_returns_none() {
        let calls = OutboundCalls::new(10);
        assert!(calls.claim(7).is_none());
    }

    #[test]
    fn claimed_id_cannot_be_claimed_twice() {
        let calls = OutboundCalls::new(10);
        let (tx, _rx) = mpsc::channel();
        let id = calls.register(recording(&tx, "a"));
        assert!(calls.claim(id).is_some());
        assert!(calls.claim(id).is_none());
    }

    #[test]
    fn overflow_evicts_the_oldest_exactly_once() {
        let calls = OutboundCalls::new(2);
        let (tx, rx) = mpsc::channel();
        let a = calls.register(recording(&tx, "a"));
        calls.register(recording(&tx, "b"));
        calls.register(recording(&tx, "c"));

        let (tag, outcome) = rx.try_recv().unwrap();
        assert_eq!(tag, "a");
        assert_eq!(
            outcome.unwrap_err(),
            format!("failed to receive a client reply for request ({a})")
        );
        assert!(rx.try_recv().is_err(), "only one eviction expected");
        assert_eq!(calls.len(), 2);
        assert!(calls.claim(a).is_none(), "evicted entry is gone");
    }

    #[test]
    fn eviction_preserves_fifo_order() {
        let calls = OutboundCalls::new(2);
        let (tx, rx) = mpsc::channel();
        for tag in ["a", "b", "c", "d"] {
            calls.register(recording(&tx, tag));
        }

        let evicted: Vec<&str> = rx.try_iter().map(|(tag, _)| tag).collect();
        assert_eq!(evicted, ["a", "b"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let calls = OutboundCalls::new(0);
        let (tx, rx) = mpsc::channel();
        calls.register(recording(&tx, "a"));
        assert!(rx.try_recv().is_err(), "single entry must survive");
    }
}
