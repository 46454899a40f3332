//! Routing of inbound envelopes to registered handlers.
//!
//! The dispatcher handles the cross-cutting concerns around every message:
//! logging, the initialization gate, cancellation bookkeeping, and reply
//! correlation for calls the endpoint sent to the client. It is driven by a
//! single task, so handlers run one at a time in wire order; a handler that
//! wants concurrency moves its [`ReplyOnce`] into spawned work.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::cancel::CancelRegistry;
use crate::context::RequestContext;
use crate::endpoint::Shared;
use crate::envelope::{Envelope, RequestId};
use crate::error::{CallError, ErrorCode, ResponseError};
use crate::outbound::OutboundCalls;
use crate::reply::ReplyOnce;
use crate::wire::WireSender;

pub(crate) type NotifyFn = Box<dyn FnMut(Value) + Send>;
pub(crate) type CallFn = Box<dyn FnMut(Value, RequestContext, ReplyOnce) + Send>;

/// Whether the transport loop should keep reading.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    Stop,
}

pub(crate) struct Dispatcher {
    notifications: HashMap<&'static str, NotifyFn>,
    calls: HashMap<&'static str, CallFn>,
    cancels: Arc<CancelRegistry>,
    outbound: Arc<OutboundCalls>,
    shared: Arc<Shared>,
    wire: WireSender,
}

impl Dispatcher {
    pub(crate) fn new(
        wire: WireSender,
        shared: Arc<Shared>,
        outbound: Arc<OutboundCalls>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            notifications: HashMap::new(),
            calls: HashMap::new(),
            cancels,
            outbound,
            shared,
            wire,
        }
    }

    pub(crate) fn register_notification(&mut self, method: &'static str, handler: NotifyFn) {
        if self.notifications.insert(method, handler).is_some() {
            panic!("notification handler for {method} registered twice");
        }
    }

    pub(crate) fn register_call(&mut self, method: &'static str, handler: CallFn) {
        if self.calls.insert(method, handler).is_some() {
            panic!("call handler for {method} registered twice");
        }
    }

    pub(crate) fn dispatch(&mut self, envelope: Envelope) -> Outcome {
        match envelope {
            Envelope::Notification { method, params } => self.on_notification(&method, params),
            Envelope::Call { id, method, params } => {
                self.on_call(id, method, params);
                Outcome::Continue
            }
            Envelope::Reply { id, result } => {
                self.on_reply(&id, result);
                Outcome::Continue
            }
        }
    }

    fn on_notification(&mut self, method: &str, params: Value) -> Outcome {
        tracing::debug!(method, "<-- notification");
        if method == "exit" {
            return Outcome::Stop;
        }
        if !self.shared.is_initialized() {
            tracing::error!(method, "notification before initialization");
            return Outcome::Continue;
        }
        if method == "$/cancelRequest" {
            self.on_cancel(&params);
            return Outcome::Continue;
        }
        match self.notifications.get_mut(method) {
            Some(handler) => {
                let span = tracing::debug_span!("notification", method, params = ?params);
                let _guard = span.enter();
                handler(params);
            }
            None => tracing::debug!(method, "unhandled notification"),
        }
        Outcome::Continue
    }

    fn on_call(&mut self, id: RequestId, method: String, params: Value) {
        tracing::debug!(method = %method, id = %id, "<-- call");
        let span = tracing::debug_span!(
            "request",
            method = %method,
            params = ?params,
            reply = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        let (token, scope) = self.cancels.register(&id);
        let cx = RequestContext::new(self.shared.offset_encoding(), token, span.clone(), scope);
        let reply = ReplyOnce::new(
            id.clone(),
            method.clone(),
            self.wire.clone(),
            Arc::clone(&self.shared),
            span.clone(),
        );

        if !self.shared.is_initialized() && method != "initialize" {
            tracing::error!(method = %method, id = %id, "call before initialization");
            reply.error(ErrorCode::ServerNotInitialized, "server not initialized");
            return;
        }
        match self.calls.get_mut(method.as_str()) {
            Some(handler) => {
                let _guard = span.enter();
                handler(params, cx, reply);
            }
            None => reply.error(ErrorCode::MethodNotFound, "method not found"),
        }
    }

    fn on_reply(&mut self, id: &RequestId, result: Result<Value, ResponseError>) {
        // Outbound ids are always integers; anything else cannot be ours.
        let Some(id) = id.as_number() else {
            tracing::warn!(id = %id, "dropping reply with non-integer id");
            return;
        };
        let Some(callback) = self.outbound.claim(id) else {
            tracing::warn!(id, "received a reply but there was no such call");
            return;
        };
        match result {
            Ok(value) => {
                tracing::debug!(id, "<-- reply");
                callback(Ok(value));
            }
            Err(error) => {
                tracing::debug!(id, %error, "<-- reply error");
                callback(Err(CallError::Rpc(error)));
            }
        }
    }

    fn on_cancel(&mut self, params: &Value) {
        let id = params
            .get("id")
            .and_then(|raw| serde_json::from_value::<RequestId>(raw.clone()).ok());
        match id {
            Some(id) => self.cancels.cancel(&id.registry_key()),
            None => tracing::error!("malformed cancellation request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OffsetEncoding;
    use crate::wire::WriterCommand;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        shared: Arc<Shared>,
        outbound: Arc<OutboundCalls>,
        rx: mpsc::UnboundedReceiver<WriterCommand>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let wire = WireSender::new(tx);
        let shared = Arc::new(Shared::new(OffsetEncoding::Utf16));
        let outbound = Arc::new(OutboundCalls::new(8));
        let cancels = Arc::new(CancelRegistry::new());
        let dispatcher = Dispatcher::new(
            wire,
            Arc::clone(&shared),
            Arc::clone(&outbound),
            cancels,
        );
        Fixture {
            dispatcher,
            shared,
            outbound,
            rx,
        }
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<WriterCommand>) -> Option<Value> {
        match rx.try_recv() {
            Ok(WriterCommand::Send(frame)) => Some(frame.to_value()),
            _ => None,
        }
    }

    fn call(id: i64, method: &str) -> Envelope {
        Envelope::Call {
            id: RequestId::Number(id),
            method: method.to_owned(),
            params: Value::Null,
        }
    }

    #[test]
    fn exit_stops_the_loop() {
        let mut f = fixture();
        let outcome = f.dispatcher.dispatch(Envelope::Notification {
            method: "exit".to_owned(),
            params: Value::Null,
        });
        assert_eq!(outcome, Outcome::Stop);
    }

    #[test]
    fn call_before_initialization_is_refused() {
        let mut f = fixture();
        f.dispatcher
            .register_call("test/echo", Box::new(|_, _, reply| reply.ok(json!("hi"))));

        f.dispatcher.dispatch(call(1, "test/echo"));

        let frame = next_frame(&mut f.rx).expect("refusal frame");
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["error"]["code"], -32002);
        assert_eq!(frame["error"]["message"], "server not initialized");
    }

    #[test]
    fn notification_before_initialization_is_dropped() {
        let mut f = fixture();
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        f.dispatcher.register_notification(
            "test/ping",
            Box::new(move |_| *sink.lock().unwrap() += 1),
        );

        f.dispatcher.dispatch(Envelope::Notification {
            method: "test/ping".to_owned(),
            params: Value::Null,
        });
        assert_eq!(*hits.lock().unwrap(), 0);

        f.shared.set_initialized();
        f.dispatcher.dispatch(Envelope::Notification {
            method: "test/ping".to_owned(),
            params: Value::Null,
        });
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unknown_method_is_refused() {
        let mut f = fixture();
        f.shared.set_initialized();
        f.dispatcher.dispatch(call(9, "no/such"));

        let frame = next_frame(&mut f.rx).expect("refusal frame");
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["error"]["code"], -32601);
        assert_eq!(frame["error"]["message"], "method not found");
    }

    #[test]
    fn initialize_is_allowed_through_the_gate() {
        let mut f = fixture();
        f.dispatcher.register_call(
            "initialize",
            Box::new(|_, _, reply| reply.ok(json!({"capabilities": {}}))),
        );

        f.dispatcher.dispatch(call(1, "initialize"));

        let frame = next_frame(&mut f.rx).expect("initialize reply");
        assert!(frame["result"]["capabilities"].is_object());
    }

    #[test]
    fn cancel_notification_fires_the_matching_call() {
        let mut f = fixture();
        f.shared.set_initialized();
        // Park the context and reply so the call stays in flight, the way a
        // handler does when it hands work to another task.
        let parked: Arc<Mutex<Option<(RequestContext, ReplyOnce)>>> =
            Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        f.dispatcher.register_call(
            "test/slow",
            Box::new(move |_, cx, reply| {
                *slot.lock().unwrap() = Some((cx, reply));
            }),
        );

        f.dispatcher.dispatch(call(5, "test/slow"));
        let token = {
            let guard = parked.lock().unwrap();
            let (cx, _) = guard.as_ref().expect("handler ran");
            assert!(!cx.is_cancelled());
            cx.cancel_token()
        };

        f.dispatcher.dispatch(Envelope::Notification {
            method: "$/cancelRequest".to_owned(),
            params: json!({"id": 5}),
        });
        assert!(token.is_cancelled());

        let (_cx, reply) = parked.lock().unwrap().take().expect("still parked");
        reply.error(ErrorCode::RequestCancelled, "canceled");
        let frame = next_frame(&mut f.rx).expect("cancellation reply");
        assert_eq!(frame["error"]["code"], -32800);
    }

    #[test]
    fn reply_is_routed_to_the_stored_continuation() {
        let mut f = fixture();
        f.shared.set_initialized();
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let id = f.outbound.register(Box::new(move |outcome| {
            *sink.lock().unwrap() = Some(outcome.map_err(|e| e.to_string()));
        }));

        f.dispatcher.dispatch(Envelope::Reply {
            id: RequestId::Number(id),
            result: Ok(json!({"applied": true})),
        });

        let outcome = observed.lock().unwrap().take().expect("continuation ran");
        assert_eq!(outcome.unwrap()["applied"], true);
    }

    #[test]
    fn reply_with_unknown_id_is_dropped() {
        let mut f = fixture();
        f.shared.set_initialized();
        f.dispatcher.dispatch(Envelope::Reply {
            id: RequestId::Number(404),
            result: Ok(Value::Null),
        });
        assert!(next_frame(&mut f.rx).is_none());
    }

    #[test]
    fn reply_with_string_id_is_dropped() {
        let mut f = fixture();
        f.shared.set_initialized();
        let touched = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&touched);
        f.outbound.register(Box::new(move |_| *sink.lock().unwrap() = true));

        f.dispatcher.dispatch(Envelope::Reply {
            id: RequestId::String("0".to_owned()),
            result: Ok(Value::Null),
        });
        assert!(!*touched.lock().unwrap());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let mut f = fixture();
        f.dispatcher
            .register_call("test/echo", Box::new(|_, _, reply| reply.ok(Value::Null)));
        f.dispatcher
            .register_call("test/echo", Box::new(|_, _, reply| reply.ok(Value::Null)));
    }
}
