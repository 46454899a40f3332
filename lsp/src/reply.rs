//! The single-use capability to answer one inbound call.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::endpoint::Shared;
use crate::envelope::RequestId;
use crate::error::{ErrorCode, ResponseError};
use crate::wire::WireSender;

/// Owns the pending reply for one inbound call.
///
/// The handle is move-only and [`reply`](Self::reply) consumes it, so a call
/// cannot be answered twice. It may be parked in a closure and carried to
/// another task; whoever ends up holding it must answer. Dropping it
/// unanswered is a bug: the drop handler logs it and sends a synthesized
/// internal error so the client is never left waiting.
///
/// The one legitimate way for a handle to die unanswered is endpoint
/// teardown: a handler may have parked it inside the continuation of a call
/// to the client, and the client never replied. No frame is sent then.
pub struct ReplyOnce {
    pending: Option<Pending>,
}

struct Pending {
    id: RequestId,
    method: String,
    received_at: Instant,
    wire: WireSender,
    shared: Arc<Shared>,
    span: tracing::Span,
}

impl ReplyOnce {
    pub(crate) fn new(
        id: RequestId,
        method: String,
        wire: WireSender,
        shared: Arc<Shared>,
        span: tracing::Span,
    ) -> Self {
        Self {
            pending: Some(Pending {
                id,
                method,
                received_at: Instant::now(),
                wire,
                shared,
                span,
            }),
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        self.pending
            .as_ref()
            .map(|p| p.method.as_str())
            .unwrap_or_default()
    }

    /// Send the reply.
    pub fn reply(mut self, result: Result<Value, ResponseError>) {
        if let Some(pending) = self.pending.take() {
            pending.finish(result);
        }
    }

    /// Send a successful reply.
    pub fn ok(self, result: Value) {
        self.reply(Ok(result));
    }

    /// Send an error reply.
    pub fn error(self, code: ErrorCode, message: impl Into<String>) {
        self.reply(Err(ResponseError::new(code, message)));
    }
}

impl Drop for ReplyOnce {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.shared.is_tearing_down() {
            return;
        }
        tracing::error!(method = %pending.method, id = %pending.id, "no reply sent for call");
        pending.finish(Err(ResponseError::new(
            ErrorCode::InternalError,
            "server failed to reply",
        )));
    }
}

impl Pending {
    fn finish(self, result: Result<Value, ResponseError>) {
        let elapsed_ms = self.received_at.elapsed().as_millis() as u64;
        match &result {
            Ok(value) => {
                self.span.record("reply", tracing::field::debug(value));
                tracing::debug!(method = %self.method, id = %self.id, elapsed_ms, "--> reply");
            }
            Err(error) => {
                self.span.record("error", tracing::field::display(error));
                tracing::debug!(
                    method = %self.method,
                    id = %self.id,
                    elapsed_ms,
                    %error,
                    "--> reply error"
                );
            }
        }
        self.wire.reply(self.id, result);
    }
}
