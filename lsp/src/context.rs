//! Per-request ambient values.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelScope;

/// How the client counts characters inside a line. Negotiated once during
/// `initialize`; UTF-16 is the protocol default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[default]
    #[serde(rename = "utf-16")]
    Utf16,
    #[serde(rename = "utf-32")]
    Utf32,
}

impl OffsetEncoding {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf16 => "utf-16",
            Self::Utf32 => "utf-32",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "utf-8" => Some(Self::Utf8),
            "utf-16" => Some(Self::Utf16),
            "utf-32" => Some(Self::Utf32),
            _ => None,
        }
    }
}

/// Ambient values for one inbound call, passed to the handler and cloned
/// into whatever concurrent work it spawns.
///
/// Clones share the cancel registration: the entry is reaped when the last
/// clone drops (and the id has not been reused since).
#[derive(Clone)]
pub struct RequestContext {
    encoding: OffsetEncoding,
    cancel: CancellationToken,
    span: tracing::Span,
    _scope: Arc<CancelScope>,
}

impl RequestContext {
    pub(crate) fn new(
        encoding: OffsetEncoding,
        cancel: CancellationToken,
        span: tracing::Span,
        scope: CancelScope,
    ) -> Self {
        Self {
            encoding,
            cancel,
            span,
            _scope: Arc::new(scope),
        }
    }

    #[must_use]
    pub fn offset_encoding(&self) -> OffsetEncoding {
        self.encoding
    }

    /// The cancel signal for this call. Cancellation is cooperative: work
    /// observes the token at its own suspension points.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The trace span covering this call; enter it from spawned work to keep
    /// logs attributed to the request.
    #[must_use]
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
