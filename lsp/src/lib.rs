//! Message dispatch and request lifecycle for an LSP endpoint.
//!
//! This crate turns a bidirectional stream of JSON-RPC 2.0 frames into typed
//! handler invocations and back. It owns the protocol's hard guarantees:
//! exactly one reply per inbound call, the `initialize` gate, client-driven
//! cancellation with correct id-reuse semantics, and a bounded table of
//! server-originated calls awaiting client replies. What the handlers
//! actually compute (completion, hover, diagnostics) lives elsewhere and
//! plugs in through [`EndpointBuilder`].

pub mod codec;

mod cancel;
mod context;
mod dispatch;
mod endpoint;
mod envelope;
mod error;
mod outbound;
mod reply;
mod wire;

pub use codec::{FrameReader, FrameWriter};
pub use context::{OffsetEncoding, RequestContext};
pub use endpoint::{Client, Endpoint, EndpointBuilder, EndpointConfig, EndpointHandle};
pub use envelope::RequestId;
pub use error::{CallError, ErrorCode, ResponseError};
pub use reply::ReplyOnce;
