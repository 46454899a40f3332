//! Endpoint lifecycle: handler registration, the transport loop, and the
//! handles for server-originated traffic.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cancel::CancelRegistry;
use crate::codec::FrameReader;
use crate::context::{OffsetEncoding, RequestContext};
use crate::dispatch::{Dispatcher, Outcome};
use crate::envelope::Envelope;
use crate::error::{CallError, ErrorCode};
use crate::outbound::OutboundCalls;
use crate::reply::ReplyOnce;
use crate::wire::{WireSender, WriterCommand, drain_to_writer};

/// Knobs the dispatch core recognizes. Everything defaults to values that
/// suit a stdio session with a well-behaved client.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Bound on server-to-client calls awaiting replies; beyond it the
    /// oldest pending call is failed and forgotten.
    #[serde(default = "default_max_outbound")]
    pub max_in_flight_outbound_calls: usize,
    /// Offset encoding assumed until `initialize` negotiates one.
    #[serde(default)]
    pub default_offset_encoding: OffsetEncoding,
    /// How long a clean shutdown may spend flushing queued frames.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_max_outbound() -> usize {
    100
}

fn default_shutdown_grace() -> u64 {
    60
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_in_flight_outbound_calls: default_max_outbound(),
            default_offset_encoding: OffsetEncoding::default(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// State shared between the dispatcher, reply handles, and user-facing
/// handles.
pub(crate) struct Shared {
    initialized: AtomicBool,
    tearing_down: AtomicBool,
    shutdown_requested: AtomicBool,
    default_encoding: OffsetEncoding,
    negotiated_encoding: OnceLock<OffsetEncoding>,
}

impl Shared {
    pub(crate) fn new(default_encoding: OffsetEncoding) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            default_encoding,
            negotiated_encoding: OnceLock::new(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }

    pub(crate) fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::Release);
    }

    pub(crate) fn offset_encoding(&self) -> OffsetEncoding {
        *self
            .negotiated_encoding
            .get()
            .unwrap_or(&self.default_encoding)
    }
}

/// Server-side view of the client: outbound notifications and calls.
///
/// Cheap to clone; handlers and workers keep one to publish diagnostics or
/// ask the client to do something.
#[derive(Clone)]
pub struct Client {
    wire: WireSender,
    outbound: Arc<OutboundCalls>,
}

impl Client {
    /// Send a notification to the client.
    pub fn notify(&self, method: &str, params: Value) {
        self.wire.notify(method.to_owned(), params);
    }

    /// Call the client. The continuation is stored until the client replies
    /// or the pending table overflows, whichever happens first, and is
    /// invoked exactly once. Returns the allocated request id.
    pub fn call(
        &self,
        method: &str,
        params: Value,
        on_reply: impl FnOnce(Result<Value, CallError>) + Send + 'static,
    ) -> i64 {
        let id = self.outbound.register(Box::new(on_reply));
        self.wire.call(id, method.to_owned(), params);
        id
    }

    /// Call the client and await its reply.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        self.call(method, params, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Err(CallError::Closed))
    }
}

/// Introspection and negotiation results, usable from handlers.
#[derive(Clone)]
pub struct EndpointHandle {
    shared: Arc<Shared>,
}

impl EndpointHandle {
    /// Record the offset encoding negotiated during `initialize`. The first
    /// write wins; later calls are ignored.
    pub fn set_offset_encoding(&self, encoding: OffsetEncoding) {
        let _ = self.shared.negotiated_encoding.set(encoding);
    }

    /// The encoding in effect: negotiated if set, configured default
    /// otherwise.
    #[must_use]
    pub fn offset_encoding(&self) -> OffsetEncoding {
        self.shared.offset_encoding()
    }

    /// Note that the client asked for a clean shutdown. The endpoint only
    /// reports this; exit-code policy belongs to the process.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::Acquire)
    }
}

/// Registers handlers and produces an [`Endpoint`].
///
/// All registration happens before the endpoint runs; registering a method
/// twice is a programming error and panics.
pub struct EndpointBuilder {
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    client: Client,
    control_tx: mpsc::UnboundedSender<WriterCommand>,
    outgoing_rx: mpsc::UnboundedReceiver<WriterCommand>,
    flush_timeout: Duration,
}

impl EndpointBuilder {
    /// A handle for server-originated traffic, cloneable into handlers.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    #[must_use]
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a notification handler. Decode failures are logged and the
    /// notification is dropped; notifications never produce replies.
    pub fn on_notification<P, F>(&mut self, method: &'static str, mut handler: F)
    where
        P: DeserializeOwned,
        F: FnMut(P) + Send + 'static,
    {
        self.dispatcher.register_notification(
            method,
            Box::new(move |params| match serde_json::from_value::<P>(params) {
                Ok(params) => handler(params),
                Err(error) => {
                    tracing::error!(method, %error, "failed to decode notification params");
                }
            }),
        );
    }

    /// Register a call handler. The handler must consume the [`ReplyOnce`]:
    /// answer inline, or move it into spawned work together with the
    /// context. Decode failures are answered with `InvalidRequest` without
    /// invoking the handler.
    pub fn on_call<P, F>(&mut self, method: &'static str, mut handler: F)
    where
        P: DeserializeOwned,
        F: FnMut(P, RequestContext, ReplyOnce) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let gate_opens_here = method == "initialize";
        self.dispatcher.register_call(
            method,
            Box::new(move |params, cx, reply| {
                match serde_json::from_value::<P>(params) {
                    Ok(params) => {
                        handler(params, cx, reply);
                        // Initialization completes with its handler; nothing
                        // else can have been dispatched in the meantime.
                        if gate_opens_here {
                            shared.set_initialized();
                        }
                    }
                    Err(error) => {
                        tracing::error!(method, %error, "failed to decode call params");
                        reply.error(ErrorCode::InvalidRequest, "failed to decode request");
                    }
                }
            }),
        );
    }

    #[must_use]
    pub fn build(self) -> Endpoint {
        Endpoint {
            dispatcher: self.dispatcher,
            shared: self.shared,
            control_tx: self.control_tx,
            outgoing_rx: self.outgoing_rx,
            flush_timeout: self.flush_timeout,
        }
    }
}

/// One LSP session over one bidirectional transport.
pub struct Endpoint {
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<WriterCommand>,
    outgoing_rx: mpsc::UnboundedReceiver<WriterCommand>,
    flush_timeout: Duration,
}

impl Endpoint {
    #[must_use]
    pub fn builder(config: EndpointConfig) -> EndpointBuilder {
        let (tx, rx) = mpsc::unbounded_channel();
        let wire = WireSender::new(tx.clone());
        let shared = Arc::new(Shared::new(config.default_offset_encoding));
        let outbound = Arc::new(OutboundCalls::new(config.max_in_flight_outbound_calls));
        let cancels = Arc::new(CancelRegistry::new());
        let dispatcher = Dispatcher::new(
            wire.clone(),
            Arc::clone(&shared),
            Arc::clone(&outbound),
            cancels,
        );
        EndpointBuilder {
            dispatcher,
            shared,
            client: Client { wire, outbound },
            control_tx: tx,
            outgoing_rx: rx,
            flush_timeout: Duration::from_secs(config.shutdown_grace_seconds),
        }
    }

    /// Drive the session until the client disconnects, sends `exit`, or the
    /// transport fails. Messages are dispatched in wire order; only a
    /// transport failure is an error.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Endpoint {
            mut dispatcher,
            shared,
            control_tx,
            outgoing_rx,
            flush_timeout,
        } = self;

        let mut writer_task: JoinHandle<Result<()>> =
            tokio::spawn(drain_to_writer(outgoing_rx, writer));
        let mut writer_alive = true;
        let mut reader = FrameReader::new(reader);

        let result = loop {
            tokio::select! {
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => match Envelope::from_frame(&frame) {
                        Some(envelope) => {
                            if dispatcher.dispatch(envelope) == Outcome::Stop {
                                break Ok(());
                            }
                        }
                        None => tracing::warn!(%frame, "dropping frame that is not JSON-RPC traffic"),
                    },
                    Ok(None) => break Ok(()),
                    Err(error) => break Err(error.context("reading from transport")),
                },
                joined = &mut writer_task, if writer_alive => {
                    writer_alive = false;
                    break match joined {
                        Ok(Ok(())) => Err(anyhow!("writer task stopped unexpectedly")),
                        Ok(Err(error)) => Err(error.context("writing to transport")),
                        Err(join_error) => Err(anyhow!(join_error).context("writer task panicked")),
                    };
                }
            }
        };

        // From here on, unanswered reply handles abandon silently: the
        // legitimate leftovers are handles parked in continuations of calls
        // the client never answered.
        shared.begin_teardown();
        drop(dispatcher);

        if writer_alive {
            let _ = control_tx.send(WriterCommand::Shutdown);
            match tokio::time::timeout(flush_timeout, &mut writer_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(error))) => {
                    if result.is_ok() {
                        return Err(error.context("flushing transport at shutdown"));
                    }
                    tracing::debug!(%error, "flush after transport failure also failed");
                }
                Ok(Err(join_error)) => {
                    tracing::error!(error = %join_error, "writer task panicked during shutdown");
                }
                Err(_) => {
                    tracing::warn!("shutdown flush timed out, abandoning queued frames");
                    writer_task.abort();
                }
            }
        }

        result
    }
}
