//! The client dispatcher: queues DIMSE requests, opens and reuses
//! associations, pipelines outstanding requests, enforces per-request
//! timeouts, and reports outcomes.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_scu::client::{ClientOptions, DicomClient, DicomRequest, EncodedDataSet};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DicomClient::new(
//!     ClientOptions::builder()
//!         .host("pacs.hospital.example")
//!         .port(104)
//!         .calling_ae_title("THIS-SCU")
//!         .called_ae_title("MAIN-PACS")
//!         .request_timeout(std::time::Duration::from_secs(5))
//!         .build(),
//! );
//!
//! let query = EncodedDataSet::new(encode_query(), "1.2.840.10008.1.2");
//! let (request, mut receiver) =
//!     DicomRequest::c_find("1.2.840.10008.5.1.4.1.2.2.1", query);
//! client.add_request(request);
//!
//! let run = client.send();
//! tokio::pin!(run);
//! loop {
//!     tokio::select! {
//!         outcome = &mut run => { outcome?; break; }
//!         Some(response) = receiver.next_response() => {
//!             println!("match with status {:?}", response.status);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! # fn encode_query() -> Vec<u8> { unimplemented!() }
//! ```

mod dispatcher;
pub mod request;

pub use request::{
    DicomRequest, DicomResponse, EncodedDataSet, FailureReason, Operation, RequestOutcome,
    RequestReceiver, RequestState,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bon::Builder;
use snafu::{Backtrace, Snafu};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::FullAeAddr;
use crate::association::{self, AssociationState};
use crate::dimse::Status;
use crate::pdu::{AssociationRJResult, AssociationRJSource, DEFAULT_MAX_PDU};
use crate::transport::{self, StreamOpener, TcpOpener};

/// Transfer syntaxes proposed for every abstract syntax
/// in addition to the native syntax of queued payloads.
const FALLBACK_TRANSFER_SYNTAXES: [&str; 2] = ["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"];

/// Presentation context IDs are odd integers up to 255.
const MAX_PRESENTATION_CONTEXTS: usize = 127;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not connect to peer: {}", source))]
    Connect {
        #[snafu(backtrace)]
        source: transport::Error,
    },

    #[snafu(display("association rejected by the peer ({})", source_field))]
    Rejected {
        result: AssociationRJResult,
        source_field: AssociationRJSource,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol violation: {}", source))]
    Protocol {
        #[snafu(backtrace)]
        source: association::Error,
    },

    #[snafu(display("transport failure: {}", source))]
    Transport {
        #[snafu(backtrace)]
        source: association::Error,
    },

    /// association aborted before any progress could be made
    Aborted { backtrace: Backtrace },

    /// the run was cancelled by the caller
    Cancelled { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An observable event emitted by the client while a run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The active association changed protocol state
    StateChanged { state: AssociationState },
    /// The peer accepted an association
    AssociationAccepted,
    /// The peer rejected an association
    AssociationRejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// An association was released gracefully
    AssociationReleased,
    /// A request exceeded the configured request timeout
    RequestTimedOut { message_id: u16, timeout: Duration },
    /// A request received its final response
    RequestCompleted { message_id: u16, status: Status },
}

/// Conversion hook for payloads whose native transfer syntax
/// was not the one negotiated for their presentation context.
///
/// The client itself does not interpret data sets;
/// when no transcoder is installed, a mismatch fails the request.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        data: &[u8],
        from_transfer_syntax: &str,
        to_transfer_syntax: &str,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Configuration of a [`DicomClient`].
#[derive(Debug, Clone, Builder)]
pub struct ClientOptions {
    /// Host name or address of the remote application entity
    #[builder(into)]
    pub host: String,
    /// TCP port of the remote application entity
    pub port: u16,
    /// The application entity title of this node
    #[builder(into, default = "THIS-SCU".to_string())]
    pub calling_ae_title: String,
    /// The application entity title of the remote node
    #[builder(into, default = "ANY-SCP".to_string())]
    pub called_ae_title: String,
    /// Maximum inbound silence per in-flight request
    /// before it is failed with a timeout
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,
    /// Maximum PDU length advertised in the association request
    #[builder(default = DEFAULT_MAX_PDU)]
    pub max_pdu_length: u32,
    /// Maximum number of requests transmitted within one association;
    /// exceeding it triggers a release followed by a new association
    #[builder(default = 128)]
    pub max_requests_per_association: usize,
    /// Proposed asynchronous operations invoked (pipelining window);
    /// 0 means no pipelining, which is equivalent to 1
    #[builder(default = 1)]
    pub async_ops_invoked: u16,
    /// Proposed asynchronous operations performed
    #[builder(default = 1)]
    pub async_ops_performed: u16,
    /// How long to keep an established association open
    /// with an empty queue, allowing rapid reuse
    #[builder(default = Duration::from_millis(50))]
    pub linger: Duration,
    /// Deadline for establishing the TCP connection
    pub connect_timeout: Option<Duration>,
    /// Per-PDU write deadline on the connection
    pub write_timeout: Option<Duration>,
}

impl ClientOptions {
    /// Point these options at a full AE address (`AET@host:port`).
    ///
    /// An explicitly configured `called_ae_title` takes precedence
    /// over the AE title embedded in the address.
    pub fn with_ae_address(mut self, addr: &FullAeAddr) -> Self {
        if self.called_ae_title != "ANY-SCP" && self.called_ae_title != addr.ae_title() {
            tracing::warn!(
                "option `called_ae_title` overrides the AE title from `{}` to `{}`",
                addr.ae_title(),
                self.called_ae_title
            );
        } else {
            self.called_ae_title = addr.ae_title().to_string();
        }
        self.host = addr.host().to_string();
        self.port = addr.port();
        self
    }

    pub(crate) fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An association-oriented DICOM client.
///
/// Requests are admitted in FIFO order with [`add_request`](Self::add_request)
/// and processed by [`send`](Self::send), which batches them over
/// one or more sequential associations.
/// See the [module documentation](self) for an example.
pub struct DicomClient {
    options: ClientOptions,
    opener: Arc<dyn StreamOpener>,
    transcoder: Option<Arc<dyn Transcoder>>,
    queue: RequestQueue,
    events: StdMutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DicomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DicomClient")
            .field("options", &self.options)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl DicomClient {
    /// Create a client over plain TCP.
    pub fn new(options: ClientOptions) -> Self {
        let opener = Arc::new(TcpOpener {
            connect_timeout: options.connect_timeout,
        });
        Self::with_opener(options, opener)
    }

    /// Create a client over TLS.
    #[cfg(feature = "tls")]
    pub fn new_tls(
        options: ClientOptions,
        config: Arc<rustls::ClientConfig>,
        server_name: impl Into<String>,
    ) -> Self {
        let opener = Arc::new(transport::TlsOpener {
            config,
            server_name: server_name.into(),
            connect_timeout: options.connect_timeout,
        });
        Self::with_opener(options, opener)
    }

    /// Create a client over a custom stream factory.
    pub fn with_opener(options: ClientOptions, opener: Arc<dyn StreamOpener>) -> Self {
        DicomClient {
            options,
            opener,
            transcoder: None,
            queue: RequestQueue::new(),
            events: StdMutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Install a transcoder consulted when a payload's transfer syntax
    /// differs from the negotiated one.
    pub fn set_transcoder(&mut self, transcoder: Arc<dyn Transcoder>) {
        self.transcoder = Some(transcoder);
    }

    /// Propose an asynchronous operations window for future associations.
    pub fn negotiate_async_ops(&mut self, invoked: u16, performed: u16) {
        self.options.async_ops_invoked = invoked;
        self.options.async_ops_performed = performed;
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Enqueue a request. Legal before or while [`send`](Self::send) runs.
    ///
    /// Ownership of the request transfers to the client;
    /// it is given back to the caller through the channels
    /// of the corresponding [`RequestReceiver`].
    /// Returns the message ID assigned to the request.
    pub fn add_request(&self, request: DicomRequest) -> u16 {
        self.queue.push(request)
    }

    /// The number of requests currently queued (not yet transmitted).
    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Subscribe to client events.
    /// Only one subscription is active at a time;
    /// subscribing again replaces the previous receiver.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut events) = self.events.lock() {
            *events = Some(tx);
        }
        rx
    }

    /// Process the queue until it is drained and every transmitted request
    /// has terminated (completed, timed out, or failed).
    ///
    /// A concurrent `send` joins the active run
    /// and returns once the queue is drained.
    pub async fn send(&self) -> Result<()> {
        self.send_with_cancellation(CancellationToken::new()).await
    }

    /// Like [`send`](Self::send), with a cooperative cancellation signal.
    ///
    /// Cancellation aborts the current association and fails
    /// outstanding in-flight requests with
    /// [`FailureReason::Cancelled`]; queued requests stay queued
    /// and already-delivered responses are not rescinded.
    pub async fn send_with_cancellation(&self, cancellation: CancellationToken) -> Result<()> {
        // the lock makes a concurrent send wait out the active run
        let _run = self.run_lock.lock().await;
        if self.queue.is_empty() {
            return Ok(());
        }
        dispatcher::Dispatcher::new(self, cancellation).run().await
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(_) => return,
        };
        if let Some(tx) = events.as_ref() {
            if tx.send(event).is_err() {
                // subscriber went away
                *events = None;
            }
        }
    }

    pub(crate) fn emit_state(&self, state: AssociationState) {
        self.emit(ClientEvent::StateChanged { state });
    }

    pub(crate) fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub(crate) fn opener(&self) -> &Arc<dyn StreamOpener> {
        &self.opener
    }

    pub(crate) fn transcoder(&self) -> Option<&Arc<dyn Transcoder>> {
        self.transcoder.as_ref()
    }
}

/// The FIFO request queue shared between callers and the dispatcher.
///
/// Admission order is preserved; completion order across
/// pipelined requests is unconstrained.
pub(crate) struct RequestQueue {
    inner: StdMutex<QueueInner>,
    added: Notify,
}

struct QueueInner {
    requests: VecDeque<DicomRequest>,
    next_message_id: u16,
}

impl RequestQueue {
    fn new() -> Self {
        RequestQueue {
            inner: StdMutex::new(QueueInner {
                requests: VecDeque::new(),
                next_message_id: 1,
            }),
            added: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // the queue mutex is only held for short, non-panicking sections
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, mut request: DicomRequest) -> u16 {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_message_id;
            inner.next_message_id = inner.next_message_id.checked_add(1).unwrap_or(1);
            request.message_id = id;
            inner.requests.push_back(request);
            id
        };
        self.added.notify_one();
        id
    }

    /// Put a request back at the head of the queue,
    /// preserving its position for the next association.
    /// Does not notify: only the dispatcher itself puts requests back.
    pub(crate) fn push_front(&self, request: DicomRequest) {
        self.lock().requests.push_front(request);
    }

    pub(crate) fn pop(&self) -> Option<DicomRequest> {
        self.lock().requests.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().requests.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().requests.len()
    }

    /// A future that resolves when a request may have been added.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.added.notified()
    }

    /// Wait up to `linger` for the queue to become non-empty.
    pub(crate) async fn wait_nonempty(&self, linger: Duration) -> bool {
        let deadline = Instant::now() + linger;
        loop {
            if !self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.added.notified())
                .await
                .is_err()
            {
                return !self.is_empty();
            }
        }
    }

    /// Fail and drain every queued request.
    pub(crate) fn fail_all(&self, reason: FailureReason) {
        let mut drained: Vec<DicomRequest> = {
            let mut inner = self.lock();
            inner.requests.drain(..).collect()
        };
        for request in &mut drained {
            debug!(
                message_id = request.message_id(),
                ?reason,
                "failing queued request"
            );
            request.finish(RequestOutcome::Failed { reason });
        }
    }

    /// The presentation contexts to propose for the requests
    /// currently queued: one per distinct SOP class,
    /// preferring the native transfer syntax of queued payloads.
    pub(crate) fn presentation_proposals(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.lock();
        let mut proposals: Vec<(String, Vec<String>)> = Vec::new();
        for request in &inner.requests {
            let native = request
                .data()
                .map(|payload| payload.transfer_syntax_uid.clone());
            match proposals
                .iter_mut()
                .find(|(sop_class, _)| sop_class == request.sop_class_uid())
            {
                Some((_, transfer_syntaxes)) => {
                    if let Some(native) = native {
                        if !transfer_syntaxes.contains(&native) {
                            transfer_syntaxes.insert(0, native);
                        }
                    }
                }
                None => {
                    let mut transfer_syntaxes: Vec<String> = Vec::new();
                    if let Some(native) = native {
                        transfer_syntaxes.push(native);
                    }
                    for fallback in FALLBACK_TRANSFER_SYNTAXES {
                        if !transfer_syntaxes.iter().any(|ts| ts == fallback) {
                            transfer_syntaxes.push(fallback.to_string());
                        }
                    }
                    proposals.push((request.sop_class_uid().to_string(), transfer_syntaxes));
                }
            }
        }
        if proposals.len() > MAX_PRESENTATION_CONTEXTS {
            debug!(
                dropped = proposals.len() - MAX_PRESENTATION_CONTEXTS,
                "too many distinct SOP classes queued, later ones negotiate in a later association"
            );
            proposals.truncate(MAX_PRESENTATION_CONTEXTS);
        }
        proposals
    }
}
