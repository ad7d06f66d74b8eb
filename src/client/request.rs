//! Queued DIMSE requests and their caller-facing channels.

use std::time::Duration;

use dicom_dictionary_std::uids;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::dimse::{CommandSet, Priority, Status};
use crate::pdu::{AssociationRJResult, AssociationRJSource};

/// The lifecycle of a request.
///
/// States only move forward:
/// `Pending → InFlight → {Completed | TimedOut | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued, nothing sent yet
    Pending,
    /// Transmitted and counted against the asynchronous operations window
    InFlight,
    Completed,
    TimedOut,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::TimedOut | RequestState::Failed
        )
    }
}

/// Why a request failed without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The peer rejected the association serving this request
    AssociationRejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// The association was aborted while the request was in flight
    AssociationAborted,
    /// The peer violated the protocol
    ProtocolViolation,
    /// The peer accepted no presentation context for the request's SOP class
    NoPresentationContext,
    /// The data set could not be converted to the negotiated transfer syntax
    Transcoding,
    /// The request could not be encoded
    Encoding,
    /// The underlying transport failed
    Transport,
    /// The caller cancelled the run
    Cancelled,
}

/// The single terminal event of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A final (non-pending) response arrived
    Completed { last_status: Status },
    /// Inbound silence exceeded the request timeout
    TimedOut { timeout: Duration },
    Failed { reason: FailureReason },
}

/// The DIMSE operation a request performs.
#[derive(Debug)]
pub enum Operation {
    CEcho,
    CStore { sop_instance_uid: String },
    CFind,
    CGet,
    CMove { destination: String },
    /// A caller-provided command set;
    /// the message ID element is overwritten at transmission
    Custom {
        command: CommandSet,
        multi_response: bool,
    },
}

/// A data set payload already encoded in a known transfer syntax.
#[derive(Debug, Clone)]
pub struct EncodedDataSet {
    pub bytes: Vec<u8>,
    pub transfer_syntax_uid: String,
}

impl EncodedDataSet {
    pub fn new(bytes: Vec<u8>, transfer_syntax_uid: impl Into<String>) -> Self {
        EncodedDataSet {
            bytes,
            transfer_syntax_uid: transfer_syntax_uid.into(),
        }
    }

    /// Encode an in-memory data set in the given transfer syntax,
    /// resolved from the transfer syntax registry.
    pub fn from_object(
        object: &dicom_object::InMemDicomObject,
        transfer_syntax_uid: impl Into<String>,
    ) -> Result<Self, crate::dimse::Error> {
        let transfer_syntax_uid = transfer_syntax_uid.into();
        let bytes = crate::dimse::encode_data_set(object, &transfer_syntax_uid)?;
        Ok(EncodedDataSet {
            bytes,
            transfer_syntax_uid,
        })
    }
}

/// A response correlated to a request by message ID.
#[derive(Debug)]
pub struct DicomResponse {
    pub message_id: u16,
    pub status: Status,
    /// The full response command set
    pub command: CommandSet,
    /// The response data set, if any, in the transfer syntax
    /// negotiated for the presentation context
    pub data: Option<Vec<u8>>,
}

/// A DIMSE request to be queued on a client.
///
/// Constructing a request yields the request itself,
/// which transfers ownership to the client on
/// [`add_request`](crate::client::DicomClient::add_request),
/// and a [`RequestReceiver`] through which the caller
/// observes responses and the terminal outcome.
#[derive(Debug)]
pub struct DicomRequest {
    pub(crate) message_id: u16,
    operation: Operation,
    sop_class_uid: String,
    priority: Priority,
    data: Option<EncodedDataSet>,
    state: RequestState,
    response_tx: mpsc::UnboundedSender<DicomResponse>,
    outcome_tx: Option<oneshot::Sender<RequestOutcome>>,
}

impl DicomRequest {
    /// Create a request for an arbitrary operation.
    pub fn new(
        operation: Operation,
        sop_class_uid: impl Into<String>,
        data: Option<EncodedDataSet>,
    ) -> (Self, RequestReceiver) {
        let (response_tx, responses) = mpsc::unbounded_channel();
        let (outcome_tx, outcome) = oneshot::channel();
        let request = DicomRequest {
            message_id: 0,
            operation,
            sop_class_uid: sop_class_uid.into(),
            priority: Priority::Medium,
            data,
            state: RequestState::Pending,
            response_tx,
            outcome_tx: Some(outcome_tx),
        };
        (request, RequestReceiver { responses, outcome })
    }

    /// Create a C-ECHO request against the Verification SOP class.
    pub fn c_echo() -> (Self, RequestReceiver) {
        Self::new(Operation::CEcho, uids::VERIFICATION, None)
    }

    /// Create a C-STORE request carrying the given encoded instance.
    pub fn c_store(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        data: EncodedDataSet,
    ) -> (Self, RequestReceiver) {
        Self::new(
            Operation::CStore {
                sop_instance_uid: sop_instance_uid.into(),
            },
            sop_class_uid,
            Some(data),
        )
    }

    /// Create a C-FIND request with the given query identifier.
    pub fn c_find(
        sop_class_uid: impl Into<String>,
        identifier: EncodedDataSet,
    ) -> (Self, RequestReceiver) {
        Self::new(Operation::CFind, sop_class_uid, Some(identifier))
    }

    /// Create a C-GET request with the given retrieve identifier.
    pub fn c_get(
        sop_class_uid: impl Into<String>,
        identifier: EncodedDataSet,
    ) -> (Self, RequestReceiver) {
        Self::new(Operation::CGet, sop_class_uid, Some(identifier))
    }

    /// Create a C-MOVE request towards the given destination AE title.
    pub fn c_move(
        sop_class_uid: impl Into<String>,
        destination: impl Into<String>,
        identifier: EncodedDataSet,
    ) -> (Self, RequestReceiver) {
        Self::new(
            Operation::CMove {
                destination: destination.into(),
            },
            sop_class_uid,
            Some(identifier),
        )
    }

    /// Override the DIMSE priority of this request.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The message ID assigned to this request.
    /// Zero until the request is added to a client.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether this operation produces a sequence of pending responses
    /// terminated by a final status.
    pub fn is_multi_response(&self) -> bool {
        match &self.operation {
            Operation::CFind | Operation::CGet | Operation::CMove { .. } => true,
            Operation::Custom { multi_response, .. } => *multi_response,
            Operation::CEcho | Operation::CStore { .. } => false,
        }
    }

    pub(crate) fn data(&self) -> Option<&EncodedDataSet> {
        self.data.as_ref()
    }

    /// Build the command set for this request with its assigned message ID.
    pub(crate) fn command_set(&self) -> CommandSet {
        match &self.operation {
            Operation::CEcho => CommandSet::c_echo_rq(self.message_id, &self.sop_class_uid),
            Operation::CStore { sop_instance_uid } => CommandSet::c_store_rq(
                self.message_id,
                &self.sop_class_uid,
                sop_instance_uid,
                self.priority,
            ),
            Operation::CFind => {
                CommandSet::c_find_rq(self.message_id, &self.sop_class_uid, self.priority)
            }
            Operation::CGet => {
                CommandSet::c_get_rq(self.message_id, &self.sop_class_uid, self.priority)
            }
            Operation::CMove { destination } => CommandSet::c_move_rq(
                self.message_id,
                &self.sop_class_uid,
                destination,
                self.priority,
            ),
            Operation::Custom { command, .. } => {
                let mut object = command.object().clone();
                object.put(dicom_core::DataElement::new(
                    dicom_dictionary_std::tags::MESSAGE_ID,
                    dicom_core::VR::US,
                    dicom_core::PrimitiveValue::from(self.message_id),
                ));
                CommandSet::from_object(object)
            }
        }
    }

    pub(crate) fn mark_in_flight(&mut self) {
        debug_assert_eq!(self.state, RequestState::Pending);
        self.state = RequestState::InFlight;
    }

    /// Deliver one response to the caller.
    /// A dropped receiver is not an error; the response is discarded.
    pub(crate) fn deliver_response(&self, response: DicomResponse) {
        let _ = self.response_tx.send(response);
    }

    /// Fire the terminal event.
    /// A second terminal event on the same request is dropped.
    pub(crate) fn finish(&mut self, outcome: RequestOutcome) {
        if self.state.is_terminal() {
            trace!(
                message_id = self.message_id,
                "dropping duplicate terminal event"
            );
            return;
        }
        self.state = match outcome {
            RequestOutcome::Completed { .. } => RequestState::Completed,
            RequestOutcome::TimedOut { .. } => RequestState::TimedOut,
            RequestOutcome::Failed { .. } => RequestState::Failed,
        };
        if let Some(outcome_tx) = self.outcome_tx.take() {
            let _ = outcome_tx.send(outcome);
        }
    }
}

/// The caller-facing side of a request:
/// a channel of responses and a one-shot terminal outcome.
#[derive(Debug)]
pub struct RequestReceiver {
    responses: mpsc::UnboundedReceiver<DicomResponse>,
    outcome: oneshot::Receiver<RequestOutcome>,
}

impl RequestReceiver {
    /// Receive the next response for this request.
    ///
    /// Yields `None` once the request reached a terminal state
    /// and all its responses were consumed.
    pub async fn next_response(&mut self) -> Option<DicomResponse> {
        self.responses.recv().await
    }

    /// Wait for the terminal outcome of the request.
    ///
    /// Responses not yet consumed are discarded;
    /// interleave [`next_response`](Self::next_response) calls
    /// to observe them all.
    pub async fn outcome(self) -> RequestOutcome {
        self.outcome.await.unwrap_or(RequestOutcome::Failed {
            reason: FailureReason::Cancelled,
        })
    }
}
