//! The dispatch engine behind [`DicomClient::send`](super::DicomClient::send).
//!
//! A single task owns the connection for the lifetime of each association
//! and serializes all transmissions, receptions and timeout decisions.
//! Batches are bounded by `max_requests_per_association`;
//! the number of concurrently outstanding requests never exceeds
//! the negotiated asynchronous operations window.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::association::{
    AssociationState, ClientAssociation, ClientAssociationOptions, Error as AssociationError,
    PresentationContextNegotiated,
};
use crate::dimse::{fragment_message, CommandSet, DimseMessage, MessageAssembler};
use crate::pdu::Pdu;
use crate::transport::Connection;

use super::request::{DicomRequest, DicomResponse, FailureReason, RequestOutcome};
use super::{ClientEvent, DicomClient, Error, Result};

/// What ended an association's batch.
enum BatchEnd {
    /// Queue empty, all in-flight requests terminated, linger elapsed
    Drained,
    /// The association cannot serve more requests but the queue holds more
    Reassociate,
    /// The association died; queued requests carry over,
    /// a fatal error ends the whole run
    Aborted { fatal: Option<Error> },
    Cancelled,
}

/// A transmitted request awaiting responses.
struct InFlight {
    request: DicomRequest,
    presentation_context_id: u8,
    /// Updated on every inbound response for this request;
    /// initialized when its last command/data PDV was flushed
    last_activity_at: Instant,
}

/// A transmission failure, scoped either to one request
/// or to the whole association.
enum TransmitError {
    Request(FailureReason),
    Association(AssociationError),
}

pub(super) struct Dispatcher<'a> {
    client: &'a DicomClient,
    cancellation: CancellationToken,
}

impl<'a> Dispatcher<'a> {
    pub(super) fn new(client: &'a DicomClient, cancellation: CancellationToken) -> Self {
        Dispatcher {
            client,
            cancellation,
        }
    }

    /// Run until the queue is drained
    /// and every transmitted request has terminated.
    pub(super) async fn run(&self) -> Result<()> {
        loop {
            if self.client.queue().is_empty() {
                return Ok(());
            }
            if self.cancellation.is_cancelled() {
                return super::CancelledSnafu.fail();
            }
            match self.run_association().await? {
                BatchEnd::Drained => return Ok(()),
                BatchEnd::Reassociate => continue,
                // the other ends are resolved inside run_association
                BatchEnd::Aborted { .. } | BatchEnd::Cancelled => unreachable!(),
            }
        }
    }

    /// Establish one association and serve one batch over it.
    async fn run_association(&self) -> Result<BatchEnd> {
        let options = self.client.options();

        self.client.emit_state(AssociationState::Requesting);
        let stream = match self.client.opener().open(&options.target()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connection to {} failed: {}", options.target(), e);
                self.client.emit_state(AssociationState::Aborted);
                self.client.queue().fail_all(FailureReason::Transport);
                return Err(Error::Connect { source: e });
            }
        };
        let connection = Connection::new(stream, options.max_pdu_length, options.write_timeout);

        let proposals = self.client.queue().presentation_proposals();
        let proposed_classes: HashSet<String> =
            proposals.iter().map(|(sop_class, _)| sop_class.clone()).collect();

        let mut association_options = ClientAssociationOptions::new()
            .calling_ae_title(&*options.calling_ae_title)
            .called_ae_title(&*options.called_ae_title)
            .max_pdu_length(options.max_pdu_length);
        for (abstract_syntax, transfer_syntaxes) in proposals {
            association_options =
                association_options.with_presentation_context(abstract_syntax, transfer_syntaxes);
        }
        // 0 means "no pipelining" in this crate, but on the wire a zero
        // in sub-item 53H reads as unconstrained, so clamp before proposing
        let proposed_invoked = options.async_ops_invoked.max(1);
        let proposed_performed = options.async_ops_performed.max(1);
        if proposed_invoked != 1 || proposed_performed != 1 {
            association_options =
                association_options.async_ops_window(proposed_invoked, proposed_performed);
        }

        let mut association = match association_options.establish(connection).await {
            Ok(association) => association,
            Err(AssociationError::Rejected {
                result,
                source_field,
                ..
            }) => {
                debug!("association rejected: {}", source_field);
                self.client.emit(ClientEvent::AssociationRejected {
                    result,
                    source: source_field,
                });
                self.client.emit_state(AssociationState::Rejected);
                self.client
                    .queue()
                    .fail_all(FailureReason::AssociationRejected {
                        result,
                        source: source_field,
                    });
                return super::RejectedSnafu {
                    result,
                    source_field,
                }
                .fail();
            }
            Err(e) => {
                warn!("association negotiation failed: {}", e);
                self.client.emit_state(AssociationState::Aborted);
                let (reason, error) = split_association_error(e);
                self.client.queue().fail_all(reason);
                return Err(error);
            }
        };
        self.client.emit(ClientEvent::AssociationAccepted);
        self.client.emit_state(AssociationState::Established);

        // the outstanding window: our proposal, narrowed by the peer's
        // answer; an explicit grant of 0 means no pipelining, i.e. 1
        let mut window = proposed_invoked as usize;
        if let Some((peer_invoked, _)) = association.async_ops_window() {
            window = window.min(peer_invoked.max(1) as usize);
        }

        match self.drive(&mut association, &proposed_classes, window).await {
            BatchEnd::Drained => {
                self.finish_association(association).await;
                if self.client.queue().is_empty() {
                    Ok(BatchEnd::Drained)
                } else {
                    // a request slipped in during release
                    Ok(BatchEnd::Reassociate)
                }
            }
            BatchEnd::Reassociate => {
                self.finish_association(association).await;
                Ok(BatchEnd::Reassociate)
            }
            BatchEnd::Aborted { fatal } => {
                self.client.emit_state(AssociationState::Aborted);
                match fatal {
                    Some(error) => Err(error),
                    None => Ok(BatchEnd::Reassociate),
                }
            }
            BatchEnd::Cancelled => {
                debug!("run cancelled, aborting association");
                association.abort().await;
                self.client.emit_state(AssociationState::Aborted);
                super::CancelledSnafu.fail()
            }
        }
    }

    /// Serve requests over an established association until the batch ends.
    async fn drive(
        &self,
        association: &mut ClientAssociation,
        proposed_classes: &HashSet<String>,
        window: usize,
    ) -> BatchEnd {
        let options = self.client.options();
        let request_timeout = options.request_timeout;
        let mut assembler = MessageAssembler::new();
        let mut in_flight: HashMap<u16, InFlight> = HashMap::new();
        // message IDs that timed out; late responses to them are dropped
        let mut tombstones: HashSet<u16> = HashSet::new();
        let mut sent_count: usize = 0;

        loop {
            // keep the pipeline as full as the window and batch cap allow
            while in_flight.len() < window && sent_count < options.max_requests_per_association {
                let Some(mut request) = self.client.queue().pop() else {
                    break;
                };
                let context = association
                    .presentation_contexts()
                    .iter()
                    .find(|pc| pc.abstract_syntax == request.sop_class_uid())
                    .cloned();
                let Some(context) = context else {
                    if proposed_classes.contains(request.sop_class_uid()) {
                        // proposed and turned down by this peer
                        debug!(
                            sop_class = request.sop_class_uid(),
                            "no accepted presentation context for request"
                        );
                        request.finish(RequestOutcome::Failed {
                            reason: FailureReason::NoPresentationContext,
                        });
                    } else {
                        // arrived after negotiation, served by the next association
                        self.client.queue().push_front(request);
                        if in_flight.is_empty() {
                            return BatchEnd::Reassociate;
                        }
                    }
                    break;
                };

                match self.transmit(association, &mut request, &context).await {
                    Ok(slowest_write) => {
                        sent_count += 1;
                        if slowest_write >= request_timeout {
                            // a single write stalled past the allowed silence;
                            // a long flush that keeps making progress is fine
                            tombstones.insert(request.message_id());
                            self.finish_timed_out(&mut request, request_timeout);
                            continue;
                        }
                        request.mark_in_flight();
                        in_flight.insert(
                            request.message_id(),
                            InFlight {
                                request,
                                presentation_context_id: context.id,
                                last_activity_at: Instant::now(),
                            },
                        );
                    }
                    Err(TransmitError::Request(reason)) => {
                        request.finish(RequestOutcome::Failed { reason });
                    }
                    Err(TransmitError::Association(e)) => {
                        warn!("association failed while transmitting: {}", e);
                        request.finish(RequestOutcome::Failed {
                            reason: FailureReason::AssociationAborted,
                        });
                        fail_in_flight(&mut in_flight, FailureReason::AssociationAborted);
                        return BatchEnd::Aborted { fatal: None };
                    }
                }
            }

            if in_flight.is_empty() {
                if !self.client.queue().is_empty() {
                    // more work, but this association cannot take it
                    return BatchEnd::Reassociate;
                }
                // idle: hold the association open for the linger window
                let more = tokio::select! {
                    _ = self.cancellation.cancelled() => return BatchEnd::Cancelled,
                    more = self.client.queue().wait_nonempty(options.linger) => more,
                };
                if !more {
                    return BatchEnd::Drained;
                }
                if sent_count >= options.max_requests_per_association {
                    return BatchEnd::Reassociate;
                }
                continue;
            }

            let nearest_deadline = in_flight
                .values()
                .map(|flight| flight.last_activity_at + request_timeout)
                .min()
                .unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    fail_in_flight(&mut in_flight, FailureReason::Cancelled);
                    return BatchEnd::Cancelled;
                }
                received = association.receive() => match received {
                    Ok(Pdu::PData { data }) => {
                        for pdv in data {
                            match assembler.push(pdv) {
                                Ok(Some(message)) => {
                                    if !self.route(&mut in_flight, &tombstones, message) {
                                        // unroutable response: protocol violation
                                        association.abort().await;
                                        fail_in_flight(
                                            &mut in_flight,
                                            FailureReason::ProtocolViolation,
                                        );
                                        return BatchEnd::Aborted {
                                            fatal: Some(super::AbortedSnafu.build()),
                                        };
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("malformed DIMSE message: {}", e);
                                    association.abort().await;
                                    fail_in_flight(&mut in_flight, FailureReason::ProtocolViolation);
                                    return BatchEnd::Aborted {
                                        fatal: Some(super::AbortedSnafu.build()),
                                    };
                                }
                            }
                        }
                    }
                    Ok(pdu) => {
                        // the association layer only lets P-DATA-TF through
                        warn!("unexpected {} slipped through", pdu.short_description());
                        fail_in_flight(&mut in_flight, FailureReason::ProtocolViolation);
                        return BatchEnd::Aborted { fatal: None };
                    }
                    Err(e) => {
                        let protocol_violation = matches!(
                            e,
                            AssociationError::UnexpectedPdu { .. }
                                | AssociationError::ProtocolVersionMismatch { .. }
                        );
                        debug!("association ended while receiving: {}", e);
                        let (reason, fatal) = if protocol_violation {
                            (
                                FailureReason::ProtocolViolation,
                                Some(Error::Protocol { source: e }),
                            )
                        } else {
                            (FailureReason::AssociationAborted, None)
                        };
                        fail_in_flight(&mut in_flight, reason);
                        return BatchEnd::Aborted { fatal };
                    }
                },
                _ = self.client.queue().notified(), if in_flight.len() < window
                    && sent_count < options.max_requests_per_association => {
                    // loop back to fill the pipeline
                }
                _ = tokio::time::sleep_until(nearest_deadline) => {
                    let expired =
                        self.expire(&mut in_flight, &mut tombstones, request_timeout);
                    // ask the peer to stop working on timed-out
                    // multi-response requests
                    for (message_id, context_id) in expired {
                        let cancel = CommandSet::c_cancel_rq(message_id);
                        if let Ok(bytes) = cancel.write_to_vec() {
                            let pdus = fragment_message(
                                context_id,
                                &bytes,
                                None,
                                association.acceptor_max_pdu_length(),
                            );
                            for pdu in &pdus {
                                if association.send(pdu).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Transmit one request, fragmenting its command and data sets
    /// across P-DATA-TF PDUs.
    ///
    /// Returns the duration of the slowest single PDU write.
    /// The request timeout clock starts only after the last PDV
    /// is flushed, so a long transfer that keeps making progress
    /// does not count as silence;
    /// an individual write stalling for the whole timeout does.
    async fn transmit(
        &self,
        association: &mut ClientAssociation,
        request: &mut DicomRequest,
        context: &PresentationContextNegotiated,
    ) -> std::result::Result<Duration, TransmitError> {
        let command_bytes = request.command_set().write_to_vec().map_err(|e| {
            warn!(
                message_id = request.message_id(),
                "failed to encode command set: {}", e
            );
            TransmitError::Request(FailureReason::Encoding)
        })?;

        let data_bytes = match request.data() {
            None => None,
            Some(payload) if payload.transfer_syntax_uid == context.transfer_syntax => {
                Some(payload.bytes.clone())
            }
            Some(payload) => match self.client.transcoder() {
                Some(transcoder) => Some(
                    transcoder
                        .transcode(
                            &payload.bytes,
                            &payload.transfer_syntax_uid,
                            &context.transfer_syntax,
                        )
                        .map_err(|e| {
                            warn!(
                                message_id = request.message_id(),
                                "transcoding failed: {}", e
                            );
                            TransmitError::Request(FailureReason::Transcoding)
                        })?,
                ),
                None => {
                    warn!(
                        message_id = request.message_id(),
                        native = %payload.transfer_syntax_uid,
                        negotiated = %context.transfer_syntax,
                        "payload needs transcoding but no transcoder is installed"
                    );
                    return Err(TransmitError::Request(FailureReason::Transcoding));
                }
            },
        };

        let pdus = fragment_message(
            context.id,
            &command_bytes,
            data_bytes.as_deref(),
            association.acceptor_max_pdu_length(),
        );
        trace!(
            message_id = request.message_id(),
            pdus = pdus.len(),
            "transmitting request"
        );

        let mut slowest_write = Duration::ZERO;
        for pdu in &pdus {
            let write_started = Instant::now();
            association
                .send(pdu)
                .await
                .map_err(TransmitError::Association)?;
            slowest_write = slowest_write.max(write_started.elapsed());
        }
        Ok(slowest_write)
    }

    /// Route a reassembled message to its in-flight request.
    /// Returns `false` on a response that cannot be correlated at all.
    fn route(
        &self,
        in_flight: &mut HashMap<u16, InFlight>,
        tombstones: &HashSet<u16>,
        message: DimseMessage,
    ) -> bool {
        let responded_to = match message.command.message_id_being_responded_to() {
            Ok(id) => id,
            Err(e) => {
                warn!("response without a message ID being responded to: {}", e);
                return false;
            }
        };
        let status = match message.command.status() {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    message_id = responded_to,
                    "response without a status: {}", e
                );
                return false;
            }
        };

        match in_flight.get_mut(&responded_to) {
            Some(flight) => {
                flight.last_activity_at = Instant::now();
                let multi = flight.request.is_multi_response();
                flight.request.deliver_response(DicomResponse {
                    message_id: responded_to,
                    status,
                    command: message.command,
                    data: message.data,
                });
                let terminal = !(multi && status.is_pending());
                if terminal {
                    if let Some(mut flight) = in_flight.remove(&responded_to) {
                        flight.request.finish(RequestOutcome::Completed {
                            last_status: status,
                        });
                        self.client.emit(ClientEvent::RequestCompleted {
                            message_id: responded_to,
                            status,
                        });
                    }
                }
            }
            None if tombstones.contains(&responded_to) => {
                debug!(
                    message_id = responded_to,
                    "dropping late response for timed-out request"
                );
            }
            None => {
                debug!(
                    message_id = responded_to,
                    "discarding response for unknown message ID"
                );
            }
        }
        true
    }

    /// Time out every in-flight request whose inbound silence
    /// reached the request timeout.
    /// Returns the message and context IDs of the expired requests.
    fn expire(
        &self,
        in_flight: &mut HashMap<u16, InFlight>,
        tombstones: &mut HashSet<u16>,
        request_timeout: Duration,
    ) -> Vec<(u16, u8)> {
        let now = Instant::now();
        let expired: Vec<u16> = in_flight
            .iter()
            .filter(|(_, flight)| now.duration_since(flight.last_activity_at) >= request_timeout)
            .map(|(message_id, _)| *message_id)
            .collect();

        let mut cancelled = Vec::with_capacity(expired.len());
        for message_id in expired {
            if let Some(mut flight) = in_flight.remove(&message_id) {
                tombstones.insert(message_id);
                if flight.request.is_multi_response() {
                    cancelled.push((message_id, flight.presentation_context_id));
                }
                self.finish_timed_out(&mut flight.request, request_timeout);
            }
        }
        cancelled
    }

    fn finish_timed_out(&self, request: &mut DicomRequest, timeout: Duration) {
        let message_id = request.message_id();
        warn!(message_id, ?timeout, "request timed out");
        request.finish(RequestOutcome::TimedOut { timeout });
        self.client
            .emit(ClientEvent::RequestTimedOut { message_id, timeout });
    }

    /// Gracefully release the association,
    /// aborting it if the peer does not answer the probe in time.
    async fn finish_association(&self, mut association: ClientAssociation) {
        let reply_timeout = release_timeout(self.client.options().request_timeout);
        match association.release(reply_timeout).await {
            Ok(()) => {
                self.client.emit(ClientEvent::AssociationReleased);
                self.client.emit_state(AssociationState::Closed);
            }
            Err(e) => {
                debug!("graceful release failed: {}", e);
                self.client.emit_state(AssociationState::Aborted);
            }
        }
    }
}

/// Fail all in-flight requests with the given reason.
fn fail_in_flight(in_flight: &mut HashMap<u16, InFlight>, reason: FailureReason) {
    for (_, mut flight) in in_flight.drain() {
        flight
            .request
            .finish(RequestOutcome::Failed { reason });
    }
}

/// Split an association error into the per-request failure reason
/// and the error surfaced from `send`.
fn split_association_error(e: AssociationError) -> (FailureReason, Error) {
    match e {
        AssociationError::SendPdu { .. }
        | AssociationError::ReceivePdu { .. }
        | AssociationError::Close { .. }
        | AssociationError::ReleaseTimedOut { .. } => {
            (FailureReason::Transport, Error::Transport { source: e })
        }
        AssociationError::Aborted { .. } => {
            (FailureReason::AssociationAborted, super::AbortedSnafu.build())
        }
        _ => (FailureReason::ProtocolViolation, Error::Protocol { source: e }),
    }
}

/// The peer gets a bounded window to answer the release probe.
fn release_timeout(request_timeout: Duration) -> Duration {
    if request_timeout.is_zero() {
        Duration::from_secs(5)
    } else {
        request_timeout
    }
}
