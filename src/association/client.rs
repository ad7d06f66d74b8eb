//! Association requester implementation.

use std::time::Duration;

use snafu::{ensure, ResultExt};
use tracing::{debug, trace, warn};

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, Pdu, PresentationContextProposed,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::transport::Connection;
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::{
    AssociationState, Error, PresentationContextNegotiated, Result,
};

/// Options for requesting a new DICOM association over
/// an already opened connection.
///
/// At least one presentation context must be specified
/// through [`with_presentation_context`](Self::with_presentation_context)
/// or [`with_abstract_syntax`](Self::with_abstract_syntax).
///
/// # Example
///
/// ```no_run
/// # use dicom_scu::association::ClientAssociationOptions;
/// # use dicom_scu::transport::{Connection, StreamOpener, TcpOpener};
/// # use dicom_scu::pdu::DEFAULT_MAX_PDU;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = TcpOpener::default().open("192.168.0.5:104").await?;
/// let connection = Connection::new(stream, DEFAULT_MAX_PDU, None);
/// let association = ClientAssociationOptions::new()
///     .calling_ae_title("THIS-SCU")
///     .called_ae_title("MAIN-STORAGE")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish(connection)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    calling_ae_title: String,
    called_ae_title: Option<String>,
    application_context_name: String,
    /// proposed presentation contexts: abstract syntax and transfer syntaxes
    presentation_contexts: Vec<(String, Vec<String>)>,
    protocol_version: u16,
    max_pdu_length: u32,
    /// proposed asynchronous operations window (invoked, performed)
    async_ops_window: Option<(u16, u16)>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: None,
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            async_ops_window: None,
        }
    }
}

impl ClientAssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this DICOM node. The default is `THIS-SCU`.
    pub fn calling_ae_title(mut self, calling_ae_title: impl Into<String>) -> Self {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target DICOM node. The default is `ANY-SCP`.
    pub fn called_ae_title(mut self, called_ae_title: impl Into<String>) -> Self {
        let aet = called_ae_title.into();
        self.called_ae_title = if aet.is_empty() { None } else { Some(aet) };
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context(
        mut self,
        abstract_syntax_uid: impl Into<String>,
        transfer_syntax_uids: Vec<String>,
    ) -> Self {
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntax_uids
                .into_iter()
                .map(trim_uid)
                .collect()));
        self
    }

    /// Propose this abstract syntax with the default transfer syntaxes
    /// (_Implicit VR Little Endian_ and _Explicit VR Little Endian_).
    pub fn with_abstract_syntax(self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.with_presentation_context(
            abstract_syntax_uid.into(),
            vec![
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string(),
            ],
        )
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Propose an asynchronous operations window
    /// (maximum operations invoked and performed).
    pub fn async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_window = Some((invoked, performed));
        self
    }

    /// Request a new association over the given connection,
    /// negotiating the presentation contexts in the process.
    ///
    /// On rejection or negotiation failure,
    /// the connection is shut down before the error is returned.
    pub async fn establish(self, mut connection: Connection) -> Result<ClientAssociation> {
        let (proposed, a_associate_rq) = self.a_associate_rq()?;

        trace!(state = %AssociationState::Requesting, "sending A-ASSOCIATE-RQ");
        connection
            .write_pdu(&a_associate_rq)
            .await
            .context(super::SendPduSnafu)?;

        let response = connection
            .read_pdu()
            .await
            .context(super::ReceivePduSnafu)?;

        match self.process_a_associate_resp(response, &proposed) {
            Ok(negotiated) => {
                debug!(
                    contexts = negotiated.presentation_contexts.len(),
                    max_pdu_length = negotiated.peer_max_pdu_length,
                    "association established"
                );
                Ok(ClientAssociation {
                    state: AssociationState::Established,
                    presentation_contexts: negotiated.presentation_contexts,
                    requestor_max_pdu_length: self.max_pdu_length,
                    acceptor_max_pdu_length: negotiated.peer_max_pdu_length,
                    async_ops_window: negotiated.async_ops_window,
                    user_variables: negotiated.user_variables,
                    connection,
                })
            }
            Err(e) => {
                // on rejection the peer closes; on anything else we abort
                if !matches!(e, Error::Rejected { .. }) {
                    let _ = connection
                        .write_pdu(&Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        })
                        .await;
                }
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    /// Construct the A-ASSOCIATE-RQ PDU for these options.
    fn a_associate_rq(&self) -> Result<(Vec<PresentationContextProposed>, Pdu)> {
        // presentation contexts represent intent and must not be omitted
        ensure!(
            !self.presentation_contexts.is_empty(),
            super::MissingAbstractSyntaxSnafu
        );

        let called_ae_title = self.called_ae_title.as_deref().unwrap_or("ANY-SCP");

        let proposed: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntaxes.clone(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some((invoked, performed)) = self.async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }

        let pdu = Pdu::AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: proposed.clone(),
            user_variables,
        };
        Ok((proposed, pdu))
    }

    /// Process the response to the association request.
    fn process_a_associate_resp(
        &self,
        response: Pdu,
        proposed: &[PresentationContextProposed],
    ) -> Result<NegotiatedOptions> {
        match response {
            Pdu::AssociationAC {
                protocol_version,
                application_context_name: _,
                presentation_contexts,
                user_variables,
            } => {
                ensure!(
                    protocol_version == self.protocol_version,
                    super::ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: protocol_version,
                    }
                );

                let peer_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);
                // zero means no limit specified
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    peer_max_pdu_length
                };

                let async_ops_window = user_variables.iter().find_map(|item| match item {
                    UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                        Some((*invoked, *performed))
                    }
                    _ => None,
                });

                let negotiated: Vec<_> = presentation_contexts
                    .into_iter()
                    .filter(|c| c.reason == PresentationContextResultReason::Acceptance)
                    .filter_map(|c| {
                        proposed.iter().find(|p| p.id == c.id).map(|p| {
                            PresentationContextNegotiated {
                                id: c.id,
                                abstract_syntax: p.abstract_syntax.clone(),
                                transfer_syntax: c.transfer_syntax,
                            }
                        })
                    })
                    .collect();
                ensure!(
                    !negotiated.is_empty(),
                    super::NoAcceptedPresentationContextsSnafu
                );

                Ok(NegotiatedOptions {
                    presentation_contexts: negotiated,
                    peer_max_pdu_length,
                    async_ops_window,
                    user_variables,
                })
            }
            Pdu::AssociationRJ { result, source } => super::RejectedSnafu {
                result,
                source_field: source,
            }
            .fail(),
            Pdu::AbortRQ { .. } => super::AbortedSnafu.fail(),
            pdu => super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }
}

/// The outcome of a successful association negotiation.
struct NegotiatedOptions {
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_max_pdu_length: u32,
    async_ops_window: Option<(u16, u16)>,
    user_variables: Vec<UserVariableItem>,
}

/// A DICOM upper layer association
/// from the perspective of the requesting application entity.
///
/// The association exclusively owns its connection
/// and shuts it down on every terminal transition.
#[derive(Debug)]
pub struct ClientAssociation {
    state: AssociationState,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    requestor_max_pdu_length: u32,
    acceptor_max_pdu_length: u32,
    async_ops_window: Option<(u16, u16)>,
    user_variables: Vec<UserVariableItem>,
    connection: Connection,
}

impl ClientAssociation {
    /// The current protocol state.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// The presentation contexts accepted by the peer.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// The maximum PDU length that this application entity admits.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The maximum PDU length that the peer admits.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// The asynchronous operations window granted by the peer, if any.
    pub fn async_ops_window(&self) -> Option<(u16, u16)> {
        self.async_ops_window
    }

    /// The user variables received from the peer.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.user_variables
    }

    /// Send a PDU to the peer. Only legal while established.
    pub async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        match self.connection.write_pdu(pdu).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_quietly().await;
                Err(e).context(super::SendPduSnafu)
            }
        }
    }

    /// Receive the next PDU from the peer.
    ///
    /// An A-ABORT moves the association to `Aborted` and surfaces as an error;
    /// any PDU that is invalid in the current state is answered
    /// with an A-ABORT (unexpected PDU) before failing.
    pub async fn receive(&mut self) -> Result<Pdu> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        match self.connection.read_pdu().await {
            Ok(Pdu::AbortRQ { source }) => {
                debug!(?source, "association aborted by peer");
                self.transition(AssociationState::Aborted);
                let _ = self.connection.close().await;
                super::AbortedSnafu.fail()
            }
            Ok(pdu @ Pdu::PData { .. }) => Ok(pdu),
            Ok(pdu) => {
                warn!("unexpected {} from peer", pdu.short_description());
                self.abort_with_reason(AbortRQServiceProviderReason::UnexpectedPdu)
                    .await;
                super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            Err(e) => {
                self.abort_quietly().await;
                Err(e).context(super::ReceivePduSnafu)
            }
        }
    }

    /// Initiate a graceful release of the association,
    /// waiting up to `reply_timeout` for the peer's A-RELEASE-RP.
    ///
    /// If the peer answers anything else, or does not answer in time,
    /// the association is aborted instead and an error is returned.
    pub async fn release(&mut self, reply_timeout: Duration) -> Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        self.transition(AssociationState::Releasing);
        self.connection
            .write_pdu(&Pdu::ReleaseRQ)
            .await
            .context(super::SendPduSnafu)?;

        loop {
            let reply = tokio::time::timeout(reply_timeout, self.connection.read_pdu()).await;
            match reply {
                Ok(Ok(Pdu::ReleaseRP)) => {
                    self.transition(AssociationState::Closed);
                    self.connection.close().await.context(super::CloseSnafu)?;
                    return Ok(());
                }
                // data still in flight from the peer is discarded while releasing
                Ok(Ok(Pdu::PData { .. })) => continue,
                Ok(Ok(Pdu::AbortRQ { .. })) => {
                    self.transition(AssociationState::Aborted);
                    let _ = self.connection.close().await;
                    return super::AbortedSnafu.fail();
                }
                Ok(Ok(pdu)) => {
                    self.abort_with_reason(AbortRQServiceProviderReason::UnexpectedPdu)
                        .await;
                    return super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                Ok(Err(e)) => {
                    self.abort_quietly().await;
                    return Err(e).context(super::ReceivePduSnafu);
                }
                Err(_elapsed) => {
                    debug!("peer unresponsive to release, aborting");
                    self.abort_quietly().await;
                    return super::ReleaseTimedOutSnafu {
                        waited: reply_timeout,
                    }
                    .fail();
                }
            }
        }
    }

    /// Send an A-ABORT and shut down the connection,
    /// terminating the association.
    pub async fn abort(&mut self) {
        self.abort_with_reason(AbortRQServiceProviderReason::ReasonNotSpecified)
            .await
    }

    async fn abort_with_reason(&mut self, reason: AbortRQServiceProviderReason) {
        if self.state.is_terminal() {
            return;
        }
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        };
        let _ = self.connection.write_pdu(&pdu).await;
        self.transition(AssociationState::Aborted);
        let _ = self.connection.close().await;
    }

    /// Terminate without emitting an A-ABORT,
    /// for when the transport itself already failed.
    async fn abort_quietly(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(AssociationState::Aborted);
        let _ = self.connection.close().await;
    }

    fn transition(&mut self, next: AssociationState) {
        trace!(from = %self.state, to = %next, "association state transition");
        self.state = next;
    }
}

/// Trims leading and trailing whitespace and null characters,
/// which are padding artifacts in UIDs read from data sets.
fn trim_uid(uid: String) -> String {
    let trimmed = uid.trim_matches([' ', '\0']);
    if trimmed.len() == uid.len() {
        uid
    } else {
        trimmed.to_string()
    }
}
