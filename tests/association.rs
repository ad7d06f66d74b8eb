//! Association lifecycle tests against a mock acceptor.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use dicom_scu::association::{AssociationState, ClientAssociationOptions, Error};
use dicom_scu::dimse::{fragment_message, CommandSet};
use dicom_scu::pdu::{
    Pdu, PresentationContextResult, PresentationContextResultReason, DEFAULT_MAX_PDU,
};
use dicom_scu::transport::{Connection, StreamOpener, TcpOpener};

use common::{spawn_scp, ConnBehavior, PduStream, RespondConfig};

const VERIFICATION: &str = "1.2.840.10008.1.1";

async fn connect(addr: SocketAddr) -> Connection {
    let stream = TcpOpener::default()
        .open(&addr.to_string())
        .await
        .expect("mock SCP should accept the connection");
    Connection::new(stream, DEFAULT_MAX_PDU, None)
}

#[tokio::test(flavor = "multi_thread")]
async fn establish_and_release_gracefully() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("MOCK-SCP")
        .with_abstract_syntax(VERIFICATION)
        .establish(connect(scp.addr).await)
        .await
        .expect("association should be accepted");

    assert_eq!(association.state(), AssociationState::Established);
    assert_eq!(association.presentation_contexts().len(), 1);
    assert_eq!(
        association.presentation_contexts()[0].abstract_syntax,
        VERIFICATION
    );
    assert_eq!(association.acceptor_max_pdu_length(), 16_384);

    association
        .release(Duration::from_millis(500))
        .await
        .expect("the peer should answer the release request");
    assert_eq!(association.state(), AssociationState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejection_is_terminal() {
    let scp = spawn_scp(vec![ConnBehavior::Reject]).await;

    let outcome = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(connect(scp.addr).await)
        .await;

    assert!(matches!(outcome, Err(Error::Rejected { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_abort_moves_to_aborted() {
    let scp = spawn_scp(vec![ConnBehavior::AbortAfterFirstCommand]).await;

    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(connect(scp.addr).await)
        .await
        .expect("association should be accepted");

    let context_id = association.presentation_contexts()[0].id;
    let command = CommandSet::c_echo_rq(1, VERIFICATION).write_to_vec().unwrap();
    for pdu in fragment_message(
        context_id,
        &command,
        None,
        association.acceptor_max_pdu_length(),
    ) {
        association.send(&pdu).await.unwrap();
    }

    let outcome = association.receive().await;
    assert!(matches!(outcome, Err(Error::Aborted { .. })));
    assert_eq!(association.state(), AssociationState::Aborted);
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_after_close_are_invalid() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;

    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(connect(scp.addr).await)
        .await
        .expect("association should be accepted");

    association
        .release(Duration::from_millis(500))
        .await
        .expect("the peer should answer the release request");

    let outcome = association.send(&Pdu::ReleaseRQ).await;
    assert!(matches!(outcome, Err(Error::InvalidState { .. })));
    // the state does not regress from its terminal value
    assert_eq!(association.state(), AssociationState::Closed);
}

/// A PDU that is not a valid stimulus in the established state
/// is answered with an A-ABORT (unexpected PDU).
#[tokio::test(flavor = "multi_thread")]
async fn unexpected_pdu_while_established_aborts() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = PduStream::new(stream);
        let Some(Pdu::AssociationRQ {
            presentation_contexts,
            ..
        }) = stream.read_pdu().await.unwrap()
        else {
            panic!("expected an A-ASSOCIATE-RQ");
        };
        stream
            .write_pdu(&Pdu::AssociationAC {
                protocol_version: 1,
                application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
                presentation_contexts: presentation_contexts
                    .iter()
                    .map(|pc| PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: pc.transfer_syntaxes[0].clone(),
                    })
                    .collect(),
                user_variables: vec![],
            })
            .await
            .unwrap();
        // a release reply without a release request is never legal
        stream.write_pdu(&Pdu::ReleaseRP).await.unwrap();

        let reply = stream.read_pdu().await.unwrap();
        assert!(matches!(reply, Some(Pdu::AbortRQ { .. })));
    });

    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(connect(addr).await)
        .await
        .expect("association should be accepted");

    let outcome = association.receive().await;
    assert!(matches!(outcome, Err(Error::UnexpectedPdu { .. })));
    assert_eq!(association.state(), AssociationState::Aborted);
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn negotiation_requires_a_presentation_context() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;

    let outcome = ClientAssociationOptions::new()
        .establish(connect(scp.addr).await)
        .await;
    assert!(matches!(outcome, Err(Error::MissingAbstractSyntax { .. })));
}
