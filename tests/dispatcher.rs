//! End-to-end tests of the client dispatcher against scripted mock SCPs.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::sync::mpsc;

use dicom_scu::client::{
    ClientEvent, ClientOptions, DicomClient, DicomRequest, EncodedDataSet, FailureReason,
    RequestOutcome, RequestReceiver,
};
use dicom_scu::dimse::Status;

use common::{spawn_scp, ConnBehavior, MockScp, RespondConfig, SlowOpener};

const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn client_for(scp: &MockScp, request_timeout: Duration) -> DicomClient {
    DicomClient::new(
        ClientOptions::builder()
            .host(scp.addr.ip().to_string())
            .port(scp.addr.port())
            .calling_ae_title("TEST-SCU")
            .called_ae_title("MOCK-SCP")
            .request_timeout(request_timeout)
            .linger(Duration::from_millis(30))
            .build(),
    )
}

fn find_request() -> (DicomRequest, RequestReceiver) {
    let query = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("*")),
    ]);
    let identifier = EncodedDataSet::from_object(&query, IMPLICIT_VR_LE)
        .expect("query identifier should encode");
    DicomRequest::c_find(STUDY_ROOT_FIND, identifier)
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = vec![];
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn timed_out_ids(events: &[ClientEvent]) -> BTreeSet<u16> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::RequestTimedOut { message_id, .. } => Some(*message_id),
            _ => None,
        })
        .collect()
}

/// Scenario: C-FIND against a never-responding peer.
/// The request times out, the event fires, and `send` completes cleanly.
#[rstest::rstest]
#[case(200)]
#[case(400)]
#[tokio::test(flavor = "multi_thread")]
async fn find_against_silent_peer_times_out(#[case] timeout_millis: u64) {
    let scp = spawn_scp(vec![ConnBehavior::Silent]).await;
    let timeout = Duration::from_millis(timeout_millis);
    let client = client_for(&scp, timeout);
    let mut events = client.events();

    let (request, mut receiver) = find_request();
    client.add_request(request);

    let started = Instant::now();
    client.send().await.expect("send should complete cleanly");
    assert!(started.elapsed() >= timeout);

    // no response was ever delivered
    assert!(receiver.next_response().await.is_none());
    assert_eq!(receiver.outcome().await, RequestOutcome::TimedOut { timeout });

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::RequestTimedOut { timeout: t, .. } if *t == timeout)));
}

/// Scenario: C-FIND against a peer pacing three `Pending` responses
/// and a final `Success`, each within the timeout window.
/// The slow-but-active request never times out.
#[tokio::test(flavor = "multi_thread")]
async fn paced_pending_responses_never_time_out() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig {
        pending_responses: 3,
        response_interval: Duration::from_millis(150),
        ..Default::default()
    })])
    .await;
    let client = client_for(&scp, Duration::from_millis(400));
    let mut events = client.events();

    let (request, mut receiver) = find_request();
    client.add_request(request);
    client.send().await.expect("send should complete cleanly");

    let mut statuses = vec![];
    while let Some(response) = receiver.next_response().await {
        statuses.push(response.status);
    }
    assert_eq!(
        statuses,
        vec![
            Status::Pending,
            Status::Pending,
            Status::Pending,
            Status::Success
        ]
    );
    assert_eq!(
        receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );

    let events = drain_events(&mut events);
    assert!(timed_out_ids(&events).is_empty());
}

/// Scenario: one `Pending` response, then silence.
/// The timeout clock restarts on the pending response
/// and fires once the silence exceeds it.
#[tokio::test(flavor = "multi_thread")]
async fn pending_then_silence_times_out() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig {
        pending_responses: 5,
        response_interval: Duration::from_millis(100),
        go_silent_after: Some(1),
        ..Default::default()
    })])
    .await;
    let timeout = Duration::from_millis(300);
    let client = client_for(&scp, timeout);
    let mut events = client.events();

    let (request, mut receiver) = find_request();
    client.add_request(request);

    let started = Instant::now();
    client.send().await.expect("send should complete cleanly");
    // one response interval plus one full timeout window
    assert!(started.elapsed() >= Duration::from_millis(400));

    let first = receiver
        .next_response()
        .await
        .expect("the pending response must be delivered");
    assert_eq!(first.status, Status::Pending);
    assert!(receiver.next_response().await.is_none());
    assert_eq!(receiver.outcome().await, RequestOutcome::TimedOut { timeout });

    let events = drain_events(&mut events);
    assert_eq!(timed_out_ids(&events).len(), 1);
}

/// Scenario: a large C-STORE whose total flush takes longer than the
/// request timeout, but whose individual writes keep making progress.
/// The timeout clock only starts after the final PDV is flushed,
/// so the request completes.
#[tokio::test(flavor = "multi_thread")]
async fn slow_but_progressing_store_completes() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;
    let timeout = Duration::from_millis(250);
    let options = ClientOptions::builder()
        .host(scp.addr.ip().to_string())
        .port(scp.addr.port())
        .request_timeout(timeout)
        .linger(Duration::from_millis(30))
        .build();
    let client = DicomClient::with_opener(
        options,
        Arc::new(SlowOpener {
            write_delay: Duration::from_millis(20),
        }),
    );
    let mut events = client.events();

    // 256 KiB over 16 KiB PDUs: a flush of well over the request timeout
    let payload = EncodedDataSet::new(vec![0x42; 256 * 1024], IMPLICIT_VR_LE);
    let (request, receiver) = DicomRequest::c_store(SECONDARY_CAPTURE, "1.2.3.4.5", payload);
    client.add_request(request);

    let started = Instant::now();
    client.send().await.expect("send should complete cleanly");
    assert!(
        started.elapsed() > timeout,
        "the transfer was expected to outlast the request timeout"
    );

    assert_eq!(
        receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );
    let events = drain_events(&mut events);
    assert!(timed_out_ids(&events).is_empty());
}

/// Scenario: a C-STORE whose every write stalls past the request timeout.
/// The request fails with the timeout outcome after the flush completes.
#[tokio::test(flavor = "multi_thread")]
async fn stalled_store_writes_fail_with_timeout() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;
    let timeout = Duration::from_millis(200);
    let options = ClientOptions::builder()
        .host(scp.addr.ip().to_string())
        .port(scp.addr.port())
        .request_timeout(timeout)
        .linger(Duration::from_millis(30))
        .build();
    let client = DicomClient::with_opener(
        options,
        Arc::new(SlowOpener {
            write_delay: Duration::from_millis(300),
        }),
    );
    let mut events = client.events();

    // a few PDUs are enough; each one stalls longer than the timeout
    let payload = EncodedDataSet::new(vec![0x42; 48 * 1024], IMPLICIT_VR_LE);
    let (request, receiver) = DicomRequest::c_store(SECONDARY_CAPTURE, "1.2.3.4.5", payload);
    client.add_request(request);

    client.send().await.expect("send should complete cleanly");

    assert_eq!(receiver.outcome().await, RequestOutcome::TimedOut { timeout });
    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::RequestTimedOut { timeout: t, .. } if *t == timeout)));
}

/// Scenario: six C-FINDs trickled in against a never-responding peer
/// with a batch cap of two.
/// All six are emitted across three associations and all six time out.
#[tokio::test(flavor = "multi_thread")]
async fn queue_survives_across_associations() {
    let scp = spawn_scp(vec![ConnBehavior::Silent]).await;
    let timeout = Duration::from_millis(250);
    let client = DicomClient::new(
        ClientOptions::builder()
            .host(scp.addr.ip().to_string())
            .port(scp.addr.port())
            .request_timeout(timeout)
            .max_requests_per_association(2)
            .linger(Duration::from_millis(30))
            .build(),
    );
    let mut events = client.events();

    let (first, first_receiver) = find_request();
    let mut ids = BTreeSet::new();
    ids.insert(client.add_request(first));
    let mut receivers = vec![first_receiver];

    let sender = async {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let (request, receiver) = find_request();
            ids.insert(client.add_request(request));
            receivers.push(receiver);
        }
    };
    let (send_result, ()) = tokio::join!(client.send(), sender);
    send_result.expect("send should complete cleanly");

    for receiver in receivers {
        assert_eq!(receiver.outcome().await, RequestOutcome::TimedOut { timeout });
    }

    // every submitted request reached the peer, over three associations
    assert_eq!(scp.associations.load(std::sync::atomic::Ordering::SeqCst), 3);
    let received: BTreeSet<u16> = scp.received_ids().into_iter().collect();
    assert_eq!(received, ids);

    // the set of timed-out requests equals the set of submitted requests
    let events = drain_events(&mut events);
    assert_eq!(timed_out_ids(&events), ids);
}

/// The number of concurrently outstanding requests on one association
/// never exceeds the negotiated asynchronous operations window.
#[tokio::test(flavor = "multi_thread")]
async fn pipelining_respects_the_async_ops_window() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig {
        response_interval: Duration::from_millis(100),
        ..Default::default()
    })])
    .await;
    let mut client = client_for(&scp, Duration::from_secs(2));
    client.negotiate_async_ops(3, 1);

    let mut receivers = vec![];
    for _ in 0..8 {
        let (request, receiver) = DicomRequest::c_echo();
        client.add_request(request);
        receivers.push(receiver);
    }
    client.send().await.expect("send should complete cleanly");

    for receiver in receivers {
        assert_eq!(
            receiver.outcome().await,
            RequestOutcome::Completed {
                last_status: Status::Success
            }
        );
    }

    let max_outstanding = scp
        .max_outstanding
        .load(std::sync::atomic::Ordering::SeqCst);
    assert!(
        max_outstanding <= 3,
        "outstanding window exceeded: {max_outstanding}"
    );
    assert!(
        max_outstanding >= 2,
        "requests were expected to pipeline, max outstanding was {max_outstanding}"
    );
}

/// A peer explicitly granting an asynchronous operations window of zero
/// means no pipelining: the effective window narrows to one
/// regardless of what the client proposed.
#[tokio::test(flavor = "multi_thread")]
async fn peer_granted_zero_window_disables_pipelining() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig {
        response_interval: Duration::from_millis(50),
        grant_async_ops: Some((0, 0)),
        ..Default::default()
    })])
    .await;
    let mut client = client_for(&scp, Duration::from_secs(2));
    client.negotiate_async_ops(3, 1);

    let mut receivers = vec![];
    for _ in 0..4 {
        let (request, receiver) = DicomRequest::c_echo();
        client.add_request(request);
        receivers.push(receiver);
    }
    client.send().await.expect("send should complete cleanly");

    for receiver in receivers {
        assert_eq!(
            receiver.outcome().await,
            RequestOutcome::Completed {
                last_status: Status::Success
            }
        );
    }

    let max_outstanding = scp
        .max_outstanding
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(
        max_outstanding, 1,
        "a granted window of zero must disable pipelining"
    );
}

/// A rejected association fails every batch request
/// and surfaces the rejection from `send`.
#[tokio::test(flavor = "multi_thread")]
async fn rejection_fails_the_batch() {
    let scp = spawn_scp(vec![ConnBehavior::Reject]).await;
    let client = client_for(&scp, Duration::from_millis(500));
    let mut events = client.events();

    let (request, receiver) = find_request();
    client.add_request(request);

    let result = client.send().await;
    assert!(matches!(
        result,
        Err(dicom_scu::client::Error::Rejected { .. })
    ));

    match receiver.outcome().await {
        RequestOutcome::Failed {
            reason: FailureReason::AssociationRejected { .. },
        } => {}
        other => panic!("expected a rejection failure, got {other:?}"),
    }

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::AssociationRejected { .. })));
}

/// An abort fails the in-flight request but queued requests
/// move on to the next association.
#[tokio::test(flavor = "multi_thread")]
async fn abort_carries_queued_requests_over() {
    let scp = spawn_scp(vec![
        ConnBehavior::AbortAfterFirstCommand,
        ConnBehavior::Respond(RespondConfig::default()),
    ])
    .await;
    let client = client_for(&scp, Duration::from_millis(500));

    let (first, first_receiver) = DicomRequest::c_echo();
    let (second, second_receiver) = DicomRequest::c_echo();
    client.add_request(first);
    client.add_request(second);

    client.send().await.expect("send should complete cleanly");

    assert_eq!(
        first_receiver.outcome().await,
        RequestOutcome::Failed {
            reason: FailureReason::AssociationAborted
        }
    );
    assert_eq!(
        second_receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );
    assert_eq!(scp.associations.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// A request added while the association lingers idle
/// reuses it instead of forcing a new association.
#[tokio::test(flavor = "multi_thread")]
async fn linger_allows_association_reuse() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig::default())]).await;
    let client = DicomClient::new(
        ClientOptions::builder()
            .host(scp.addr.ip().to_string())
            .port(scp.addr.port())
            .request_timeout(Duration::from_millis(500))
            .linger(Duration::from_millis(800))
            .build(),
    );

    let (first, first_receiver) = DicomRequest::c_echo();
    client.add_request(first);

    let late_adder = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (second, receiver) = DicomRequest::c_echo();
        client.add_request(second);
        receiver
    };
    let (send_result, second_receiver) = tokio::join!(client.send(), late_adder);
    send_result.expect("send should complete cleanly");

    assert_eq!(
        first_receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );
    assert_eq!(
        second_receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );
    assert_eq!(scp.associations.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// A concurrent `send` joins the active run instead of racing it.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_send_joins_the_active_run() {
    let scp = spawn_scp(vec![ConnBehavior::Respond(RespondConfig {
        response_interval: Duration::from_millis(50),
        ..Default::default()
    })])
    .await;
    let client = client_for(&scp, Duration::from_secs(2));

    let (request, receiver) = DicomRequest::c_echo();
    client.add_request(request);

    let (a, b) = tokio::join!(client.send(), client.send());
    a.expect("first send should complete cleanly");
    b.expect("second send should complete cleanly");

    assert_eq!(
        receiver.outcome().await,
        RequestOutcome::Completed {
            last_status: Status::Success
        }
    );
}

/// Cancellation aborts the association and fails in-flight requests.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_fails_outstanding_requests() {
    let scp = spawn_scp(vec![ConnBehavior::Silent]).await;
    let client = client_for(&scp, Duration::from_secs(10));

    let (request, receiver) = find_request();
    client.add_request(request);

    let cancellation = tokio_util::sync::CancellationToken::new();
    let canceller = {
        let cancellation = cancellation.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancellation.cancel();
        }
    };

    let started = Instant::now();
    let (result, ()) = tokio::join!(client.send_with_cancellation(cancellation), canceller);
    assert!(matches!(
        result,
        Err(dicom_scu::client::Error::Cancelled { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        receiver.outcome().await,
        RequestOutcome::Failed {
            reason: FailureReason::Cancelled
        }
    );
}
