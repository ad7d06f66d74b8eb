//! Shared test infrastructure:
//! a scripted mock SCP and a write-latency-injecting stream.
#![allow(dead_code)]

use std::future::Future;
use std::io::Cursor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use dicom_scu::dimse::{CommandField, CommandSet, MessageAssembler};
use dicom_scu::pdu::{
    read_pdu, write_pdu, PDataValue, PDataValueType, Pdu, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, MAXIMUM_PDU_SIZE,
};
use dicom_scu::transport::{BoxedStream, OpenFuture, StreamOpener, TcpOpener};

/// How a mock SCP treats one accepted connection.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum ConnBehavior {
    /// Accept the association, then read and ignore everything,
    /// including the release request.
    Silent,
    /// Reject the association.
    Reject,
    /// Accept, then abort right after the first complete DIMSE message.
    AbortAfterFirstCommand,
    /// Accept and answer each DIMSE request according to the config.
    Respond(RespondConfig),
}

#[derive(Debug, Clone)]
pub struct RespondConfig {
    /// Number of `Pending` responses before the final `Success`
    pub pending_responses: usize,
    /// Delay before each response
    pub response_interval: Duration,
    /// Stop answering a request after this many responses
    pub go_silent_after: Option<usize>,
    /// Asynchronous operations window granted in the A-ASSOCIATE-AC;
    /// `None` echoes whatever the client proposed
    pub grant_async_ops: Option<(u16, u16)>,
}

impl Default for RespondConfig {
    fn default() -> Self {
        RespondConfig {
            pending_responses: 0,
            response_interval: Duration::from_millis(5),
            go_silent_after: None,
            grant_async_ops: None,
        }
    }
}

/// A running mock SCP with counters shared with the test body.
pub struct MockScp {
    pub addr: SocketAddr,
    /// How many associations were accepted (or rejected)
    pub associations: Arc<AtomicUsize>,
    /// Message IDs of all DIMSE requests received, in arrival order
    pub received: Arc<Mutex<Vec<u16>>>,
    /// Largest number of concurrently outstanding requests observed
    pub max_outstanding: Arc<AtomicUsize>,
    _handle: JoinHandle<()>,
}

impl MockScp {
    #[allow(dead_code)]
    pub fn received_ids(&self) -> Vec<u16> {
        self.received.lock().unwrap().clone()
    }
}

/// Spawn a mock SCP which applies `behaviors` to successive connections,
/// repeating the last behavior when more connections arrive.
pub async fn spawn_scp(behaviors: Vec<ConnBehavior>) -> MockScp {
    assert!(!behaviors.is_empty());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let associations = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let max_outstanding = Arc::new(AtomicUsize::new(0));

    let counters = (
        associations.clone(),
        received.clone(),
        max_outstanding.clone(),
    );
    let handle = tokio::spawn(async move {
        let mut next = 0;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let behavior = behaviors[next.min(behaviors.len() - 1)].clone();
            next += 1;
            let (associations, received, max_outstanding) = (
                counters.0.clone(),
                counters.1.clone(),
                counters.2.clone(),
            );
            tokio::spawn(async move {
                let _ = serve_connection(
                    stream,
                    behavior,
                    associations,
                    received,
                    max_outstanding,
                )
                .await;
            });
        }
    });

    MockScp {
        addr,
        associations,
        received,
        max_outstanding,
        _handle: handle,
    }
}

/// Byte-level PDU framing for the mock SCP side.
pub struct PduStream {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl PduStream {
    pub fn new(stream: TcpStream) -> Self {
        PduStream {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Read one PDU; `None` on a clean EOF.
    pub async fn read_pdu(&mut self) -> std::io::Result<Option<Pdu>> {
        loop {
            let mut window = Cursor::new(&self.buffer[..]);
            match read_pdu(&mut window, MAXIMUM_PDU_SIZE) {
                Ok(Some(pdu)) => {
                    let consumed = window.position() as usize;
                    self.buffer.drain(..consumed);
                    return Ok(Some(pdu));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn write_pdu(&mut self, pdu: &Pdu) -> std::io::Result<()> {
        let mut bytes = vec![];
        write_pdu(&mut bytes, pdu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&bytes).await
    }
}

/// Build a response command set for the given request command.
pub fn response_command(request: &CommandSet, status: u16) -> CommandSet {
    let field = request
        .command_field()
        .unwrap()
        .expect("request command field must be known");
    let message_id = request.message_id().unwrap();
    CommandSet::from_object(InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(field as u16 | 0x8000),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(message_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(0x0101_u16),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ]))
}

fn command_pdu(context_id: u8, command: &CommandSet) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command.write_to_vec().unwrap(),
        }],
    }
}

/// A response the SCP still owes, with its due time.
struct Owed {
    due_at: Instant,
    context_id: u8,
    request: CommandSet,
    /// pending responses still to send before the final one
    pending_left: usize,
    /// responses already sent for this request
    sent: usize,
}

async fn serve_connection(
    stream: TcpStream,
    behavior: ConnBehavior,
    associations: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u16>>>,
    max_outstanding: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let mut stream = PduStream::new(stream);

    // association phase
    let Some(rq) = stream.read_pdu().await? else {
        return Ok(());
    };
    let Pdu::AssociationRQ {
        presentation_contexts,
        user_variables,
        ..
    } = rq
    else {
        return Ok(());
    };
    associations.fetch_add(1, Ordering::SeqCst);

    if matches!(behavior, ConnBehavior::Reject) {
        stream
            .write_pdu(&Pdu::AssociationRJ {
                result: dicom_scu::pdu::AssociationRJResult::Permanent,
                source: dicom_scu::pdu::AssociationRJSource::ServiceUser(
                    dicom_scu::pdu::AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            })
            .await?;
        return Ok(());
    }

    let respond = match &behavior {
        ConnBehavior::Respond(config) => Some(config.clone()),
        _ => None,
    };

    // accept every proposed context with its first transfer syntax
    let accepted: Vec<PresentationContextResult> = presentation_contexts
        .iter()
        .map(|pc| PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: pc.transfer_syntaxes[0].clone(),
        })
        .collect();
    let mut ac_user_variables = vec![UserVariableItem::MaxLength(16_384)];
    // grant the configured asynchronous operations window,
    // or echo the proposed one
    let granted = respond.as_ref().and_then(|config| config.grant_async_ops);
    if let Some((invoked, performed)) = granted {
        ac_user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
    } else if let Some(window) = user_variables.iter().find_map(|item| match item {
        UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
            Some(UserVariableItem::AsyncOperationsWindow(*invoked, *performed))
        }
        _ => None,
    }) {
        ac_user_variables.push(window);
    }
    stream
        .write_pdu(&Pdu::AssociationAC {
            protocol_version: 1,
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: accepted,
            user_variables: ac_user_variables,
        })
        .await?;

    let mut assembler = MessageAssembler::new();
    let mut owed: Vec<Owed> = Vec::new();
    let mut outstanding = 0usize;

    loop {
        let next_due = owed.iter().map(|o| o.due_at).min();
        tokio::select! {
            incoming = stream.read_pdu() => match incoming? {
                None => return Ok(()),
                Some(Pdu::PData { data }) => {
                    for pdv in data {
                        let Ok(Some(message)) = assembler.push(pdv) else {
                            continue;
                        };
                        let field = message.command.command_field().ok().flatten();
                        if field == Some(CommandField::CCancelRq) {
                            // drop whatever is owed for the cancelled request
                            if let Ok(id) = message.command.message_id_being_responded_to() {
                                owed.retain(|o| o.request.message_id().unwrap() != id);
                            }
                            continue;
                        }
                        received
                            .lock()
                            .unwrap()
                            .push(message.command.message_id().unwrap());
                        outstanding += 1;
                        max_outstanding.fetch_max(outstanding, Ordering::SeqCst);

                        match (&behavior, &respond) {
                            (ConnBehavior::AbortAfterFirstCommand, _) => {
                                stream
                                    .write_pdu(&Pdu::AbortRQ {
                                        source: dicom_scu::pdu::AbortRQSource::ServiceProvider(
                                            dicom_scu::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                                        ),
                                    })
                                    .await?;
                                return Ok(());
                            }
                            (_, Some(config)) => {
                                owed.push(Owed {
                                    due_at: Instant::now() + config.response_interval,
                                    context_id: message.presentation_context_id,
                                    request: message.command,
                                    pending_left: config.pending_responses,
                                    sent: 0,
                                });
                            }
                            // silent: just swallow the message
                            _ => {}
                        }
                    }
                }
                Some(Pdu::ReleaseRQ) => {
                    if respond.is_some() {
                        stream.write_pdu(&Pdu::ReleaseRP).await?;
                    }
                    // a silent peer does not even answer the release probe
                    return Ok(());
                }
                Some(Pdu::AbortRQ { .. }) => return Ok(()),
                Some(_) => return Ok(()),
            },
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let config = respond.clone().unwrap_or_default();
                let position = owed
                    .iter()
                    .position(|o| Some(o.due_at) == next_due)
                    .unwrap();
                let mut item = owed.remove(position);

                if let Some(limit) = config.go_silent_after {
                    if item.sent >= limit {
                        // keep the request outstanding forever
                        continue;
                    }
                }

                if item.pending_left > 0 {
                    let response = response_command(&item.request, 0xFF00);
                    stream.write_pdu(&command_pdu(item.context_id, &response)).await?;
                    item.pending_left -= 1;
                    item.sent += 1;
                    item.due_at = Instant::now() + config.response_interval;
                    owed.push(item);
                } else {
                    let response = response_command(&item.request, 0x0000);
                    stream.write_pdu(&command_pdu(item.context_id, &response)).await?;
                    outstanding = outstanding.saturating_sub(1);
                }
            }
        }
    }
}

/// An `AsyncWrite` decorator that sleeps before every write,
/// simulating per-PDU write latency.
pub struct SlowWriteStream<S> {
    inner: S,
    delay: Duration,
    sleeping: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<S> SlowWriteStream<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        SlowWriteStream {
            inner,
            delay,
            sleeping: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SlowWriteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SlowWriteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.sleeping.is_none() {
            this.sleeping = Some(Box::pin(tokio::time::sleep(this.delay)));
        }
        if let Some(sleeping) = this.sleeping.as_mut() {
            ready!(sleeping.as_mut().poll(cx));
        }
        this.sleeping = None;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A stream opener that decorates plain TCP with per-write latency.
pub struct SlowOpener {
    pub write_delay: Duration,
}

impl StreamOpener for SlowOpener {
    fn open(&self, target: &str) -> OpenFuture<'_> {
        let target = target.to_string();
        Box::pin(async move {
            let stream = TcpOpener::default().open(&target).await?;
            Ok(Box::new(SlowWriteStream::new(stream, self.write_delay)) as BoxedStream)
        })
    }
}
