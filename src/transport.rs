//! Framed PDU transport over asynchronous byte streams.
//!
//! [`Connection`] couples a byte stream with a read buffer
//! and performs whole-PDU reads and writes,
//! with an optional deadline on each write.
//! [`StreamOpener`] is the single contract through which
//! plain TCP, TLS and test streams are produced,
//! so that everything above this module
//! is agnostic to the concrete transport.

use bytes::{Buf, BytesMut};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pdu::{self, Pdu, PDU_HEADER_SIZE};

/// Object-safe alias for the byte streams a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// The future returned by [`StreamOpener::open`].
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send + 'a>>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to encode PDU: {}", source))]
    EncodePdu {
        #[snafu(backtrace)]
        source: pdu::WriteError,
    },

    #[snafu(display("failed to decode PDU: {}", source))]
    DecodePdu {
        #[snafu(backtrace)]
        source: pdu::ReadError,
    },

    /// failed to read PDU bytes from wire
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to send PDU bytes on wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("write deadline of {:?} elapsed before the PDU was flushed", deadline))]
    WriteTimeout {
        deadline: Duration,
        backtrace: Backtrace,
    },

    /// connection closed by peer
    ConnectionClosed,

    /// invalid server name for TLS
    #[cfg(feature = "tls")]
    InvalidServerName {
        source: rustls::pki_types::InvalidDnsNameError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A factory of byte streams towards a DICOM node.
///
/// One implementation exists for plain TCP ([`TcpOpener`])
/// and one for TLS ([`TlsOpener`], feature `tls`).
/// Tests provide their own implementations
/// to decorate the stream, such as for injecting write latency.
pub trait StreamOpener: Send + Sync {
    /// Open a new stream towards `target`
    /// (a `host:port` pair or anything else resolvable).
    fn open(&self, target: &str) -> OpenFuture<'_>;
}

/// Plain TCP stream opener, with an optional connection timeout.
#[derive(Debug, Default)]
pub struct TcpOpener {
    pub connect_timeout: Option<Duration>,
}

impl StreamOpener for TcpOpener {
    fn open(&self, target: &str) -> OpenFuture<'_> {
        let target = target.to_string();
        Box::pin(async move {
            let connecting = tokio::net::TcpStream::connect(target);
            let stream = match self.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connecting)
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))
                    .context(ConnectSnafu)?
                    .context(ConnectSnafu)?,
                None => connecting.await.context(ConnectSnafu)?,
            };
            // DIMSE messages are latency sensitive
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// TLS stream opener over TCP.
#[cfg(feature = "tls")]
pub struct TlsOpener {
    pub config: std::sync::Arc<rustls::ClientConfig>,
    pub server_name: String,
    pub connect_timeout: Option<Duration>,
}

#[cfg(feature = "tls")]
impl StreamOpener for TlsOpener {
    fn open(&self, target: &str) -> OpenFuture<'_> {
        let target = target.to_string();
        Box::pin(async move {
            let tcp = TcpOpener {
                connect_timeout: self.connect_timeout,
            };
            let stream = tcp.open(&target).await?;
            let connector = tokio_rustls::TlsConnector::from(self.config.clone());
            let domain = rustls::pki_types::ServerName::try_from(self.server_name.clone())
                .context(InvalidServerNameSnafu)?;
            let stream = connector
                .connect(domain, stream)
                .await
                .context(ConnectSnafu)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// A framed PDU connection over an asynchronous byte stream.
pub struct Connection {
    stream: BoxedStream,
    /// Incoming bytes not yet consumed as a whole PDU
    read_buffer: BytesMut,
    /// Maximum PDU length admitted on reads
    max_pdu_length: u32,
    /// Deadline applied to each PDU write
    write_timeout: Option<Duration>,
    write_buffer: Vec<u8>,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("max_pdu_length", &self.max_pdu_length)
            .field("write_timeout", &self.write_timeout)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(stream: BoxedStream, max_pdu_length: u32, write_timeout: Option<Duration>) -> Self {
        Connection {
            stream,
            read_buffer: BytesMut::with_capacity((max_pdu_length + PDU_HEADER_SIZE) as usize),
            max_pdu_length,
            write_timeout,
            write_buffer: Vec::with_capacity((max_pdu_length + PDU_HEADER_SIZE) as usize),
            closed: false,
        }
    }

    /// Read a whole PDU, suspending until one is fully framed.
    ///
    /// This method is cancel safe:
    /// bytes of a partially received PDU stay in the read buffer
    /// and a subsequent call resumes from them.
    pub async fn read_pdu(&mut self) -> Result<Pdu> {
        loop {
            let mut window = Cursor::new(&self.read_buffer[..]);
            if let Some(pdu) =
                pdu::read_pdu(&mut window, self.max_pdu_length).context(DecodePduSnafu)?
            {
                let consumed = window.position() as usize;
                self.read_buffer.advance(consumed);
                return Ok(pdu);
            }
            let received = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .context(WireReadSnafu)?;
            ensure!(received > 0, ConnectionClosedSnafu);
        }
    }

    /// Encode and write a whole PDU,
    /// failing with [`Error::WriteTimeout`] if the configured
    /// per-write deadline elapses before all bytes are accepted.
    pub async fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        pdu::write_pdu(&mut self.write_buffer, pdu).context(EncodePduSnafu)?;
        match self.write_timeout {
            Some(deadline) => {
                let write = self.stream.write_all(&self.write_buffer);
                match tokio::time::timeout(deadline, write).await {
                    Ok(done) => done.context(WireSendSnafu),
                    Err(_) => WriteTimeoutSnafu { deadline }.fail(),
                }
            }
            None => self
                .stream
                .write_all(&self.write_buffer)
                .await
                .context(WireSendSnafu),
        }
    }

    /// Shut down the stream. A second call is a no-op.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
