//! DICOM association handling from the requesting side.
//!
//! An association is requested through [`ClientAssociationOptions`],
//! which negotiates presentation contexts over an already opened
//! [`Connection`](crate::transport::Connection)
//! and yields a [`ClientAssociation`] on acceptance.
//! The association drives a reduced form of the PS3.8 §9.2 state machine,
//! sufficient for a service class user.

pub mod client;

pub use client::{ClientAssociation, ClientAssociationOptions};

use snafu::{Backtrace, Snafu};

use crate::pdu::{AssociationRJResult, AssociationRJSource, Pdu};
use crate::transport;

/// The protocol state of an association, as observed by the requestor.
///
/// Transitions are strictly forward:
/// `Idle → Requesting → Established → Releasing → Closed`,
/// with `Rejected` reachable from `Requesting`
/// and `Aborted` reachable from any live state.
/// A terminal transition destroys the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Requesting,
    Established,
    Releasing,
    Closed,
    Rejected,
    Aborted,
}

impl AssociationState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssociationState::Closed | AssociationState::Rejected | AssociationState::Aborted
        )
    }
}

impl std::fmt::Display for AssociationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AssociationState::Idle => "idle",
            AssociationState::Requesting => "requesting",
            AssociationState::Established => "established",
            AssociationState::Releasing => "releasing",
            AssociationState::Closed => "closed",
            AssociationState::Rejected => "rejected",
            AssociationState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A presentation context accepted by the association acceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextNegotiated {
    /// Presentation context ID, an odd integer between 1 and 255
    pub id: u8,
    pub abstract_syntax: String,
    /// The transfer syntax chosen by the acceptor
    pub transfer_syntax: String,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("failed to send PDU: {}", source))]
    SendPdu {
        #[snafu(backtrace)]
        source: transport::Error,
    },

    #[snafu(display("failed to receive PDU: {}", source))]
    ReceivePdu {
        #[snafu(backtrace)]
        source: transport::Error,
    },

    #[snafu(display("unexpected {} from peer", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the peer ({})", source_field))]
    Rejected {
        result: AssociationRJResult,
        source_field: AssociationRJSource,
        backtrace: Backtrace,
    },

    /// association aborted
    Aborted { backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("operation invalid in association state `{}`", state))]
    InvalidState {
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("no A-RELEASE-RP within {:?}", waited))]
    ReleaseTimedOut {
        waited: std::time::Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to close connection: {}", source))]
    Close {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error already terminated the association
    /// (the peer aborted, the transport broke, or we aborted in reaction).
    pub fn is_fatal_to_association(&self) -> bool {
        !matches!(self, Error::InvalidState { .. })
    }
}
