//! Protocol data unit definitions for the DICOM upper layer protocol.
//!
//! This module provides the [`Pdu`] type,
//! covering the seven PDU types of PS3.8 §9.3,
//! alongside the codec functions [`read_pdu`] and [`write_pdu`].
//! The codec is a pure function of bytes and never performs I/O;
//! framing over a live connection is done in [`crate::transport`].

pub mod reader;
pub mod writer;


pub use reader::{read_pdu, ReadError};
pub use writer::{write_pdu, WriteError};

/// The default maximum PDU length advertised to peers.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum admissible maximum PDU length.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum admissible maximum PDU length.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The number of octets taken by a PDU header
/// (type, reserved, and 4 octets of length).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The number of octets taken by a presentation data value header
/// (4 octets of length, context ID, and message control header).
pub const PDV_HEADER_SIZE: u32 = 6;

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (type 01H)
    AssociationRQ {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-AC (type 02H)
    AssociationAC {
        protocol_version: u16,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-RJ (type 03H)
    AssociationRJ {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// P-DATA-TF (type 04H)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (type 05H)
    ReleaseRQ,
    /// A-RELEASE-RP (type 06H)
    ReleaseRP,
    /// A-ABORT (type 07H)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// A short name for the PDU variant, for logging.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
        }
    }
}

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextProposed {
    /// Presentation context ID, an odd integer between 1 and 255
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context as answered in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextResult {
    /// Presentation context ID, matching the proposed context
    pub id: u8,
    pub reason: PresentationContextResultReason,
    /// The transfer syntax chosen by the acceptor.
    /// Only meaningful when `reason` is
    /// [`Acceptance`](PresentationContextResultReason::Acceptance).
    pub transfer_syntax: String,
}

/// The result/reason field of a presentation context reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            PresentationContextResultReason::Acceptance => 0,
            PresentationContextResultReason::UserRejection => 1,
            PresentationContextResultReason::NoReason => 2,
            PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
            PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source and reason/diagnostic fields of an A-ASSOCIATE-RJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => {
                let reason = match reason {
                    1 => AssociationRJServiceUserReason::NoReasonGiven,
                    2 => AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    3 => AssociationRJServiceUserReason::CallingAETitleNotRecognized,
                    7 => AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                    x => AssociationRJServiceUserReason::Reserved(x),
                };
                Some(AssociationRJSource::ServiceUser(reason))
            }
            2 => match reason {
                1 => Some(AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::NoReasonGiven,
                )),
                2 => Some(AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                )),
                _ => None,
            },
            3 => {
                let reason = match reason {
                    1 => AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
                    2 => AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                    x => AssociationRJServiceProviderPresentationReason::Reserved(x),
                };
                Some(AssociationRJSource::ServiceProviderPresentation(reason))
            }
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let reason = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(x) => x,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAcse(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(x) => x,
                };
                (3, reason)
            }
        }
    }
}

impl std::fmt::Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => write!(f, "service user: {r:?}"),
            AssociationRJSource::ServiceProviderAcse(r) => {
                write!(f, "service provider (ACSE): {r:?}")
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                write!(f, "service provider (presentation): {r:?}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value within a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// Whether this fragment is the last one of its stream
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value carries
/// command set or data set fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source and reason fields of an A-ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(AbortRQSource::ServiceUser),
            1 => Some(AbortRQSource::Reserved),
            2 => {
                let reason = match reason {
                    0 => AbortRQServiceProviderReason::ReasonNotSpecified,
                    1 => AbortRQServiceProviderReason::UnrecognizedPdu,
                    2 => AbortRQServiceProviderReason::UnexpectedPdu,
                    3 => AbortRQServiceProviderReason::Reserved,
                    4 => AbortRQServiceProviderReason::UnrecognizedPduParameter,
                    5 => AbortRQServiceProviderReason::UnexpectedPduParameter,
                    6 => AbortRQServiceProviderReason::InvalidPduParameter,
                    _ => return None,
                };
                Some(AbortRQSource::ServiceProvider(reason))
            }
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let reason = match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A sub-item of the user information item
/// in an A-ASSOCIATE-RQ or A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq)]
pub enum UserVariableItem {
    /// Maximum length received (sub-item 51H)
    MaxLength(u32),
    /// Implementation class UID (sub-item 52H)
    ImplementationClassUID(String),
    /// Implementation version name (sub-item 55H)
    ImplementationVersionName(String),
    /// Asynchronous operations window (sub-item 53H):
    /// maximum number of operations invoked and performed
    AsyncOperationsWindow(u16, u16),
    /// Any other sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// A variable item read from the payload of an association PDU.
#[derive(Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}
