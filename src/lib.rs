//! This crate contains an association-oriented client
//! for the DICOM upper layer protocol:
//! it establishes associations with remote service class providers,
//! multiplexes DIMSE requests over them,
//! enforces per-request response timeouts,
//! and reports outcomes back to the caller.
//!
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and the codec that maps them to and from octet buffers.
//! - The [`transport`] module
//!   frames PDUs over TCP or TLS byte streams,
//!   with per-write deadlines.
//! - The [`association`] module
//!   negotiates and drives associations
//!   towards other application entities.
//! - The [`dimse`] module
//!   packages DIMSE command and data sets into presentation data values
//!   and reassembles inbound fragments into whole messages.
//! - The [`client`] module
//!   is the orchestrator: a request queue, batching over
//!   sequential associations, request pipelining, and timeout accounting.
//!
//! The crate is asynchronous and runs on [tokio].
//! A client serializes all of its I/O and timing decisions
//! in the task that calls [`send`](client::DicomClient::send);
//! caller-facing methods merely suspend and may be invoked from any thread.

pub mod address;
pub mod association;
pub mod client;
pub mod dimse;
pub mod pdu;
pub mod transport;

/// The implementation class UID of this crate,
/// generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137284957242397158191246386232403817190";

/// The implementation version name advertised during association
/// negotiation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicom-scu 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::{AssociationState, ClientAssociation, ClientAssociationOptions};
pub use client::{ClientEvent, ClientOptions, DicomClient, DicomRequest, DicomResponse};
pub use dimse::{CommandSet, Status};
pub use pdu::{read_pdu, write_pdu, Pdu};
