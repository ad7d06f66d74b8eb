//! DIMSE message layer:
//! packaging command and data sets into presentation data values,
//! and reassembling inbound fragments into whole messages.
//!
//! Outbound, [`fragment_message`] splits a command stream
//! and an optional data stream into P-DATA-TF PDUs
//! sized to the peer's maximum PDU length.
//! Inbound, a [`MessageAssembler`] accumulates fragments
//! per presentation context until both streams are complete,
//! yielding a [`DimseMessage`] ready for routing by message ID.

pub mod commands;

pub use commands::{CommandField, CommandSet, Priority, Status};

use std::collections::HashMap;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

use crate::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE, PDV_HEADER_SIZE};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to read inbound command set: {}", source))]
    InboundCommand {
        #[snafu(backtrace)]
        source: commands::Error,
    },

    #[snafu(display(
        "command fragment on presentation context {} after its command set was complete",
        presentation_context_id
    ))]
    UnexpectedCommandFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "data fragment on presentation context {} after its data set was complete",
        presentation_context_id
    ))]
    UnexpectedDataFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("transfer syntax `{}` is not in the registry", uid))]
    UnknownTransferSyntax { uid: String, backtrace: Backtrace },

    #[snafu(display("failed to encode data set: {}", source))]
    EncodeDataSet {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encode a data set in the given transfer syntax,
/// resolved from the transfer syntax registry.
pub fn encode_data_set(object: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let transfer_syntax = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnknownTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let mut bytes = Vec::new();
    object
        .write_dataset_with_ts(&mut bytes, transfer_syntax)
        .context(EncodeDataSetSnafu)?;
    Ok(bytes)
}

/// A fully reassembled DIMSE message:
/// a command set and, when announced, a data set kept as raw bytes
/// in the transfer syntax of its presentation context.
#[derive(Debug)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data: Option<Vec<u8>>,
}

/// Split a command stream and an optional data stream
/// into context-tagged P-DATA-TF PDUs,
/// never letting a PDU exceed `max_pdu_length`
/// (accounting for the 6 octets of PDU overhead
/// and 6 octets of PDV overhead).
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let chunk_length = max_pdu_length
        .saturating_sub(PDU_HEADER_SIZE + PDV_HEADER_SIZE)
        .max(64) as usize;

    let mut pdus = Vec::with_capacity(
        command.len().div_ceil(chunk_length) + data.map_or(0, |d| d.len().div_ceil(chunk_length)),
    );
    fragment_stream(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        chunk_length,
    );
    if let Some(data) = data {
        fragment_stream(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            data,
            chunk_length,
        );
    }
    pdus
}

fn fragment_stream(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    chunk_length: usize,
) {
    let mut chunks = bytes.chunks(chunk_length).peekable();
    // an empty stream still emits one empty closing fragment
    if chunks.peek().is_none() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        });
        return;
    }
    while let Some(chunk) = chunks.next() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        });
    }
}

/// Reassembles inbound presentation data values into whole DIMSE messages.
///
/// Fragments are accumulated per presentation context ID,
/// so responses to different requests may interleave arbitrarily
/// as long as they travel on different contexts.
/// Within one context, a message is complete once the command stream
/// carries its last-fragment bit and, if the command announces a data set,
/// the data stream does too.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u8, PartialMessage>,
}

#[derive(Debug, Default)]
struct PartialMessage {
    command: Vec<u8>,
    command_set: Option<CommandSet>,
    expects_data: bool,
    data: Vec<u8>,
    data_complete: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one presentation data value,
    /// returning a whole message once one is complete.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let context_id = pdv.presentation_context_id;
        let partial = self.partial.entry(context_id).or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(
                    partial.command_set.is_none(),
                    UnexpectedCommandFragmentSnafu {
                        presentation_context_id: context_id
                    }
                );
                partial.command.extend(pdv.data);
                if pdv.is_last {
                    let command_set =
                        CommandSet::read_from(&partial.command).context(InboundCommandSnafu)?;
                    partial.expects_data = command_set.has_data_set();
                    partial.command_set = Some(command_set);
                }
            }
            PDataValueType::Data => {
                ensure!(
                    !partial.data_complete,
                    UnexpectedDataFragmentSnafu {
                        presentation_context_id: context_id
                    }
                );
                partial.data.extend(pdv.data);
                if pdv.is_last {
                    partial.data_complete = true;
                }
            }
        }

        let complete = partial.command_set.is_some()
            && (!partial.expects_data || partial.data_complete);
        if !complete {
            return Ok(None);
        }
        if let Some(partial) = self.partial.remove(&context_id) {
            if let Some(command) = partial.command_set {
                let data = partial.expects_data.then_some(partial.data);
                return Ok(Some(DimseMessage {
                    presentation_context_id: context_id,
                    command,
                    data,
                }));
            }
        }
        Ok(None)
    }
}
