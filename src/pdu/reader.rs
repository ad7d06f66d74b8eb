//! Decoding of upper layer PDUs from octet buffers.

use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};

use crate::pdu::{
    AbortRQSource, AssociationRJResult, AssociationRJSource, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
    PDataValue, PDataValueType, Pdu, PduVariableItem, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};

/// An error decoding a PDU from a byte buffer.
///
/// Every variant denotes a malformed PDU;
/// the expected reaction of an association
/// is to abort with reason _unexpected PDU_.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown PDU type {:#04x}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display(
        "incoming PDU is too large: length {}, maximum admitted is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("reserved PDU header octet has value {:#04x}", value))]
    ReservedNotZero { value: u8, backtrace: Backtrace },

    #[snafu(display("could not read PDU field `{}`: {}", field, source))]
    ReadField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU item truncated: expected {} more bytes", bytes))]
    TruncatedItem { bytes: usize, backtrace: Backtrace },

    #[snafu(display("text field `{}` is not valid ISO 646", field))]
    InvalidText {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected variable item {:?}", item))]
    UnexpectedVariableItem {
        item: Box<PduVariableItem>,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid reject result, source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason {}", code))]
    InvalidResultReason { code: u8, backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item {:#04x}", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("multiple transfer syntaxes accepted in one presentation context"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T, E = ReadError> = std::result::Result<T, E>;

/// Try to decode one PDU from the given reader.
///
/// Returns `Ok(None)` when the reader does not hold a complete PDU yet,
/// so that the caller can fetch more bytes and retry from the same position.
/// Any structural problem in a fully buffered PDU is a hard error.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // PDU header: type, reserved, 4 octets of length
    let mut head = [0; 6];
    if let Err(e) = reader.read_exact(&mut head) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadFieldSnafu { field: "type" });
    }

    let pdu_type = head[0];
    ensure!(head[1] == 0, ReservedNotZeroSnafu { value: head[1] });
    ensure!(
        (0x01..=0x07).contains(&pdu_type),
        UnknownPduTypeSnafu { pdu_type }
    );

    let pdu_length = u32::from_be_bytes([head[2], head[3], head[4], head[5]]);
    // association negotiation PDUs may legitimately exceed the
    // max PDU length agreed for P-DATA, so only P-DATA is bounded
    if pdu_type == 0x04 {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
    }

    let payload = read_n(reader, pdu_length as usize).context(ReadFieldSnafu { field: "payload" })?;
    if payload.len() < pdu_length as usize {
        // not fully buffered yet
        return Ok(None);
    }
    let mut payload = Cursor::new(payload);

    let pdu = match pdu_type {
        0x01 => read_association_rq(&mut payload)?,
        0x02 => read_association_ac(&mut payload)?,
        0x03 => read_association_rj(&mut payload)?,
        0x04 => read_pdata(&mut payload)?,
        0x05 => {
            // 4 reserved octets
            skip(&mut payload, 4)?;
            Pdu::ReleaseRQ
        }
        0x06 => {
            skip(&mut payload, 4)?;
            Pdu::ReleaseRP
        }
        0x07 => read_abort(&mut payload)?,
        _ => unreachable!(),
    };
    Ok(Some(pdu))
}

fn read_association_rq(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
        field: "Protocol-version",
    })?;
    // 2 reserved octets, not tested on receipt
    skip(cursor, 2)?;

    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;

    // 32 reserved octets
    skip(cursor, 32)?;

    let mut application_context_name = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];
    while remaining(cursor) > 0 {
        match read_variable_item(cursor)? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextProposed(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            item => {
                return UnexpectedVariableItemSnafu {
                    item: Box::new(item),
                }
                .fail()
            }
        }
    }

    Ok(Pdu::AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
        field: "Protocol-version",
    })?;
    // reserved: 2 octets, then the echoed AE title fields (16 + 16 + 32)
    skip(cursor, 2 + 16 + 16 + 32)?;

    let mut application_context_name = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];
    while remaining(cursor) > 0 {
        match read_variable_item(cursor)? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextResult(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            item => {
                return UnexpectedVariableItemSnafu {
                    item: Box::new(item),
                }
                .fail()
            }
        }
    }

    Ok(Pdu::AssociationAC {
        protocol_version,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_rj(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    // 1 reserved octet
    skip(cursor, 1)?;
    let result = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "Result" })?;
    let source = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "Source" })?;
    let reason = cursor.read_u8().context(ReadFieldSnafu {
        field: "Reason/Diag.",
    })?;

    let result = AssociationRJResult::from_code(result).context(InvalidRejectSourceOrReasonSnafu)?;
    let source =
        AssociationRJSource::from_codes(source, reason).context(InvalidRejectSourceOrReasonSnafu)?;
    Ok(Pdu::AssociationRJ { result, source })
}

fn read_pdata(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    let mut values = vec![];
    while remaining(cursor) > 0 {
        let item_length = cursor.read_u32::<BigEndian>().context(ReadFieldSnafu {
            field: "Item-length",
        })?;
        ensure!(
            item_length >= 2,
            TruncatedItemSnafu {
                bytes: 2usize - item_length as usize
            }
        );
        let presentation_context_id = cursor.read_u8().context(ReadFieldSnafu {
            field: "Presentation-context-ID",
        })?;

        // message control header: bit 0 is command, bit 1 is last fragment
        let header = cursor.read_u8().context(ReadFieldSnafu {
            field: "Message Control Header",
        })?;
        let value_type = if header & 0x01 != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let is_last = header & 0x02 != 0;

        let data = read_exact_n(cursor, (item_length - 2) as usize, "Presentation-data-value")?;

        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        });
    }
    Ok(Pdu::PData { data: values })
}

fn read_abort(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    // 2 reserved octets
    skip(cursor, 2)?;
    let source = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "Source" })?;
    let reason = cursor.read_u8().context(ReadFieldSnafu {
        field: "Reason/Diag",
    })?;
    let source = AbortRQSource::from_codes(source, reason).context(InvalidAbortSourceOrReasonSnafu)?;
    Ok(Pdu::AbortRQ { source })
}

fn read_variable_item(cursor: &mut Cursor<Vec<u8>>) -> Result<PduVariableItem> {
    let item_type = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "Item-type" })?;
    skip(cursor, 1)?;
    let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
        field: "Item-length",
    })?;
    let body = read_exact_n(cursor, item_length as usize, "Item")?;
    let mut body = Cursor::new(body);

    match item_type {
        0x10 => {
            let name = into_text(body.into_inner(), "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(name))
        }
        0x20 => read_presentation_context_proposed(&mut body),
        0x21 => read_presentation_context_result(&mut body),
        0x50 => read_user_information(&mut body),
        other => Ok(PduVariableItem::Unknown(other)),
    }
}

fn read_presentation_context_proposed(cursor: &mut Cursor<Vec<u8>>) -> Result<PduVariableItem> {
    let id = cursor.read_u8().context(ReadFieldSnafu {
        field: "Presentation-context-ID",
    })?;
    // 3 reserved octets
    skip(cursor, 3)?;

    let mut abstract_syntax = None;
    let mut transfer_syntaxes = vec![];
    while remaining(cursor) > 0 {
        let item_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "Item-type" })?;
        skip(cursor, 1)?;
        let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
            field: "Item-length",
        })?;
        let body = read_exact_n(cursor, item_length as usize, "syntax sub-item")?;
        match item_type {
            0x30 => {
                abstract_syntax = Some(into_text(body, "Abstract-syntax-name")?);
            }
            0x40 => {
                transfer_syntaxes.push(into_text(body, "Transfer-syntax-name")?);
            }
            item_type => return UnknownPresentationContextSubItemSnafu { item_type }.fail(),
        }
    }

    Ok(PduVariableItem::PresentationContextProposed(
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
            transfer_syntaxes,
        },
    ))
}

fn read_presentation_context_result(cursor: &mut Cursor<Vec<u8>>) -> Result<PduVariableItem> {
    let id = cursor.read_u8().context(ReadFieldSnafu {
        field: "Presentation-context-ID",
    })?;
    skip(cursor, 1)?;
    let code = cursor.read_u8().context(ReadFieldSnafu {
        field: "Result/Reason",
    })?;
    let reason =
        PresentationContextResultReason::from_code(code).context(InvalidResultReasonSnafu { code })?;
    skip(cursor, 1)?;

    let mut transfer_syntax = None;
    while remaining(cursor) > 0 {
        let item_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "Item-type" })?;
        skip(cursor, 1)?;
        let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
            field: "Item-length",
        })?;
        let body = read_exact_n(cursor, item_length as usize, "Transfer-syntax-name")?;
        match item_type {
            0x40 => {
                ensure!(
                    transfer_syntax.is_none(),
                    MultipleTransferSyntaxesAcceptedSnafu
                );
                transfer_syntax = Some(into_text(body, "Transfer-syntax-name")?);
            }
            item_type => return UnknownPresentationContextSubItemSnafu { item_type }.fail(),
        }
    }

    Ok(PduVariableItem::PresentationContextResult(
        PresentationContextResult {
            id,
            reason,
            transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
        },
    ))
}

fn read_user_information(cursor: &mut Cursor<Vec<u8>>) -> Result<PduVariableItem> {
    let mut user_variables = vec![];
    while remaining(cursor) > 0 {
        let item_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "Item-type" })?;
        skip(cursor, 1)?;
        let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
            field: "Item-length",
        })?;
        let body = read_exact_n(cursor, item_length as usize, "User-data sub-item")?;
        match item_type {
            0x51 => {
                let mut body = Cursor::new(body);
                let max_length = body.read_u32::<BigEndian>().context(ReadFieldSnafu {
                    field: "Maximum-length-received",
                })?;
                user_variables.push(UserVariableItem::MaxLength(max_length));
            }
            0x52 => {
                let uid = into_text(body, "Implementation-class-uid")?;
                user_variables.push(UserVariableItem::ImplementationClassUID(uid));
            }
            0x53 => {
                let mut body = Cursor::new(body);
                let invoked = body.read_u16::<BigEndian>().context(ReadFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
                let performed = body.read_u16::<BigEndian>().context(ReadFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
                user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
            }
            0x55 => {
                let name = into_text(body, "Implementation-version-name")?;
                user_variables.push(UserVariableItem::ImplementationVersionName(name));
            }
            other => {
                user_variables.push(UserVariableItem::Unknown(other, body));
            }
        }
    }
    Ok(PduVariableItem::UserVariables(user_variables))
}

fn remaining(cursor: &Cursor<Vec<u8>>) -> u64 {
    cursor.get_ref().len() as u64 - cursor.position()
}

fn skip(cursor: &mut Cursor<Vec<u8>>, bytes: u64) -> Result<()> {
    ensure!(
        remaining(cursor) >= bytes,
        TruncatedItemSnafu {
            bytes: (bytes - remaining(cursor)) as usize
        }
    );
    cursor.set_position(cursor.position() + bytes);
    Ok(())
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read.min(MAXIMUM_PDU_SIZE as usize));
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

fn read_exact_n(
    cursor: &mut Cursor<Vec<u8>>,
    bytes_to_read: usize,
    field: &'static str,
) -> Result<Vec<u8>> {
    let mut out = vec![0; bytes_to_read];
    cursor
        .read_exact(&mut out)
        .context(ReadFieldSnafu { field })?;
    Ok(out)
}

/// AE titles and UIDs are ISO 646 (basic G0 set) with
/// non-significant leading and trailing spaces.
fn into_text(bytes: Vec<u8>, field: &'static str) -> Result<String> {
    ensure!(bytes.is_ascii(), InvalidTextSnafu { field });
    let text = String::from_utf8(bytes).ok().context(InvalidTextSnafu { field })?;
    Ok(text.trim_matches([' ', '\0']).to_string())
}

fn read_ae_title(cursor: &mut Cursor<Vec<u8>>, field: &'static str) -> Result<String> {
    let bytes = read_exact_n(cursor, 16, field)?;
    into_text(bytes, field)
}
