//! Encoding of upper layer PDUs into octet buffers.

use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, Snafu};
use std::io::Write;

use crate::pdu::{Pdu, PresentationContextProposed, PresentationContextResult, UserVariableItem};

/// An error encoding a PDU.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(context(false), display("failed to write PDU bytes: {}", source))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("text field `{}` is not valid ISO 646: {:?}", field, text))]
    InvalidText {
        field: &'static str,
        text: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;

/// Encode a single PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            writer.write_u8(0x01)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_u16::<BigEndian>(*protocol_version)?;
                writer.write_u16::<BigEndian>(0x00)?;
                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
                // 32 reserved octets
                writer.write_all(&[0u8; 32])?;

                write_application_context_name(writer, application_context_name)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context)?;
                }
                write_user_variables(writer, user_variables)?;
                Ok(())
            })
        }
        Pdu::AssociationAC {
            protocol_version,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            writer.write_u8(0x02)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_u16::<BigEndian>(*protocol_version)?;
                writer.write_u16::<BigEndian>(0x00)?;
                // reserved AE title fields, echoed but not tested on receipt
                writer.write_all(&[0x20; 16])?;
                writer.write_all(&[0x20; 16])?;
                writer.write_all(&[0u8; 32])?;

                write_application_context_name(writer, application_context_name)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context)?;
                }
                write_user_variables(writer, user_variables)?;
                Ok(())
            })
        }
        Pdu::AssociationRJ { result, source } => {
            writer.write_u8(0x03)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_u8(0x00)?;
                writer.write_u8(result.code())?;
                let (source, reason) = source.codes();
                writer.write_u8(source)?;
                writer.write_u8(reason)?;
                Ok(())
            })
        }
        Pdu::PData { data } => {
            writer.write_u8(0x04)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer.write_u8(pdv.presentation_context_id)?;
                        let mut header = 0x00;
                        if let crate::pdu::PDataValueType::Command = pdv.value_type {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        writer.write_u8(header)?;
                        writer.write_all(&pdv.data)?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            writer.write_u8(0x05)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4])?;
                Ok(())
            })
        }
        Pdu::ReleaseRP => {
            writer.write_u8(0x06)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4])?;
                Ok(())
            })
        }
        Pdu::AbortRQ { source } => {
            writer.write_u8(0x07)?;
            writer.write_u8(0x00)?;
            write_chunk_u32(writer, |writer| {
                writer.write_u8(0x00)?;
                writer.write_u8(0x00)?;
                let (source, reason) = source.codes();
                writer.write_u8(source)?;
                writer.write_u8(reason)?;
                Ok(())
            })
        }
    }
}

/// Write a chunk of data preceded by its length in 4 octets, big endian.
pub(crate) fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;
    writer.write_u32::<BigEndian>(data.len() as u32)?;
    writer.write_all(&data)?;
    Ok(())
}

/// Write a chunk of data preceded by its length in 2 octets, big endian.
pub(crate) fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;
    writer.write_u16::<BigEndian>(data.len() as u16)?;
    writer.write_all(&data)?;
    Ok(())
}

/// AE titles are 16 characters of ISO 646,
/// padded with trailing spaces.
fn write_ae_title(writer: &mut dyn Write, ae_title: &str, field: &'static str) -> Result<()> {
    ensure!(
        ae_title.is_ascii() && ae_title.len() <= 16,
        InvalidTextSnafu {
            field,
            text: ae_title
        }
    );
    let mut bytes = ae_title.as_bytes().to_vec();
    bytes.resize(16, b' ');
    writer.write_all(&bytes)?;
    Ok(())
}

fn write_text(writer: &mut dyn Write, text: &str, field: &'static str) -> Result<()> {
    ensure!(text.is_ascii(), InvalidTextSnafu { field, text });
    writer.write_all(text.as_bytes())?;
    Ok(())
}

fn write_application_context_name(writer: &mut dyn Write, name: &str) -> Result<()> {
    writer.write_u8(0x10)?;
    writer.write_u8(0x00)?;
    write_chunk_u16(writer, |writer| {
        write_text(writer, name, "Application-context-name")
    })
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    writer.write_u8(0x20)?;
    writer.write_u8(0x00)?;
    write_chunk_u16(writer, |writer| {
        writer.write_u8(presentation_context.id)?;
        writer.write_all(&[0u8; 3])?;

        // one abstract syntax sub-item (30H)
        writer.write_u8(0x30)?;
        writer.write_u8(0x00)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
            )
        })?;

        // one or more transfer syntax sub-items (40H)
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer.write_u8(0x40)?;
            writer.write_u8(0x00)?;
            write_chunk_u16(writer, |writer| {
                write_text(writer, transfer_syntax, "Transfer-syntax-name")
            })?;
        }
        Ok(())
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    writer.write_u8(0x21)?;
    writer.write_u8(0x00)?;
    write_chunk_u16(writer, |writer| {
        writer.write_u8(presentation_context.id)?;
        writer.write_u8(0x00)?;
        writer.write_u8(presentation_context.reason.code())?;
        writer.write_u8(0x00)?;

        writer.write_u8(0x40)?;
        writer.write_u8(0x00)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
            )
        })?;
        Ok(())
    })
}

fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    writer.write_u8(0x50)?;
    writer.write_u8(0x00)?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer.write_u8(0x51)?;
                    writer.write_u8(0x00)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_u32::<BigEndian>(*max_length)?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    writer.write_u8(0x52)?;
                    writer.write_u8(0x00)?;
                    write_chunk_u16(writer, |writer| {
                        write_text(writer, uid, "Implementation-class-uid")
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    writer.write_u8(0x53)?;
                    writer.write_u8(0x00)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_u16::<BigEndian>(*invoked)?;
                        writer.write_u16::<BigEndian>(*performed)?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    writer.write_u8(0x55)?;
                    writer.write_u8(0x00)?;
                    write_chunk_u16(writer, |writer| {
                        write_text(writer, name, "Implementation-version-name")
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer.write_u8(*item_type)?;
                    writer.write_u8(0x00)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_all(data)?;
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}
