//! DIMSE command set construction and inspection.
//!
//! A command set is a small DICOM data set of group `0000` elements,
//! always encoded in implicit VR little endian.
//! The [`CommandSet`] type wraps an in-memory object
//! with typed accessors for the fields the client needs to route responses.

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

/// Value of _Command Data Set Type_ (0000,0800) announcing
/// that no data set follows the command set.
pub const NO_DATA_SET: u16 = 0x0101;

/// Value of _Command Data Set Type_ (0000,0800) announcing
/// that a data set follows the command set.
pub const DATA_SET_PRESENT: u16 = 0x0001;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to decode command set: {}", source))]
    DecodeCommand {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to encode command set: {}", source))]
    EncodeCommand {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    #[snafu(display("missing command set element `{}`", name))]
    MissingElement {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value in command set element `{}`: {}", name, source))]
    InvalidElement {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The DIMSE command field codes (0000,0100) known to this crate.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    /// Whether this is a response command (bit 15 set).
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }

    /// Whether this request yields a sequence of responses
    /// terminated by a final non-pending status.
    pub fn is_multi_response_rq(self) -> bool {
        matches!(
            self,
            CommandField::CFindRq | CommandField::CGetRq | CommandField::CMoveRq
        )
    }
}

/// DIMSE operation priority (0000,0700).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// Classification of a DIMSE status code (0000,0900)
/// according to PS3.7 Annex C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Matching or sub-operations are continuing;
    /// does not terminate a multi-response request
    Pending,
    /// Terminated due to a cancel request
    Cancel,
    Warning(u16),
    Failure(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0xFF00 | 0xFF01 => Status::Pending,
            0xFE00 => Status::Cancel,
            0x0001 | 0x0107 | 0x0116 => Status::Warning(code),
            0xB000..=0xBFFF => Status::Warning(code),
            other => Status::Failure(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::Pending => 0xFF00,
            Status::Cancel => 0xFE00,
            Status::Warning(code) | Status::Failure(code) => code,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending)
    }
}

/// A DIMSE command set.
#[derive(Debug, Clone)]
pub struct CommandSet {
    object: InMemDicomObject,
}

impl CommandSet {
    fn request(
        field: CommandField,
        message_id: u16,
        affected_sop_class_uid: &str,
        data_set_type: u16,
        extra: impl IntoIterator<Item = InMemElement>,
    ) -> Self {
        let base = vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(affected_sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(field as u16),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(data_set_type),
            ),
        ];
        let object =
            InMemDicomObject::command_from_element_iter(base.into_iter().chain(extra));
        CommandSet { object }
    }

    fn priority_element(priority: Priority) -> InMemElement {
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            PrimitiveValue::from(priority as u16),
        )
    }

    /// Build a C-ECHO-RQ command set.
    pub fn c_echo_rq(message_id: u16, affected_sop_class_uid: &str) -> Self {
        Self::request(
            CommandField::CEchoRq,
            message_id,
            affected_sop_class_uid,
            NO_DATA_SET,
            [],
        )
    }

    /// Build a C-STORE-RQ command set.
    /// The data set with the instance to store follows the command.
    pub fn c_store_rq(
        message_id: u16,
        affected_sop_class_uid: &str,
        affected_sop_instance_uid: &str,
        priority: Priority,
    ) -> Self {
        Self::request(
            CommandField::CStoreRq,
            message_id,
            affected_sop_class_uid,
            DATA_SET_PRESENT,
            [
                Self::priority_element(priority),
                DataElement::new(
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(affected_sop_instance_uid),
                ),
            ],
        )
    }

    /// Build a C-FIND-RQ command set.
    /// The query identifier data set follows the command.
    pub fn c_find_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> Self {
        Self::request(
            CommandField::CFindRq,
            message_id,
            affected_sop_class_uid,
            DATA_SET_PRESENT,
            [Self::priority_element(priority)],
        )
    }

    /// Build a C-GET-RQ command set.
    pub fn c_get_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> Self {
        Self::request(
            CommandField::CGetRq,
            message_id,
            affected_sop_class_uid,
            DATA_SET_PRESENT,
            [Self::priority_element(priority)],
        )
    }

    /// Build a C-MOVE-RQ command set.
    pub fn c_move_rq(
        message_id: u16,
        affected_sop_class_uid: &str,
        move_destination: &str,
        priority: Priority,
    ) -> Self {
        Self::request(
            CommandField::CMoveRq,
            message_id,
            affected_sop_class_uid,
            DATA_SET_PRESENT,
            [
                Self::priority_element(priority),
                DataElement::new(
                    tags::MOVE_DESTINATION,
                    VR::AE,
                    PrimitiveValue::from(move_destination),
                ),
            ],
        )
    }

    /// Build a C-CANCEL-RQ command set
    /// addressed at a previously issued request.
    pub fn c_cancel_rq(message_id_being_responded_to: u16) -> Self {
        let object = InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(CommandField::CCancelRq as u16),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                PrimitiveValue::from(message_id_being_responded_to),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(NO_DATA_SET),
            ),
        ]);
        CommandSet { object }
    }

    /// Wrap an already assembled command data set.
    pub fn from_object(object: InMemDicomObject) -> Self {
        CommandSet { object }
    }

    /// Decode a command set from implicit VR little endian bytes.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let object = InMemDicomObject::read_dataset_with_ts(
            bytes,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(DecodeCommandSnafu)?;
        Ok(CommandSet { object })
    }

    /// Encode this command set in implicit VR little endian.
    pub fn write_to_vec(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.object
            .write_dataset_with_ts(&mut bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(EncodeCommandSnafu)?;
        Ok(bytes)
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.object
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.object
    }

    fn ushort(&self, tag: dicom_core::Tag, name: &'static str) -> Result<u16> {
        self.object
            .get(tag)
            .context(MissingElementSnafu { name })?
            .to_int::<u16>()
            .context(InvalidElementSnafu { name })
    }

    /// The command field (0000,0100) of this command set.
    pub fn command_field(&self) -> Result<Option<CommandField>> {
        let code = self.ushort(tags::COMMAND_FIELD, "Command Field")?;
        Ok(CommandField::from_code(code))
    }

    /// The message ID (0000,0110).
    pub fn message_id(&self) -> Result<u16> {
        self.ushort(tags::MESSAGE_ID, "Message ID")
    }

    /// The message ID being responded to (0000,0120);
    /// present in every response command.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.ushort(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// The classified status (0000,0900) of a response command.
    pub fn status(&self) -> Result<Status> {
        let code = self.ushort(tags::STATUS, "Status")?;
        Ok(Status::from_code(code))
    }

    /// Whether a data set follows this command set,
    /// as announced by _Command Data Set Type_ (0000,0800).
    pub fn has_data_set(&self) -> bool {
        match self.object.get(tags::COMMAND_DATA_SET_TYPE) {
            Some(element) => element
                .to_int::<u16>()
                .map(|value| value != NO_DATA_SET)
                .unwrap_or(false),
            None => false,
        }
    }
}
