//! Message type and return code vocabularies of the SOME/IP header.

use serde::{Deserialize, Serialize};

/// SOME/IP message type octet.
///
/// The `0x20` bit marks a TP segment; the TP variants are listed explicitly
/// so a decoded header always maps onto a named variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Request expecting a response.
    Request = 0x00,
    /// Fire-and-forget request.
    RequestNoReturn = 0x01,
    /// Event or field notification.
    Notification = 0x02,
    /// Response to a request.
    Response = 0x80,
    /// Error response to a request.
    Error = 0x81,
    /// TP segment of a request.
    TpRequest = 0x20,
    /// TP segment of a fire-and-forget request.
    TpRequestNoReturn = 0x21,
    /// TP segment of a notification.
    TpNotification = 0x22,
    /// TP segment of a response.
    TpResponse = 0xA0,
    /// TP segment of an error response.
    TpError = 0xA1,
}

impl MessageType {
    /// Decode the message type octet.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            0x20 => Some(Self::TpRequest),
            0x21 => Some(Self::TpRequestNoReturn),
            0x22 => Some(Self::TpNotification),
            0xA0 => Some(Self::TpResponse),
            0xA1 => Some(Self::TpError),
            _ => None,
        }
    }

    /// True for the TP (segmented) variants.
    pub fn is_tp(self) -> bool {
        (self as u8) & 0x20 != 0
    }

    /// The unsegmented equivalent of a TP variant (identity otherwise).
    pub fn without_tp(self) -> Self {
        match self {
            Self::TpRequest => Self::Request,
            Self::TpRequestNoReturn => Self::RequestNoReturn,
            Self::TpNotification => Self::Notification,
            Self::TpResponse => Self::Response,
            Self::TpError => Self::Error,
            other => other,
        }
    }

    /// The segmented equivalent of a plain variant (identity for TP variants).
    pub fn with_tp(self) -> Self {
        match self {
            Self::Request => Self::TpRequest,
            Self::RequestNoReturn => Self::TpRequestNoReturn,
            Self::Notification => Self::TpNotification,
            Self::Response => Self::TpResponse,
            Self::Error => Self::TpError,
            other => other,
        }
    }

    /// True if this message answers a pending request (RESPONSE or ERROR).
    pub fn is_answer(self) -> bool {
        matches!(self, Self::Response | Self::Error | Self::TpResponse | Self::TpError)
    }
}

/// SOME/IP return code octet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    /// No error.
    #[default]
    Ok = 0x00,
    /// Unspecified error.
    NotOk = 0x01,
    /// The service id is unknown.
    UnknownService = 0x02,
    /// The method id is unknown.
    UnknownMethod = 0x03,
    /// The service is not ready to serve requests.
    NotReady = 0x04,
    /// The target endpoint cannot be reached.
    NotReachable = 0x05,
    /// No response arrived within the request deadline.
    Timeout = 0x06,
    /// The protocol version octet was not 1.
    WrongProtocolVersion = 0x07,
    /// The interface version does not match the offered major version.
    WrongInterfaceVersion = 0x08,
    /// The message violates the header or payload layout.
    MalformedMessage = 0x09,
    /// The message type is not valid for the addressed method.
    WrongMessageType = 0x0A,
}

impl ReturnCode {
    /// Decode the return code octet. Unassigned values map to `NotOk`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::NotOk,
            0x02 => Self::UnknownService,
            0x03 => Self::UnknownMethod,
            0x04 => Self::NotReady,
            0x05 => Self::NotReachable,
            0x06 => Self::Timeout,
            0x07 => Self::WrongProtocolVersion,
            0x08 => Self::WrongInterfaceVersion,
            0x09 => Self::MalformedMessage,
            0x0A => Self::WrongMessageType,
            _ => Self::NotOk,
        }
    }
}

/// Classification of an event within an eventgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Plain event: delivered only when notified.
    Event,
    /// Field: the last value is cached and replayed to new subscribers.
    Field,
    /// Selective event: delivered to explicitly chosen subscribers.
    SelectiveEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in [0x00u8, 0x01, 0x02, 0x80, 0x81, 0x20, 0x21, 0x22, 0xA0, 0xA1] {
            let ty = MessageType::from_u8(value).expect("assigned value");
            assert_eq!(ty as u8, value);
        }
        assert_eq!(MessageType::from_u8(0x42), None);
    }

    #[test]
    fn test_tp_bit() {
        assert!(MessageType::TpRequest.is_tp());
        assert!(!MessageType::Request.is_tp());
        assert_eq!(MessageType::TpResponse.without_tp(), MessageType::Response);
        assert_eq!(MessageType::Notification.with_tp(), MessageType::TpNotification);
        assert_eq!(MessageType::Request.without_tp(), MessageType::Request);
    }

    #[test]
    fn test_return_code_unassigned_maps_to_not_ok() {
        assert_eq!(ReturnCode::from_u8(0x00), ReturnCode::Ok);
        assert_eq!(ReturnCode::from_u8(0x0A), ReturnCode::WrongMessageType);
        assert_eq!(ReturnCode::from_u8(0x7F), ReturnCode::NotOk);
    }
}
