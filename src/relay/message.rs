// Message types and naming rules for the gatekeeper relay protocol

use crate::relay::error::{RelayError, RelayResult, RemoteErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Shared topic on which every cloud listens for advertisements.
pub const GENERAL_ADVERTISEMENT_TOPIC: &str = "General-M5QTZXM9G9AnpPHWT6WennWu";

pub const REQUEST_QUEUE_PREFIX: &str = "REQ-";
pub const RESPONSE_QUEUE_PREFIX: &str = "RESP-";

/// Queue on which the responder `common_name` receives the request of a session.
pub fn request_queue_name(common_name: &str, session_id: &str) -> String {
    format!("{REQUEST_QUEUE_PREFIX}{common_name}-{session_id}")
}

/// Queue on which the initiator receives the ack and the response of a session.
pub fn response_queue_name(common_name: &str, session_id: &str) -> String {
    format!("{RESPONSE_QUEUE_PREFIX}{common_name}-{session_id}")
}

/// The closed set of message types understood on the relay.
///
/// Every request kind is answered with a response of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ack,
    GsdPoll,
    MultiGsdPoll,
    IcnProposal,
    AccessType,
    SystemAddressList,
    QosRelayTest,
}

impl MessageType {
    pub const REQUEST_KINDS: [MessageType; 6] = [
        MessageType::GsdPoll,
        MessageType::MultiGsdPoll,
        MessageType::IcnProposal,
        MessageType::AccessType,
        MessageType::SystemAddressList,
        MessageType::QosRelayTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ack => "ack",
            MessageType::GsdPoll => "gsd_poll",
            MessageType::MultiGsdPoll => "multi_gsd_poll",
            MessageType::IcnProposal => "icn_proposal",
            MessageType::AccessType => "access_type",
            MessageType::SystemAddressList => "system_address_list",
            MessageType::QosRelayTest => "qos_relay_test",
        }
    }

    pub fn is_request(&self) -> bool {
        !matches!(self, MessageType::Ack)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ack" => Ok(MessageType::Ack),
            "gsd_poll" => Ok(MessageType::GsdPoll),
            "multi_gsd_poll" => Ok(MessageType::MultiGsdPoll),
            "icn_proposal" => Ok(MessageType::IcnProposal),
            "access_type" => Ok(MessageType::AccessType),
            "system_address_list" => Ok(MessageType::SystemAddressList),
            "qos_relay_test" => Ok(MessageType::QosRelayTest),
            other => Err(RelayError::Validation(format!(
                "unsupported message type: {other}"
            ))),
        }
    }
}

/// Answer to an access type query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTypeResponse {
    pub direct_access: bool,
}

/// Answer to a system address list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAddressListResponse {
    pub addresses: Vec<String>,
}

/// Payload of a request, tagged with its kind.
///
/// Business DTOs stay opaque JSON; only the tag is interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    GsdPoll(Value),
    MultiGsdPoll(Value),
    IcnProposal(Value),
    AccessType,
    SystemAddressList,
    QosRelayTest(Value),
}

impl RequestPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            RequestPayload::GsdPoll(_) => MessageType::GsdPoll,
            RequestPayload::MultiGsdPoll(_) => MessageType::MultiGsdPoll,
            RequestPayload::IcnProposal(_) => MessageType::IcnProposal,
            RequestPayload::AccessType => MessageType::AccessType,
            RequestPayload::SystemAddressList => MessageType::SystemAddressList,
            RequestPayload::QosRelayTest(_) => MessageType::QosRelayTest,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RequestPayload::GsdPoll(body)
            | RequestPayload::MultiGsdPoll(body)
            | RequestPayload::IcnProposal(body)
            | RequestPayload::QosRelayTest(body) => body.clone(),
            RequestPayload::AccessType | RequestPayload::SystemAddressList => Value::Null,
        }
    }

    /// Rebuild a payload from the JSON text carried under `message_type`.
    pub fn from_json(message_type: MessageType, json: &str) -> RelayResult<Self> {
        let body: Value = serde_json::from_str(json)
            .map_err(|e| RelayError::Validation(format!("malformed {message_type} request: {e}")))?;

        match message_type {
            MessageType::GsdPoll => Ok(RequestPayload::GsdPoll(body)),
            MessageType::MultiGsdPoll => Ok(RequestPayload::MultiGsdPoll(body)),
            MessageType::IcnProposal => Ok(RequestPayload::IcnProposal(body)),
            MessageType::AccessType => Ok(RequestPayload::AccessType),
            MessageType::SystemAddressList => Ok(RequestPayload::SystemAddressList),
            MessageType::QosRelayTest => Ok(RequestPayload::QosRelayTest(body)),
            MessageType::Ack => Err(RelayError::Validation(
                "ack is not a request message type".to_string(),
            )),
        }
    }
}

/// Payload of a response, tagged with the kind of request it answers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    GsdPoll(Value),
    MultiGsdPoll(Value),
    IcnProposal(Value),
    AccessType(AccessTypeResponse),
    SystemAddressList(SystemAddressListResponse),
    QosRelayTest(Value),
}

impl ResponsePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            ResponsePayload::GsdPoll(_) => MessageType::GsdPoll,
            ResponsePayload::MultiGsdPoll(_) => MessageType::MultiGsdPoll,
            ResponsePayload::IcnProposal(_) => MessageType::IcnProposal,
            ResponsePayload::AccessType(_) => MessageType::AccessType,
            ResponsePayload::SystemAddressList(_) => MessageType::SystemAddressList,
            ResponsePayload::QosRelayTest(_) => MessageType::QosRelayTest,
        }
    }

    pub fn to_json(&self) -> RelayResult<Value> {
        let value = match self {
            ResponsePayload::GsdPoll(body)
            | ResponsePayload::MultiGsdPoll(body)
            | ResponsePayload::IcnProposal(body)
            | ResponsePayload::QosRelayTest(body) => body.clone(),
            ResponsePayload::AccessType(dto) => serde_json::to_value(dto)
                .map_err(|e| RelayError::Crypto(format!("payload serialization failed: {e}")))?,
            ResponsePayload::SystemAddressList(dto) => serde_json::to_value(dto)
                .map_err(|e| RelayError::Crypto(format!("payload serialization failed: {e}")))?,
        };
        Ok(value)
    }

    pub fn from_json(message_type: MessageType, json: &str) -> RelayResult<Self> {
        let malformed =
            |e: serde_json::Error| RelayError::Validation(format!("malformed {message_type} response: {e}"));

        match message_type {
            MessageType::GsdPoll => Ok(ResponsePayload::GsdPoll(serde_json::from_str(json).map_err(malformed)?)),
            MessageType::MultiGsdPoll => Ok(ResponsePayload::MultiGsdPoll(
                serde_json::from_str(json).map_err(malformed)?,
            )),
            MessageType::IcnProposal => Ok(ResponsePayload::IcnProposal(
                serde_json::from_str(json).map_err(malformed)?,
            )),
            MessageType::AccessType => Ok(ResponsePayload::AccessType(
                serde_json::from_str(json).map_err(malformed)?,
            )),
            MessageType::SystemAddressList => Ok(ResponsePayload::SystemAddressList(
                serde_json::from_str(json).map_err(malformed)?,
            )),
            MessageType::QosRelayTest => Ok(ResponsePayload::QosRelayTest(
                serde_json::from_str(json).map_err(malformed)?,
            )),
            MessageType::Ack => Err(RelayError::Validation(
                "ack is not a response message type".to_string(),
            )),
        }
    }
}

/// Error descriptor sent in place of a response when the remote side failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorWrapper {
    error: bool,
    pub error_message: String,
    pub error_code: u16,
    pub exception_type: RemoteErrorKind,
    pub origin: String,
}

impl ErrorWrapper {
    pub fn new(
        exception_type: RemoteErrorKind,
        error_code: u16,
        error_message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            error: true,
            error_message: error_message.into(),
            error_code,
            exception_type,
            origin: origin.into(),
        }
    }

    /// Detect the error marker in a decoded payload.
    ///
    /// `"error": true` alone marks the payload as an error. Kinds this side
    /// does not know become `Generic`; a marked payload missing the other
    /// fields is a validation error, never a response.
    pub fn detect(payload: &str) -> RelayResult<Option<Self>> {
        let Ok(mut value) = serde_json::from_str::<Value>(payload) else {
            return Ok(None);
        };
        if value.get("error").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }

        let kind = value
            .get("exceptionType")
            .cloned()
            .and_then(|kind| serde_json::from_value::<RemoteErrorKind>(kind).ok())
            .unwrap_or(RemoteErrorKind::Generic);
        if let Some(fields) = value.as_object_mut() {
            fields.insert("exceptionType".to_string(), Value::String(kind.to_string()));
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RelayError::Validation(format!("malformed error wrapper: {e}")))
    }

    pub fn into_error(self) -> RelayError {
        RelayError::Remote {
            kind: self.exception_type,
            code: self.error_code,
            message: self.error_message,
            origin: self.origin,
        }
    }
}

/// Advertisement record published on the shared topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementRecord {
    #[serde(rename = "senderCN")]
    pub sender_cn: String,
    #[serde(rename = "senderPublicKey")]
    pub sender_public_key: String,
    #[serde(rename = "recipientCN")]
    pub recipient_cn: String,
    /// Session id signed by the sender and sealed for the recipient.
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl AdvertisementRecord {
    pub fn to_json(&self) -> RelayResult<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Validation(format!("advertisement serialization failed: {e}")))
    }

    pub fn from_json(json: &str) -> RelayResult<Self> {
        let record: Self = serde_json::from_str(json)
            .map_err(|e| RelayError::Validation(format!("malformed advertisement: {e}")))?;

        if record.sender_cn.is_empty() || record.recipient_cn.is_empty() || record.session_id.is_empty() {
            return Err(RelayError::Validation(
                "advertisement has empty fields".to_string(),
            ));
        }
        Ok(record)
    }
}
