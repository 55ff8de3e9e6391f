//! Wire format for call signaling.
//!
//! Every message travelling through a mailbox is a [`WireMessage`]:
//! `{ "type": ..., "data": ..., "from": ..., "to": ... }`. The signaling
//! channel classifies those into typed [`SignalingMessage`] values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_CANDIDATE: &str = "candidate";
pub const TYPE_CALL_REQUEST: &str = "call-request";
pub const TYPE_CALL_ACCEPTED: &str = "call-accepted";
pub const TYPE_CALL_REJECTED: &str = "call-rejected";
pub const TYPE_END_CALL: &str = "end-call";

/// Opaque name of a mailbox. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::EmptyEndpoint);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random endpoint id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EndpointId::new(value)
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

impl std::str::FromStr for EndpointId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointId::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// One half of an offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Answer,
        }
    }
}

/// A single network-path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

/// Raw message as it is stored in (and read from) a mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub from: String,
    pub to: String,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Typed signaling payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    CallRequest,
    CallAccepted,
    CallRejected,
    EndCall,
}

impl SignalingMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => TYPE_OFFER,
            SignalingMessage::Answer(_) => TYPE_ANSWER,
            SignalingMessage::Candidate(_) => TYPE_CANDIDATE,
            SignalingMessage::CallRequest => TYPE_CALL_REQUEST,
            SignalingMessage::CallAccepted => TYPE_CALL_ACCEPTED,
            SignalingMessage::CallRejected => TYPE_CALL_REJECTED,
            SignalingMessage::EndCall => TYPE_END_CALL,
        }
    }
}

/// A typed message together with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: EndpointId,
    pub to: String,
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(from: EndpointId, to: &EndpointId, message: SignalingMessage) -> Self {
        Self {
            from,
            to: to.as_str().to_string(),
            message,
        }
    }

    pub fn into_wire(self) -> Result<WireMessage, ProtocolError> {
        let data = match &self.message {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                Some(serde_json::to_value(desc)?)
            }
            SignalingMessage::Candidate(candidate) => Some(serde_json::to_value(candidate)?),
            SignalingMessage::CallRequest
            | SignalingMessage::CallAccepted
            | SignalingMessage::CallRejected
            | SignalingMessage::EndCall => None,
        };
        Ok(WireMessage {
            kind: self.message.type_name().to_string(),
            data,
            from: self.from.into(),
            to: self.to,
        })
    }
}

/// Project a raw wire message into a typed envelope.
///
/// Pure: the same input always classifies the same way. `to` is carried
/// through untouched since delivery already implies the recipient.
pub fn classify(wire: WireMessage) -> Result<Envelope, ProtocolError> {
    let from = EndpointId::new(wire.from).map_err(|_| ProtocolError::MissingSender)?;
    let message = match wire.kind.as_str() {
        TYPE_OFFER => SignalingMessage::Offer(description(wire.data, SdpType::Offer)?),
        TYPE_ANSWER => SignalingMessage::Answer(description(wire.data, SdpType::Answer)?),
        TYPE_CANDIDATE => {
            let data = wire.data.ok_or(ProtocolError::MissingPayload(TYPE_CANDIDATE))?;
            SignalingMessage::Candidate(serde_json::from_value(data)?)
        }
        TYPE_CALL_REQUEST => SignalingMessage::CallRequest,
        TYPE_CALL_ACCEPTED => SignalingMessage::CallAccepted,
        TYPE_CALL_REJECTED => SignalingMessage::CallRejected,
        TYPE_END_CALL => SignalingMessage::EndCall,
        other => return Err(ProtocolError::UnknownType(other.to_string())),
    };
    Ok(Envelope {
        from,
        to: wire.to,
        message,
    })
}

fn description(data: Option<Value>, expected: SdpType) -> Result<SessionDescription, ProtocolError> {
    let name = match expected {
        SdpType::Offer => TYPE_OFFER,
        SdpType::Answer => TYPE_ANSWER,
    };
    let data = data.ok_or(ProtocolError::MissingPayload(name))?;
    let desc: SessionDescription = serde_json::from_value(data)?;
    if desc.kind != expected {
        return Err(ProtocolError::PolarityMismatch {
            message: name,
            found: desc.kind,
        });
    }
    Ok(desc)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("endpoint id must not be empty")]
    EmptyEndpoint,
    #[error("message has no sender")]
    MissingSender,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{0} message carries no payload")]
    MissingPayload(&'static str),
    #[error("{message} message carries a {found:?} description")]
    PolarityMismatch {
        message: &'static str,
        found: SdpType,
    },
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(value: &str) -> EndpointId {
        EndpointId::new(value).unwrap()
    }

    #[test_timeout::timeout]
    fn offer_serializes_to_documented_wire_shape() {
        let wire = Envelope::new(
            id("alice"),
            &id("bob"),
            SignalingMessage::Offer(SessionDescription::offer("v=0")),
        )
        .into_wire()
        .unwrap();
        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "data": { "sdp": "v=0", "type": "offer" },
                "from": "alice",
                "to": "bob",
            })
        );
    }

    #[test_timeout::timeout]
    fn candidate_uses_camel_case_correlation_fields() {
        let raw = json!({
            "type": "candidate",
            "data": { "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0 },
            "from": "bob",
            "to": "alice",
        });
        let wire: WireMessage = serde_json::from_value(raw).unwrap();
        let envelope = classify(wire).unwrap();
        match envelope.message {
            SignalingMessage::Candidate(candidate) => {
                assert_eq!(candidate.sdp_mid, "0");
                assert_eq!(candidate.sdp_mline_index, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(envelope.from, id("bob"));
    }

    #[test_timeout::timeout]
    fn control_messages_carry_null_data() {
        let wire = Envelope::new(id("a"), &id("b"), SignalingMessage::EndCall)
            .into_wire()
            .unwrap();
        assert_eq!(wire.kind, "end-call");
        assert!(wire.data.is_none());
        let text = wire.to_json().unwrap();
        assert!(text.contains("\"data\":null"));
    }

    #[test_timeout::timeout]
    fn unknown_types_are_rejected() {
        let wire = WireMessage {
            kind: "ride-request".into(),
            data: None,
            from: "a".into(),
            to: "b".into(),
        };
        assert!(matches!(classify(wire), Err(ProtocolError::UnknownType(t)) if t == "ride-request"));
    }

    #[test_timeout::timeout]
    fn empty_sender_is_rejected() {
        let wire = WireMessage {
            kind: TYPE_END_CALL.into(),
            data: None,
            from: " ".into(),
            to: "b".into(),
        };
        assert!(matches!(classify(wire), Err(ProtocolError::MissingSender)));
    }

    #[test_timeout::timeout]
    fn answer_with_offer_polarity_is_rejected() {
        let wire = WireMessage {
            kind: TYPE_ANSWER.into(),
            data: Some(json!({ "sdp": "v=0", "type": "offer" })),
            from: "a".into(),
            to: "b".into(),
        };
        assert!(matches!(
            classify(wire),
            Err(ProtocolError::PolarityMismatch { .. })
        ));
    }

    #[test_timeout::timeout]
    fn offer_without_payload_is_rejected() {
        let wire = WireMessage {
            kind: TYPE_OFFER.into(),
            data: None,
            from: "a".into(),
            to: "b".into(),
        };
        assert!(matches!(
            classify(wire),
            Err(ProtocolError::MissingPayload("offer"))
        ));
    }

    #[test_timeout::timeout]
    fn endpoint_id_rejects_empty_strings() {
        assert!(EndpointId::new("").is_err());
        assert!(serde_json::from_value::<EndpointId>(json!("")).is_err());
        assert_eq!(EndpointId::generate().as_str().len(), 36);
    }
}
