use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;
use crate::types::ParticipantId;

pub const WS_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

const KNOWN_TYPES: [&str; 5] = ["init", "new-peer", "offer", "answer", "ice-candidate"];

/// Control messages the relay delivers to a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Init {
        id: ParticipantId,
        #[serde(rename = "otherClientIds", default)]
        other_client_ids: Vec<ParticipantId>,
    },
    NewPeer {
        id: ParticipantId,
    },
    Offer {
        sender: ParticipantId,
        #[serde(default)]
        target: Option<ParticipantId>,
        signal: Value,
    },
    Answer {
        sender: ParticipantId,
        #[serde(default)]
        target: Option<ParticipantId>,
        signal: Value,
    },
    IceCandidate {
        sender: ParticipantId,
        #[serde(default)]
        target: Option<ParticipantId>,
        candidate: Value,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Init { .. } => "init",
            SignalingMessage::NewPeer { .. } => "new-peer",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// The remote participant a negotiation message came from.
    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            SignalingMessage::Offer { sender, .. }
            | SignalingMessage::Answer { sender, .. }
            | SignalingMessage::IceCandidate { sender, .. } => Some(sender),
            SignalingMessage::Init { .. } | SignalingMessage::NewPeer { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), ParseError> {
        let invalid = |reason: &str| ParseError::Invalid {
            kind: self.kind().to_string(),
            reason: reason.to_string(),
        };
        match self {
            SignalingMessage::Init {
                id,
                other_client_ids,
            } => {
                if id.is_empty() {
                    return Err(invalid("empty id"));
                }
                if other_client_ids.iter().any(ParticipantId::is_empty) {
                    return Err(invalid("empty peer id"));
                }
            }
            SignalingMessage::NewPeer { id } => {
                if id.is_empty() {
                    return Err(invalid("empty id"));
                }
            }
            SignalingMessage::Offer { sender, signal, .. }
            | SignalingMessage::Answer { sender, signal, .. } => {
                if sender.is_empty() {
                    return Err(invalid("empty sender"));
                }
                if signal.is_null() {
                    return Err(invalid("missing signal"));
                }
            }
            SignalingMessage::IceCandidate {
                sender, candidate, ..
            } => {
                if sender.is_empty() {
                    return Err(invalid("empty sender"));
                }
                if candidate.is_null() {
                    return Err(invalid("missing candidate"));
                }
            }
        }
        Ok(())
    }
}

/// Negotiation frames this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundSignal {
    Offer {
        sender: ParticipantId,
        target: ParticipantId,
        signal: Value,
    },
    Answer {
        sender: ParticipantId,
        target: ParticipantId,
        signal: Value,
    },
    IceCandidate {
        sender: ParticipantId,
        target: ParticipantId,
        candidate: Value,
    },
}

impl OutboundSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn target(&self) -> &ParticipantId {
        match self {
            OutboundSignal::Offer { target, .. }
            | OutboundSignal::Answer { target, .. }
            | OutboundSignal::IceCandidate { target, .. } => target,
        }
    }
}

pub fn encode(msg: &OutboundSignal) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

fn check_size(kind: &str, len: usize) -> Result<(), ParseError> {
    if len > WS_MAX_MESSAGE_BYTES {
        return Err(ParseError::Invalid {
            kind: kind.into(),
            reason: format!("frame of {len} bytes exceeds limit"),
        });
    }
    Ok(())
}

/// Parse one text frame. Anything outside the known tag set is rejected.
pub fn decode_text(raw: &str) -> Result<SignalingMessage, ParseError> {
    check_size("text", raw.len())?;
    let value: Value = serde_json::from_str(raw)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingType)?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(ParseError::UnknownType(tag.to_string()));
    }
    let kind = tag.to_string();
    let msg: SignalingMessage =
        serde_json::from_value(value).map_err(|e| ParseError::Invalid {
            kind,
            reason: e.to_string(),
        })?;
    msg.validate()?;
    Ok(msg)
}

/// Binary frames are treated as UTF-8 JSON.
pub fn decode_binary(raw: &[u8]) -> Result<SignalingMessage, ParseError> {
    check_size("binary", raw.len())?;
    let txt = std::str::from_utf8(raw).map_err(|_| ParseError::NotUtf8)?;
    decode_text(txt)
}
