//! Signaling-Envelopes
//!
//! Wire-Format auf dem Relay:
//! `{ type, target, conversationId, data }`, optional mit `from` und
//! `sessionId`. Der Relay interpretiert den Inhalt nicht.

use crate::call_engine::{CallMode, ConversationId, ParticipantId, SessionId};
use crate::peer::CandidateDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: EnvelopeType, reason: String },

    #[error("Invalid envelope JSON: {0}")]
    Json(String),

    #[error("Envelope has no target")]
    MissingTarget,
}

// ============================================================================
// ENVELOPE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    CallStart,
    CallEnd,
    Offer,
    Answer,
    IceCandidate,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::CallStart => "call-start",
            EnvelopeType::CallEnd => "call-end",
            EnvelopeType::Offer => "offer",
            EnvelopeType::Answer => "answer",
            EnvelopeType::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = EnvelopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "call-start" => Ok(EnvelopeType::CallStart),
            "call-end" => Ok(EnvelopeType::CallEnd),
            "offer" => Ok(EnvelopeType::Offer),
            "answer" => Ok(EnvelopeType::Answer),
            "ice-candidate" => Ok(EnvelopeType::IceCandidate),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

/// `data` von `call-start` / `call-end`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallTypeData {
    call_type: CallMode,
}

/// `data` von `offer` / `answer`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpData {
    sdp: String,
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Envelope wie es über den Relay läuft
///
/// `type` bleibt ein String, damit unbekannte Typen geparst und
/// anschließend verworfen werden können.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub target: String,
    pub conversation_id: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SignalingEnvelope {
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    /// Baut das Envelope für ein typisiertes Signal
    pub fn encode(signal: &Signal) -> Self {
        Self {
            kind: signal.payload.envelope_type().as_str().to_string(),
            target: signal.target.to_string(),
            conversation_id: signal.conversation_id.0,
            data: signal.payload.to_data(),
            from: signal.from.as_ref().map(|f| f.to_string()),
            session_id: signal.session_id.map(|s| s.to_string()),
        }
    }

    /// Prüft Typ und Payload
    pub fn decode(&self) -> Result<Signal, EnvelopeError> {
        let kind: EnvelopeType = self.kind.parse()?;
        if self.target.is_empty() {
            return Err(EnvelopeError::MissingTarget);
        }

        let payload = SignalPayload::from_data(kind, &self.data)?;

        Ok(Signal {
            conversation_id: ConversationId(self.conversation_id),
            from: self
                .from
                .as_deref()
                .filter(|f| !f.is_empty())
                .map(ParticipantId::new),
            target: ParticipantId::new(self.target.clone()),
            session_id: self.session_id.as_deref().and_then(SessionId::parse),
            payload,
        })
    }
}

// ============================================================================
// TYPED SIGNALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    CallStart { mode: CallMode },
    CallEnd { mode: CallMode },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(CandidateDescriptor),
}

impl SignalPayload {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            SignalPayload::CallStart { .. } => EnvelopeType::CallStart,
            SignalPayload::CallEnd { .. } => EnvelopeType::CallEnd,
            SignalPayload::Offer { .. } => EnvelopeType::Offer,
            SignalPayload::Answer { .. } => EnvelopeType::Answer,
            SignalPayload::IceCandidate(_) => EnvelopeType::IceCandidate,
        }
    }

    fn to_data(&self) -> Value {
        let data = match self {
            SignalPayload::CallStart { mode } | SignalPayload::CallEnd { mode } => {
                serde_json::to_value(CallTypeData { call_type: *mode })
            }
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => {
                serde_json::to_value(SdpData { sdp: sdp.clone() })
            }
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate),
        };
        // Diese Structs serialisieren immer
        data.unwrap_or(Value::Null)
    }

    fn from_data(kind: EnvelopeType, data: &Value) -> Result<Self, EnvelopeError> {
        let malformed = |e: serde_json::Error| EnvelopeError::MalformedPayload {
            kind,
            reason: e.to_string(),
        };

        let payload = match kind {
            EnvelopeType::CallStart => {
                let data: CallTypeData = serde_json::from_value(data.clone()).map_err(malformed)?;
                SignalPayload::CallStart {
                    mode: data.call_type,
                }
            }
            EnvelopeType::CallEnd => {
                let data: CallTypeData = serde_json::from_value(data.clone()).map_err(malformed)?;
                SignalPayload::CallEnd {
                    mode: data.call_type,
                }
            }
            EnvelopeType::Offer => {
                let data: SdpData = serde_json::from_value(data.clone()).map_err(malformed)?;
                SignalPayload::Offer { sdp: data.sdp }
            }
            EnvelopeType::Answer => {
                let data: SdpData = serde_json::from_value(data.clone()).map_err(malformed)?;
                SignalPayload::Answer { sdp: data.sdp }
            }
            EnvelopeType::IceCandidate => SignalPayload::IceCandidate(
                serde_json::from_value(data.clone()).map_err(malformed)?,
            ),
        };
        Ok(payload)
    }
}

/// Dekodiertes Envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub conversation_id: ConversationId,
    pub from: Option<ParticipantId>,
    pub target: ParticipantId,
    pub session_id: Option<SessionId>,
    pub payload: SignalPayload,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_start_wire_shape() {
        let signal = Signal {
            conversation_id: ConversationId(42),
            from: Some(ParticipantId::new("U1")),
            target: ParticipantId::new("U2"),
            session_id: None,
            payload: SignalPayload::CallStart {
                mode: CallMode::Voice,
            },
        };

        let json: Value = serde_json::from_str(&SignalingEnvelope::encode(&signal).to_json().unwrap())
            .unwrap();
        assert_eq!(
            json,
            json!({
                "type": "call-start",
                "target": "U2",
                "conversationId": 42,
                "data": { "callType": "voice" },
                "from": "U1"
            })
        );
    }

    #[test]
    fn test_decode_ice_candidate() {
        let envelope = SignalingEnvelope::from_json(
            r#"{"type":"ice-candidate","target":"U1","conversationId":3,
                "data":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        let signal = envelope.decode().unwrap();
        match signal.payload {
            SignalPayload::IceCandidate(candidate) => {
                assert_eq!(candidate.candidate, "candidate:1");
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(signal.conversation_id, ConversationId(3));
        assert!(signal.from.is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let envelope = SignalingEnvelope::from_json(
            r#"{"type":"typing","target":"U1","conversationId":3,"data":{}}"#,
        )
        .unwrap();

        assert_eq!(
            envelope.decode().unwrap_err(),
            EnvelopeError::UnknownType("typing".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let envelope = SignalingEnvelope::from_json(
            r#"{"type":"offer","target":"U1","conversationId":3,"data":{"sdp":17}}"#,
        )
        .unwrap();
        assert!(matches!(
            envelope.decode(),
            Err(EnvelopeError::MalformedPayload {
                kind: EnvelopeType::Offer,
                ..
            })
        ));

        let envelope = SignalingEnvelope::from_json(
            r#"{"type":"call-start","target":"U1","conversationId":3,"data":{"callType":"fax"}}"#,
        )
        .unwrap();
        assert!(envelope.decode().is_err());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(matches!(
            SignalingEnvelope::from_json("not json"),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn test_session_tag_survives_encoding() {
        let session = SessionId::new();
        let signal = Signal {
            conversation_id: ConversationId(1),
            from: Some(ParticipantId::new("U1")),
            target: ParticipantId::new("U2"),
            session_id: Some(session),
            payload: SignalPayload::Answer {
                sdp: "v=0".to_string(),
            },
        };

        let decoded = SignalingEnvelope::encode(&signal).decode().unwrap();
        assert_eq!(decoded, signal);
    }
}
