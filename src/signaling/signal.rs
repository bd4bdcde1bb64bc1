//! Signal-Typen für das Mailbox-Protokoll
//!
//! Ein Signal ist eine einzelne Handshake- oder Kontroll-Nachricht
//! (Offer, Answer, ICE-Candidate, Decline, End-Call), adressiert von
//! einem Teilnehmer an einen anderen für einen bestimmten Anruf.
//! Gespeichert wird es als Zeile in der Mailbox; `call_id` korreliert
//! alle Signale eines Anrufversuchs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// SIGNAL TYPE
// ============================================================================

/// Signal-Art ohne Payload (entspricht der `signal_type`-Spalte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Decline,
    EndCall,
}

impl SignalType {
    /// Stabiler Tag für Speicherung und Filter
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
            SignalType::Decline => "decline",
            SignalType::EndCall => "end-call",
        }
    }

    /// Feste Dispatch-Priorität: Offer/Answer vor ICE, Kontroll-Signale zuletzt.
    /// Der Poller sortiert jeden Batch danach, damit Verhandlungs-Nachrichten
    /// nie hinter Candidate-Daten verhungern.
    pub fn priority(&self) -> u8 {
        match self {
            SignalType::Offer => 0,
            SignalType::Answer => 1,
            SignalType::IceCandidate => 2,
            SignalType::Decline | SignalType::EndCall => 3,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Alle Signal-Arten mit ihren spezifischen Payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP Offer vom Anrufer
    Offer { sdp: String },

    /// SDP Answer vom Angerufenen
    Answer { sdp: String },

    /// ICE Candidate (JSON-serialisiert, Format der Negotiation-Engine)
    IceCandidate { candidate: String },

    /// Anruf abgelehnt
    Decline,

    /// Anruf beendet (normales Auflegen)
    EndCall,
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalPayload::Offer { .. } => SignalType::Offer,
            SignalPayload::Answer { .. } => SignalType::Answer,
            SignalPayload::IceCandidate { .. } => SignalType::IceCandidate,
            SignalPayload::Decline => SignalType::Decline,
            SignalPayload::EndCall => SignalType::EndCall,
        }
    }
}

// ============================================================================
// SIGNAL RECORD
// ============================================================================

/// Eine Mailbox-Zeile: ein zugestelltes Signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Eindeutige, unveränderliche ID (UUID v4)
    pub id: String,
    pub call_id: String,
    pub from_peer: String,
    pub to_peer: String,
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
}

/// Neues Signal ohne ID und Timestamp (für INSERT)
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub call_id: String,
    pub from_peer: String,
    pub to_peer: String,
    pub payload: SignalPayload,
}

impl NewSignal {
    pub fn offer(
        call_id: impl Into<String>,
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
        sdp: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload: SignalPayload::Offer { sdp: sdp.into() },
        }
    }

    pub fn answer(
        call_id: impl Into<String>,
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
        sdp: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload: SignalPayload::Answer { sdp: sdp.into() },
        }
    }

    pub fn ice_candidate(
        call_id: impl Into<String>,
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload: SignalPayload::IceCandidate {
                candidate: candidate.into(),
            },
        }
    }

    pub fn decline(
        call_id: impl Into<String>,
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload: SignalPayload::Decline,
        }
    }

    pub fn end_call(
        call_id: impl Into<String>,
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload: SignalPayload::EndCall,
        }
    }
}

/// Erzeugt eine neue Call-ID (vom Anrufer generiert, vom Angerufenen
/// übernommen, damit alle Signale eines Versuchs korrelierbar sind)
pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut types = vec![
            SignalType::EndCall,
            SignalType::IceCandidate,
            SignalType::Answer,
            SignalType::Decline,
            SignalType::Offer,
        ];
        types.sort_by_key(|t| t.priority());
        assert_eq!(types[0], SignalType::Offer);
        assert_eq!(types[1], SignalType::Answer);
        assert_eq!(types[2], SignalType::IceCandidate);
    }

    #[test]
    fn test_payload_tag_roundtrip() {
        let payload = SignalPayload::Offer {
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"offer\""));
        let back: SignalPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.signal_type(), SignalType::Offer);
    }

    #[test]
    fn test_unit_payloads_have_no_data() {
        let json = serde_json::to_string(&SignalPayload::Decline).unwrap();
        assert_eq!(json, r#"{"type":"decline"}"#);
        assert_eq!(SignalType::EndCall.as_str(), "end-call");
    }

    #[test]
    fn test_call_id_is_unique() {
        assert_ne!(generate_call_id(), generate_call_id());
        assert!(generate_call_id().starts_with("call_"));
    }
}
