//! Negotiation-Engine Abstraktion
//!
//! Die Engine ist der externe Medien-Stack, der nach dem Austausch von
//! Descriptions und Candidates den direkten Audio/Video-Pfad aufbaut.
//! Die Session steuert sie nur über diese Schnittstelle; ob dahinter die
//! echte WebRTC-Implementierung oder die Simulation steckt, ist ihr egal.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Kamera/Mikrofon nicht verfügbar oder verweigert (fatal, vor dem
    /// ersten Signal)
    #[error("Media access denied: {0}")]
    MediaAccess(String),

    #[error("WebRTC error: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Events, die die Engine zurück in die Session meldet
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lokal gesammelter ICE Candidate (JSON-serialisiert)
    IceCandidate { candidate: String },

    /// Verbindung steht. Kann sowohl vom Connection-State als auch vom
    /// ICE-State ausgelöst werden; die Session nimmt den Übergang nur einmal.
    Connected,

    /// Verbindungsaufbau fehlgeschlagen oder Verbindung abgerissen
    Failed { reason: String },

    /// Remote-Medien (Track/Stream) eingetroffen
    RemoteMedia,
}

// ============================================================================
// ENGINE TRAIT
// ============================================================================

/// Eine Peer-Verbindung für genau einen Anrufversuch
///
/// `create_offer`/`create_answer` setzen die erzeugte Description auch
/// als Local Description und geben das SDP zurück.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<String, EngineError>;

    async fn create_answer(&self) -> Result<String, EngineError>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), EngineError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), EngineError>;

    /// Mikrofon stumm schalten / aktivieren
    fn set_audio_enabled(&self, enabled: bool);

    /// Kamera aus- / einschalten
    fn set_video_enabled(&self, enabled: bool);

    /// Schließt die Verbindung und gibt die lokalen Medien frei
    async fn close(&self);

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

// ============================================================================
// ENGINE FACTORY
// ============================================================================

/// Erzeugt pro Anrufversuch eine frische Engine
///
/// Die Medien-Akquise passiert hier: schlägt sie fehl, entsteht gar keine
/// Session und es wird kein Signal in die Mailbox geschrieben.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_engine(&self) -> Result<Arc<dyn NegotiationEngine>, EngineError>;
}
