//! Simulierte Negotiation-Engine
//!
//! Deterministischer Ersatz für den WebRTC-Stack: sammelt konfigurierte
//! Candidates sobald eine Local Description existiert, meldet `Connected`
//! sobald beide Descriptions gesetzt sind und protokolliert jeden
//! angewendeten Candidate. Damit lässt sich die komplette Signal-Logik
//! ohne Medien-Hardware und ohne Netz testen.

use super::engine::{EngineError, EngineEvent, EngineFactory, NegotiationEngine};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SimEngineConfig {
    /// Simuliert verweigerte Kamera/Mikrofon-Berechtigung: die Factory
    /// liefert `MediaAccess` statt einer Engine
    pub deny_media: bool,

    /// Candidates, die die Engine nach der Local Description "sammelt"
    pub local_candidates: Vec<String>,

    /// Künstliche Dauer der Medien-Akquise; macht das Zeitfenster zwischen
    /// Slot-Reservierung und Engine-Erzeugung in Tests greifbar
    pub create_delay: Duration,
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt Sim-Engines und behält sie für Test-Inspektion
pub struct SimEngineFactory {
    config: SimEngineConfig,
    created: Mutex<Vec<Arc<SimEngine>>>,
}

impl SimEngineFactory {
    pub fn new(config: SimEngineConfig) -> Self {
        Self {
            config,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Alle bisher erzeugten Engines, in Erzeugungs-Reihenfolge
    pub fn engines(&self) -> Vec<Arc<SimEngine>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl EngineFactory for SimEngineFactory {
    async fn create_engine(&self) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        if !self.config.create_delay.is_zero() {
            tokio::time::sleep(self.config.create_delay).await;
        }

        if self.config.deny_media {
            return Err(EngineError::MediaAccess(
                "sim: camera/microphone permission denied".to_string(),
            ));
        }

        let engine = Arc::new(SimEngine::new(self.config.local_candidates.clone()));
        self.created.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}

// ============================================================================
// SIM ENGINE
// ============================================================================

#[derive(Debug, Default)]
struct SimState {
    local_description_set: bool,
    remote_description_set: bool,
    connected: bool,
    closed: bool,
    candidates_emitted: bool,
    remote_offers_applied: u32,
    applied_candidates: Vec<String>,
    audio_enabled: bool,
    video_enabled: bool,
}

pub struct SimEngine {
    state: Mutex<SimState>,
    local_candidates: Vec<String>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl SimEngine {
    fn new(local_candidates: Vec<String>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Mutex::new(SimState {
                audio_enabled: true,
                video_enabled: true,
                ..SimState::default()
            }),
            local_candidates,
            event_tx,
        }
    }

    /// Markiert die Local Description und stößt Candidate-Sammlung sowie
    /// gegebenenfalls den Connected-Übergang an
    fn on_local_description(&self) {
        let (emit_candidates, connected) = {
            let mut state = self.state.lock();
            state.local_description_set = true;
            let emit = !state.candidates_emitted && !self.local_candidates.is_empty();
            state.candidates_emitted = true;
            (emit, Self::check_connected(&mut state))
        };

        if emit_candidates {
            for candidate in &self.local_candidates {
                let _ = self.event_tx.send(EngineEvent::IceCandidate {
                    candidate: candidate.clone(),
                });
            }
        }
        if connected {
            let _ = self.event_tx.send(EngineEvent::Connected);
        }
    }

    fn on_remote_description(&self) {
        let connected = {
            let mut state = self.state.lock();
            state.remote_description_set = true;
            Self::check_connected(&mut state)
        };

        if connected {
            let _ = self.event_tx.send(EngineEvent::RemoteMedia);
            let _ = self.event_tx.send(EngineEvent::Connected);
        }
    }

    fn check_connected(state: &mut SimState) -> bool {
        if state.local_description_set && state.remote_description_set && !state.connected {
            state.connected = true;
            true
        } else {
            false
        }
    }

    // ========================================================================
    // TEST ACCESSORS
    // ========================================================================

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn remote_offers_applied(&self) -> u32 {
        self.state.lock().remote_offers_applied
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.lock().audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.state.lock().video_enabled
    }
}

#[async_trait]
impl NegotiationEngine for SimEngine {
    async fn create_offer(&self) -> Result<String, EngineError> {
        self.on_local_description();
        Ok("v=0 sim-offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        self.on_local_description();
        Ok("v=0 sim-answer".to_string())
    }

    async fn set_remote_offer(&self, _sdp: &str) -> Result<(), EngineError> {
        self.state.lock().remote_offers_applied += 1;
        self.on_remote_description();
        Ok(())
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<(), EngineError> {
        self.on_remote_description();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .applied_candidates
            .push(candidate.to_string());
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.state.lock().audio_enabled = enabled;
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.state.lock().video_enabled = enabled;
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimEngine")
            .field("connected", &state.connected)
            .field("closed", &state.closed)
            .field("applied_candidates", &state.applied_candidates.len())
            .finish()
    }
}
