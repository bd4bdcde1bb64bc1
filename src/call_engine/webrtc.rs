//! WebRTC-Implementierung der Negotiation-Engine
//!
//! Treibt eine `RTCPeerConnection` aus dem `webrtc`-Crate: Offer/Answer,
//! Candidate-Sammlung und die beiden Verbindungs-Status-Callbacks.
//! Connection-State und ICE-State melden beide `Connected`; welcher
//! zuerst feuert, hängt vom Netz ab.

use super::engine::{EngineError, EngineEvent, EngineFactory, NegotiationEngine};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt WebRTC-Engines mit fester ICE-Server-Konfiguration
pub struct WebRtcEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Fügt optionale TURN-Server Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create_engine(&self) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        let engine = WebRtcEngine::new(self.ice_servers.clone()).await?;
        Ok(Arc::new(engine))
    }
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    event_tx: broadcast::Sender<EngineEvent>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl WebRtcEngine {
    async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, EngineError> {
        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Negotiation(e.to_string()))?,
        );

        // Lokale Tracks anlegen entspricht der Medien-Akquise; Fehler hier
        // bedeuten kein Zugriff auf Capture
        Self::add_local_tracks(&pc).await?;

        let (event_tx, _) = broadcast::channel(100);
        let engine = Self {
            pc,
            event_tx,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        };
        engine.setup_peer_connection_handlers().await;

        Ok(engine)
    }

    async fn add_local_tracks(pc: &Arc<RTCPeerConnection>) -> Result<(), EngineError> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "popcall".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::MediaAccess(e.to_string()))?;

        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "popcall".to_string(),
        ));

        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::MediaAccess(e.to_string()))?;

        Ok(())
    }

    async fn setup_peer_connection_handlers(&self) {
        let pc = Arc::clone(&self.pc);

        // Connection State Handler
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            match s {
                RTCPeerConnectionState::Connected => {
                    let _ = event_tx.send(EngineEvent::Connected);
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    let _ = event_tx.send(EngineEvent::Failed {
                        reason: format!("peer connection {s}"),
                    });
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        // ICE Connection State Handler; gleichwertiger Connected-Trigger
        let event_tx = self.event_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            tracing::debug!("ICE connection state: {:?}", s);

            match s {
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    let _ = event_tx.send(EngineEvent::Connected);
                }
                RTCIceConnectionState::Failed => {
                    let _ = event_tx.send(EngineEvent::Failed {
                        reason: "ice connection failed".to_string(),
                    });
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = event_tx.send(EngineEvent::IceCandidate {
                            candidate: candidate_str,
                        });
                    }
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Remote-Medien)
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
                let _ = event_tx.send(EngineEvent::RemoteMedia);
            })
        }));
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<String, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), EngineError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), EngineError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    fn set_audio_enabled(&self, enabled: bool) {
        // Dieses Backend hat noch keine Capture-Pipeline, die RTP in die
        // Tracks schreibt; der Zustand wird nur vorgemerkt.
        // TODO: beim Anbinden einer Capture-Quelle das Flag vor jedem
        // Sample-Write prüfen, damit Mute das Senden tatsächlich pausiert
        self.audio_enabled.store(enabled, Ordering::Relaxed);
        tracing::debug!("Audio {}", if enabled { "enabled" } else { "muted" });
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
        tracing::debug!("Video {}", if enabled { "enabled" } else { "disabled" });
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("audio_enabled", &self.audio_enabled.load(Ordering::Relaxed))
            .field("video_enabled", &self.video_enabled.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
