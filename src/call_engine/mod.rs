//! Call Engine - Anrufaufbau und Medienverhandlung
//!
//! Kernstück des Anruf-Stacks:
//! - `engine`: Abstraktion über die Verhandlungs-Engine (Trait + Events)
//! - `webrtc`: Produktions-Engine auf Basis von webrtc-rs
//! - `sim`: deterministische In-Process-Engine für Tests
//! - `session`: Zustandsmaschine eines einzelnen Anrufversuchs
//! - `detector`: Mailbox-Überwachung auf eingehende Anrufe

pub mod engine;
pub mod session;
pub mod sim;
pub mod webrtc;

pub(crate) mod detector;

pub use engine::{EngineError, EngineEvent, EngineFactory, NegotiationEngine};
pub use session::{CallEvent, CallRole, EndReason, SessionState};
pub use sim::{SimEngine, SimEngineConfig, SimEngineFactory};
pub use webrtc::{WebRtcEngine, WebRtcEngineFactory};
