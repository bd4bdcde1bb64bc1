//! Popcall - P2P-Videoanrufe über eine gepollte Signal-Mailbox
//!
//! Kein Signalisierungsserver mit Push-Kanal: beide Seiten tauschen
//! SDP und ICE-Candidates als Zeilen einer geteilten, persistenten
//! Mailbox aus, die im Sekundentakt gepollt wird. Zustellung ist
//! at-least-once; Konsumenten sind über ein Ledger verarbeiteter
//! Signal-IDs idempotent.
//!
//! Einstiegspunkt ist der [`CallManager`]: er betreibt den
//! Incoming-Call-Detector, erzwingt höchstens einen aktiven Anruf und
//! startet pro Anrufversuch eine [`call_engine::session`]-Zustands-
//! maschine mit eigener Verhandlungs-Engine (WebRTC in Produktion,
//! Simulation in Tests).

pub mod call_engine;
pub mod signaling;

use call_engine::detector::{self, DetectorParams};
use call_engine::session::{ActiveCall, CallSession, SessionCommand, SessionParams};
use call_engine::{CallEvent, CallRole, EndReason, EngineError, EngineFactory, SessionState};
use parking_lot::RwLock;
use signaling::{generate_call_id, MailboxError, NewSignal, SignalMailbox, SignalQuery, SignalType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// CONFIG
// ============================================================================

/// Laufzeit-Parameter des Anruf-Stacks
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Poll-Intervall einer aktiven Session
    pub signal_poll_interval: Duration,
    /// Poll-Intervall des Incoming-Call-Detectors
    pub detector_poll_interval: Duration,
    /// Alter, ab dem liegengebliebene Signale aus der Mailbox geräumt werden
    pub signal_ttl: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signal_poll_interval: Duration::from_secs(1),
            detector_poll_interval: Duration::from_secs(1),
            signal_ttl: Duration::from_secs(120),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum CallError {
    #[error("camera/microphone access denied: {0}")]
    MediaAccess(String),

    #[error("negotiation engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("signal mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("another call is already active")]
    AlreadyInCall,

    #[error("no active call")]
    NoActiveCall,

    #[error("unknown call: {0}")]
    UnknownCall(String),
}

// ============================================================================
// CALL MANAGER
// ============================================================================

/// Fassade des Anruf-Stacks für eine lokale Peer-Identität.
///
/// Erzwingt die Invariante "höchstens ein aktiver Anruf": der
/// Active-Call-Slot wird beim Start einer Session belegt und von ihr
/// beim Erreichen von `Ended` wieder freigegeben. Solange er belegt
/// ist, ruht der Incoming-Call-Detector und weitere `start_call`/
/// `accept_incoming_call` schlagen mit [`CallError::AlreadyInCall`] fehl.
pub struct CallManager {
    local_peer: String,
    mailbox: Arc<dyn SignalMailbox>,
    engines: Arc<dyn EngineFactory>,
    config: CallConfig,
    active: Arc<RwLock<Option<ActiveCall>>>,
    event_tx: broadcast::Sender<CallEvent>,
    detector: JoinHandle<()>,
}

impl CallManager {
    /// Startet den Manager samt Incoming-Call-Detector.
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(
        local_peer: impl Into<String>,
        mailbox: Arc<dyn SignalMailbox>,
        engines: Arc<dyn EngineFactory>,
        config: CallConfig,
    ) -> Self {
        let local_peer = local_peer.into();
        let (event_tx, _) = broadcast::channel(100);
        let active = Arc::new(RwLock::new(None));

        let detector = detector::spawn(DetectorParams {
            local_peer: local_peer.clone(),
            mailbox: Arc::clone(&mailbox),
            event_tx: event_tx.clone(),
            active: Arc::clone(&active),
            poll_interval: config.detector_poll_interval,
            signal_ttl: config.signal_ttl,
        });

        Self {
            local_peer,
            mailbox,
            engines,
            config,
            active,
            event_tx,
            detector,
        }
    }

    /// Lokale Peer-Identität dieses Managers
    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Event-Strom für die UI-Anbindung; jeder Subscriber sieht alle
    /// Events ab dem Zeitpunkt des Abonnements
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Startet einen ausgehenden Anruf zu `remote_peer`.
    ///
    /// Schlägt das Beschaffen der Medien fehl, wird kein Signal
    /// geschrieben; die Gegenseite bekommt den Versuch nie zu sehen.
    pub async fn start_call(&self, remote_peer: impl Into<String>) -> Result<CallHandle, CallError> {
        let remote_peer = remote_peer.into();
        let call_id = generate_call_id();
        self.launch_session(CallRole::Caller, call_id, remote_peer)
            .await
    }

    /// Nimmt einen zuvor über [`CallEvent::IncomingCall`] gemeldeten
    /// Anruf an. Das Offer muss noch in der Mailbox liegen, sonst
    /// [`CallError::UnknownCall`].
    pub async fn accept_incoming_call(&self, call_id: &str) -> Result<CallHandle, CallError> {
        let offer = self
            .find_offer(call_id)?
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;

        // Das Offer bleibt liegen; die Session konsumiert es über ihren
        // normalen Poll-Pfad
        self.launch_session(CallRole::Receiver, call_id.to_string(), offer.from_peer)
            .await
    }

    /// Lehnt einen gemeldeten Anruf ab, ohne eine Session zu starten:
    /// Decline-Signal an den Anrufer, Offer aus der Mailbox entfernen
    pub fn decline_incoming_call(&self, call_id: &str) -> Result<(), CallError> {
        let offer = self
            .find_offer(call_id)?
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;

        tracing::info!("[{}] Declining call from {}", call_id, offer.from_peer);
        self.mailbox.create(NewSignal::decline(
            call_id,
            &self.local_peer,
            &offer.from_peer,
        ))?;
        self.mailbox.delete(&offer.id)?;
        Ok(())
    }

    /// Beendet den aktiven Anruf
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let cmd_tx = {
            let slot = self.active.read();
            slot.as_ref()
                .map(|a| a.cmd_tx.clone())
                .ok_or(CallError::NoActiveCall)?
        };

        // Fehler heißt: die Session ist gerade von selbst zu Ende gegangen
        let _ = cmd_tx.send(SessionCommand::Hangup).await;
        Ok(())
    }

    fn find_offer(&self, call_id: &str) -> Result<Option<signaling::Signal>, CallError> {
        let query = SignalQuery::recipient(&self.local_peer)
            .with_call(call_id)
            .with_type(SignalType::Offer);
        Ok(self.mailbox.filter(&query)?.into_iter().next())
    }

    async fn launch_session(
        &self,
        role: CallRole,
        call_id: String,
        remote_peer: String,
    ) -> Result<CallHandle, CallError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        // Slot atomar reservieren, bevor irgendetwas suspendiert; zwei
        // nebenläufige Starts würden eine reine Prüfung sonst beide passieren
        {
            let mut slot = self.active.write();
            if slot.is_some() {
                return Err(CallError::AlreadyInCall);
            }
            *slot = Some(ActiveCall {
                call_id: call_id.clone(),
                cmd_tx: cmd_tx.clone(),
            });
        }

        // Medien werden VOR dem ersten Signal beschafft; bei Verweigerung
        // endet der Versuch hier, ohne dass irgendetwas das Gerät verlässt
        let engine = match self.engines.create_engine().await {
            Ok(engine) => engine,
            Err(EngineError::MediaAccess(reason)) => {
                self.release_slot(&call_id);
                tracing::warn!("[{}] Media access denied: {}", call_id, reason);
                let _ = self.event_tx.send(CallEvent::StateChanged {
                    call_id,
                    state: SessionState::Ended(EndReason::MediaAccessDenied),
                });
                return Err(CallError::MediaAccess(reason));
            }
            Err(e) => {
                self.release_slot(&call_id);
                return Err(CallError::Engine(e));
            }
        };

        let params = SessionParams {
            role,
            call_id: call_id.clone(),
            local_peer: self.local_peer.clone(),
            remote_peer: remote_peer.clone(),
            engine: Arc::clone(&engine),
            mailbox: Arc::clone(&self.mailbox),
            event_tx: self.event_tx.clone(),
            active: Arc::clone(&self.active),
            poll_interval: self.config.signal_poll_interval,
        };

        if let Err(e) = CallSession::start(params, cmd_rx).await {
            engine.close().await;
            self.release_slot(&call_id);
            tracing::error!("[{}] Failed to start session: {}", call_id, e);
            let _ = self.event_tx.send(CallEvent::Error {
                call_id: call_id.clone(),
                message: format!("failed to start call: {e}"),
            });
            let _ = self.event_tx.send(CallEvent::StateChanged {
                call_id,
                state: SessionState::Ended(EndReason::ConnectionFailed),
            });
            return Err(CallError::Engine(e));
        }

        Ok(CallHandle {
            call_id,
            remote_peer,
            cmd_tx,
        })
    }

    /// Gibt den Slot frei, sofern er noch diesem Versuch gehört
    fn release_slot(&self, call_id: &str) {
        let mut slot = self.active.write();
        if slot.as_ref().is_some_and(|a| a.call_id == call_id) {
            *slot = None;
        }
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        self.detector.abort();
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("local_peer", &self.local_peer)
            .field("in_call", &self.active.read().is_some())
            .finish()
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Griff auf einen laufenden Anrufversuch
#[derive(Debug, Clone)]
pub struct CallHandle {
    call_id: String,
    remote_peer: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl CallHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Legt auf; ein No-op wenn die Session bereits beendet ist
    pub async fn hang_up(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Hangup).await;
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(SessionCommand::SetAudioEnabled(enabled)).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(SessionCommand::SetVideoEnabled(enabled)).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{SimEngineConfig, SimEngineFactory};
    use crate::signaling::SqliteMailbox;

    fn fast_config() -> CallConfig {
        CallConfig {
            signal_poll_interval: Duration::from_millis(10),
            detector_poll_interval: Duration::from_millis(10),
            signal_ttl: Duration::from_secs(120),
        }
    }

    fn manager(peer: &str, mailbox: &Arc<SqliteMailbox>) -> CallManager {
        CallManager::new(
            peer,
            Arc::clone(mailbox) as Arc<dyn SignalMailbox>,
            Arc::new(SimEngineFactory::new(SimEngineConfig::default())),
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_start_call_writes_offer() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = manager("bob", &mailbox);

        let handle = bob.start_call("alice").await.unwrap();
        assert_eq!(handle.remote_peer(), "alice");

        let offers = mailbox
            .filter(&SignalQuery::recipient("alice").with_type(SignalType::Offer))
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].call_id, handle.call_id());
        assert_eq!(offers[0].from_peer, "bob");
    }

    #[tokio::test]
    async fn test_second_call_rejected_while_active() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = manager("bob", &mailbox);

        let _handle = bob.start_call("alice").await.unwrap();
        let err = bob.start_call("carol").await.unwrap_err();
        assert!(matches!(err, CallError::AlreadyInCall));
    }

    #[tokio::test]
    async fn test_concurrent_starts_claim_slot_once() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = CallManager::new(
            "bob",
            Arc::clone(&mailbox) as Arc<dyn SignalMailbox>,
            Arc::new(SimEngineFactory::new(SimEngineConfig {
                create_delay: Duration::from_millis(100),
                ..Default::default()
            })),
            fast_config(),
        );

        // Beide Starts suspendieren in der Medien-Akquise; die
        // Slot-Reservierung davor darf trotzdem nur einen durchlassen
        let (first, second) = tokio::join!(bob.start_call("alice"), bob.start_call("carol"));
        let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(matches!(
            [first, second].into_iter().find_map(Result::err),
            Some(CallError::AlreadyInCall)
        ));

        // Nur der Gewinner hat ein Offer geschrieben
        let offers = mailbox
            .filter(&SignalQuery::default().with_type(SignalType::Offer))
            .unwrap();
        assert_eq!(offers.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_unknown_call() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = manager("bob", &mailbox);

        let err = bob.accept_incoming_call("call_nope").await.unwrap_err();
        assert!(matches!(err, CallError::UnknownCall(_)));
    }

    #[tokio::test]
    async fn test_decline_removes_offer_and_notifies_caller() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = manager("bob", &mailbox);

        mailbox
            .create(NewSignal::offer("call_1", "alice", "bob", "v=0"))
            .unwrap();

        bob.decline_incoming_call("call_1").unwrap();

        assert!(mailbox
            .filter(&SignalQuery::recipient("bob").with_type(SignalType::Offer))
            .unwrap()
            .is_empty());
        let declines = mailbox
            .filter(&SignalQuery::recipient("alice").with_type(SignalType::Decline))
            .unwrap();
        assert_eq!(declines.len(), 1);
        assert_eq!(declines[0].call_id, "call_1");
    }

    #[tokio::test]
    async fn test_media_denied_writes_no_signal() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = CallManager::new(
            "bob",
            Arc::clone(&mailbox) as Arc<dyn SignalMailbox>,
            Arc::new(SimEngineFactory::new(SimEngineConfig {
                deny_media: true,
                ..Default::default()
            })),
            fast_config(),
        );
        let mut events = bob.subscribe();

        let err = bob.start_call("alice").await.unwrap_err();
        assert!(matches!(err, CallError::MediaAccess(_)));

        // Kein Signal geschrieben; der Slot ist wieder frei, der zweite
        // Versuch scheitert an den Medien, nicht an einem Phantom-Anruf
        assert!(mailbox.filter(&SignalQuery::recipient("alice")).unwrap().is_empty());
        assert!(matches!(
            bob.start_call("alice").await.unwrap_err(),
            CallError::MediaAccess(_)
        ));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            CallEvent::StateChanged {
                state: SessionState::Ended(EndReason::MediaAccessDenied),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_hang_up_without_call() {
        let mailbox = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let bob = manager("bob", &mailbox);
        assert!(matches!(bob.hang_up().await, Err(CallError::NoActiveCall)));
    }
}
