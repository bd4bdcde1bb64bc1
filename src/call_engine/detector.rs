//! Incoming Call Detector - Mailbox-Überwachung auf eingehende Offers
//!
//! Läuft als eigener Tokio-Task vom Start des Managers bis zu dessen
//! Drop. Solange der Active-Call-Slot belegt ist, wird der Tick komplett
//! übersprungen; während eines laufenden Anrufs klingelt nichts.
//!
//! Jeder Tick räumt außerdem abgelaufene Signale aus der Mailbox, damit
//! liegengebliebene Zeilen (abgestürzte Gegenseite, nie abgeholte
//! Candidates) die Tabelle nicht unbegrenzt wachsen lassen.

use crate::call_engine::session::{ActiveCall, CallEvent};
use crate::signaling::{SignalMailbox, SignalPayload, SignalQuery, SignalType};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub(crate) struct DetectorParams {
    pub local_peer: String,
    pub mailbox: Arc<dyn SignalMailbox>,
    pub event_tx: broadcast::Sender<CallEvent>,
    pub active: Arc<RwLock<Option<ActiveCall>>>,
    pub poll_interval: Duration,
    pub signal_ttl: Duration,
}

/// Startet den Detector-Task; der zurückgegebene Handle wird beim Drop
/// des Managers abgebrochen
pub(crate) fn spawn(params: DetectorParams) -> JoinHandle<()> {
    tokio::spawn(run(params))
}

async fn run(params: DetectorParams) {
    let DetectorParams {
        local_peer,
        mailbox,
        event_tx,
        active,
        poll_interval,
        signal_ttl,
    } = params;

    tracing::info!("Incoming call detector started for {}", local_peer);

    // Bereits gemeldete Offer-IDs; verhindert erneutes Klingeln desselben
    // Offers, solange der Nutzer noch nicht reagiert hat
    let mut surfaced: HashSet<String> = HashSet::new();

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match mailbox.purge_expired(signal_ttl) {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Purged {} expired signals", n),
            Err(e) => tracing::warn!("Signal purge failed: {}", e),
        }

        // Während eines aktiven Anrufs klingelt nichts
        if active.read().is_some() {
            continue;
        }

        let query = SignalQuery::recipient(&local_peer).with_type(SignalType::Offer);
        let offers = match mailbox.filter(&query) {
            Ok(offers) => offers,
            Err(e) => {
                tracing::warn!("Incoming call poll failed: {}", e);
                continue;
            }
        };

        // IDs verschwundener Offers vergessen, damit das Set nicht wächst
        surfaced.retain(|id| offers.iter().any(|o| o.id == *id));

        for offer in offers {
            if !matches!(offer.payload, SignalPayload::Offer { .. }) {
                continue;
            }
            if !surfaced.insert(offer.id.clone()) {
                continue;
            }

            tracing::info!(
                "Incoming call {} from {}",
                offer.call_id,
                offer.from_peer
            );
            let _ = event_tx.send(CallEvent::IncomingCall {
                call_id: offer.call_id,
                from_peer: offer.from_peer,
            });
        }
    }
}
