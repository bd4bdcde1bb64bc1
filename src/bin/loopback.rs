//! Loopback-Demo: zwei Peers, eine geteilte In-Memory-Mailbox.
//!
//! Alice ruft Bob an, Bob nimmt über den Incoming-Call-Detector an,
//! beide verbinden sich über die Sim-Engine, Alice legt wieder auf.
//!
//! ```text
//! RUST_LOG=popcall=debug cargo run --bin loopback
//! ```

use anyhow::Result;
use popcall::call_engine::{CallEvent, SessionState, SimEngineConfig, SimEngineFactory};
use popcall::signaling::{SignalMailbox, SqliteMailbox};
use popcall::{CallConfig, CallManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn sim_factory(peer: &str) -> Arc<SimEngineFactory> {
    Arc::new(SimEngineFactory::new(SimEngineConfig {
        local_candidates: vec![format!("candidate:{peer}-host-1"), format!("candidate:{peer}-srflx-1")],
        ..Default::default()
    }))
}

async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> Result<CallEvent> {
    let found = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) => continue,
                Err(e) => return Err(anyhow::anyhow!("event stream closed: {e}")),
            }
        }
    })
    .await??;
    Ok(found)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "popcall=info,loopback=info".into()),
        )
        .init();

    let mailbox: Arc<dyn SignalMailbox> = Arc::new(SqliteMailbox::open_in_memory()?);
    let config = CallConfig {
        signal_poll_interval: Duration::from_millis(100),
        detector_poll_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let alice = CallManager::new("alice", Arc::clone(&mailbox), sim_factory("alice"), config.clone());
    let bob = CallManager::new("bob", Arc::clone(&mailbox), sim_factory("bob"), config);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    tracing::info!("alice calls bob");
    let handle = alice.start_call("bob").await?;

    let incoming = wait_for(&mut bob_events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await?;
    let CallEvent::IncomingCall { call_id, from_peer } = incoming else {
        unreachable!();
    };
    tracing::info!("bob sees incoming call {call_id} from {from_peer}");

    bob.accept_incoming_call(&call_id).await?;

    wait_for(&mut alice_events, |e| {
        matches!(e, CallEvent::StateChanged { state: SessionState::Connected, .. })
    })
    .await?;
    wait_for(&mut bob_events, |e| {
        matches!(e, CallEvent::StateChanged { state: SessionState::Connected, .. })
    })
    .await?;
    tracing::info!("both sides connected");

    tokio::time::sleep(Duration::from_millis(500)).await;

    tracing::info!("alice hangs up");
    handle.hang_up().await;

    wait_for(&mut bob_events, |e| {
        matches!(e, CallEvent::StateChanged { state: SessionState::Ended(_), .. })
    })
    .await?;
    tracing::info!("call finished on both sides");

    Ok(())
}
