//! Signaling Module - Signal-Typen und Mailbox
//!
//! Dieses Modul verwaltet den Signal-Austausch zwischen zwei Teilnehmern:
//! - Signal-Record mit geschlossenem Arten-Enum
//! - Mailbox-Schnittstelle (create / filter / delete / purge)
//! - SQLite-Implementierung der Mailbox

mod mailbox;
mod signal;

pub use mailbox::{MailboxError, SignalMailbox, SignalQuery, SqliteMailbox};
pub use signal::{generate_call_id, NewSignal, Signal, SignalPayload, SignalType};
