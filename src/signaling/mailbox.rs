//! Signal-Mailbox
//!
//! Persistenter Briefkasten für Signale: zwei Teilnehmer ohne direkten
//! Kanal tauschen Handshake-Daten über gewöhnliche Datenbank-Zeilen aus,
//! die per Intervall gepollt werden. Der Store selbst garantiert weder
//! Reihenfolge noch Exactly-Once; beides erzwingt der Session-Controller.

use super::signal::{NewSignal, Signal, SignalPayload, SignalType};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Invalid signal payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

// ============================================================================
// QUERY
// ============================================================================

/// Filter für `SignalMailbox::filter`
///
/// Alle Felder sind optional; der Store filtert auf beliebigen Spalten
/// (die Offer-Bereinigung beim Auflegen filtert z.B. nur nach
/// `call_id` + `signal_type`, ohne Empfänger).
#[derive(Debug, Clone, Default)]
pub struct SignalQuery {
    pub to_peer: Option<String>,
    pub call_id: Option<String>,
    pub signal_type: Option<SignalType>,
}

impl SignalQuery {
    /// Alle Signale an einen Empfänger
    pub fn recipient(to_peer: impl Into<String>) -> Self {
        Self {
            to_peer: Some(to_peer.into()),
            ..Self::default()
        }
    }

    pub fn with_call(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_type(mut self, signal_type: SignalType) -> Self {
        self.signal_type = Some(signal_type);
        self
    }
}

// ============================================================================
// MAILBOX TRAIT
// ============================================================================

/// Kollaborator-Schnittstelle der Mailbox
///
/// Zustellung ist at-least-once: ein Consumer, der nach dem Verarbeiten
/// aber vor dem Löschen abstürzt, sieht das Signal erneut. Die
/// Verarbeitung muss deshalb idempotent sein.
pub trait SignalMailbox: Send + Sync {
    /// Legt ein neues Signal ab und gibt die gespeicherte Zeile zurück
    fn create(&self, signal: NewSignal) -> Result<Signal, MailboxError>;

    /// Alle Signale, die auf den Filter passen, älteste zuerst
    fn filter(&self, query: &SignalQuery) -> Result<Vec<Signal>, MailboxError>;

    /// Löscht ein Signal; eine unbekannte ID ist kein Fehler
    fn delete(&self, signal_id: &str) -> Result<(), MailboxError>;

    /// Löscht alle Signale, die älter als `ttl` sind (Garbage Collection
    /// für Zeilen, deren Consumer vor dem Löschen abgestürzt ist).
    /// Gibt die Anzahl entfernter Zeilen zurück.
    fn purge_expired(&self, ttl: Duration) -> Result<usize, MailboxError>;
}

// ============================================================================
// SQLITE MAILBOX
// ============================================================================

/// SQLite-Implementierung der Mailbox (Thread-safe durch Mutex)
pub struct SqliteMailbox {
    conn: Mutex<Connection>,
}

impl SqliteMailbox {
    /// Öffnet oder erstellt die Mailbox am Standard-Pfad
    pub fn open() -> Result<Self, MailboxError> {
        let db_path = Self::get_database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening signal mailbox at {:?}", db_path);
        Self::open_at(&db_path)
    }

    /// Öffnet die Mailbox an einem expliziten Pfad
    pub fn open_at(path: &std::path::Path) -> Result<Self, MailboxError> {
        let conn = Connection::open(path)?;
        let mailbox = Self {
            conn: Mutex::new(conn),
        };
        mailbox.init_schema()?;
        Ok(mailbox)
    }

    /// In-Memory Mailbox für Tests und Loopback-Demos; wird sie per `Arc`
    /// von mehreren Managern geteilt, sehen beide Seiten dieselben Zeilen
    pub fn open_in_memory() -> Result<Self, MailboxError> {
        let conn = Connection::open_in_memory()?;
        let mailbox = Self {
            conn: Mutex::new(conn),
        };
        mailbox.init_schema()?;
        Ok(mailbox)
    }

    fn get_database_path() -> Result<PathBuf, MailboxError> {
        let proj_dirs = directories::ProjectDirs::from("com", "popcall", "popcall")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("signals.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), MailboxError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                from_peer TEXT NOT NULL,
                to_peer TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                signal_data TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        // Indizes für die beiden heißen Filter: Empfänger-Poll und Call-Poll
        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_signals_to_peer ON signals(to_peer)
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_signals_call_id ON signals(call_id)
            "#,
            [],
        )?;

        Ok(())
    }

    fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
        let data: String = row.get(4)?;
        let payload: SignalPayload = serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        let millis: i64 = row.get(5)?;

        Ok(Signal {
            id: row.get(0)?,
            call_id: row.get(1)?,
            from_peer: row.get(2)?,
            to_peer: row.get(3)?,
            payload,
            created_at: Utc
                .timestamp_millis_opt(millis)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    /// Setzt alle Timestamps um `secs` Sekunden zurück (nur für Purge-Tests)
    #[cfg(test)]
    fn backdate_all(&self, secs: i64) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signals SET created_at = created_at - ?1",
            params![secs * 1000],
        )
        .unwrap();
    }
}

impl SignalMailbox for SqliteMailbox {
    fn create(&self, signal: NewSignal) -> Result<Signal, MailboxError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let data = serde_json::to_string(&signal.payload)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO signals (id, call_id, from_peer, to_peer, signal_type, signal_data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                id,
                signal.call_id,
                signal.from_peer,
                signal.to_peer,
                signal.payload.signal_type().as_str(),
                data,
                created_at.timestamp_millis(),
            ],
        )?;

        Ok(Signal {
            id,
            call_id: signal.call_id,
            from_peer: signal.from_peer,
            to_peer: signal.to_peer,
            payload: signal.payload,
            created_at,
        })
    }

    fn filter(&self, query: &SignalQuery) -> Result<Vec<Signal>, MailboxError> {
        let mut sql = String::from(
            r#"
            SELECT id, call_id, from_peer, to_peer, signal_data, created_at
            FROM signals
            WHERE 1=1
            "#,
        );
        let mut values: Vec<String> = Vec::new();

        if let Some(to_peer) = &query.to_peer {
            values.push(to_peer.clone());
            sql.push_str(&format!(" AND to_peer = ?{}", values.len()));
        }
        if let Some(call_id) = &query.call_id {
            values.push(call_id.clone());
            sql.push_str(&format!(" AND call_id = ?{}", values.len()));
        }
        if let Some(signal_type) = query.signal_type {
            values.push(signal_type.as_str().to_string());
            sql.push_str(&format!(" AND signal_type = ?{}", values.len()));
        }

        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let signals = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_signal)?
            .collect::<rusqlite::Result<Vec<Signal>>>()?;

        Ok(signals)
    }

    fn delete(&self, signal_id: &str) -> Result<(), MailboxError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            DELETE FROM signals
            WHERE id = ?1
            "#,
            params![signal_id],
        )?;
        Ok(())
    }

    fn purge_expired(&self, ttl: Duration) -> Result<usize, MailboxError> {
        let cutoff = Utc::now().timestamp_millis() - ttl.as_millis() as i64;
        let conn = self.conn.lock();
        let removed = conn.execute(
            r#"
            DELETE FROM signals
            WHERE created_at < ?1
            "#,
            params![cutoff],
        )?;
        Ok(removed)
    }
}

impl std::fmt::Debug for SqliteMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMailbox").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
