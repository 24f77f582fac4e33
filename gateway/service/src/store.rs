// Copyright (c) 2024 The Botho Foundation

//! SQLite persistence for payment sessions.
//!
//! Each session row carries a `version` that every write compares and bumps,
//! so two components can never advance the same session from the same
//! snapshot. The `data` column holds the full session record, history
//! included; the history is also kept in an insert-only table, which is
//! what reads load it from.

use bth_gateway_core::session::{HistoryEvent, HistoryEventType, Session, SessionStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// How long a writer waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A session together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub session: Session,
    pub version: u64,
}

/// Session store backed by SQLite.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                cryptocurrency TEXT NOT NULL,
                address_index INTEGER NOT NULL,
                payment_address TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                is_open INTEGER NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (cryptocurrency, address_index)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_open ON sessions(is_open);

            CREATE TABLE IF NOT EXISTS session_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                event TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_session ON session_history(session_id);

            CREATE TRIGGER IF NOT EXISTS session_history_no_update
            BEFORE UPDATE ON session_history
            BEGIN
                SELECT RAISE(ABORT, 'session history is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS session_history_no_delete
            BEFORE DELETE ON session_history
            BEGIN
                SELECT RAISE(ABORT, 'session history is append-only');
            END;

            CREATE TABLE IF NOT EXISTS address_counters (
                cryptocurrency TEXT PRIMARY KEY,
                next_index INTEGER NOT NULL
            );

            -- Seed counters past every stored index so a lost or missing
            -- counter row can never hand out a used index again.
            INSERT INTO address_counters (cryptocurrency, next_index)
            SELECT cryptocurrency, MAX(address_index) + 1 FROM sessions WHERE true
            GROUP BY cryptocurrency
            ON CONFLICT(cryptocurrency) DO UPDATE
            SET next_index = MAX(next_index, excluded.next_index);
            "#,
        )?;

        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Insert a new session at version 1.
    pub fn create(&self, session: &Session) -> Result<StoredSession, StoreError> {
        session
            .check_invariants()
            .map_err(StoreError::InvariantViolation)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO sessions (
                id, cryptocurrency, address_index, payment_address, status,
                is_open, version, data, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)
            "#,
            params![
                session.id.to_string(),
                session.cryptocurrency.code(),
                session.address_index as i64,
                session.payment_address,
                session.status.as_str(),
                session.is_open(),
                record_json(session)?,
                session.created_at.timestamp(),
                session.updated_at.timestamp(),
            ],
        )?;
        for event in &session.transaction_history {
            insert_history(&tx, &session.id, event)?;
        }
        tx.commit()?;

        debug!("Created session {} at index {}", session.id, session.address_index);

        Ok(StoredSession {
            session: session.clone(),
            version: 1,
        })
    }

    /// Get a session by ID.
    pub fn get(&self, id: &Uuid) -> Result<Option<StoredSession>, StoreError> {
        let conn = self.lock()?;
        load_session(&conn, id)
    }

    /// Replace `current` with `next` if nobody else wrote in between.
    ///
    /// History events appended to `next` are inserted in the same
    /// transaction. Fails with `StaleWrite` when the stored version moved.
    pub fn update(&self, current: &StoredSession, next: Session) -> Result<StoredSession, StoreError> {
        self.write(current, next, true)
    }

    /// Compare-and-swap update that also records one history event.
    pub fn transition(
        &self,
        current: &StoredSession,
        mut next: Session,
        event: HistoryEvent,
    ) -> Result<StoredSession, StoreError> {
        next.transaction_history.push(event);
        self.write(current, next, true)
    }

    /// Append a history event without changing any other field.
    pub fn append_history(&self, id: &Uuid, event: &HistoryEvent) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = load_session(&tx, id)? else {
            return Err(StoreError::NotFound(*id));
        };
        let mut record = current.session;
        record.transaction_history.push(event.clone());

        tx.execute(
            r#"
            UPDATE sessions
            SET is_open = ?1, version = version + 1, data = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                record.is_open(),
                record_json(&record)?,
                Utc::now().timestamp(),
                id.to_string()
            ],
        )?;
        insert_history(&tx, id, event)?;
        tx.commit()?;

        Ok(())
    }

    /// Hand a session to an operator, recording why.
    pub fn flag_for_review(
        &self,
        current: &StoredSession,
        reason: impl Into<String>,
    ) -> Result<StoredSession, StoreError> {
        let reason = reason.into();
        let mut next = current.session.clone();
        next.flag_for_review(reason.clone());
        next.transaction_history
            .push(HistoryEvent::new(HistoryEventType::NeedsReview).with_detail(reason));
        self.write(current, next, true)
    }

    /// Return a session under review to the status it held before.
    pub fn release_review(&self, id: &Uuid, note: &str) -> Result<StoredSession, StoreError> {
        let current = self.get(id)?.ok_or(StoreError::NotFound(*id))?;

        let mut next = current.session.clone();
        let restored = next
            .release_review()
            .map_err(StoreError::InvariantViolation)?;
        next.transaction_history.push(
            HistoryEvent::new(HistoryEventType::ReviewReleased)
                .with_detail(format!("restored {}: {}", restored, note)),
        );

        self.write(&current, next, false)
    }

    /// List sessions in a given status, oldest first.
    pub fn list_by_status(&self, status: SessionStatus) -> Result<Vec<StoredSession>, StoreError> {
        let conn = self.lock()?;
        let ids = query_ids(
            &conn,
            "SELECT id FROM sessions WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            params![status.as_str()],
        )?;
        load_all(&conn, &ids)
    }

    /// List sessions the engine still has work to do on, oldest first.
    pub fn list_open(&self) -> Result<Vec<StoredSession>, StoreError> {
        let conn = self.lock()?;
        let ids = query_ids(
            &conn,
            "SELECT id FROM sessions WHERE is_open = 1 ORDER BY created_at ASC, rowid ASC",
            [],
        )?;
        load_all(&conn, &ids)
    }

    /// Count sessions per status.
    pub fn status_counts(&self) -> Result<Vec<(SessionStatus, u64)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM sessions GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(status, count)| {
                let status = status
                    .parse::<SessionStatus>()
                    .map_err(StoreError::InvariantViolation)?;
                Ok((status, count as u64))
            })
            .collect()
    }

    fn write(
        &self,
        current: &StoredSession,
        mut next: Session,
        check_transition: bool,
    ) -> Result<StoredSession, StoreError> {
        validate_write(&current.session, &next, check_transition)?;
        next.updated_at = Utc::now();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            r#"
            UPDATE sessions
            SET status = ?1, is_open = ?2, version = version + 1, data = ?3, updated_at = ?4
            WHERE id = ?5 AND version = ?6
            "#,
            params![
                next.status.as_str(),
                next.is_open(),
                record_json(&next)?,
                next.updated_at.timestamp(),
                next.id.to_string(),
                current.version as i64,
            ],
        )?;

        if changed == 0 {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT version FROM sessions WHERE id = ?1",
                    params![next.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => StoreError::StaleWrite {
                    id: next.id,
                    expected: current.version,
                },
                None => StoreError::NotFound(next.id),
            });
        }

        let known = current.session.transaction_history.len();
        for event in &next.transaction_history[known..] {
            insert_history(&tx, &next.id, event)?;
        }
        tx.commit()?;

        if current.session.status != next.status {
            debug!(
                "Session {} {} -> {}",
                next.id, current.session.status, next.status
            );
        }

        Ok(StoredSession {
            session: next,
            version: current.version + 1,
        })
    }
}

/// Check a proposed write against the record it replaces.
fn validate_write(
    current: &Session,
    next: &Session,
    check_transition: bool,
) -> Result<(), StoreError> {
    if next.id != current.id
        || next.cryptocurrency != current.cryptocurrency
        || next.address_index != current.address_index
        || next.payment_address != current.payment_address
    {
        return Err(StoreError::InvariantViolation(
            "session identity fields are immutable".to_string(),
        ));
    }

    if check_transition && !current.status.can_transition_to(next.status) {
        return Err(StoreError::InvalidTransition {
            from: current.status,
            to: next.status,
        });
    }

    if let Some(hash) = &current.forwarding.forwarding_tx_hash {
        if next.forwarding.forwarding_tx_hash.as_ref() != Some(hash) {
            return Err(StoreError::InvariantViolation(format!(
                "forwardingTxHash {} is already set",
                hash
            )));
        }
    }

    let known = current.transaction_history.len();
    if next.transaction_history.len() < known
        || next.transaction_history[..known] != current.transaction_history[..]
    {
        return Err(StoreError::InvariantViolation(
            "transaction history is append-only".to_string(),
        ));
    }

    next.check_invariants()
        .map_err(StoreError::InvariantViolation)
}

/// Full session record as stored in `sessions.data`.
fn record_json(session: &Session) -> Result<String, StoreError> {
    Ok(serde_json::to_string(session)?)
}

fn insert_history(conn: &Connection, id: &Uuid, event: &HistoryEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO session_history (session_id, event, created_at) VALUES (?1, ?2, ?3)",
        params![
            id.to_string(),
            serde_json::to_string(event)?,
            event.timestamp.timestamp(),
        ],
    )?;
    Ok(())
}

fn query_ids<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Uuid>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    ids.iter()
        .map(|id| {
            Uuid::parse_str(id)
                .map_err(|e| StoreError::InvariantViolation(format!("bad session id {}: {}", id, e)))
        })
        .collect()
}

fn load_all(conn: &Connection, ids: &[Uuid]) -> Result<Vec<StoredSession>, StoreError> {
    let mut sessions = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(stored) = load_session(conn, id)? {
            sessions.push(stored);
        }
    }
    Ok(sessions)
}

fn load_session(conn: &Connection, id: &Uuid) -> Result<Option<StoredSession>, StoreError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT data, version FROM sessions WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((data, version)) = row else {
        return Ok(None);
    };

    let mut session: Session = serde_json::from_str(&data)?;

    let mut stmt = conn
        .prepare("SELECT event FROM session_history WHERE session_id = ?1 ORDER BY id ASC")?;
    let events = stmt
        .query_map(params![id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    session.transaction_history = events
        .iter()
        .map(|event| serde_json::from_str(event))
        .collect::<Result<Vec<HistoryEvent>, _>>()?;

    Ok(Some(StoredSession {
        session,
        version: version as u64,
    }))
}
