use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use rusqlite::{
    Connection, ErrorCode, OptionalExtension, TransactionBehavior, params,
};
use thiserror::Error;
use vigil_core::{
    Alert, AlertKind, AlertSource, ChangeSummary, Language, Session, SessionState, Snapshot,
    SymbolTable, normalize_path, now_millis, snapshot_id,
};

mod history;

pub use history::SnapshotHistory;

pub const DATABASE_FILE_NAME: &str = "vigil.sqlite";

const MAX_RECORD_ATTEMPTS: u32 = 5;
const RECORD_RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("snapshot store is corrupt: {0}")]
    Corrupt(String),
    #[error("concurrent write conflict on {0}")]
    Conflict(String),
    #[error("session {session_id} is {}", state.as_str())]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub file_path: String,
    pub latest_sequence: u64,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    vigil_dir: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) `<workspace>/.vigil/vigil.sqlite` and verifies its integrity.
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let vigil_dir = vigil_config::vigil_dir(workspace_root);
        let sqlite_path = vigil_dir.join(DATABASE_FILE_NAME);

        fs::create_dir_all(&vigil_dir)?;

        let conn = open_connection(&sqlite_path).map_err(classify_open_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
            vigil_dir,
        })
    }

    pub fn vigil_dir(&self) -> &Path {
        &self.vigil_dir
    }

    pub fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO sessions (
                id, project_root, language, intent, state, created_at, last_activity_at, snapshot_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session.id,
                session.project_root,
                session.language.as_str(),
                session.intent,
                session.state.as_str(),
                session.created_at,
                session.last_activity_at,
                session.snapshot_count as i64,
            ],
        )?;

        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, project_root, language, intent, state, created_at, last_activity_at, snapshot_count
            FROM sessions
            WHERE id = ?1
            "#,
        )?;

        let row = stmt
            .query_row(params![session_id], SessionRow::from_row)
            .optional()?;

        row.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?
            .into_session()
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, project_root, language, intent, state, created_at, last_activity_at, snapshot_count
            FROM sessions
            ORDER BY created_at ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map([], SessionRow::from_row)?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Moves an open session to the terminal state `to`. A session that is
    /// already terminal keeps its state. Returns the state after the call.
    pub fn end_session(
        &self,
        session_id: &str,
        to: SessionState,
    ) -> Result<SessionState, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = session_state(&tx, session_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        tx.execute(
            "UPDATE sessions SET state = ?2 WHERE id = ?1",
            params![session_id, to.as_str()],
        )?;
        tx.commit()?;
        Ok(to)
    }

    pub fn touch_session(&self, session_id: &str, at: i64) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
            params![session_id, at],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Stores a new snapshot and assigns the next per-file sequence and
    /// per-session step. Write conflicts are retried a bounded number of times.
    pub fn record(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
        table: &SymbolTable,
    ) -> Result<Snapshot, StoreError> {
        let file_path = normalize_path(file_path);
        let mut attempt = 1;
        loop {
            match self.try_record(session_id, &file_path, content, table) {
                Err(StoreError::Conflict(slot)) if attempt < MAX_RECORD_ATTEMPTS => {
                    tracing::debug!(
                        session_id,
                        file_path = %file_path,
                        attempt,
                        slot = %slot,
                        "retrying snapshot write after conflict"
                    );
                    attempt += 1;
                    thread::sleep(RECORD_RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    fn try_record(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
        table: &SymbolTable,
    ) -> Result<Snapshot, StoreError> {
        let table_json = serde_json::to_string(table)?;
        let created_at = now_millis();

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| classify_write_error(err, session_id, file_path))?;

        let state = session_state(&tx, session_id)?;
        if state.is_terminal() {
            return Err(StoreError::SessionClosed {
                session_id: session_id.to_owned(),
                state,
            });
        }

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM snapshots WHERE session_id = ?1 AND file_path = ?2",
            params![session_id, file_path],
            |row| row.get(0),
        )?;
        let step: i64 = tx.query_row(
            "SELECT COALESCE(MAX(step), 0) + 1 FROM snapshots WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
            INSERT INTO snapshots (session_id, file_path, seq, step, content, table_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![session_id, file_path, sequence, step, content, table_json, created_at],
        )
        .map_err(|err| classify_write_error(err, session_id, file_path))?;

        tx.execute(
            r#"
            UPDATE sessions
            SET snapshot_count = snapshot_count + 1,
                last_activity_at = MAX(last_activity_at, ?2),
                state = CASE WHEN state = ?3 THEN ?4 ELSE state END
            WHERE id = ?1
            "#,
            params![
                session_id,
                created_at,
                SessionState::Initialized.as_str(),
                SessionState::Active.as_str()
            ],
        )?;

        tx.commit()
            .map_err(|err| classify_write_error(err, session_id, file_path))?;

        Ok(Snapshot {
            id: snapshot_id(session_id, file_path, sequence as u64),
            session_id: session_id.to_owned(),
            file_path: file_path.to_owned(),
            content: content.to_owned(),
            table: table.clone(),
            sequence: sequence as u64,
            step: step as u64,
            created_at,
        })
    }

    /// Lazily pages through a file's snapshots, oldest first.
    pub fn history(&self, session_id: &str, file_path: &str) -> SnapshotHistory<'_> {
        SnapshotHistory::new(self, session_id, &normalize_path(file_path))
    }

    pub fn latest(&self, session_id: &str, file_path: &str) -> Result<Snapshot, StoreError> {
        let file_path = normalize_path(file_path);
        self.query_snapshot(
            r#"
            SELECT session_id, file_path, seq, step, content, table_json, created_at
            FROM snapshots
            WHERE session_id = ?1 AND file_path = ?2
            ORDER BY seq DESC
            LIMIT 1
            "#,
            params![session_id, file_path],
        )?
        .ok_or_else(|| StoreError::NotFound(format!("no snapshots for {file_path} in {session_id}")))
    }

    pub fn at_or_before(
        &self,
        session_id: &str,
        file_path: &str,
        sequence: u64,
    ) -> Result<Snapshot, StoreError> {
        let file_path = normalize_path(file_path);
        self.query_snapshot(
            r#"
            SELECT session_id, file_path, seq, step, content, table_json, created_at
            FROM snapshots
            WHERE session_id = ?1 AND file_path = ?2 AND seq <= ?3
            ORDER BY seq DESC
            LIMIT 1
            "#,
            params![session_id, file_path, sequence as i64],
        )?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "no snapshot of {file_path} at or before sequence {sequence} in {session_id}"
            ))
        })
    }

    pub fn tracked_files(&self, session_id: &str) -> Result<Vec<TrackedFile>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT file_path, MAX(seq)
            FROM snapshots
            WHERE session_id = ?1
            GROUP BY file_path
            ORDER BY file_path ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(TrackedFile {
                file_path: row.get(0)?,
                latest_sequence: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let files = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn append_alerts(&self, session_id: &str, alerts: &[Alert]) -> Result<(), StoreError> {
        if alerts.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO alerts (session_id, kind, severity, subject, message, source_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for alert in alerts {
                let source_json = serde_json::to_string(&alert.source)?;
                stmt.execute(params![
                    session_id,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.subject,
                    alert.message,
                    source_json,
                    alert.created_at,
                ])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    pub fn session_alerts(&self, session_id: &str) -> Result<Vec<Alert>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT kind, severity, subject, message, source_json, created_at
            FROM alerts
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(AlertRow {
                kind: row.get(0)?,
                severity: row.get(1)?,
                subject: row.get(2)?,
                message: row.get(3)?,
                source_json: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AlertRow::into_alert).collect()
    }

    pub fn append_summary(
        &self,
        session_id: &str,
        summary: &ChangeSummary,
        created_at: i64,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO change_summaries (session_id, scope, summary, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![session_id, summary.scope, summary.text, created_at],
        )?;
        Ok(())
    }

    /// The newest `limit` summaries of a session, oldest first.
    pub fn recent_summaries(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT scope, summary
            FROM change_summaries
            WHERE session_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(ChangeSummary {
                scope: row.get(0)?,
                text: row.get(1)?,
            })
        })?;
        let mut summaries = rows.collect::<Result<Vec<_>, _>>()?;
        summaries.reverse();
        Ok(summaries)
    }

    pub(crate) fn snapshot_page(
        &self,
        session_id: &str,
        file_path: &str,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, file_path, seq, step, content, table_json, created_at
            FROM snapshots
            WHERE session_id = ?1 AND file_path = ?2 AND seq > ?3
            ORDER BY seq ASC
            LIMIT ?4
            "#,
        )?;

        let rows = stmt.query_map(
            params![session_id, file_path, after_sequence as i64, limit as i64],
            SnapshotRow::from_row,
        )?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    fn query_snapshot(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let row = stmt.query_row(params, SnapshotRow::from_row).optional()?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SessionRow {
    id: String,
    project_root: String,
    language: String,
    intent: String,
    state: String,
    created_at: i64,
    last_activity_at: i64,
    snapshot_count: i64,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_root: row.get(1)?,
            language: row.get(2)?,
            intent: row.get(3)?,
            state: row.get(4)?,
            created_at: row.get(5)?,
            last_activity_at: row.get(6)?,
            snapshot_count: row.get(7)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        let language = self
            .language
            .parse::<Language>()
            .map_err(StoreError::Corrupt)?;
        let state = SessionState::parse(&self.state).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown session state '{}'", self.state))
        })?;

        Ok(Session {
            id: self.id,
            project_root: self.project_root,
            language,
            intent: self.intent,
            state,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            snapshot_count: self.snapshot_count.max(0) as u64,
        })
    }
}

struct SnapshotRow {
    session_id: String,
    file_path: String,
    sequence: i64,
    step: i64,
    content: String,
    table_json: String,
    created_at: i64,
}

impl SnapshotRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            file_path: row.get(1)?,
            sequence: row.get(2)?,
            step: row.get(3)?,
            content: row.get(4)?,
            table_json: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_snapshot(self) -> Result<Snapshot, StoreError> {
        let table: SymbolTable = serde_json::from_str(&self.table_json)?;
        let sequence = self.sequence as u64;
        Ok(Snapshot {
            id: snapshot_id(&self.session_id, &self.file_path, sequence),
            session_id: self.session_id,
            file_path: self.file_path,
            content: self.content,
            table,
            sequence,
            step: self.step as u64,
            created_at: self.created_at,
        })
    }
}

struct AlertRow {
    kind: String,
    severity: String,
    subject: String,
    message: String,
    source_json: String,
    created_at: i64,
}

impl AlertRow {
    fn into_alert(self) -> Result<Alert, StoreError> {
        let kind = AlertKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown alert kind '{}'", self.kind)))?;
        let severity = vigil_core::Severity::parse(&self.severity).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown alert severity '{}'", self.severity))
        })?;
        let source: AlertSource = serde_json::from_str(&self.source_json)?;

        Ok(Alert {
            kind,
            severity,
            subject: self.subject,
            message: self.message,
            source,
            created_at: self.created_at,
        })
    }
}

fn open_connection(sqlite_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(sqlite_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(StoreError::Corrupt(check));
    }

    run_migrations(&conn)?;
    Ok(conn)
}

fn classify_open_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, message))
            if matches!(
                code.code,
                ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
            ) =>
        {
            StoreError::Corrupt(message.unwrap_or_else(|| code.to_string()))
        }
        other => other,
    }
}

fn classify_write_error(err: rusqlite::Error, session_id: &str, file_path: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Conflict(format!("{session_id}/{file_path}"))
        }
        _ => StoreError::Sqlite(err),
    }
}

fn session_state(conn: &Connection, session_id: &str) -> Result<SessionState, StoreError> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    let state = state.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
    SessionState::parse(&state)
        .ok_or_else(|| StoreError::Corrupt(format!("session {session_id} has state {state}")))
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            project_root TEXT NOT NULL,
            language TEXT NOT NULL,
            intent TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL,
            snapshot_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            session_id TEXT NOT NULL REFERENCES sessions(id),
            file_path TEXT NOT NULL,
            seq INTEGER NOT NULL,
            step INTEGER NOT NULL,
            content TEXT NOT NULL,
            table_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, file_path, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_session_step
            ON snapshots(session_id, step);

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            subject TEXT NOT NULL,
            message TEXT NOT NULL,
            source_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_session ON alerts(session_id, id);

        CREATE TABLE IF NOT EXISTS change_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            scope TEXT,
            summary TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_summaries_session ON change_summaries(session_id, id);
        "#,
    )?;

    Ok(())
}
