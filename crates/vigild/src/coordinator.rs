use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as FileLock, RwLock as WindowLock};
use tokio::task::{JoinError, spawn_blocking};
use vigil_analysis::{
    CodeIssue, DriftScorer, TextSimilarityProvider, compare, compare_with_callers,
    parse_degraded_alert, summarize_change, summarize_request, validate_code,
};
use vigil_config::{SessionConfig, VigilConfig};
use vigil_core::{
    Alert, AlertSource, CallSite, ChangeSummary, Language, Session, SessionId, SessionState,
    Severity, Snapshot, SymbolTable, normalize_path, now_millis,
};
use vigil_parse::{ExtractError, LanguageRegistry, SymbolExtractor, default_registry, language_for_path};
use vigil_store::{SqliteStore, StoreError};

use crate::baseline::{discover_sources, project_relative_path};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session {session_id} is {} and no longer accepts changes", state.as_str())]
    SessionClosed {
        session_id: SessionId,
        state: SessionState,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("background task failed: {0}")]
    Join(#[from] JoinError),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::SessionClosed { session_id, state } => {
                Self::SessionClosed { session_id, state }
            }
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileChange {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub session: Session,
    pub baseline_snapshots: usize,
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub snapshot: Snapshot,
    pub alerts: Vec<Alert>,
    pub drift_percentage: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub informational: usize,
    pub warning: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedFileSummary {
    pub file_path: String,
    pub latest_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub state: SessionState,
    pub intent: String,
    pub project_root: String,
    pub language: Language,
    pub snapshot_count: u64,
    pub tracked_files: Vec<TrackedFileSummary>,
    pub alert_counts: AlertCounts,
    pub drift_window: Vec<String>,
}

type FileKey = (SessionId, String);
type DriftWindow = Arc<WindowLock<VecDeque<ChangeSummary>>>;

/// Owns session lifecycle and the per-change pipeline: store, extract,
/// compare, score drift, append alerts.
pub struct SessionCoordinator {
    store: Arc<SqliteStore>,
    registry: Arc<LanguageRegistry>,
    drift: DriftScorer,
    session_config: SessionConfig,
    window_size: usize,
    file_locks: Mutex<HashMap<FileKey, Arc<FileLock<()>>>>,
    windows: RwLock<HashMap<SessionId, DriftWindow>>,
}

impl SessionCoordinator {
    pub fn open(workspace: impl AsRef<Path>, config: &VigilConfig) -> Result<Self, CoordinatorError> {
        let store = SqliteStore::open(workspace)?;
        Ok(Self::new(
            Arc::new(store),
            config,
            DriftScorer::keyword_overlap(&config.drift),
        ))
    }

    pub fn new(store: Arc<SqliteStore>, config: &VigilConfig, drift: DriftScorer) -> Self {
        Self {
            store,
            registry: Arc::new(default_registry()),
            drift,
            session_config: config.session.clone(),
            window_size: config.drift.window_size.max(1),
            file_locks: Mutex::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_provider(
        store: Arc<SqliteStore>,
        config: &VigilConfig,
        provider: Arc<dyn TextSimilarityProvider>,
    ) -> Self {
        Self::new(store, config, DriftScorer::new(provider, &config.drift))
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub async fn init_session(
        &self,
        project_root: &str,
        language: Language,
        intent: &str,
    ) -> Result<InitOutcome, CoordinatorError> {
        if project_root.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "project_path must not be empty".to_owned(),
            ));
        }
        if self.registry.get_by_language(language).is_none() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "language {} is not supported",
                language.as_str()
            )));
        }

        let mut session = Session::new(project_root, language, intent, now_millis());
        let created = session.clone();
        self.with_store(move |store| store.create_session(&created)).await?;

        let mut baseline_snapshots = 0;
        if self.session_config.seed_baseline {
            baseline_snapshots = self.seed_baseline(&session).await?;
            session = self.store.get_session(&session.id)?;
        }

        tracing::info!(
            session_id = %session.id,
            project_root = %session.project_root,
            baseline_snapshots,
            "session initialized"
        );

        Ok(InitOutcome {
            session,
            baseline_snapshots,
        })
    }

    async fn seed_baseline(&self, session: &Session) -> Result<usize, CoordinatorError> {
        let root = Path::new(&session.project_root).to_path_buf();
        if !root.is_dir() {
            tracing::debug!(
                session_id = %session.id,
                project_root = %session.project_root,
                "project root is not a local directory; skipping baseline"
            );
            return Ok(0);
        }

        let registry = Arc::clone(&self.registry);
        let language = session.language;
        let extracted = spawn_blocking(move || -> Result<Vec<_>, ExtractError> {
            let mut extractor = SymbolExtractor::with_registry(registry)?;
            discover_sources(&root, language)
                .into_iter()
                .map(|file| {
                    let extracted =
                        extractor.extract_from_path(Path::new(&file.file_path), &file.content)?;
                    Ok((file, extracted.table))
                })
                .collect()
        })
        .await??;

        let session_id = session.id.clone();
        self.with_store(move |store| {
            for (file, table) in &extracted {
                store.record(&session_id, &file.file_path, &file.content, table)?;
            }
            Ok(extracted.len())
        })
        .await
    }

    /// Records one file change and returns the alerts it produced.
    pub async fn record_change(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<RecordOutcome, CoordinatorError> {
        if normalize_path(file_path).is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "file_path must not be empty".to_owned(),
            ));
        }

        let session = self.writable_session(session_id)?;
        let file_path = project_relative_path(&session.project_root, file_path);
        let lock = self.file_lock(&session.id, &file_path);
        let _guard = lock.lock().await;
        // The session may have closed while this change waited for the lock.
        let session = self.writable_session(&session.id)?;

        let previous = match self.store.latest(&session.id, &file_path) {
            Ok(snapshot) => Some(snapshot),
            Err(StoreError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        let table = self
            .extract(session.language, &file_path, content.to_owned())
            .await?;
        let snapshot = {
            let session_id = session.id.clone();
            let file_path = file_path.clone();
            let content = content.to_owned();
            self.with_store(move |store| store.record(&session_id, &file_path, &content, &table))
                .await?
        };

        tracing::info!(
            session_id = %session.id,
            file_path = %file_path,
            sequence = snapshot.sequence,
            step = snapshot.step,
            symbols = snapshot.table.len(),
            "recorded snapshot"
        );

        let source = AlertSource::Snapshots {
            previous: previous.as_ref().map(|snapshot| snapshot.id.clone()),
            current: snapshot.id.clone(),
        };

        let mut alerts = match previous.as_ref() {
            Some(previous) => {
                let session_id = session.id.clone();
                let file_path = file_path.clone();
                let old_table = previous.table.clone();
                let new_table = snapshot.table.clone();
                self.with_store(move |store| {
                    let external_calls = external_calls(store, &session_id, &file_path)?;
                    Ok(compare_with_callers(&old_table, &new_table, &external_calls))
                })
                .await?
            }
            None => Vec::new(),
        };
        alerts = alerts
            .into_iter()
            .map(|alert| alert.with_source(source.clone()))
            .collect();
        alerts.extend(parse_degraded_alert(&snapshot.table, source));

        let summary = summarize_change(
            previous.as_ref().map(|previous| &previous.table),
            &snapshot.table,
        );
        let window = self.push_summary(&session.id, summary).await?;
        let drift = self.drift.score(&session.id, &session.intent, &window).await;
        alerts.extend(drift.alert);

        if !alerts.is_empty() {
            let session_id = session.id.clone();
            let stored = alerts.clone();
            self.with_store(move |store| store.append_alerts(&session_id, &stored)).await?;
        }
        for alert in alerts.iter().filter(|alert| alert.severity == Severity::Critical) {
            tracing::warn!(
                session_id = %session.id,
                file_path = %file_path,
                kind = alert.kind.as_str(),
                subject = %alert.subject,
                "critical alert"
            );
        }

        Ok(RecordOutcome {
            snapshot,
            alerts,
            drift_percentage: drift.percentage,
        })
    }

    /// Records several file changes concurrently. Results follow input order;
    /// one failed change does not discard the outcomes of the others.
    pub async fn record_changes(
        &self,
        session_id: &str,
        changes: &[FileChange],
    ) -> Result<Vec<Result<RecordOutcome, CoordinatorError>>, CoordinatorError> {
        if changes.is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "code_changes must not be empty".to_owned(),
            ));
        }
        self.writable_session(session_id)?;

        Ok(join_all(
            changes
                .iter()
                .map(|change| self.record_change(session_id, &change.file_path, &change.content)),
        )
        .await)
    }

    /// Adds an AI request prompt to the session's drift window. Returns false
    /// for a blank prompt.
    pub async fn note_request(
        &self,
        session_id: &str,
        request_id: &str,
        prompt: &str,
    ) -> Result<bool, CoordinatorError> {
        let session = self.writable_session(session_id)?;
        let Some(summary) = summarize_request(prompt) else {
            return Ok(false);
        };

        self.push_summary(&session.id, summary).await?;
        let touched = session.id.clone();
        self.with_store(move |store| store.touch_session(&touched, now_millis())).await?;
        tracing::debug!(session_id = %session.id, request_id, "noted ai request");
        Ok(true)
    }

    pub fn close(&self, session_id: &str) -> Result<Session, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        match session.state {
            SessionState::Archived => return Ok(session),
            SessionState::Abandoned => {
                return Err(CoordinatorError::SessionClosed {
                    session_id: session.id,
                    state: session.state,
                });
            }
            SessionState::Initialized | SessionState::Active => {}
        }

        let state = self
            .store
            .end_session(&session.id, SessionState::Archived)?;
        if state != SessionState::Archived {
            return Err(CoordinatorError::SessionClosed {
                session_id: session.id,
                state,
            });
        }
        self.release(&session.id);
        tracing::info!(session_id = %session.id, "session archived");

        Ok(self.store.get_session(&session.id)?)
    }

    /// Abandons every open session that hit its snapshot cap or went idle.
    pub fn collect_garbage(&self, now: i64) -> Result<Vec<SessionId>, CoordinatorError> {
        let mut abandoned = Vec::new();
        for session in self.store.list_sessions()? {
            if !session.accepts_writes() {
                continue;
            }
            let Some(reason) = self.abandonment_reason(&session, now) else {
                continue;
            };
            if self.abandon(&session.id, &reason)? == SessionState::Abandoned {
                abandoned.push(session.id);
            }
        }
        Ok(abandoned)
    }

    /// Content of `file_path` as of per-file sequence `target_step`.
    pub fn reconstruct(
        &self,
        session_id: &str,
        file_path: &str,
        target_step: u64,
    ) -> Result<Snapshot, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        let file_path = project_relative_path(&session.project_root, file_path);
        if target_step == 0 {
            return Err(CoordinatorError::NotFound(format!(
                "step 0 precedes the first snapshot of {file_path}"
            )));
        }
        Ok(self.store.at_or_before(session_id, &file_path, target_step)?)
    }

    /// Recomputes regression alerts for consecutive snapshots of one file
    /// without writing anything.
    pub async fn replay_alerts(
        &self,
        session_id: &str,
        file_path: &str,
    ) -> Result<Vec<Alert>, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        let file_path = project_relative_path(&session.project_root, file_path);

        let session_id = session.id;
        self.with_store(move |store| {
            let mut alerts = Vec::new();
            let mut previous: Option<Snapshot> = None;
            for snapshot in store.history(&session_id, &file_path) {
                let snapshot = snapshot?;
                if let Some(previous) = &previous {
                    let source = AlertSource::Snapshots {
                        previous: Some(previous.id.clone()),
                        current: snapshot.id.clone(),
                    };
                    alerts.extend(
                        compare(&previous.table, &snapshot.table)
                            .into_iter()
                            .map(|alert| alert.with_source(source.clone())),
                    );
                }
                previous = Some(snapshot);
            }
            Ok(alerts)
        })
        .await
    }

    pub async fn session_context(&self, session_id: &str) -> Result<SessionContext, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        let tracked_files = self
            .store
            .tracked_files(&session.id)?
            .into_iter()
            .map(|tracked| TrackedFileSummary {
                file_path: tracked.file_path,
                latest_sequence: tracked.latest_sequence,
            })
            .collect();

        let mut alert_counts = AlertCounts::default();
        for alert in self.store.session_alerts(&session.id)? {
            match alert.severity {
                Severity::Informational => alert_counts.informational += 1,
                Severity::Warning => alert_counts.warning += 1,
                Severity::Critical => alert_counts.critical += 1,
            }
        }

        let window = self.window(&session.id)?;
        let drift_window = window.read().await.iter().map(ChangeSummary::render).collect();

        Ok(SessionContext {
            session_id: session.id,
            state: session.state,
            intent: session.intent,
            project_root: session.project_root,
            language: session.language,
            snapshot_count: session.snapshot_count,
            tracked_files,
            alert_counts,
            drift_window,
        })
    }

    pub async fn validate_code(
        &self,
        file_path: &str,
        content: &str,
    ) -> Result<Vec<CodeIssue>, CoordinatorError> {
        let language = language_for_path(Path::new(file_path)).unwrap_or(Language::Python);
        let registry = Arc::clone(&self.registry);
        let file_path = normalize_path(file_path);
        let content = content.to_owned();

        let issues = spawn_blocking(move || {
            let mut extractor = SymbolExtractor::with_registry(registry)?;
            validate_code(&mut extractor, language, &file_path, &content)
        })
        .await??;

        Ok(issues)
    }

    pub fn session(&self, session_id: &str) -> Result<Session, CoordinatorError> {
        Ok(self.store.get_session(session_id)?)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, CoordinatorError> {
        Ok(self.store.list_sessions()?)
    }

    pub fn history(&self, session_id: &str, file_path: &str) -> Result<Vec<Snapshot>, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        let file_path = project_relative_path(&session.project_root, file_path);
        let snapshots = self
            .store
            .history(session_id, &file_path)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    pub fn latest(&self, session_id: &str, file_path: &str) -> Result<Snapshot, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        let file_path = project_relative_path(&session.project_root, file_path);
        Ok(self.store.latest(session_id, &file_path)?)
    }

    pub fn alerts(&self, session_id: &str) -> Result<Vec<Alert>, CoordinatorError> {
        self.store.get_session(session_id)?;
        Ok(self.store.session_alerts(session_id)?)
    }

    fn writable_session(&self, session_id: &str) -> Result<Session, CoordinatorError> {
        let session = self.store.get_session(session_id)?;
        if !session.accepts_writes() {
            return Err(CoordinatorError::SessionClosed {
                session_id: session.id,
                state: session.state,
            });
        }

        if let Some(reason) = self.abandonment_reason(&session, now_millis()) {
            let state = self.abandon(&session.id, &reason)?;
            return Err(CoordinatorError::SessionClosed {
                session_id: session.id,
                state,
            });
        }

        Ok(session)
    }

    fn abandonment_reason(&self, session: &Session, now: i64) -> Option<String> {
        if session.snapshot_count >= self.session_config.max_snapshots {
            return Some(format!(
                "reached {} snapshots (limit {})",
                session.snapshot_count, self.session_config.max_snapshots
            ));
        }

        let idle_limit_ms = self.session_config.idle_timeout_secs.saturating_mul(1000);
        let idle_ms = now.saturating_sub(session.last_activity_at).max(0) as u64;
        if idle_ms > idle_limit_ms {
            return Some(format!(
                "idle for {}s (limit {}s)",
                idle_ms / 1000,
                self.session_config.idle_timeout_secs
            ));
        }

        None
    }

    /// Returns the state the session ended in; a session closed concurrently
    /// keeps that state.
    fn abandon(&self, session_id: &str, reason: &str) -> Result<SessionState, CoordinatorError> {
        let state = self
            .store
            .end_session(session_id, SessionState::Abandoned)?;
        self.release(session_id);
        if state == SessionState::Abandoned {
            tracing::warn!(session_id, reason, "session abandoned");
        }
        Ok(state)
    }

    fn release(&self, session_id: &str) {
        self.locks()
            .retain(|(locked_session, _), _| locked_session != session_id);
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    fn file_lock(&self, session_id: &str, file_path: &str) -> Arc<FileLock<()>> {
        let mut locks = self.locks();
        Arc::clone(
            locks
                .entry((session_id.to_owned(), file_path.to_owned()))
                .or_default(),
        )
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<FileKey, Arc<FileLock<()>>>> {
        self.file_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn extract(
        &self,
        language: Language,
        file_path: &str,
        content: String,
    ) -> Result<SymbolTable, CoordinatorError> {
        let registry = Arc::clone(&self.registry);
        let file_path = file_path.to_owned();
        let table = spawn_blocking(move || {
            let mut extractor = SymbolExtractor::with_registry(registry)?;
            extractor.extract(language, &file_path, &content)
        })
        .await??;
        Ok(table)
    }

    /// Runs a store call on the blocking pool. SQLite I/O and the store's
    /// conflict backoff sleep must stay off the async workers.
    async fn with_store<T, F>(&self, op: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(spawn_blocking(move || op(&store)).await??)
    }

    fn window(&self, session_id: &str) -> Result<DriftWindow, CoordinatorError> {
        if let Some(window) = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return Ok(Arc::clone(window));
        }

        let recent = self.store.recent_summaries(session_id, self.window_size)?;
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let window = windows
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(WindowLock::new(VecDeque::from(recent))));
        Ok(Arc::clone(window))
    }

    /// Appends to the drift window and returns the texts the scorer sees.
    async fn push_summary(
        &self,
        session_id: &str,
        summary: ChangeSummary,
    ) -> Result<Vec<String>, CoordinatorError> {
        let window = self.window(session_id)?;
        let mut window = window.write().await;

        let stored = summary.clone();
        let owner = session_id.to_owned();
        self.with_store(move |store| store.append_summary(&owner, &stored, now_millis())).await?;
        window.push_back(summary);
        while window.len() > self.window_size {
            window.pop_front();
        }

        Ok(window.iter().map(|summary| summary.text.clone()).collect())
    }
}

/// Call sites from the latest snapshot of every other tracked file.
fn external_calls(
    store: &SqliteStore,
    session_id: &str,
    file_path: &str,
) -> Result<Vec<CallSite>, StoreError> {
    let mut calls = Vec::new();
    for tracked in store.tracked_files(session_id)? {
        if tracked.file_path == file_path {
            continue;
        }
        let snapshot = store.latest(session_id, &tracked.file_path)?;
        calls.extend(snapshot.table.calls);
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn first_change_activates_session_and_seeds_window() {
        let temp = tempdir().expect("tempdir");
        let mut config = VigilConfig::default();
        config.session.seed_baseline = false;
        let coordinator = SessionCoordinator::open(temp.path(), &config).expect("coordinator");

        let init = coordinator
            .init_session("/nonexistent/project", Language::Python, "auth login")
            .await
            .expect("init");
        assert_eq!(init.session.state, SessionState::Initialized);
        assert_eq!(init.baseline_snapshots, 0);

        let outcome = coordinator
            .record_change(&init.session.id, "auth.py", "def login(user):\n    return user\n")
            .await
            .expect("record");
        assert_eq!(outcome.snapshot.sequence, 1);

        let session = coordinator.session(&init.session.id).expect("session");
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.snapshot_count, 1);

        let context = coordinator
            .session_context(&init.session.id)
            .await
            .expect("context");
        assert_eq!(context.drift_window, vec!["auth: created with login"]);
        assert_eq!(
            context.tracked_files,
            vec![TrackedFileSummary {
                file_path: "auth.py".to_owned(),
                latest_sequence: 1,
            }]
        );
    }

    #[tokio::test]
    async fn blank_paths_and_unknown_sessions_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let coordinator =
            SessionCoordinator::open(temp.path(), &VigilConfig::default()).expect("coordinator");

        let missing = coordinator
            .record_change("sess_missing", "a.py", "x = 1\n")
            .await
            .expect_err("unknown session");
        assert!(matches!(missing, CoordinatorError::NotFound(_)));

        let blank = coordinator
            .record_change("sess_missing", "  ", "x = 1\n")
            .await
            .expect_err("blank path");
        assert!(matches!(blank, CoordinatorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn note_request_skips_blank_prompts() {
        let temp = tempdir().expect("tempdir");
        let coordinator =
            SessionCoordinator::open(temp.path(), &VigilConfig::default()).expect("coordinator");
        let init = coordinator
            .init_session("/nonexistent", Language::Python, "billing")
            .await
            .expect("init");

        assert!(
            !coordinator
                .note_request(&init.session.id, "req-1", "   ")
                .await
                .expect("blank prompt")
        );
        assert!(
            coordinator
                .note_request(&init.session.id, "req-2", "add invoice totals")
                .await
                .expect("prompt")
        );

        let context = coordinator
            .session_context(&init.session.id)
            .await
            .expect("context");
        assert_eq!(context.drift_window, vec!["add invoice totals"]);
    }
}
