use serde::{Deserialize, Serialize};

use crate::{Language, SymbolTable, content_hash, normalize_path};

pub type SessionId = String;
pub type SnapshotId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initialized,
    Active,
    Archived,
    Abandoned,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
            Self::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "INITIALIZED" => Some(Self::Initialized),
            "ACTIVE" => Some(Self::Active),
            "ARCHIVED" => Some(Self::Archived),
            "ABANDONED" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_root: String,
    pub language: Language,
    pub intent: String,
    pub state: SessionState,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub snapshot_count: u64,
}

impl Session {
    pub fn new(project_root: &str, language: Language, intent: &str, created_at: i64) -> Self {
        let project_root = normalize_path(project_root);
        let intent = intent.trim().to_owned();
        let id = format!(
            "sess_{}",
            &content_hash(&format!("{project_root}\n{intent}\n{created_at}\n{}", nonce()))[..16]
        );
        Self {
            id,
            project_root,
            language,
            intent,
            state: SessionState::Initialized,
            created_at,
            last_activity_at: created_at,
            snapshot_count: 0,
        }
    }

    pub fn accepts_writes(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// An immutable capture of one file at one point in session time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub session_id: SessionId,
    pub file_path: String,
    pub content: String,
    pub table: SymbolTable,
    /// Per-file sequence index, starting at 1.
    pub sequence: u64,
    /// Per-session step across all files, starting at 1.
    pub step: u64,
    pub created_at: i64,
}

/// One entry of a session's drift window. Only `text` is scored against the
/// intent; `scope` names the file the change touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub scope: Option<String>,
    pub text: String,
}

impl ChangeSummary {
    pub fn for_file(scope: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            text: text.into(),
        }
    }

    pub fn unscoped(text: impl Into<String>) -> Self {
        Self {
            scope: None,
            text: text.into(),
        }
    }

    pub fn render(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}: {}", self.text),
            None => self.text.clone(),
        }
    }
}

pub fn snapshot_id(session_id: &str, file_path: &str, sequence: u64) -> SnapshotId {
    format!("{session_id}/{}@{sequence:08}", normalize_path(file_path))
}

fn nonce() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_for_identical_inputs() {
        let first = Session::new("/work", Language::Python, "add login", 1_700_000_000);
        let second = Session::new("/work", Language::Python, "add login", 1_700_000_000);
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("sess_"));
        assert_eq!(first.state, SessionState::Initialized);
        assert!(first.accepts_writes());
    }

    #[test]
    fn snapshot_id_encodes_path_and_zero_padded_sequence() {
        assert_eq!(
            snapshot_id("sess_1", ".\\src\\auth.py", 7),
            "sess_1/src/auth.py@00000007"
        );
    }

    #[test]
    fn terminal_states_reject_writes() {
        for state in [SessionState::Archived, SessionState::Abandoned] {
            assert!(state.is_terminal());
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert!(!SessionState::Active.is_terminal());
    }
}
