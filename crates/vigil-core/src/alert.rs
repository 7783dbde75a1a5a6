use serde::{Deserialize, Serialize};

use crate::{SessionId, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Informational,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Informational => "INFORMATIONAL",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "INFORMATIONAL" => Some(Self::Informational),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    RegressionRemoved,
    RegressionSignature,
    BodyChanged,
    ContextDrift,
    ParseDegraded,
    DriftUnavailable,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegressionRemoved => "REGRESSION_REMOVED",
            Self::RegressionSignature => "REGRESSION_SIGNATURE",
            Self::BodyChanged => "BODY_CHANGED",
            Self::ContextDrift => "CONTEXT_DRIFT",
            Self::ParseDegraded => "PARSE_DEGRADED",
            Self::DriftUnavailable => "DRIFT_UNAVAILABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "REGRESSION_REMOVED" => Some(Self::RegressionRemoved),
            "REGRESSION_SIGNATURE" => Some(Self::RegressionSignature),
            "BODY_CHANGED" => Some(Self::BodyChanged),
            "CONTEXT_DRIFT" => Some(Self::ContextDrift),
            "PARSE_DEGRADED" => Some(Self::ParseDegraded),
            "DRIFT_UNAVAILABLE" => Some(Self::DriftUnavailable),
            _ => None,
        }
    }

    pub fn is_regression(self) -> bool {
        matches!(self, Self::RegressionRemoved | Self::RegressionSignature)
    }
}

/// What produced an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertSource {
    /// Two symbol tables compared outside any stored session.
    Tables { file_path: String },
    /// A stored snapshot compared against its predecessor (absent for the first one).
    Snapshots {
        previous: Option<SnapshotId>,
        current: SnapshotId,
    },
    /// The session intent scored against a window of recent change summaries.
    Intent {
        session_id: SessionId,
        window_len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub subject: String,
    pub message: String,
    pub source: AlertSource,
    pub created_at: i64,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        subject: impl Into<String>,
        message: impl Into<String>,
        source: AlertSource,
    ) -> Self {
        Self {
            kind,
            severity,
            subject: subject.into(),
            message: message.into(),
            source,
            created_at: crate::now_millis(),
        }
    }

    pub fn with_source(mut self, source: AlertSource) -> Self {
        self.source = source;
        self
    }

    /// Alert content without provenance or time, for set comparisons.
    pub fn fingerprint(&self) -> (AlertKind, Severity, &str, &str) {
        (
            self.kind,
            self.severity,
            self.subject.as_str(),
            self.message.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_serializes_with_wire_names() {
        let alert = Alert::new(
            AlertKind::RegressionRemoved,
            Severity::Critical,
            "auth::login",
            "login was removed",
            AlertSource::Snapshots {
                previous: Some("sess_1/auth.py@00000001".to_owned()),
                current: "sess_1/auth.py@00000002".to_owned(),
            },
        );

        let value = serde_json::to_value(&alert).expect("serialize alert");
        assert_eq!(value["kind"], "REGRESSION_REMOVED");
        assert_eq!(value["severity"], "CRITICAL");
        assert_eq!(value["source"]["type"], "snapshots");

        let decoded: Alert = serde_json::from_value(value).expect("deserialize alert");
        assert_eq!(decoded, alert);
    }

    #[test]
    fn kinds_and_severities_round_trip_through_strings() {
        for kind in [
            AlertKind::RegressionRemoved,
            AlertKind::RegressionSignature,
            AlertKind::BodyChanged,
            AlertKind::ContextDrift,
            AlertKind::ParseDegraded,
            AlertKind::DriftUnavailable,
        ] {
            assert_eq!(AlertKind::parse(kind.as_str()), Some(kind));
        }
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Informational);
        assert_eq!(Severity::parse("WARNING"), Some(Severity::Warning));
    }
}
