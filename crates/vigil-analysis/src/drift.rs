use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use vigil_config::DriftConfig;
use vigil_core::{Alert, AlertKind, AlertSource, Severity};

const MIN_PREFIX_MATCH_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "for", "from", "has", "have",
    "in", "into", "is", "it", "its", "of", "on", "or", "so", "that", "the", "then", "this", "to",
    "we", "with", "should", "would", "will", "please", "make", "use", "add", "added", "adds",
    "change", "changed", "changes", "remove", "removed", "edit", "edited", "edits", "create",
    "created", "creates", "update", "updated",
    "new", "py", "self", "cls", "def", "return", "none", "true", "false",
];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("similarity provider timed out after {0} ms")]
    Timeout(u64),
    #[error("similarity provider failed: {0}")]
    Failed(String),
}

/// Scores how similar two pieces of text are, from 0.0 (unrelated) to 1.0.
#[async_trait]
pub trait TextSimilarityProvider: Send + Sync {
    async fn similarity(&self, left: &str, right: &str) -> Result<f32, ProviderError>;

    fn provider_name(&self) -> &str;
}

/// Identifier-aware keyword overlap, no external service involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordOverlapProvider;

#[async_trait]
impl TextSimilarityProvider for KeywordOverlapProvider {
    async fn similarity(&self, left: &str, right: &str) -> Result<f32, ProviderError> {
        Ok(keyword_overlap(left, right))
    }

    fn provider_name(&self) -> &str {
        "keyword_overlap"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftResult {
    pub percentage: u8,
    pub alert: Option<Alert>,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct DriftScorer {
    provider: Arc<dyn TextSimilarityProvider>,
    warning_threshold: u8,
    critical_threshold: u8,
    provider_timeout: Duration,
}

impl DriftScorer {
    pub fn new(provider: Arc<dyn TextSimilarityProvider>, config: &DriftConfig) -> Self {
        Self {
            provider,
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
        }
    }

    pub fn keyword_overlap(config: &DriftConfig) -> Self {
        Self::new(Arc::new(KeywordOverlapProvider), config)
    }

    /// Distance between the session intent and the recent change summaries.
    /// Entries without any keyword (`edited`, `created`) carry no topic and
    /// are skipped. Emits at most one alert.
    pub async fn score(&self, session_id: &str, intent: &str, recent: &[String]) -> DriftResult {
        let window = recent
            .iter()
            .map(|summary| summary.trim())
            .filter(|summary| !keyword_tokens(summary).is_empty())
            .collect::<Vec<_>>();
        if window.is_empty() {
            return DriftResult {
                percentage: 0,
                alert: None,
                degraded: false,
            };
        }

        let source = AlertSource::Intent {
            session_id: session_id.to_owned(),
            window_len: window.len(),
        };
        let joined = window.join("\n");

        let similarity = match timeout(
            self.provider_timeout,
            self.provider.similarity(intent, &joined),
        )
        .await
        {
            Ok(Ok(similarity)) if similarity.is_finite() => similarity.clamp(0.0, 1.0),
            Ok(Ok(similarity)) => {
                return self.unavailable(
                    session_id,
                    ProviderError::Failed(format!("non-finite similarity {similarity}")),
                    source,
                );
            }
            Ok(Err(err)) => return self.unavailable(session_id, err, source),
            Err(_) => {
                let err = ProviderError::Timeout(self.provider_timeout.as_millis() as u64);
                return self.unavailable(session_id, err, source);
            }
        };

        let percentage = drift_percentage(similarity);
        let severity = if percentage > self.critical_threshold {
            Some(Severity::Critical)
        } else if percentage > self.warning_threshold {
            Some(Severity::Warning)
        } else {
            None
        };

        let alert = severity.map(|severity| {
            Alert::new(
                AlertKind::ContextDrift,
                severity,
                session_id.to_owned(),
                format!(
                    "recent changes drifted {percentage}% from the session intent \"{}\"",
                    intent.trim()
                ),
                source,
            )
        });

        DriftResult {
            percentage,
            alert,
            degraded: false,
        }
    }

    fn unavailable(&self, session_id: &str, err: ProviderError, source: AlertSource) -> DriftResult {
        tracing::warn!(
            session_id,
            provider = self.provider.provider_name(),
            error = %err,
            "drift scoring unavailable"
        );

        DriftResult {
            percentage: 0,
            alert: Some(Alert::new(
                AlertKind::DriftUnavailable,
                Severity::Informational,
                session_id.to_owned(),
                format!("drift check skipped: {err}"),
                source,
            )),
            degraded: true,
        }
    }
}

pub fn drift_percentage(similarity: f32) -> u8 {
    (100.0 * (1.0 - similarity.clamp(0.0, 1.0))).round() as u8
}

/// Overlap coefficient between the keyword sets of two texts.
pub fn keyword_overlap(left: &str, right: &str) -> f32 {
    let left_tokens = keyword_tokens(left);
    let right_tokens = keyword_tokens(right);

    if left_tokens.is_empty() || right_tokens.is_empty() {
        let same = left.trim().eq_ignore_ascii_case(right.trim());
        return if same { 1.0 } else { 0.0 };
    }

    let (smaller, larger) = if left_tokens.len() <= right_tokens.len() {
        (&left_tokens, &right_tokens)
    } else {
        (&right_tokens, &left_tokens)
    };

    let matched = smaller
        .iter()
        .filter(|token| larger.iter().any(|other| tokens_match(token, other)))
        .count();

    matched as f32 / smaller.len() as f32
}

/// Lower-cased keywords with snake_case and camelCase identifiers split apart.
pub fn keyword_tokens(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .flat_map(split_camel_case)
        .map(|token| token.to_lowercase())
        .filter(|token| token.chars().count() > 1)
        .filter(|token| !token.chars().all(|ch| ch.is_ascii_digit()))
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

fn split_camel_case(word: &str) -> Vec<&str> {
    let chars = word.char_indices().collect::<Vec<_>>();
    let mut parts = Vec::new();
    let mut start = 0;

    for window in 1..chars.len() {
        let (index, current) = chars[window];
        let previous = chars[window - 1].1;
        let next_is_lower = chars
            .get(window + 1)
            .is_some_and(|(_, next)| next.is_lowercase());

        let boundary = current.is_uppercase()
            && (previous.is_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_uppercase() && next_is_lower));
        if boundary {
            parts.push(&word[start..index]);
            start = index;
        }
    }

    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

fn tokens_match(left: &str, right: &str) -> bool {
    if left == right {
        return true;
    }
    left.len() >= MIN_PREFIX_MATCH_LEN
        && right.len() >= MIN_PREFIX_MATCH_LEN
        && (left.starts_with(right) || right.starts_with(left))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProvider;

    #[async_trait]
    impl TextSimilarityProvider for SlowProvider {
        async fn similarity(&self, _left: &str, _right: &str) -> Result<f32, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }

        fn provider_name(&self) -> &str {
            "slow"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TextSimilarityProvider for FailingProvider {
        async fn similarity(&self, _left: &str, _right: &str) -> Result<f32, ProviderError> {
            Err(ProviderError::Failed("backend offline".to_owned()))
        }

        fn provider_name(&self) -> &str {
            "failing"
        }
    }

    fn config() -> DriftConfig {
        DriftConfig::default()
    }

    #[test]
    fn tokens_split_identifiers_and_drop_stopwords() {
        let tokens = keyword_tokens("Add verify_password to the HTTPServer loginFlow v2");
        let expected = ["flow", "http", "login", "password", "server", "v2", "verify"]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect::<BTreeSet<_>>();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn overlap_uses_prefix_matching_for_longer_tokens() {
        assert_eq!(keyword_overlap("authentication", "auth"), 1.0);
        assert_eq!(keyword_overlap("ab", "abc"), 0.0);
        assert_eq!(keyword_overlap("login flow", "login flow"), 1.0);
        assert_eq!(keyword_overlap("the", "the"), 1.0);
        assert_eq!(keyword_overlap("", "login"), 0.0);
    }

    #[tokio::test]
    async fn identical_text_has_zero_distance() {
        let scorer = DriftScorer::keyword_overlap(&config());
        let result = scorer
            .score(
                "sess_1",
                "implement login session handling",
                &["implement login session handling".to_owned()],
            )
            .await;

        assert_eq!(result.percentage, 0);
        assert!(result.alert.is_none());
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn unrelated_window_raises_one_critical_drift_alert() {
        let scorer = DriftScorer::keyword_overlap(&config());
        let result = scorer
            .score(
                "sess_1",
                "implement login session handling",
                &[
                    "billing: added compute_invoice_total".to_owned(),
                    "reports: changed render_chart".to_owned(),
                ],
            )
            .await;

        assert!(result.percentage > 70);
        let alert = result.alert.expect("drift alert");
        assert_eq!(alert.kind, AlertKind::ContextDrift);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(
            alert.source,
            AlertSource::Intent {
                session_id: "sess_1".to_owned(),
                window_len: 2,
            }
        );
    }

    #[tokio::test]
    async fn empty_window_is_zero_without_alert() {
        let scorer = DriftScorer::keyword_overlap(&config());
        let result = scorer.score("sess_1", "anything", &["   ".to_owned()]).await;

        assert_eq!(result.percentage, 0);
        assert!(result.alert.is_none());
    }

    #[tokio::test]
    async fn structural_verbs_alone_do_not_count_as_drift() {
        let scorer = DriftScorer::keyword_overlap(&config());
        let result = scorer
            .score(
                "sess_1",
                "implement user login function `login`",
                &["created".to_owned(), "edited".to_owned(), "removed login".to_owned()],
            )
            .await;

        assert_eq!(result.percentage, 0);
        assert!(result.alert.is_none());
        assert_eq!(keyword_tokens("created with edited"), BTreeSet::new());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_timeout_degrades_with_single_advisory() {
        let scorer = DriftScorer::new(Arc::new(SlowProvider), &config());
        let result = scorer
            .score("sess_1", "login", &["payments".to_owned()])
            .await;

        assert_eq!(result.percentage, 0);
        assert!(result.degraded);
        let alert = result.alert.expect("advisory");
        assert_eq!(alert.kind, AlertKind::DriftUnavailable);
        assert_eq!(alert.severity, Severity::Informational);
        assert!(alert.message.contains("timed out after 2000 ms"));
    }

    #[tokio::test]
    async fn provider_error_degrades_with_single_advisory() {
        let scorer = DriftScorer::new(Arc::new(FailingProvider), &config());
        let result = scorer
            .score("sess_1", "login", &["payments".to_owned()])
            .await;

        assert!(result.degraded);
        assert_eq!(
            result.alert.map(|alert| alert.kind),
            Some(AlertKind::DriftUnavailable)
        );
    }

    #[test]
    fn percentage_rounds_distance() {
        assert_eq!(drift_percentage(1.0), 0);
        assert_eq!(drift_percentage(0.0), 100);
        assert_eq!(drift_percentage(0.55), 45);
        assert_eq!(drift_percentage(1.7), 0);
    }
}
