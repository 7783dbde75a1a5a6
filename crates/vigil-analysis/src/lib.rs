mod drift;
mod regression;
mod summary;
mod validate;

pub use drift::{
    DriftResult, DriftScorer, KeywordOverlapProvider, ProviderError, TextSimilarityProvider,
    drift_percentage, keyword_overlap, keyword_tokens,
};
pub use regression::{compare, compare_with_callers, parse_degraded_alert};
pub use summary::{summarize_change, summarize_request};
pub use validate::{CodeIssue, IssueKind, validate_code};
