use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity token that must accompany every read and write.
///
/// A record matches a partition when its owner equals `owner_id` and either
/// side leaves the sub-scope unset or both name the same sub-scope.  Owner-wide
/// queries therefore see every record of the owner, while a sub-scoped query
/// sees only its own and the owner's unscoped records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionContext {
    pub owner_id: Uuid,
    pub sub_scope_id: Option<Uuid>,
}

impl PartitionContext {
    /// Owner-wide partition.
    pub fn owner(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            sub_scope_id: None,
        }
    }

    /// Partition narrowed to one sub-scope (session, agent, ...).
    pub fn scoped(owner_id: Uuid, sub_scope_id: Uuid) -> Self {
        Self {
            owner_id,
            sub_scope_id: Some(sub_scope_id),
        }
    }

    /// Evaluate the partition predicate against a record's keys.
    pub fn matches(&self, owner_id: Uuid, sub_scope_id: Option<Uuid>) -> bool {
        if self.owner_id != owner_id {
            return false;
        }
        match (self.sub_scope_id, sub_scope_id) {
            (None, _) | (_, None) => true,
            (Some(want), Some(have)) => want == have,
        }
    }
}

/// Visibility tag stored with every episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ShareScope {
    /// Visible to the owning partition only.
    #[default]
    Owner,
    /// Visible to collaborators the owner shares with.
    Shared,
}

impl ShareScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareScope::Owner => "owner",
            ShareScope::Shared => "shared",
        }
    }
}

impl fmt::Display for ShareScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShareScope {
    type Err = MemoryError;

    /// Accepts the legacy `user` / `global` spellings as well.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" | "user" => Ok(ShareScope::Owner),
            "shared" | "global" => Ok(ShareScope::Shared),
            other => Err(MemoryError::Validation(format!(
                "unknown share scope {other:?}"
            ))),
        }
    }
}

/// Three-dimensional salience score.
///
/// Every constructor clamps each dimension to its declared range, so a
/// `ValenceScore` obtained through [`ValenceScore::new`] always satisfies
/// `polarity ∈ [-1, 1]`, `goal_relevance ∈ [0, 1]` and `arousal ∈ [0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ValenceScore {
    pub polarity: f64,
    pub goal_relevance: f64,
    pub arousal: f64,
}

impl ValenceScore {
    pub fn new(polarity: f64, goal_relevance: f64, arousal: f64) -> Self {
        Self {
            polarity: clamp_finite(polarity, -1.0, 1.0),
            goal_relevance: clamp_finite(goal_relevance, 0.0, 1.0),
            arousal: clamp_finite(arousal, 0.0, 1.0),
        }
    }

    /// The zero score used whenever salience cannot be computed.
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Re-apply the range clamps, e.g. to a caller-supplied override.
    pub fn clamped(self) -> Self {
        Self::new(self.polarity, self.goal_relevance, self.arousal)
    }
}

fn clamp_finite(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(lo, hi) }
}

/// One stored memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub sub_scope_id: Option<Uuid>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Decaying rank weight, starts at 1.0 and is only ever lowered.
    pub accessibility_score: f64,
    pub valence: ValenceScore,
    pub share_scope: ShareScope,
    /// Free-form tags; `source` is the conventional producer label.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Episode {
    /// Construct an episode with a fresh id, a neutral valence and full
    /// accessibility.  `last_accessed_at` starts at `created_at`.
    pub fn new(
        owner_id: Uuid,
        sub_scope_id: Option<Uuid>,
        content: impl Into<String>,
        embedding: Vec<f32>,
        created_at: DateTime<Utc>,
        share_scope: ShareScope,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            sub_scope_id,
            content: content.into(),
            embedding,
            created_at,
            last_accessed_at: created_at,
            accessibility_score: 1.0,
            valence: ValenceScore::neutral(),
            share_scope,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_valence(mut self, valence: ValenceScore) -> Self {
        self.valence = valence.clamped();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The `source` metadata tag, if any.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(METADATA_SOURCE).map(String::as_str)
    }

    /// Whether this episode is visible under `partition`.
    pub fn visible_to(&self, partition: &PartitionContext) -> bool {
        partition.matches(self.owner_id, self.sub_scope_id)
    }
}

/// Metadata key holding the producer label of an episode.
pub const METADATA_SOURCE: &str = "source";

/// Caller input for writing a new episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeInput {
    pub content: String,
    /// Externally produced embedding; required.
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub share_scope: ShareScope,
    /// Task type used to weigh goal relevance (e.g. `"client_complaint"`).
    pub task_hint: Option<String>,
    /// Skip the scorer and store this valence instead.
    pub explicit_valence: Option<ValenceScore>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Final ordering applied to retrieval results.  Ties are always broken by
/// ascending episode id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Newest first.
    #[default]
    TimestampDesc,
    /// Smallest vector distance first.
    Relevance,
    /// Largest `|polarity|` first.
    ValenceAbsDesc,
    /// Highest accessibility score first.
    AccessibilityDesc,
}

/// A retrieval request.
///
/// When `query_vector` or `query_text` is present the request is a similarity
/// search, otherwise it lists the most recent episodes.  All other fields are
/// post-filters evaluated over the fetched set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrievalQuery {
    #[serde(default)]
    pub query_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Inclusive lower bound on `created_at`.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_polarity: Option<f64>,
    #[serde(default)]
    pub min_accessibility: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    /// Every listed key must be present with exactly this value.
    #[serde(default)]
    pub required_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub share_scope: Option<ShareScope>,
    #[serde(default)]
    pub sort_by: SortBy,
}

fn default_limit() -> usize {
    10
}

impl Default for RetrievalQuery {
    fn default() -> Self {
        Self {
            query_vector: None,
            query_text: None,
            limit: default_limit(),
            since: None,
            until: None,
            min_polarity: None,
            min_accessibility: None,
            source: None,
            required_metadata: BTreeMap::new(),
            share_scope: None,
            sort_by: SortBy::default(),
        }
    }
}

impl RetrievalQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn similar(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            query_vector: Some(vector),
            limit,
            sort_by: SortBy::Relevance,
            ..Self::default()
        }
    }

    /// `true` when any post-filter could drop fetched records.
    pub fn has_filters(&self) -> bool {
        self.since.is_some()
            || self.until.is_some()
            || self.min_polarity.is_some()
            || self.min_accessibility.is_some()
            || self.source.is_some()
            || !self.required_metadata.is_empty()
            || self.share_scope.is_some()
    }
}

/// Error taxonomy surfaced to callers of the memory engine.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemoryError {
    /// Malformed input; never retried.
    #[error("Validation Error: {0}")]
    Validation(String),

    /// Absent, or present under another partition.
    #[error("Episode Not Found: {0}")]
    NotFound(Uuid),

    #[error("Episode Conflict: {0} already exists")]
    Conflict(Uuid),

    /// A persistence call exceeded its deadline or was cancelled.
    #[error("Persistence Timeout")]
    Timeout,

    #[error("Transient Store Error: {0}")]
    TransientStore(String),

    #[error("Embedding Provider Error: {0}")]
    Embedding(String),
}

impl MemoryError {
    /// Whether the caller may retry with a fresh context.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Timeout | MemoryError::TransientStore(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_wide_partition_sees_scoped_and_unscoped_records() {
        let owner = Uuid::new_v4();
        let p = PartitionContext::owner(owner);
        assert!(p.matches(owner, None));
        assert!(p.matches(owner, Some(Uuid::new_v4())));
        assert!(!p.matches(Uuid::new_v4(), None));
    }

    #[test]
    fn scoped_partition_hides_other_sub_scopes() {
        let owner = Uuid::new_v4();
        let session = Uuid::new_v4();
        let p = PartitionContext::scoped(owner, session);
        assert!(p.matches(owner, Some(session)));
        assert!(p.matches(owner, None));
        assert!(!p.matches(owner, Some(Uuid::new_v4())));
        assert!(!p.matches(Uuid::new_v4(), Some(session)));
    }

    #[test]
    fn valence_clamps_each_dimension() {
        let v = ValenceScore::new(-3.0, 1.5, -0.2);
        assert_eq!(v.polarity, -1.0);
        assert_eq!(v.goal_relevance, 1.0);
        assert_eq!(v.arousal, 0.0);

        let nan = ValenceScore::new(f64::NAN, 0.4, 0.4);
        assert_eq!(nan.polarity, 0.0);
    }

    #[test]
    fn new_episode_defaults() {
        let owner = Uuid::new_v4();
        let ts = Utc::now();
        let ep = Episode::new(owner, None, "test memory", vec![0.1, 0.2, 0.3], ts, ShareScope::Owner);
        assert_ne!(ep.id, Uuid::nil());
        assert_eq!(ep.owner_id, owner);
        assert_eq!(ep.sub_scope_id, None);
        assert_eq!(ep.last_accessed_at, ep.created_at);
        assert_eq!(ep.accessibility_score, 1.0);
        assert_eq!(ep.valence, ValenceScore::neutral());
    }

    #[test]
    fn share_scope_parses_legacy_names() {
        assert_eq!("user".parse::<ShareScope>().unwrap(), ShareScope::Owner);
        assert_eq!("GLOBAL".parse::<ShareScope>().unwrap(), ShareScope::Shared);
        assert!(matches!(
            "team".parse::<ShareScope>(),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn sort_by_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&SortBy::ValenceAbsDesc).unwrap();
        assert_eq!(json, "\"valence_abs_desc\"");
        let back: SortBy = serde_json::from_str("\"timestamp_desc\"").unwrap();
        assert_eq!(back, SortBy::TimestampDesc);
    }

    #[test]
    fn retrieval_query_defaults_from_empty_json() {
        let q: RetrievalQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit, 10);
        assert_eq!(q.sort_by, SortBy::TimestampDesc);
        assert!(!q.has_filters());
    }

    #[test]
    fn retryable_errors() {
        assert!(MemoryError::Timeout.is_retryable());
        assert!(MemoryError::TransientStore("down".into()).is_retryable());
        assert!(!MemoryError::Validation("bad".into()).is_retryable());
        assert!(!MemoryError::Conflict(Uuid::nil()).is_retryable());
    }
}
