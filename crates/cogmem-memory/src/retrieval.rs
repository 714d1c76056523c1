//! Retrieval Coordinator.
//!
//! The write and read paths that callers use.  The coordinator validates
//! input, scores valence on write, and on read picks a store query, applies
//! the post-filters, orders the result and records the access.
//!
//! Every method takes the caller's [`PartitionContext`] and a [`CallContext`]
//! and surfaces failures as [`MemoryError`].

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cogmem_types::{
    Episode, EpisodeInput, MemoryError, PartitionContext, RetrievalQuery, SortBy, ValenceScore,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::CallContext;
use crate::episodic::{EpisodicStore, RecentWindow, StoreError};
use crate::valence::ValenceScorer;

/// Multiplier applied to `limit` for the first store query when post-filters
/// may drop fetched records.
pub const OVERFETCH_FACTOR: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Embedder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Embedding provider failed: {0}")]
    Provider(String),
}

impl From<EmbedError> for MemoryError {
    fn from(e: EmbedError) -> Self {
        MemoryError::Embedding(e.to_string())
    }
}

/// Turns query text into a vector of the store's dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// RetrievedEpisode
// ─────────────────────────────────────────────────────────────────────────────

/// One retrieval hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedEpisode {
    pub episode: Episode,
    /// Cosine distance to the query; `None` for recency listings.
    pub distance: Option<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RetrievalCoordinator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetrievalCoordinator {
    store: Arc<dyn EpisodicStore>,
    scorer: Arc<dyn ValenceScorer>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl RetrievalCoordinator {
    pub fn new(store: Arc<dyn EpisodicStore>, scorer: Arc<dyn ValenceScorer>) -> Self {
        Self {
            store,
            scorer,
            embedder: None,
        }
    }

    /// Enable `query_text` retrieval through `embedder`.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn store_handle(&self) -> Arc<dyn EpisodicStore> {
        Arc::clone(&self.store)
    }

    // ── write path ───────────────────────────────────────────────────────────

    /// Persist a new episode for `partition` and return its id.
    pub async fn store(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        input: EpisodeInput,
    ) -> Result<Uuid, MemoryError> {
        if partition.owner_id.is_nil() {
            return Err(MemoryError::Validation("owner_id is required".into()));
        }
        if input.content.trim().is_empty() {
            return Err(MemoryError::Validation("content is empty".into()));
        }
        let Some(embedding) = input.embedding else {
            return Err(MemoryError::Validation("embedding is required".into()));
        };
        let expected = self.store.embedding_dim();
        if embedding.len() != expected {
            return Err(MemoryError::Validation(format!(
                "embedding dimension mismatch: expected {expected}, got {}",
                embedding.len()
            )));
        }

        let valence = match input.explicit_valence {
            Some(v) => v.clamped(),
            None => self.score_or_neutral(&input.content, input.task_hint.as_deref()),
        };

        let mut episode = Episode::new(
            partition.owner_id,
            partition.sub_scope_id,
            input.content,
            embedding,
            Utc::now(),
            input.share_scope,
        )
        .with_valence(valence);
        episode.metadata = input.metadata;

        let id = episode.id;
        self.store
            .save(ctx, partition, &episode)
            .await
            .map_err(MemoryError::from)?;
        debug!(episode_id = %id, owner_id = %partition.owner_id, polarity = valence.polarity, "episode stored");
        Ok(id)
    }

    fn score_or_neutral(&self, text: &str, task_hint: Option<&str>) -> ValenceScore {
        match self.scorer.score(text, task_hint) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "valence scoring failed; storing neutral valence");
                ValenceScore::neutral()
            }
        }
    }

    // ── read path ────────────────────────────────────────────────────────────

    /// Run `query` against `partition`.
    pub async fn retrieve(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        query: &RetrievalQuery,
    ) -> Result<Vec<RetrievedEpisode>, MemoryError> {
        validate_query(query)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let fetch = if query.has_filters() {
            query.limit.saturating_mul(OVERFETCH_FACTOR)
        } else {
            query.limit
        };

        let (mut hits, examined) = match self.query_vector(query).await? {
            Some(vector) => {
                self.fetch_similar(ctx, partition, query, &vector, fetch)
                    .await?
            }
            None => self.fetch_recent(ctx, partition, query, fetch).await?,
        };
        sort_hits(&mut hits, query.sort_by);
        hits.truncate(query.limit);

        self.record_access(ctx, partition, hits.iter_mut().map(|h| &mut h.episode))
            .await?;
        debug!(
            owner_id = %partition.owner_id,
            examined,
            returned = hits.len(),
            sort_by = ?query.sort_by,
            "retrieval completed"
        );
        Ok(hits)
    }

    /// Point lookup.  Records the access like [`retrieve`](Self::retrieve).
    pub async fn get(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        id: Uuid,
    ) -> Result<Episode, MemoryError> {
        let mut episode = self.store.find_by_id(ctx, id, partition).await?;
        self.record_access(ctx, partition, std::iter::once(&mut episode))
            .await?;
        Ok(episode)
    }

    /// Owner-initiated removal.
    pub async fn delete(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        id: Uuid,
    ) -> Result<(), MemoryError> {
        self.store.delete(ctx, id, partition).await?;
        debug!(episode_id = %id, owner_id = %partition.owner_id, "episode deleted");
        Ok(())
    }

    /// Newest matches first.  The time range is applied by the store; the
    /// remaining filters are applied here, one page at a time, until `limit`
    /// matches are found or the partition is exhausted.
    async fn fetch_recent(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        query: &RetrievalQuery,
        page_size: usize,
    ) -> Result<(Vec<RetrievedEpisode>, usize), StoreError> {
        let mut window = RecentWindow {
            since: query.since,
            until: query.until,
            offset: 0,
        };
        let mut hits = Vec::new();
        let mut examined = 0;
        loop {
            let page = self
                .store
                .find_recent_in(ctx, &window, page_size, partition)
                .await?;
            let fetched = page.len();
            examined += fetched;
            hits.extend(
                page.into_iter()
                    .filter(|episode| passes_filters(episode, query))
                    .map(|episode| RetrievedEpisode {
                        episode,
                        distance: None,
                    }),
            );
            if hits.len() >= query.limit || fetched < page_size {
                break;
            }
            window.offset += fetched;
        }
        hits.truncate(query.limit);
        Ok((hits, examined))
    }

    /// Nearest matches first.  The candidate set doubles until `limit`
    /// matches survive the filters or the partition is exhausted.
    async fn fetch_similar(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        query: &RetrievalQuery,
        vector: &[f32],
        mut fetch: usize,
    ) -> Result<(Vec<RetrievedEpisode>, usize), StoreError> {
        loop {
            let candidates = self
                .store
                .find_by_vector(ctx, vector, fetch, partition)
                .await?;
            let fetched = candidates.len();
            let hits: Vec<RetrievedEpisode> = candidates
                .into_iter()
                .filter(|(episode, _)| passes_filters(episode, query))
                .map(|(episode, distance)| RetrievedEpisode {
                    episode,
                    distance: Some(distance),
                })
                .collect();
            if hits.len() >= query.limit || fetched < fetch || fetch == usize::MAX {
                return Ok((hits, fetched));
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn query_vector(&self, query: &RetrievalQuery) -> Result<Option<Vec<f32>>, MemoryError> {
        if let Some(v) = &query.query_vector {
            return Ok(Some(v.clone()));
        }
        let Some(text) = query.query_text.as_deref() else {
            return Ok(None);
        };
        let Some(embedder) = &self.embedder else {
            return Err(MemoryError::Validation(
                "query_text requires an embedding provider".into(),
            ));
        };
        Ok(Some(embedder.embed(text).await?))
    }

    async fn record_access<'a>(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        episodes: impl Iterator<Item = &'a mut Episode> + Send,
    ) -> Result<(), StoreError> {
        let episodes: Vec<&mut Episode> = episodes.collect();
        if episodes.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let ids: Vec<Uuid> = episodes.iter().map(|e| e.id).collect();
        self.store.touch(ctx, &ids, now, partition).await?;
        for episode in episodes {
            if now > episode.last_accessed_at {
                episode.last_accessed_at = now;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filters and ordering
// ─────────────────────────────────────────────────────────────────────────────

fn validate_query(query: &RetrievalQuery) -> Result<(), MemoryError> {
    if let (Some(since), Some(until)) = (query.since, query.until)
        && since > until
    {
        return Err(MemoryError::Validation("since is after until".into()));
    }
    if query.min_polarity.is_some_and(|p| !p.is_finite()) {
        return Err(MemoryError::Validation("min_polarity must be finite".into()));
    }
    if query.min_accessibility.is_some_and(|a| !a.is_finite()) {
        return Err(MemoryError::Validation("min_accessibility must be finite".into()));
    }
    if query.query_vector.as_ref().is_some_and(|v| v.is_empty()) {
        return Err(MemoryError::Validation("query_vector is empty".into()));
    }
    Ok(())
}

fn passes_filters(episode: &Episode, query: &RetrievalQuery) -> bool {
    if query.since.is_some_and(|since| episode.created_at < since) {
        return false;
    }
    if query.until.is_some_and(|until| episode.created_at > until) {
        return false;
    }
    if query
        .min_polarity
        .is_some_and(|min| episode.valence.polarity < min)
    {
        return false;
    }
    if query
        .min_accessibility
        .is_some_and(|min| episode.accessibility_score < min)
    {
        return false;
    }
    if let Some(source) = &query.source
        && episode.source() != Some(source.as_str())
    {
        return false;
    }
    if query.share_scope.is_some_and(|s| episode.share_scope != s) {
        return false;
    }
    query
        .required_metadata
        .iter()
        .all(|(k, v)| episode.metadata.get(k) == Some(v))
}

fn desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

fn sort_hits(hits: &mut [RetrievedEpisode], sort_by: SortBy) {
    hits.sort_by(|a, b| {
        let primary = match sort_by {
            SortBy::TimestampDesc => b.episode.created_at.cmp(&a.episode.created_at),
            // Recency listings carry no distance; they keep the id order.
            SortBy::Relevance => match (a.distance, b.distance) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            SortBy::ValenceAbsDesc => desc(
                a.episode.valence.polarity.abs(),
                b.episode.valence.polarity.abs(),
            ),
            SortBy::AccessibilityDesc => {
                desc(a.episode.accessibility_score, b.episode.accessibility_score)
            }
        };
        primary.then_with(|| a.episode.id.cmp(&b.episode.id))
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
