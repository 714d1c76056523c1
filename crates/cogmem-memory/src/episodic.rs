//! Episodic Record Store.
//!
//! Persists [`Episode`] records together with their dense embedding vectors
//! to SQLite and answers point, recency and cosine-similarity queries.  Every
//! query is filtered by a [`PartitionContext`]; a record outside the caller's
//! partition is indistinguishable from a missing one.
//!
//! # Storage layout
//!
//! A single table `episodic_memory` is created (if it does not already exist)
//! with the following columns:
//!
//! | column              | type | description                                   |
//! |---------------------|------|-----------------------------------------------|
//! | id                  | TEXT | UUID v4 primary key                           |
//! | owner_id            | TEXT | Partition key (UUID)                          |
//! | sub_scope_id        | TEXT | Optional secondary partition key (UUID)       |
//! | content             | TEXT | Immutable text payload                        |
//! | embedding           | BLOB | Little-endian f32 vector (4 × dim bytes)      |
//! | created_at          | TEXT | RFC-3339 creation time (UTC, nanoseconds)     |
//! | last_accessed_at    | TEXT | RFC-3339 time of the latest read              |
//! | accessibility_score | REAL | Decaying rank weight, ≥ 0                     |
//! | valence             | TEXT | JSON `{polarity, goal_relevance, arousal}`    |
//! | share_scope         | TEXT | `"owner"` or `"shared"`                       |
//! | metadata            | TEXT | JSON string map                               |
//! | decayed_at          | TEXT | RFC-3339 time of the latest decay write       |
//!
//! Timestamps are written with a fixed nanosecond width so their text order is
//! their chronological order, which lets `ORDER BY created_at` and
//! `MAX(last_accessed_at, ?)` work directly on the stored strings.
//!
//! Recency queries use the `(owner_id, created_at DESC)` index.  Similarity
//! search is an exact cosine scan over the owner's rows.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use cogmem_memory::context::CallContext;
//! use cogmem_memory::episodic::{EpisodicStore, SqliteEpisodicStore, StoreOptions};
//! use cogmem_types::{Episode, PartitionContext, ShareScope};
//! use uuid::Uuid;
//!
//! let store = SqliteEpisodicStore::open_in_memory(StoreOptions::with_dim(3)).unwrap();
//! let owner = Uuid::new_v4();
//! let partition = PartitionContext::owner(owner);
//!
//! let ep = Episode::new(owner, None, "the deploy failed", vec![0.1, 0.9, 0.3],
//!                       chrono::Utc::now(), ShareScope::Owner);
//! let ctx = CallContext::background();
//! store.save(&ctx, &partition, &ep).await.unwrap();
//!
//! let hits = store.find_by_vector(&ctx, &[0.1, 0.9, 0.3], 5, &partition).await.unwrap();
//! assert_eq!(hits[0].0.id, ep.id);
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use cogmem_types::{Episode, PartitionContext, ShareScope, ValenceScore};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OptionalExtension, Row, params};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::CallContext;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from episodic store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid episode: {0}")]
    Invalid(String),
    #[error("Episode {0} already exists")]
    DuplicateId(Uuid),
    #[error("Episode {0} not found")]
    NotFound(Uuid),
    #[error("Store call exceeded its deadline or was cancelled")]
    Timeout,
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Connectivity-class failures the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Pool(_) | StoreError::Join(_) | StoreError::Timeout
        )
    }
}

impl From<StoreError> for cogmem_types::MemoryError {
    fn from(err: StoreError) -> Self {
        use cogmem_types::MemoryError;
        match err {
            StoreError::DimensionMismatch { .. } | StoreError::Invalid(_) => {
                MemoryError::Validation(err.to_string())
            }
            StoreError::DuplicateId(id) => MemoryError::Conflict(id),
            StoreError::NotFound(id) => MemoryError::NotFound(id),
            StoreError::Timeout => MemoryError::Timeout,
            other => MemoryError::TransientStore(other.to_string()),
        }
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted)
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// DecayCandidate
// ─────────────────────────────────────────────────────────────────────────────

/// The slice of an episode the decay engine reads.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayCandidate {
    pub id: Uuid,
    pub accessibility_score: f64,
    pub last_accessed_at: DateTime<Utc>,
    /// Time of the previous decay write, if any.
    pub decayed_at: Option<DateTime<Utc>>,
    pub polarity: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// RecentWindow
// ─────────────────────────────────────────────────────────────────────────────

/// Page of a recency listing: an optional `created_at` range (both ends
/// inclusive) and the number of newest matching records to skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecentWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store contract
// ─────────────────────────────────────────────────────────────────────────────

/// Partition-isolated persistence for episodic records.
#[async_trait]
pub trait EpisodicStore: Send + Sync {
    /// Embedding dimension every stored vector must have.
    fn embedding_dim(&self) -> usize;

    /// Insert a new record.  Fails with [`StoreError::DuplicateId`] when the
    /// id already exists.
    async fn save(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        episode: &Episode,
    ) -> Result<(), StoreError>;

    /// Point lookup.  A record outside `partition` yields
    /// [`StoreError::NotFound`].
    async fn find_by_id(
        &self,
        ctx: &CallContext,
        id: Uuid,
        partition: &PartitionContext,
    ) -> Result<Episode, StoreError>;

    /// Up to `limit` records, newest first, ties by ascending id.
    async fn find_recent(
        &self,
        ctx: &CallContext,
        limit: usize,
        partition: &PartitionContext,
    ) -> Result<Vec<Episode>, StoreError> {
        self.find_recent_in(ctx, &RecentWindow::default(), limit, partition)
            .await
    }

    /// [`find_recent`](Self::find_recent) restricted to `window`.
    async fn find_recent_in(
        &self,
        ctx: &CallContext,
        window: &RecentWindow,
        limit: usize,
        partition: &PartitionContext,
    ) -> Result<Vec<Episode>, StoreError>;

    /// Up to `limit` records by ascending cosine distance to `query`, ties by
    /// ascending id.  Each record is paired with its distance.
    async fn find_by_vector(
        &self,
        ctx: &CallContext,
        query: &[f32],
        limit: usize,
        partition: &PartitionContext,
    ) -> Result<Vec<(Episode, f32)>, StoreError>;

    /// Advance `last_accessed_at` to `at` for the listed records.  Returns
    /// the number of records updated.
    async fn touch(
        &self,
        ctx: &CallContext,
        ids: &[Uuid],
        at: DateTime<Utc>,
        partition: &PartitionContext,
    ) -> Result<usize, StoreError>;

    async fn delete(
        &self,
        ctx: &CallContext,
        id: Uuid,
        partition: &PartitionContext,
    ) -> Result<(), StoreError>;

    /// Every record eligible for decay, optionally narrowed to one partition.
    async fn decay_candidates(
        &self,
        ctx: &CallContext,
        scope: Option<&PartitionContext>,
    ) -> Result<Vec<DecayCandidate>, StoreError>;

    /// Write one decayed score.  The stored score is never raised.
    async fn set_accessibility(
        &self,
        ctx: &CallContext,
        id: Uuid,
        score: f64,
        decayed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Cosine similarity
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Cosine distance, `1 − similarity`, in `[0.0, 2.0]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS episodic_memory (
    id                  TEXT NOT NULL PRIMARY KEY,
    owner_id            TEXT NOT NULL,
    sub_scope_id        TEXT,
    content             TEXT NOT NULL,
    embedding           BLOB NOT NULL,
    created_at          TEXT NOT NULL,
    last_accessed_at    TEXT NOT NULL,
    accessibility_score REAL NOT NULL DEFAULT 1.0,
    valence             TEXT NOT NULL,
    share_scope         TEXT NOT NULL,
    metadata            TEXT NOT NULL DEFAULT '{}',
    decayed_at          TEXT
);
CREATE INDEX IF NOT EXISTS idx_episodic_memory_owner_created
    ON episodic_memory (owner_id, created_at DESC);
";

const COLUMNS: &str = "id, owner_id, sub_scope_id, content, embedding, created_at, \
     last_accessed_at, accessibility_score, valence, share_scope, metadata";

/// Partition predicate over `?1` (owner) and `?2` (sub-scope or NULL).
const PARTITION_FILTER: &str =
    "owner_id = ?1 AND (?2 IS NULL OR sub_scope_id IS NULL OR sub_scope_id = ?2)";

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn uuid_from_sql(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("uuid {raw:?}: {e}")))
}

fn sub_scope_param(partition: &PartitionContext) -> Option<String> {
    partition.sub_scope_id.map(|s| s.to_string())
}

struct RawRow {
    id: String,
    owner_id: String,
    sub_scope_id: Option<String>,
    content: String,
    embedding: Vec<u8>,
    created_at: String,
    last_accessed_at: String,
    accessibility_score: f64,
    valence: String,
    share_scope: String,
    metadata: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            sub_scope_id: row.get(2)?,
            content: row.get(3)?,
            embedding: row.get(4)?,
            created_at: row.get(5)?,
            last_accessed_at: row.get(6)?,
            accessibility_score: row.get(7)?,
            valence: row.get(8)?,
            share_scope: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_episode(self) -> Result<Episode, StoreError> {
        let valence: ValenceScore = serde_json::from_str(&self.valence)?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)?;
        let share_scope: ShareScope = self
            .share_scope
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        Ok(Episode {
            id: uuid_from_sql(&self.id)?,
            owner_id: uuid_from_sql(&self.owner_id)?,
            sub_scope_id: self.sub_scope_id.as_deref().map(uuid_from_sql).transpose()?,
            content: self.content,
            embedding: bytes_to_embedding(&self.embedding),
            created_at: ts_from_sql(&self.created_at)?,
            last_accessed_at: ts_from_sql(&self.last_accessed_at)?,
            accessibility_score: self.accessibility_score,
            valence,
            share_scope,
            metadata,
        })
    }
}

fn collect_episodes(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Episode>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RawRow::read)?;
    let mut episodes = Vec::new();
    for row in rows {
        episodes.push(row?.into_episode()?);
    }
    Ok(episodes)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteEpisodicStore
// ─────────────────────────────────────────────────────────────────────────────

/// Construction options for [`SqliteEpisodicStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Dimension every embedding must have.
    pub embedding_dim: usize,
    /// Maximum pooled connections (file databases only).
    pub pool_size: u32,
    /// Deadline applied to calls whose context has none.
    pub op_timeout: Duration,
}

impl StoreOptions {
    pub fn with_dim(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            ..Self::default()
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            embedding_dim: 1536,
            pool_size: 8,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// SQLite-backed [`EpisodicStore`] over an `r2d2` connection pool.
///
/// Statements run on tokio's blocking pool.  When a call's deadline passes
/// the statement is interrupted through the connection's interrupt handle and
/// [`StoreError::Timeout`] is returned.
#[derive(Clone)]
pub struct SqliteEpisodicStore {
    pool: Pool<SqliteConnectionManager>,
    embedding_dim: usize,
    op_timeout: Duration,
}

impl SqliteEpisodicStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)?;
        Self::from_pool(pool, options)
    }

    /// Open a private in-memory database (useful for testing).
    ///
    /// The pool holds a single connection that is never recycled, since an
    /// in-memory database lives exactly as long as its connection.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool, options)
    }

    fn from_pool(
        pool: Pool<SqliteConnectionManager>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        if options.embedding_dim == 0 {
            return Err(StoreError::Invalid("embedding dimension must be positive".into()));
        }
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self {
            pool,
            embedding_dim: options.embedding_dim,
            op_timeout: options.op_timeout,
        })
    }

    fn check_dim(&self, actual: usize) -> Result<(), StoreError> {
        if actual != self.embedding_dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.embedding_dim,
                actual,
            });
        }
        Ok(())
    }

    fn validate(&self, partition: &PartitionContext, episode: &Episode) -> Result<(), StoreError> {
        if episode.owner_id.is_nil() {
            return Err(StoreError::Invalid("owner_id is required".into()));
        }
        if !episode.visible_to(partition) {
            return Err(StoreError::Invalid(
                "episode keys do not belong to the calling partition".into(),
            ));
        }
        if episode.content.trim().is_empty() {
            return Err(StoreError::Invalid("content is empty".into()));
        }
        self.check_dim(episode.embedding.len())?;
        if episode.embedding.iter().any(|x| !x.is_finite()) {
            return Err(StoreError::Invalid("embedding has non-finite components".into()));
        }
        let v = &episode.valence;
        if !(-1.0..=1.0).contains(&v.polarity)
            || !(0.0..=1.0).contains(&v.goal_relevance)
            || !(0.0..=1.0).contains(&v.arousal)
        {
            return Err(StoreError::Invalid(format!(
                "valence out of range: polarity {}, goal_relevance {}, arousal {}",
                v.polarity, v.goal_relevance, v.arousal
            )));
        }
        if !episode.accessibility_score.is_finite() || episode.accessibility_score < 0.0 {
            return Err(StoreError::Invalid("accessibility_score must be finite and ≥ 0".into()));
        }
        if episode.last_accessed_at < episode.created_at {
            return Err(StoreError::Invalid("last_accessed_at precedes created_at".into()));
        }
        Ok(())
    }

    /// Run `op` on a pooled connection under `ctx`'s deadline.
    async fn run<T, F>(&self, ctx: &CallContext, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        if ctx.is_done() {
            return Err(StoreError::Timeout);
        }
        let deadline = ctx.effective_deadline(self.op_timeout);
        let checkout_wait = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        let handle_slot: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));
        let abandoned = Arc::new(AtomicBool::new(false));

        let pool = self.pool.clone();
        let slot = handle_slot.clone();
        let gone = abandoned.clone();
        let task = tokio::task::spawn_blocking(move || {
            let conn = pool.get_timeout(checkout_wait)?;
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(conn.get_interrupt_handle());
            }
            if gone.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout);
            }
            let result = f(&conn);
            if let Ok(mut guard) = slot.lock() {
                guard.take();
            }
            result
        });

        let outcome = tokio::select! {
            joined = task => joined.map_err(|e| StoreError::Join(e.to_string()))?,
            _ = tokio::time::sleep_until(deadline) => Err(StoreError::Timeout),
            _ = ctx.cancel_token().cancelled() => Err(StoreError::Timeout),
        };

        match outcome {
            Err(StoreError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                if let Ok(mut guard) = handle_slot.lock()
                    && let Some(handle) = guard.take()
                {
                    handle.interrupt();
                }
                warn!(op, "store call abandoned at deadline");
                Err(StoreError::Timeout)
            }
            Err(StoreError::Sqlite(e)) if is_interrupt(&e) => Err(StoreError::Timeout),
            other => other,
        }
    }
}

#[async_trait]
impl EpisodicStore for SqliteEpisodicStore {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    async fn save(
        &self,
        ctx: &CallContext,
        partition: &PartitionContext,
        episode: &Episode,
    ) -> Result<(), StoreError> {
        self.validate(partition, episode)?;
        debug!(episode_id = %episode.id, owner_id = %episode.owner_id, "saving episode");

        let id = episode.id;
        let values = (
            episode.id.to_string(),
            episode.owner_id.to_string(),
            episode.sub_scope_id.map(|s| s.to_string()),
            episode.content.clone(),
            embedding_to_bytes(&episode.embedding),
            ts_to_sql(&episode.created_at),
            ts_to_sql(&episode.last_accessed_at),
            episode.accessibility_score,
            serde_json::to_string(&episode.valence)?,
            episode.share_scope.as_str(),
            serde_json::to_string(&episode.metadata)?,
        );
        self.run(ctx, "save", move |conn| {
            conn.execute(
                "INSERT INTO episodic_memory
                     (id, owner_id, sub_scope_id, content, embedding, created_at,
                      last_accessed_at, accessibility_score, valence, share_scope, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    values.0, values.1, values.2, values.3, values.4, values.5, values.6,
                    values.7, values.8, values.9, values.10,
                ],
            )
            .map_err(|e| {
                if is_primary_key_violation(&e) {
                    StoreError::DuplicateId(id)
                } else {
                    StoreError::Sqlite(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn find_by_id(
        &self,
        ctx: &CallContext,
        id: Uuid,
        partition: &PartitionContext,
    ) -> Result<Episode, StoreError> {
        let owner = partition.owner_id.to_string();
        let sub_scope = sub_scope_param(partition);
        self.run(ctx, "find_by_id", move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM episodic_memory WHERE {PARTITION_FILTER} AND id = ?3"
            );
            let raw = conn
                .query_row(&sql, params![owner, sub_scope, id.to_string()], RawRow::read)
                .optional()?;
            match raw {
                Some(raw) => raw.into_episode(),
                None => Err(StoreError::NotFound(id)),
            }
        })
        .await
    }

    async fn find_recent_in(
        &self,
        ctx: &CallContext,
        window: &RecentWindow,
        limit: usize,
        partition: &PartitionContext,
    ) -> Result<Vec<Episode>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if let (Some(since), Some(until)) = (window.since, window.until)
            && since > until
        {
            return Ok(Vec::new());
        }
        let owner = partition.owner_id.to_string();
        let sub_scope = sub_scope_param(partition);
        let since = window.since.as_ref().map(ts_to_sql);
        let until = window.until.as_ref().map(ts_to_sql);
        let offset = sql_limit(window.offset);
        self.run(ctx, "find_recent", move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM episodic_memory
                 WHERE {PARTITION_FILTER}
                   AND (?3 IS NULL OR created_at >= ?3)
                   AND (?4 IS NULL OR created_at <= ?4)
                 ORDER BY created_at DESC, id ASC
                 LIMIT ?5 OFFSET ?6"
            );
            collect_episodes(
                conn,
                &sql,
                params![owner, sub_scope, since, until, sql_limit(limit), offset],
            )
        })
        .await
    }

    async fn find_by_vector(
        &self,
        ctx: &CallContext,
        query: &[f32],
        limit: usize,
        partition: &PartitionContext,
    ) -> Result<Vec<(Episode, f32)>, StoreError> {
        self.check_dim(query.len())?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = query.to_vec();
        let owner = partition.owner_id.to_string();
        let sub_scope = sub_scope_param(partition);
        self.run(ctx, "find_by_vector", move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM episodic_memory WHERE {PARTITION_FILTER}");
            let episodes = collect_episodes(conn, &sql, params![owner, sub_scope])?;
            let mut scored: Vec<(Episode, f32)> = episodes
                .into_iter()
                .filter(|e| e.embedding.len() == query.len())
                .map(|e| {
                    let distance = cosine_distance(&e.embedding, &query);
                    (e, distance)
                })
                .collect();
            scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    async fn touch(
        &self,
        ctx: &CallContext,
        ids: &[Uuid],
        at: DateTime<Utc>,
        partition: &PartitionContext,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sub_scope = match sub_scope_param(partition) {
            Some(s) => Value::Text(s),
            None => Value::Null,
        };
        let mut values = vec![
            Value::Text(ts_to_sql(&at)),
            Value::Text(partition.owner_id.to_string()),
            sub_scope.clone(),
            sub_scope,
        ];
        values.extend(ids.iter().map(|id| Value::Text(id.to_string())));
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.run(ctx, "touch", move |conn| {
            let sql = format!(
                "UPDATE episodic_memory
                 SET last_accessed_at = MAX(last_accessed_at, ?)
                 WHERE owner_id = ? AND (? IS NULL OR sub_scope_id IS NULL OR sub_scope_id = ?)
                   AND id IN ({placeholders})"
            );
            Ok(conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?)
        })
        .await
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        id: Uuid,
        partition: &PartitionContext,
    ) -> Result<(), StoreError> {
        let owner = partition.owner_id.to_string();
        let sub_scope = sub_scope_param(partition);
        self.run(ctx, "delete", move |conn| {
            let sql = format!("DELETE FROM episodic_memory WHERE {PARTITION_FILTER} AND id = ?3");
            match conn.execute(&sql, params![owner, sub_scope, id.to_string()])? {
                0 => Err(StoreError::NotFound(id)),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn decay_candidates(
        &self,
        ctx: &CallContext,
        scope: Option<&PartitionContext>,
    ) -> Result<Vec<DecayCandidate>, StoreError> {
        let scope = scope.map(|p| (p.owner_id.to_string(), sub_scope_param(p)));
        self.run(ctx, "decay_candidates", move |conn| {
            let base = "SELECT id, accessibility_score, last_accessed_at, decayed_at, valence
                        FROM episodic_memory";
            let (sql, values) = match scope {
                Some((owner, sub_scope)) => (
                    format!("{base} WHERE {PARTITION_FILTER}"),
                    vec![Value::Text(owner), sub_scope.map_or(Value::Null, Value::Text)],
                ),
                None => (base.to_string(), Vec::new()),
            };
            let mut stmt = conn.prepare(&sql)?;
            let raw: Vec<(String, f64, String, Option<String>, String)> = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut candidates = Vec::with_capacity(raw.len());
            for (id, score, last_accessed, decayed, valence) in raw {
                let parsed = (|| -> Result<DecayCandidate, StoreError> {
                    let valence: ValenceScore = serde_json::from_str(&valence)?;
                    Ok(DecayCandidate {
                        id: uuid_from_sql(&id)?,
                        accessibility_score: score,
                        last_accessed_at: ts_from_sql(&last_accessed)?,
                        decayed_at: decayed.as_deref().map(ts_from_sql).transpose()?,
                        polarity: valence.polarity,
                    })
                })();
                match parsed {
                    Ok(candidate) => candidates.push(candidate),
                    Err(e) => warn!(episode_id = %id, error = %e, "skipping unreadable decay row"),
                }
            }
            Ok(candidates)
        })
        .await
    }

    async fn set_accessibility(
        &self,
        ctx: &CallContext,
        id: Uuid,
        score: f64,
        decayed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !score.is_finite() {
            return Err(StoreError::Invalid(format!("non-finite accessibility score {score}")));
        }
        let score = score.max(0.0);
        let decayed_at = ts_to_sql(&decayed_at);
        self.run(ctx, "set_accessibility", move |conn| {
            let changed = conn.execute(
                "UPDATE episodic_memory
                 SET accessibility_score = MIN(accessibility_score, ?1), decayed_at = ?2
                 WHERE id = ?3",
                params![score, decayed_at, id.to_string()],
            )?;
            match changed {
                0 => Err(StoreError::NotFound(id)),
                _ => Ok(()),
            }
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
