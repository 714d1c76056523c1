//! Read-only memory access for sandboxed scripts.
//!
//! Scripts never receive the store, the coordinator or a partition they can
//! change.  They get a [`MemoryReader`] already bound to one partition and the
//! JSON schema of [`RetrievalQuery`] so they can build well-formed requests.

use std::sync::Arc;

use async_trait::async_trait;
use cogmem_types::{Episode, MemoryError, PartitionContext, RetrievalQuery};

use crate::context::CallContext;
use crate::retrieval::RetrievalCoordinator;

/// The narrow capability handed to a script.
#[async_trait]
pub trait MemoryReader: Send + Sync {
    /// Up to `limit` most recent episodes.
    async fn recent(&self, limit: usize) -> Result<Vec<Episode>, MemoryError>;

    /// Up to `limit` episodes closest to `vector`, nearest first.
    async fn similar(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<Episode>, MemoryError>;
}

/// [`MemoryReader`] fixed to one partition.
///
/// Reads go through the coordinator, so they record access exactly like any
/// other retrieval.
#[derive(Clone)]
pub struct PartitionScopedReader {
    coordinator: RetrievalCoordinator,
    partition: PartitionContext,
    ctx: CallContext,
}

impl PartitionScopedReader {
    pub fn new(coordinator: RetrievalCoordinator, partition: PartitionContext) -> Self {
        Self {
            coordinator,
            partition,
            ctx: CallContext::background(),
        }
    }

    /// Bind every read to `ctx`, e.g. the script's own deadline.
    pub fn with_context(mut self, ctx: CallContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn partition(&self) -> &PartitionContext {
        &self.partition
    }

    async fn run(&self, query: RetrievalQuery) -> Result<Vec<Episode>, MemoryError> {
        let hits = self
            .coordinator
            .retrieve(&self.ctx, &self.partition, &query)
            .await?;
        Ok(hits.into_iter().map(|h| h.episode).collect())
    }
}

#[async_trait]
impl MemoryReader for PartitionScopedReader {
    async fn recent(&self, limit: usize) -> Result<Vec<Episode>, MemoryError> {
        self.run(RetrievalQuery::recent(limit)).await
    }

    async fn similar(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<Episode>, MemoryError> {
        self.run(RetrievalQuery::similar(vector, limit)).await
    }
}

/// JSON schema describing [`RetrievalQuery`].
pub fn query_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(RetrievalQuery);
    serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
}

/// Shareable handle, as scripts usually hold the reader behind an `Arc`.
pub fn scoped_reader(
    coordinator: &RetrievalCoordinator,
    partition: PartitionContext,
) -> Arc<dyn MemoryReader> {
    Arc::new(PartitionScopedReader::new(coordinator.clone(), partition))
}
