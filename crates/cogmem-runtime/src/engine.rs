//! Engine wiring.
//!
//! [`MemoryEngine`] opens the store described by a [`MemoryConfig`], builds
//! the retrieval coordinator around it and owns the decay engine.  It is the
//! one object a host process needs to hold.

use std::sync::Arc;
use std::time::Duration;

use cogmem_memory::decay::CycleReport;
use cogmem_memory::retrieval::Embedder;
use cogmem_memory::sandbox::scoped_reader;
use cogmem_memory::{
    DecayEngine, DecayError, DecayHandle, EngineState, EpisodicStore, LexiconScorer,
    MemoryReader, RetrievalCoordinator, SqliteEpisodicStore, StoreError, ValenceScorer,
};
use cogmem_types::PartitionContext;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, MemoryConfig};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open episodic store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decay(#[from] DecayError),
}

pub struct MemoryEngine {
    store: Arc<dyn EpisodicStore>,
    coordinator: RetrievalCoordinator,
    decay: DecayEngine,
}

impl MemoryEngine {
    /// Open with the default [`LexiconScorer`].
    pub fn open(config: &MemoryConfig) -> Result<Self, EngineError> {
        Self::open_with_scorer(config, Arc::new(LexiconScorer::new()))
    }

    pub fn open_with_scorer(
        config: &MemoryConfig,
        scorer: Arc<dyn ValenceScorer>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let store: Arc<dyn EpisodicStore> = if config.is_in_memory() {
            Arc::new(SqliteEpisodicStore::open_in_memory(config.store_options())?)
        } else {
            Arc::new(SqliteEpisodicStore::open(&config.database_url, config.store_options())?)
        };
        let coordinator = RetrievalCoordinator::new(Arc::clone(&store), scorer);
        let decay = DecayEngine::new(Arc::clone(&store), config.decay_config())?;
        info!(
            database = %config.database_url,
            embedding_dim = config.embedding_dim,
            "memory engine opened"
        );
        Ok(Self {
            store,
            coordinator,
            decay,
        })
    }

    /// Enable `query_text` retrieval.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.coordinator = self.coordinator.with_embedder(embedder);
        self
    }

    pub fn coordinator(&self) -> &RetrievalCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> Arc<dyn EpisodicStore> {
        Arc::clone(&self.store)
    }

    /// Read-only access for a script running on behalf of `partition`.
    pub fn reader_for(&self, partition: PartitionContext) -> Arc<dyn MemoryReader> {
        scoped_reader(&self.coordinator, partition)
    }

    pub fn start_decay(&self) -> DecayHandle {
        self.decay.start()
    }

    pub async fn stop_decay(&self, deadline: Duration) -> Result<(), DecayError> {
        self.decay.stop(deadline).await
    }

    pub fn decay_state(&self) -> EngineState {
        self.decay.state()
    }

    pub async fn run_decay_cycle(&self) -> Result<CycleReport, DecayError> {
        self.decay.run_cycle().await
    }
}
