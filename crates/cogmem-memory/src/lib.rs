//! `cogmem-memory` – Partitioned episodic memory.
//!
//! Stores what an agent experienced, keyed by owner, ranks it by emotional
//! salience and lets it fade over time unless it is recalled.
//!
//! # Modules
//!
//! - [`episodic`] – [`EpisodicStore`][episodic::EpisodicStore]: the
//!   partition-isolated record store, with a SQLite implementation
//!   supporting recency listing and cosine-similarity recall.
//! - [`valence`] – [`ValenceScorer`][valence::ValenceScorer]: deterministic
//!   polarity / goal-relevance / arousal scoring of episode text.
//! - [`decay`] – [`DecayEngine`][decay::DecayEngine]: periodic,
//!   valence-weighted exponential decay of accessibility scores.
//! - [`retrieval`] – [`RetrievalCoordinator`][retrieval::RetrievalCoordinator]:
//!   the store/retrieve/get/delete entry points with filtering and ordering.
//! - [`sandbox`] – [`MemoryReader`][sandbox::MemoryReader]: read-only,
//!   partition-bound access for scripts.
//! - [`context`] – [`CallContext`][context::CallContext]: per-call deadline
//!   and cancellation.

pub mod context;
pub mod decay;
pub mod episodic;
pub mod retrieval;
pub mod sandbox;
pub mod valence;

pub use context::CallContext;
pub use decay::{DecayConfig, DecayEngine, DecayError, DecayHandle, EngineState};
pub use episodic::{EpisodicStore, RecentWindow, SqliteEpisodicStore, StoreError, StoreOptions};
pub use retrieval::{Embedder, RetrievalCoordinator, RetrievedEpisode};
pub use sandbox::{MemoryReader, PartitionScopedReader, query_schema, scoped_reader};
pub use valence::{LexiconScorer, ValenceScorer};
