//! End-to-end properties of the memory engine, exercised through the public
//! API only.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use cogmem_memory::{
    CallContext, DecayConfig, DecayEngine, EpisodicStore, LexiconScorer, MemoryReader,
    RetrievalCoordinator, SqliteEpisodicStore, StoreError, StoreOptions, ValenceScorer,
    query_schema, scoped_reader,
};
use cogmem_types::{Episode, EpisodeInput, PartitionContext, RetrievalQuery, ShareScope, ValenceScore};
use uuid::Uuid;

const DIM: usize = 4;

fn open_store() -> Arc<SqliteEpisodicStore> {
    Arc::new(SqliteEpisodicStore::open_in_memory(StoreOptions::with_dim(DIM)).unwrap())
}

fn unit(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i % DIM] = 1.0;
    v
}

async fn seed(store: &SqliteEpisodicStore, owner: Uuid, age_secs: i64, polarity: f64) -> Episode {
    let ep = Episode::new(
        owner,
        None,
        format!("episode aged {age_secs}s"),
        unit(age_secs as usize),
        Utc::now() - TimeDelta::seconds(age_secs),
        ShareScope::Owner,
    )
    .with_valence(ValenceScore::new(polarity, 0.0, 0.0));
    store
        .save(&CallContext::background(), &PartitionContext::owner(owner), &ep)
        .await
        .unwrap();
    ep
}

#[tokio::test]
async fn partitions_never_leak() {
    let store = open_store();
    let ctx = CallContext::background();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let a = seed(&store, alice, 10, 0.0).await;
    let b = seed(&store, bob, 20, 0.0).await;
    let pa = PartitionContext::owner(alice);
    let pb = PartitionContext::owner(bob);

    assert!(matches!(
        store.find_by_id(&ctx, b.id, &pa).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.find_by_id(&ctx, a.id, &pb).await,
        Err(StoreError::NotFound(_))
    ));

    let recent = store.find_recent(&ctx, 10, &pa).await.unwrap();
    assert_eq!(recent.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id]);

    for i in 0..DIM {
        let hits = store.find_by_vector(&ctx, &unit(i), 10, &pb).await.unwrap();
        assert!(hits.iter().all(|(e, _)| e.owner_id == bob));
    }
}

#[tokio::test]
async fn scoped_readers_stay_in_their_partition() {
    let store = open_store();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let a = seed(&store, alice, 10, 0.0).await;
    seed(&store, bob, 20, 0.0).await;
    let coordinator = RetrievalCoordinator::new(store.clone(), Arc::new(LexiconScorer::new()));

    let reader = scoped_reader(&coordinator, PartitionContext::owner(alice));
    let recent = reader.recent(10).await.unwrap();
    assert_eq!(recent.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id]);
    for i in 0..DIM {
        let hits = reader.similar(unit(i), 10).await.unwrap();
        assert!(hits.iter().all(|e| e.owner_id == alice));
    }

    let schema = query_schema();
    assert!(schema["properties"]["limit"].is_object());
}

#[tokio::test]
async fn find_recent_returns_the_two_newest() {
    let store = open_store();
    let owner = Uuid::new_v4();
    let _first = seed(&store, owner, 300, 0.0).await;
    let second = seed(&store, owner, 200, 0.0).await;
    let third = seed(&store, owner, 100, 0.0).await;

    let got = store
        .find_recent(&CallContext::background(), 2, &PartitionContext::owner(owner))
        .await
        .unwrap();
    assert_eq!(got.iter().map(|e| e.id).collect::<Vec<_>>(), vec![third.id, second.id]);
}

#[tokio::test]
async fn store_then_get_roundtrips_caller_fields() {
    let store = open_store();
    let coord = RetrievalCoordinator::new(store.clone(), Arc::new(LexiconScorer::new()));
    let owner = Uuid::new_v4();
    let session = Uuid::new_v4();
    let p = PartitionContext::scoped(owner, session);
    let ctx = CallContext::background();

    let input = EpisodeInput {
        content: "deployment finished, great success".into(),
        embedding: Some(vec![0.5, 0.5, 0.0, 0.0]),
        share_scope: ShareScope::Shared,
        metadata: [("source".to_string(), "ci".to_string())].into(),
        ..EpisodeInput::default()
    };
    let id = coord.store(&ctx, &p, input.clone()).await.unwrap();

    let stored = store.find_by_id(&ctx, id, &p).await.unwrap();
    assert_eq!(stored.owner_id, owner);
    assert_eq!(stored.sub_scope_id, Some(session));
    assert_eq!(stored.content, input.content);
    assert_eq!(Some(stored.embedding.clone()), input.embedding);
    assert_eq!(stored.share_scope, ShareScope::Shared);
    assert_eq!(stored.metadata, input.metadata);
    assert_eq!(stored.accessibility_score, 1.0);
    assert!(stored.valence.polarity > 0.0);

    // Visible owner-wide, hidden from a sibling sub-scope.
    assert!(coord.get(&ctx, &PartitionContext::owner(owner), id).await.is_ok());
    assert!(
        coord
            .get(&ctx, &PartitionContext::scoped(owner, Uuid::new_v4()), id)
            .await
            .is_err()
    );
}

#[test]
fn scorer_is_deterministic() {
    let scorer = LexiconScorer::new();
    let a = scorer.score("urgent client complaint", Some("client_complaint")).unwrap();
    let b = scorer.score("urgent client complaint", Some("client_complaint")).unwrap();
    assert_eq!(a.polarity.to_bits(), b.polarity.to_bits());
    assert_eq!(a.goal_relevance.to_bits(), b.goal_relevance.to_bits());
    assert_eq!(a.arousal.to_bits(), b.arousal.to_bits());
}

#[tokio::test]
async fn decay_is_monotone_idempotent_and_valence_weighted() {
    let store = open_store();
    let owner = Uuid::new_v4();
    let p = PartitionContext::owner(owner);
    let ctx = CallContext::background();
    let a = seed(&store, owner, 0, 0.9).await;
    let b = seed(&store, owner, 0, 0.0).await;

    let engine = DecayEngine::new(
        store.clone(),
        DecayConfig {
            base_rate: 1e-7,
            valence_weight: 0.8,
            ..DecayConfig::default()
        },
    )
    .unwrap();

    let later = a.last_accessed_at.max(b.last_accessed_at) + TimeDelta::seconds(1_000_000);
    engine.run_cycle_at(later).await.unwrap();
    let sa = store.find_by_id(&ctx, a.id, &p).await.unwrap().accessibility_score;
    let sb = store.find_by_id(&ctx, b.id, &p).await.unwrap().accessibility_score;
    assert!(sa > sb);
    assert!(sa <= 1.0 && sb <= 1.0);

    engine.run_cycle_at(later).await.unwrap();
    assert_eq!(store.find_by_id(&ctx, a.id, &p).await.unwrap().accessibility_score, sa);
    assert_eq!(store.find_by_id(&ctx, b.id, &p).await.unwrap().accessibility_score, sb);
}

#[tokio::test]
async fn recall_refreshes_access_time_used_by_decay() {
    let store = open_store();
    let coord = RetrievalCoordinator::new(store.clone(), Arc::new(LexiconScorer::new()));
    let owner = Uuid::new_v4();
    let p = PartitionContext::owner(owner);
    let ctx = CallContext::background();
    let recalled = seed(&store, owner, 7_200, 0.0).await;
    let forgotten = seed(&store, owner, 7_300, 0.0).await;

    let hits = coord.retrieve(&ctx, &p, &RetrievalQuery::recent(1)).await.unwrap();
    assert_eq!(hits[0].episode.id, recalled.id);

    let engine = DecayEngine::new(
        store.clone(),
        DecayConfig {
            base_rate: 1e-4,
            ..DecayConfig::default()
        },
    )
    .unwrap();
    engine.run_cycle().await.unwrap();

    let kept = store.find_by_id(&ctx, recalled.id, &p).await.unwrap().accessibility_score;
    let faded = store.find_by_id(&ctx, forgotten.id, &p).await.unwrap().accessibility_score;
    assert!(kept > faded);
}
