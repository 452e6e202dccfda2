//! Similarity memory of past decisions and their outcomes.
//!
//! An append-only collection of [`MemoryFragment`]s searched by cosine
//! similarity. Every mutation rewrites the whole collection to the configured
//! [`DurableStore`]; persistence failures are logged and the store keeps
//! operating in memory.

use crate::oracle::storage::DurableStore;
use crate::oracle::types::{
    Advice, FragmentMetadata, MemoryFragment, Outcome, RecallSummary, ScenarioAnalysis,
};
use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// Neighbours considered by [`MemoryStore::analyze_scenario`].
pub const SCENARIO_NEIGHBOURS: usize = 10;

/// Win rate above which similar history is considered favourable.
const POSITIVE_WIN_RATE: f64 = 0.6;
/// Win rate below which similar history is considered unfavourable.
const NEGATIVE_WIN_RATE: f64 = 0.4;

/// A recalled fragment together with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Recollection {
    pub fragment: MemoryFragment,
    /// Cosine similarity to the query, in [-1, 1]
    pub similarity: f64,
}

/// Append-only similarity memory of past decisions and their outcomes.
///
/// Every mutation rewrites the snapshot in the durable store; write failures
/// are logged and the in-memory collection stays authoritative.
pub struct MemoryStore {
    dimension: usize,
    fragments: RwLock<Vec<MemoryFragment>>,
    durable: Arc<dyn DurableStore>,
}

impl MemoryStore {
    /// Opens the store, loading any snapshot the durable store holds.
    ///
    /// Unreadable snapshots are logged and the store starts empty. Fragments
    /// whose embedding length differs from `dimension` are skipped.
    #[instrument(skip(durable))]
    pub async fn open(dimension: usize, durable: Arc<dyn DurableStore>) -> Self {
        let loaded = match durable.read_all().await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<MemoryFragment>>(&bytes) {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!("Memory snapshot is unreadable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load memory snapshot, starting empty: {:#}", e);
                Vec::new()
            }
        };

        let total = loaded.len();
        let fragments: Vec<MemoryFragment> = loaded
            .into_iter()
            .filter(|f| f.embedding.len() == dimension)
            .collect();
        if fragments.len() != total {
            warn!(
                "Skipped {} fragments with a dimension other than {}",
                total - fragments.len(),
                dimension
            );
        }

        info!("Memory store opened with {} fragments", fragments.len());
        Self {
            dimension,
            fragments: RwLock::new(fragments),
            durable,
        }
    }

    /// Embedding length every fragment must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of fragments held.
    pub async fn len(&self) -> usize {
        self.fragments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.fragments.read().await.is_empty()
    }

    /// Copy of the fragment with `id`.
    pub async fn get(&self, id: &str) -> Option<MemoryFragment> {
        self.fragments.read().await.iter().find(|f| f.id == id).cloned()
    }

    /// Appends a fragment and persists the collection.
    ///
    /// Fails only when the embedding has the wrong dimension.
    #[instrument(skip(self, embedding, metadata), fields(symbol = %metadata.symbol, action = %metadata.action))]
    pub async fn remember(&self, embedding: Vec<f64>, metadata: FragmentMetadata) -> Result<String> {
        if embedding.len() != self.dimension {
            bail!(
                "embedding dimension {} does not match store dimension {}",
                embedding.len(),
                self.dimension
            );
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut fragments = self.fragments.write().await;
        fragments.push(MemoryFragment {
            id: id.clone(),
            embedding,
            metadata,
        });
        self.persist(&fragments).await;

        debug!("Remembered fragment {} ({} total)", id, fragments.len());
        Ok(id)
    }

    /// Resolves a pending fragment to WIN or LOSS.
    ///
    /// Returns `true` if the fragment changed. Unknown ids, already resolved
    /// fragments and a `Pending` target are no-ops.
    #[instrument(skip(self))]
    pub async fn update_outcome(&self, id: &str, outcome: Outcome, pnl: f64) -> bool {
        if outcome == Outcome::Pending {
            warn!("Ignoring outcome update to PENDING for fragment {}", id);
            return false;
        }

        let mut fragments = self.fragments.write().await;
        let Some(fragment) = fragments.iter_mut().find(|f| f.id == id) else {
            debug!("No fragment with id {}", id);
            return false;
        };

        if fragment.metadata.outcome != Outcome::Pending {
            warn!(
                "Fragment {} already resolved as {:?}, ignoring {:?}",
                id, fragment.metadata.outcome, outcome
            );
            return false;
        }

        fragment.metadata.outcome = outcome;
        fragment.metadata.pnl = pnl;
        self.persist(&fragments).await;

        info!("Fragment {} resolved as {:?} (pnl {:.2})", id, outcome, pnl);
        true
    }

    /// Up to `k` fragments ordered by descending cosine similarity to `query`.
    pub async fn recall(&self, query: &[f64], k: usize) -> Vec<Recollection> {
        if k == 0 {
            return Vec::new();
        }

        let fragments = self.fragments.read().await;
        let mut scored: Vec<Recollection> = fragments
            .iter()
            .map(|fragment| Recollection {
                similarity: cosine_similarity(query, &fragment.embedding),
                fragment: fragment.clone(),
            })
            .collect();
        drop(fragments);

        // sort_by is stable, so equal similarities keep insertion order
        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Win-rate summary of the resolved fragments among the nearest neighbours.
    pub async fn analyze_scenario(&self, query: &[f64]) -> ScenarioAnalysis {
        let neighbours = self.recall(query, SCENARIO_NEIGHBOURS).await;
        summarize(&neighbours)
    }

    /// Scenario analysis plus short lessons from the `k` nearest resolved fragments.
    pub async fn recall_summary(&self, query: &[f64], k: usize) -> RecallSummary {
        let neighbours = self.recall(query, SCENARIO_NEIGHBOURS.max(k)).await;
        let analysis = summarize(&neighbours[..neighbours.len().min(SCENARIO_NEIGHBOURS)]);
        let lessons = neighbours
            .iter()
            .take(k)
            .filter(|r| r.fragment.metadata.outcome != Outcome::Pending)
            .map(|r| {
                let meta = &r.fragment.metadata;
                format!(
                    "{} {} {:?} pnl={:.2} sim={:.2}",
                    meta.symbol, meta.action, meta.outcome, meta.pnl, r.similarity
                )
            })
            .collect();

        RecallSummary { analysis, lessons }
    }

    /// Serializes the whole collection in the durable snapshot format.
    pub async fn serialize(&self) -> Result<Vec<u8>> {
        let fragments = self.fragments.read().await;
        encode(&fragments)
    }

    /// Writes the current collection to the durable store.
    pub async fn flush(&self) -> Result<()> {
        let fragments = self.fragments.read().await;
        let bytes = encode(&fragments)?;
        self.durable.write_all(&bytes).await
    }

    async fn persist(&self, fragments: &[MemoryFragment]) {
        let result = match encode(fragments) {
            Ok(bytes) => self.durable.write_all(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to persist memory snapshot: {:#}", e);
        }
    }
}

fn encode(fragments: &[MemoryFragment]) -> Result<Vec<u8>> {
    serde_json::to_vec(fragments).context("Failed to serialize memory fragments")
}

fn summarize(neighbours: &[Recollection]) -> ScenarioAnalysis {
    let (wins, losses) = neighbours
        .iter()
        .fold((0usize, 0usize), |(w, l), r| match r.fragment.metadata.outcome {
            Outcome::Win => (w + 1, l),
            Outcome::Loss => (w, l + 1),
            Outcome::Pending => (w, l),
        });

    let resolved = wins + losses;
    if neighbours.is_empty() {
        return ScenarioAnalysis::no_history();
    }
    if resolved == 0 {
        return ScenarioAnalysis::awaiting_outcomes(neighbours.len());
    }

    let win_rate = wins as f64 / resolved as f64;
    let advice = if win_rate > POSITIVE_WIN_RATE {
        Advice::Positive
    } else if win_rate < NEGATIVE_WIN_RATE {
        Advice::Negative
    } else {
        Advice::Uncertain
    };

    ScenarioAnalysis {
        win_rate,
        confidence: (resolved as f64 / SCENARIO_NEIGHBOURS as f64).min(1.0),
        similar_count: neighbours.len(),
        resolved_count: resolved,
        advice,
    }
}

/// Cosine similarity; zero for mismatched lengths, zero-norm vectors or non-finite results.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::storage::InMemorySnapshotStore;
    use crate::oracle::types::Action;

    fn metadata(outcome: Outcome) -> FragmentMetadata {
        FragmentMetadata {
            timestamp: 1,
            symbol: "BTCUSDT".to_string(),
            action: Action::Buy,
            outcome,
            pnl: 0.0,
            context: String::new(),
        }
    }

    async fn create_test_store(dimension: usize) -> MemoryStore {
        MemoryStore::open(dimension, Arc::new(InMemorySnapshotStore::new())).await
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[f64::NAN, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_recall_empty_store() {
        let store = create_test_store(2).await;
        assert!(store.recall(&[1.0, 0.0], 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_recall_orders_by_similarity() {
        let store = create_test_store(2).await;
        store.remember(vec![0.0, 1.0], metadata(Outcome::Pending)).await.unwrap();
        store.remember(vec![1.0, 0.1], metadata(Outcome::Pending)).await.unwrap();
        store.remember(vec![1.0, 1.0], metadata(Outcome::Pending)).await.unwrap();

        let recalled = store.recall(&[1.0, 0.0], 2).await;
        assert_eq!(recalled.len(), 2);
        assert!(recalled[0].similarity >= recalled[1].similarity);
        assert_eq!(recalled[0].fragment.embedding, vec![1.0, 0.1]);

        assert!(store.recall(&[1.0, 0.0], 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_remember_rejects_wrong_dimension() {
        let store = create_test_store(3).await;
        assert!(store.remember(vec![1.0], metadata(Outcome::Pending)).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_outcome_exactly_once() {
        let store = create_test_store(2).await;
        let id = store.remember(vec![1.0, 0.0], metadata(Outcome::Pending)).await.unwrap();

        assert!(store.update_outcome(&id, Outcome::Win, 12.5).await);
        assert!(!store.update_outcome(&id, Outcome::Loss, -3.0).await);
        assert!(!store.update_outcome("missing", Outcome::Win, 1.0).await);

        let fragment = store.get(&id).await.unwrap();
        assert_eq!(fragment.metadata.outcome, Outcome::Win);
        assert_eq!(fragment.metadata.pnl, 12.5);
    }

    #[tokio::test]
    async fn test_analyze_scenario_thresholds() {
        let store = create_test_store(2).await;
        assert_eq!(store.analyze_scenario(&[1.0, 0.0]).await, ScenarioAnalysis::no_history());

        for _ in 0..7 {
            store.remember(vec![1.0, 0.0], metadata(Outcome::Win)).await.unwrap();
        }
        for _ in 0..3 {
            store.remember(vec![1.0, 0.0], metadata(Outcome::Loss)).await.unwrap();
        }

        let analysis = store.analyze_scenario(&[1.0, 0.0]).await;
        assert!((analysis.win_rate - 0.7).abs() < 1e-9);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.advice, Advice::Positive);
    }

    #[tokio::test]
    async fn test_pending_fragments_are_ignored_in_analysis() {
        let store = create_test_store(2).await;
        store.remember(vec![1.0, 0.0], metadata(Outcome::Loss)).await.unwrap();
        store.remember(vec![1.0, 0.0], metadata(Outcome::Pending)).await.unwrap();

        let analysis = store.analyze_scenario(&[1.0, 0.0]).await;
        assert_eq!(analysis.similar_count, 2);
        assert_eq!(analysis.resolved_count, 1);
        assert_eq!(analysis.win_rate, 0.0);
        assert!((analysis.confidence - 0.1).abs() < 1e-9);
        assert_eq!(analysis.advice, Advice::Negative);

        let summary = store.recall_summary(&[1.0, 0.0], 5).await;
        assert_eq!(summary.lessons.len(), 1);
        assert!(summary.lessons[0].contains("Loss"));
    }

    #[tokio::test]
    async fn test_only_pending_neighbours_differ_from_empty_store() {
        let store = create_test_store(2).await;
        assert_eq!(store.analyze_scenario(&[1.0, 0.0]).await.advice, Advice::NoHistory);

        store.remember(vec![1.0, 0.0], metadata(Outcome::Pending)).await.unwrap();
        store.remember(vec![0.9, 0.1], metadata(Outcome::Pending)).await.unwrap();

        let analysis = store.analyze_scenario(&[1.0, 0.0]).await;
        assert_eq!(analysis.advice, Advice::AwaitingOutcomes);
        assert_eq!(analysis.similar_count, 2);
        assert_eq!(analysis.resolved_count, 0);
        assert_eq!(analysis.win_rate, 0.5);
        assert_eq!(analysis.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_open_skips_wrong_dimension_fragments() {
        let fragments = vec![
            MemoryFragment {
                id: "a".to_string(),
                embedding: vec![1.0, 0.0],
                metadata: metadata(Outcome::Win),
            },
            MemoryFragment {
                id: "b".to_string(),
                embedding: vec![1.0, 0.0, 0.0],
                metadata: metadata(Outcome::Win),
            },
        ];
        let bytes = serde_json::to_vec(&fragments).unwrap();
        let store = MemoryStore::open(2, Arc::new(InMemorySnapshotStore::with_bytes(bytes))).await;

        assert_eq!(store.len().await, 1);
        assert!(store.get("a").await.is_some());
    }

    #[tokio::test]
    async fn test_open_with_corrupt_snapshot_starts_empty() {
        let durable = Arc::new(InMemorySnapshotStore::with_bytes(b"not json".to_vec()));
        let store = MemoryStore::open(2, durable).await;
        assert!(store.is_empty().await);
    }
}
