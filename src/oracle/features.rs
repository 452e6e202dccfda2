//! Snapshot embedding.
//!
//! Turns a market snapshot into a fixed-dimension vector in [-1, 1] so that
//! similar market conditions land close to each other under cosine similarity.

use crate::types::{
    MarketSnapshot, INDICATOR_ADX, INDICATOR_FEAR_GREED, INDICATOR_OFI, INDICATOR_RSI,
    INDICATOR_TREND, INDICATOR_VOLATILITY, NEUTRAL_RSI,
};
use tracing::{debug, instrument};

/// Number of features the embedder computes natively.
pub const DEFAULT_DIMENSION: usize = 8;

/// Feature slots, in vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingFeature {
    Rsi,
    Trend,
    OrderFlow,
    FearGreed,
    Volatility,
    TrendStrength,
    RsiZone,
    FlowAgreement,
}

impl EmbeddingFeature {
    pub fn all() -> [EmbeddingFeature; DEFAULT_DIMENSION] {
        [
            EmbeddingFeature::Rsi,
            EmbeddingFeature::Trend,
            EmbeddingFeature::OrderFlow,
            EmbeddingFeature::FearGreed,
            EmbeddingFeature::Volatility,
            EmbeddingFeature::TrendStrength,
            EmbeddingFeature::RsiZone,
            EmbeddingFeature::FlowAgreement,
        ]
    }
}

/// Deterministic snapshot embedder.
#[derive(Debug, Clone)]
pub struct SnapshotEmbedder {
    dimension: usize,
}

impl SnapshotEmbedder {
    /// Create an embedder producing vectors of `dimension` entries.
    ///
    /// Dimensions above [`DEFAULT_DIMENSION`] are zero-padded, smaller ones truncate.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[instrument(skip(self, snapshot), fields(symbol = %snapshot.symbol))]
    pub fn embed(&self, snapshot: &MarketSnapshot) -> Vec<f64> {
        let mut vector: Vec<f64> = EmbeddingFeature::all()
            .iter()
            .map(|feature| Self::compute(*feature, snapshot))
            .collect();
        vector.resize(self.dimension, 0.0);

        debug!("Embedded snapshot: {:?}", vector);
        vector
    }

    fn compute(feature: EmbeddingFeature, snapshot: &MarketSnapshot) -> f64 {
        let get = |name: &str| {
            snapshot
                .indicator(name)
                .filter(|value| value.is_finite())
        };

        let value = match feature {
            EmbeddingFeature::Rsi => {
                (get(INDICATOR_RSI).unwrap_or(NEUTRAL_RSI) - NEUTRAL_RSI) / NEUTRAL_RSI
            }
            EmbeddingFeature::Trend => get(INDICATOR_TREND).unwrap_or(0.0),
            EmbeddingFeature::OrderFlow => get(INDICATOR_OFI).unwrap_or(0.0),
            EmbeddingFeature::FearGreed => {
                (get(INDICATOR_FEAR_GREED).unwrap_or(50.0) - 50.0) / 50.0
            }
            EmbeddingFeature::Volatility => {
                // 0% maps to -1, 10% and above to +1
                match get(INDICATOR_VOLATILITY) {
                    Some(vol) => (vol.abs().min(0.10) / 0.10) * 2.0 - 1.0,
                    None => 0.0,
                }
            }
            EmbeddingFeature::TrendStrength => match get(INDICATOR_ADX) {
                Some(adx) => (adx - 25.0) / 25.0,
                None => 0.0,
            },
            EmbeddingFeature::RsiZone => {
                let rsi = get(INDICATOR_RSI).unwrap_or(NEUTRAL_RSI);
                if rsi < 32.0 {
                    1.0
                } else if rsi > 68.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            EmbeddingFeature::FlowAgreement => {
                let trend = get(INDICATOR_TREND).unwrap_or(0.0);
                let ofi = get(INDICATOR_OFI).unwrap_or(0.0);
                (trend.signum() * ofi.signum()) * (trend.abs().min(1.0) * ofi.abs().min(1.0)).sqrt()
            }
        };

        value.clamp(-1.0, 1.0)
    }
}

impl Default for SnapshotEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot::new("ETHUSDT", 3_000.0, 1_700_000_000_000)
            .with_indicator(INDICATOR_RSI, 25.0)
            .with_indicator(INDICATOR_TREND, 1.0)
            .with_indicator(INDICATOR_OFI, 0.4)
            .with_indicator(INDICATOR_FEAR_GREED, 80.0)
    }

    #[test]
    fn test_embedding_dimension_and_range() {
        let embedder = SnapshotEmbedder::default();
        let vector = embedder.embed(&snapshot());

        assert_eq!(vector.len(), DEFAULT_DIMENSION);
        assert!(vector.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!((vector[0] - (-0.5)).abs() < 1e-9);
        assert_eq!(vector[6], 1.0); // oversold zone
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = SnapshotEmbedder::default();
        assert_eq!(embedder.embed(&snapshot()), embedder.embed(&snapshot()));
    }

    #[test]
    fn test_custom_dimension_pads_and_truncates() {
        assert_eq!(SnapshotEmbedder::new(12).embed(&snapshot()).len(), 12);
        assert_eq!(SnapshotEmbedder::new(3).embed(&snapshot()).len(), 3);
    }

    #[test]
    fn test_non_finite_indicators_are_neutral() {
        let snap = MarketSnapshot::new("X", 1.0, 0).with_indicator(INDICATOR_RSI, f64::NAN);
        let vector = SnapshotEmbedder::default().embed(&snap);
        assert_eq!(vector[0], 0.0);
    }
}
