//! Core market types shared by every stage of the Titan Council pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative strength index, 0..100.
pub const INDICATOR_RSI: &str = "rsi";
/// Trend direction: positive bullish, negative bearish, zero neutral.
pub const INDICATOR_TREND: &str = "trend";
/// Order-flow imbalance, roughly -1..1.
pub const INDICATOR_OFI: &str = "ofi";
/// Fear & greed index, 0..100.
pub const INDICATOR_FEAR_GREED: &str = "fear_greed";
/// Realized volatility, as a fraction.
pub const INDICATOR_VOLATILITY: &str = "volatility";
/// Average directional index, 0..100.
pub const INDICATOR_ADX: &str = "adx";

/// Neutral RSI used when a snapshot carries none.
pub const NEUTRAL_RSI: f64 = 50.0;

/// A point-in-time view of one traded instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Instrument symbol, e.g. "BTCUSDT"
    pub symbol: String,
    /// Last traded price
    pub price: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Named numeric indicators (sorted for canonical serialization)
    pub indicators: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: u64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
            indicators: BTreeMap::new(),
        }
    }

    /// Builder-style indicator setter.
    pub fn with_indicator(mut self, name: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(name.into(), value);
        self
    }

    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied()
    }

    /// RSI, or the neutral value when absent.
    pub fn oscillator(&self) -> f64 {
        self.indicator(INDICATOR_RSI).unwrap_or(NEUTRAL_RSI)
    }

    pub fn trend(&self) -> TrendLabel {
        TrendLabel::from_indicator(self.indicator(INDICATOR_TREND).unwrap_or(0.0))
    }
}

/// Discrete trend classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendLabel {
    pub fn from_indicator(value: f64) -> Self {
        if value > 0.0 {
            TrendLabel::Bullish
        } else if value < 0.0 {
            TrendLabel::Bearish
        } else {
            TrendLabel::Neutral
        }
    }
}

impl std::fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrendLabel::Bullish => "BULLISH",
            TrendLabel::Bearish => "BEARISH",
            TrendLabel::Neutral => "NEUTRAL",
        };
        f.write_str(label)
    }
}
