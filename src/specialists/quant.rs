//! Quant specialist - technical indicator analysis
//!
//! Pure algorithmic calculations over the price history; no model calls.

use super::{symbol_of, Specialist, SpecialistOutput};
use crate::error::OrchestrationError;
use crate::market::{Bar, MarketDataProvider};
use crate::models::{ContextSnapshot, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const HISTORY_BARS: usize = 60;
const RSI_PERIOD: usize = 14;
const SMA_FAST: usize = 20;
const SMA_SLOW: usize = 50;

pub struct QuantSpecialist {
    provider: Arc<dyn MarketDataProvider>,
}

impl QuantSpecialist {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Specialist for QuantSpecialist {
    fn tag(&self) -> SpecialistTag {
        SpecialistTag::Quant
    }

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput> {
        let symbol = symbol_of(snapshot);
        let bars = self.provider.history(symbol, HISTORY_BARS).await?;

        if bars.len() < SMA_SLOW {
            return Err(OrchestrationError::SpecialistError(format!(
                "insufficient history for {} ({} bars, need {})",
                symbol,
                bars.len(),
                SMA_SLOW
            )));
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let rsi = relative_strength_index(&closes, RSI_PERIOD);
        let sma_fast = simple_moving_average(&closes, SMA_FAST);
        let sma_slow = simple_moving_average(&closes, SMA_SLOW);
        let last_close = *closes.last().unwrap_or(&0.0);
        let support = support_level(&bars);

        let stance = if sma_fast > sma_slow && rsi < 70.0 {
            Stance::Bullish
        } else if sma_fast < sma_slow && rsi > 30.0 {
            Stance::Bearish
        } else {
            Stance::Neutral
        };

        let narrative = format!(
            "Technical read on {symbol}: RSI {:.1}, {}-bar SMA {:.2} vs {}-bar SMA {:.2}, support near {:.2}.",
            rsi, SMA_FAST, sma_fast, SMA_SLOW, sma_slow, support
        );

        Ok(SpecialistOutput {
            stance: Some(stance),
            payload: json!({
                "symbol": symbol,
                "rsi": rsi,
                "sma_fast": sma_fast,
                "sma_slow": sma_slow,
                "last_close": last_close,
                "support_level": support,
            }),
            narrative,
        })
    }
}

fn simple_moving_average(closes: &[f64], period: usize) -> f64 {
    let window = &closes[closes.len().saturating_sub(period)..];
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

fn relative_strength_index(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 50.0;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in closes[closes.len() - period - 1..].windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }

    if losses == 0.0 {
        return 100.0;
    }
    let rs = gains / losses;
    100.0 - 100.0 / (1.0 + rs)
}

fn support_level(bars: &[Bar]) -> f64 {
    bars.iter()
        .rev()
        .take(SMA_FAST)
        .map(|b| b.low)
        .fold(f64::INFINITY, f64::min)
}
