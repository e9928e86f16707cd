//! Forecast specialist - short-horizon drift projection
//!
//! Exponentially weighted return drift extrapolated over a small horizon.
//! Deterministic; no model calls.

use super::{symbol_of, Specialist, SpecialistOutput};
use crate::error::OrchestrationError;
use crate::market::MarketDataProvider;
use crate::models::{ContextSnapshot, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const HISTORY_BARS: usize = 60;
const HORIZON_BARS: usize = 5;
const EWMA_ALPHA: f64 = 0.2;
/// Drift below this magnitude is treated as flat.
const FLAT_CUTOFF: f64 = 0.0005;

pub struct ForecastSpecialist {
    provider: Arc<dyn MarketDataProvider>,
}

impl ForecastSpecialist {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Specialist for ForecastSpecialist {
    fn tag(&self) -> SpecialistTag {
        SpecialistTag::Forecast
    }

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput> {
        let symbol = symbol_of(snapshot);
        let bars = self.provider.history(symbol, HISTORY_BARS).await?;

        if bars.len() < 2 {
            return Err(OrchestrationError::SpecialistError(format!(
                "insufficient history for {} forecast",
                symbol
            )));
        }

        let mut drift = 0.0;
        for pair in bars.windows(2) {
            let ret = pair[1].close / pair[0].close - 1.0;
            drift = EWMA_ALPHA * ret + (1.0 - EWMA_ALPHA) * drift;
        }

        let last_close = bars.last().map(|b| b.close).unwrap_or(0.0);
        let projected = last_close * (1.0 + drift).powi(HORIZON_BARS as i32);

        let (stance, trend) = if drift > FLAT_CUTOFF {
            (Stance::Bullish, "upward")
        } else if drift < -FLAT_CUTOFF {
            (Stance::Bearish, "downward")
        } else {
            (Stance::Neutral, "flat")
        };

        Ok(SpecialistOutput {
            stance: Some(stance),
            payload: json!({
                "symbol": symbol,
                "drift_per_bar": drift,
                "horizon_bars": HORIZON_BARS,
                "last_close": last_close,
                "projected_close": projected,
                "trend": trend,
            }),
            narrative: format!(
                "Projection for {symbol} is {trend} over the next {HORIZON_BARS} bars, targeting {projected:.2} from {last_close:.2}."
            ),
        })
    }
}
