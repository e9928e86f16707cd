//! Whale specialist - institutional block trade flow

use super::{symbol_of, Specialist, SpecialistOutput};
use crate::error::OrchestrationError;
use crate::market::MarketDataProvider;
use crate::models::{ContextSnapshot, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Buy-minus-sell imbalance beyond which flow counts as directional.
const IMBALANCE_CUTOFF: f64 = 0.2;

pub struct WhaleSpecialist {
    provider: Arc<dyn MarketDataProvider>,
}

impl WhaleSpecialist {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Specialist for WhaleSpecialist {
    fn tag(&self) -> SpecialistTag {
        SpecialistTag::Whale
    }

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput> {
        let symbol = symbol_of(snapshot);
        let trades = self.provider.block_trades(symbol).await?;

        if trades.is_empty() {
            return Err(OrchestrationError::SpecialistError(format!(
                "no block trade prints for {}",
                symbol
            )));
        }

        let buy_notional: f64 = trades.iter().filter(|t| t.is_buy).map(|t| t.notional).sum();
        let sell_notional: f64 = trades
            .iter()
            .filter(|t| !t.is_buy)
            .map(|t| t.notional)
            .sum();
        let total = buy_notional + sell_notional;
        let imbalance = if total > 0.0 {
            (buy_notional - sell_notional) / total
        } else {
            0.0
        };

        let (stance, bias) = if imbalance > IMBALANCE_CUTOFF {
            (Stance::Bullish, "accumulation")
        } else if imbalance < -IMBALANCE_CUTOFF {
            (Stance::Bearish, "distribution")
        } else {
            (Stance::Neutral, "balanced")
        };

        Ok(SpecialistOutput {
            stance: Some(stance),
            payload: json!({
                "symbol": symbol,
                "print_count": trades.len(),
                "buy_notional": buy_notional,
                "sell_notional": sell_notional,
                "imbalance": imbalance,
            }),
            narrative: format!(
                "Block flow in {symbol} shows {bias} across {} prints (imbalance {imbalance:+.2}).",
                trades.len()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::SyntheticMarketData;
    use crate::models::AccountScope;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_whale_imbalance_bounded() {
        let specialist = WhaleSpecialist::new(Arc::new(SyntheticMarketData));
        let snapshot = ContextSnapshot {
            correlation_id: Uuid::new_v4(),
            query: "any whales in GOOG?".to_string(),
            symbol: Some("GOOG".to_string()),
            account_scope: AccountScope::All,
        };

        let output = specialist.analyze(&snapshot).await.unwrap();
        let imbalance = output.payload["imbalance"].as_f64().unwrap();
        assert!((-1.0..=1.0).contains(&imbalance));
    }
}
