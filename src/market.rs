//! Market data provider seam
//!
//! Price/quote fetchers are external collaborators; the core only depends
//! on this interface. `SyntheticMarketData` is a deterministic stand-in
//! used by the demo binary and tests.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Headline {
    pub title: String,
    /// Lexicon polarity in [-1, 1] as scored by the upstream feed.
    pub polarity: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockTrade {
    pub notional: f64,
    pub is_buy: bool,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;
    async fn history(&self, symbol: &str, bars: usize) -> Result<Vec<Bar>>;
    async fn headlines(&self, symbol: &str) -> Result<Vec<Headline>>;
    async fn block_trades(&self, symbol: &str) -> Result<Vec<BlockTrade>>;
}

/// Deterministic synthetic market data, seeded by symbol.
pub struct SyntheticMarketData;

impl SyntheticMarketData {
    fn seed(symbol: &str) -> u64 {
        symbol
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x1000_0000_01b3)
            })
    }

    fn base_price(seed: u64) -> f64 {
        20.0 + (seed % 480) as f64
    }

    /// Per-bar drift in roughly [-0.2%, +0.2%].
    fn drift(seed: u64) -> f64 {
        ((seed >> 8) % 400) as f64 / 100_000.0 - 0.002
    }
}

#[async_trait]
impl MarketDataProvider for SyntheticMarketData {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let bars = self.history(symbol, 2).await?;
        let last = bars[bars.len() - 1];
        let prev = bars[0];
        Ok(Quote {
            price: last.close,
            change_pct: (last.close - prev.close) / prev.close * 100.0,
        })
    }

    async fn history(&self, symbol: &str, bars: usize) -> Result<Vec<Bar>> {
        let seed = Self::seed(symbol);
        let base = Self::base_price(seed);
        let drift = Self::drift(seed);

        let mut series = Vec::with_capacity(bars);
        let mut close = base;
        for t in 0..bars {
            let wave = (t as f64 / 5.0).sin() * 0.004;
            let open = close;
            close = open * (1.0 + drift + wave);
            let high = open.max(close) * 1.003;
            let low = open.min(close) * 0.997;
            let volume = 500_000 + (seed.wrapping_add(t as u64) % 250_000);
            series.push(Bar {
                open,
                high,
                low,
                close,
                volume,
            });
        }
        Ok(series)
    }

    async fn headlines(&self, symbol: &str) -> Result<Vec<Headline>> {
        let seed = Self::seed(symbol);
        let templates: [(&str, f64); 6] = [
            ("{} beats quarterly revenue estimates", 0.6),
            ("Analysts raise price target on {}", 0.5),
            ("{} faces regulatory scrutiny over disclosures", -0.5),
            ("Institutional inflows lift {} ahead of earnings", 0.4),
            ("{} guidance disappoints on margin pressure", -0.6),
            ("{} announces expanded buyback program", 0.3),
        ];

        let mut out = Vec::new();
        for (i, (template, polarity)) in templates.iter().enumerate() {
            // Deterministic subset: roughly four of six per symbol.
            if (seed >> i) & 0b11 != 0 {
                out.push(Headline {
                    title: template.replace("{}", symbol),
                    polarity: *polarity,
                });
            }
        }
        Ok(out)
    }

    async fn block_trades(&self, symbol: &str) -> Result<Vec<BlockTrade>> {
        let seed = Self::seed(symbol);
        let mut out = Vec::with_capacity(6);
        for i in 0..6u64 {
            let s = seed.rotate_left(i as u32 * 7);
            out.push(BlockTrade {
                notional: 1_000_000.0 + (s % 4_000_000) as f64,
                is_buy: s % 3 != 0,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_is_deterministic_per_symbol() {
        let provider = SyntheticMarketData;
        let a = provider.history("NVDA", 60).await.unwrap();
        let b = provider.history("NVDA", 60).await.unwrap();
        assert_eq!(a.len(), 60);
        assert_eq!(a[59].close, b[59].close);

        let c = provider.history("KO", 60).await.unwrap();
        assert_ne!(a[59].close, c[59].close);
    }

    #[tokio::test]
    async fn test_headlines_nonempty() {
        let provider = SyntheticMarketData;
        let headlines = provider.headlines("AAPL").await.unwrap();
        assert!(!headlines.is_empty());
        assert!(headlines[0].title.contains("AAPL"));
    }
}
