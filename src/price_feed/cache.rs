//! Time-boxed quote cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::Instant;

/// Where a cached price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuoteSource {
    Stream,
    Pull,
}

impl QuoteSource {
    pub fn as_label(self) -> &'static str {
        match self {
            QuoteSource::Stream => "stream",
            QuoteSource::Pull => "pull",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceCacheEntry {
    pub price: Decimal,
    /// Local receive time (stream) or request start time (pull)
    pub observed_at: Instant,
    pub source: QuoteSource,
}

impl PriceCacheEntry {
    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }
}

/// Symbol -> latest quote, with a fixed staleness bound.
#[derive(Debug)]
pub struct QuoteCache {
    source: QuoteSource,
    max_age: Duration,
    entries: DashMap<String, PriceCacheEntry>,
}

impl QuoteCache {
    pub fn new(source: QuoteSource, max_age: Duration) -> Self {
        Self {
            source,
            max_age,
            entries: DashMap::new(),
        }
    }

    /// Price for `symbol` if one younger than the staleness bound exists.
    pub fn fresh(&self, symbol: &str) -> Option<Decimal> {
        self.entries
            .get(symbol)
            .filter(|e| e.is_fresh(self.max_age))
            .map(|e| e.price)
    }

    pub fn get(&self, symbol: &str) -> Option<PriceCacheEntry> {
        self.entries.get(symbol).map(|e| *e)
    }

    /// Store `price` observed at `observed_at`, unless a newer observation
    /// was stored while this one was in flight.
    pub fn insert_if_newer(&self, symbol: &str, price: Decimal, observed_at: Instant) -> bool {
        let entry = PriceCacheEntry {
            price,
            observed_at,
            source: self.source,
        };
        match self.entries.entry(symbol.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().observed_at <= observed_at {
                    existing.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_freshness_bound() {
        let cache = QuoteCache::new(QuoteSource::Stream, Duration::from_secs(5));
        cache.insert_if_newer("BTCUSDT", dec!(50000), Instant::now());
        assert_eq!(cache.fresh("BTCUSDT"), Some(dec!(50000)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.fresh("BTCUSDT"), None);
        assert!(cache.get("BTCUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_observation_does_not_overwrite() {
        let cache = QuoteCache::new(QuoteSource::Pull, Duration::from_secs(900));
        let early = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        let late = Instant::now();

        assert!(cache.insert_if_newer("ETHUSDT", dec!(3001), late));
        assert!(!cache.insert_if_newer("ETHUSDT", dec!(3000), early));
        assert_eq!(cache.fresh("ETHUSDT"), Some(dec!(3001)));
    }
}
