//! Price API client with TTL caches.
//!
//! Two cache tiers: the stETH/ETH rate is hot (5 minute TTL, polled every
//! analysis tick) and historical prices are cold (6 hour TTL, keyed by hour
//! bucket; the calculator only ever asks at hourly granularity).
//!
//! Readers racing a refresh is fine; last writer wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Soft de-peg band. A rate outside this band is worth a warning; the hard
/// validity bound lives in the data-quality validator.
const DEPEG_WARN_LOWER: Decimal = Decimal::from_parts(98, 0, 0, false, 2);
const DEPEG_WARN_UPPER: Decimal = Decimal::from_parts(102, 0, 0, false, 2);

const RATE_TTL: Duration = Duration::from_secs(5 * 60);
const HISTORICAL_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Price access used by the calculator. Missing prices are `None`; the
/// stETH/ETH rate always yields a value (falling back to parity).
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_current_price(&self, asset: &str) -> Option<Decimal>;
    async fn get_historical_price(&self, asset: &str, at: DateTime<Utc>) -> Option<Decimal>;
    async fn get_steth_eth_rate(&self) -> Decimal;
}

#[derive(Debug, Deserialize)]
struct PriceBody {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct RateBody {
    rate: Decimal,
}

struct TtlEntry<V> {
    stored_at: Instant,
    value: V,
}

/// Minimal TTL map. No eviction beyond expiry-on-read; the key space is
/// bounded (assets × hour buckets inside the lookback).
struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, TtlEntry<V>>>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: K, value: V) {
        self.entries.write().insert(
            key,
            TtlEntry {
                stored_at: Instant::now(),
                value,
            },
        );
    }
}

pub struct PriceProvider {
    http: reqwest::Client,
    base_url: String,
    rate_cache: TtlCache<(), Decimal>,
    historical_cache: TtlCache<(String, i64), Decimal>,
}

impl PriceProvider {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build price HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_cache: TtlCache::new(RATE_TTL),
            historical_cache: TtlCache::new(HISTORICAL_TTL),
        })
    }

    async fn fetch_price(&self, url: &str) -> eyre::Result<Decimal> {
        let body: PriceBody = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.price)
    }
}

/// Hour bucket of an instant, the historical cache key granularity.
fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

#[async_trait]
impl PriceSource for PriceProvider {
    async fn get_current_price(&self, asset: &str) -> Option<Decimal> {
        let url = format!("{}/v1/price/{asset}", self.base_url);
        match self.fetch_price(&url).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(asset, error = %e, "current price fetch failed");
                None
            }
        }
    }

    async fn get_historical_price(&self, asset: &str, at: DateTime<Utc>) -> Option<Decimal> {
        let key = (asset.to_string(), hour_bucket(at));
        if let Some(cached) = self.historical_cache.get(&key) {
            return Some(cached);
        }

        let url = format!("{}/v1/price/{asset}/at/{}", self.base_url, at.timestamp());
        match self.fetch_price(&url).await {
            Ok(price) => {
                self.historical_cache.put(key, price);
                Some(price)
            }
            Err(e) => {
                warn!(asset, at = %at, error = %e, "historical price fetch failed");
                None
            }
        }
    }

    async fn get_steth_eth_rate(&self) -> Decimal {
        if let Some(cached) = self.rate_cache.get(&()) {
            return cached;
        }

        let url = format!("{}/v1/rate/steth-eth", self.base_url);
        let rate = match self.http.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<RateBody>().await {
                    Ok(body) => body.rate,
                    Err(e) => {
                        warn!(error = %e, "stETH/ETH rate body malformed, assuming parity");
                        return Decimal::ONE;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "stETH/ETH rate endpoint error, assuming parity");
                    return Decimal::ONE;
                }
            },
            Err(e) => {
                warn!(error = %e, "stETH/ETH rate fetch failed, assuming parity");
                return Decimal::ONE;
            }
        };

        if rate < DEPEG_WARN_LOWER || rate > DEPEG_WARN_UPPER {
            warn!(%rate, "stETH/ETH rate outside [0.98, 1.02] — possible de-peg");
        } else {
            debug!(%rate, "stETH/ETH rate refreshed");
        }

        self.rate_cache.put((), rate);
        rate
    }
}
