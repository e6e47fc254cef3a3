use crate::{
    config::Config,
    constants::{
        PRICE_DURABLE_TTL_SECS, PRICE_FETCH_TIMEOUT_SECS, PRICE_MEMORY_TTL_SECS,
        PRICE_STALE_MAX_SECS, SETTING_PRICE_CACHE_PREFIX, SUPPORTED_CURRENCIES,
    },
    db::Database,
    error::Result,
    utils::normalize_token,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// EUR spot price with its provenance. `Unavailable` is a sentinel, not an
/// error: callers fall back to the gateway outcome or proportional math.
#[derive(Debug, Clone)]
pub enum PriceQuote {
    Available { value: Decimal, source: PriceSource },
    Unavailable,
}

impl PriceQuote {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            PriceQuote::Available { value, .. } => Some(*value),
            PriceQuote::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceSource {
    Memory,
    Durable,
    Provider(String),
    Stale,
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_eur(&self, currency: &str) -> anyhow::Result<Decimal>;
}

#[derive(Clone)]
struct CachedPrice {
    value: Decimal,
    fetched_at: Instant,
}

#[derive(Serialize, Deserialize)]
struct DurablePrice {
    price: Decimal,
    fetched_at_unix: i64,
}

/// Cached EUR spot prices with multi-source rotation and stale fallback.
/// Readers tolerate staleness; a single latch guards the in-process map.
pub struct PriceOracle {
    db: Database,
    providers: Vec<Arc<dyn PriceProvider>>,
    memory: RwLock<HashMap<String, CachedPrice>>,
    rotation: std::sync::atomic::AtomicUsize,
}

impl PriceOracle {
    pub fn new(db: Database, config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PRICE_FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        let mut providers: Vec<Arc<dyn PriceProvider>> = vec![
            Arc::new(CoinGeckoProvider { client: client.clone() }),
            Arc::new(KrakenProvider { client: client.clone() }),
            Arc::new(BinanceProvider { client: client.clone() }),
        ];
        if let Some(url) = &config.price_rpc_url {
            providers.insert(
                0,
                Arc::new(ConfiguredRpcProvider { client, url: url.clone() }),
            );
        }

        Self {
            db,
            providers,
            memory: RwLock::new(HashMap::new()),
            rotation: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Freshness ladder: memory (5 min) → durable (10 min) → live fetch →
    /// stale memory (1 h) → Unavailable. Never errors.
    pub async fn price_eur(&self, currency: &str) -> PriceQuote {
        let key = normalize_token(currency);

        if let Some(cached) = self.memory_get(&key, Duration::from_secs(PRICE_MEMORY_TTL_SECS)).await
        {
            return PriceQuote::Available {
                value: cached.value,
                source: PriceSource::Memory,
            };
        }

        match self.durable_get(&key).await {
            Ok(Some(value)) => {
                self.memory_put(&key, value).await;
                return PriceQuote::Available {
                    value,
                    source: PriceSource::Durable,
                };
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("Durable price cache read failed for {}: {}", key, err),
        }

        if let Some((value, provider)) = self.fetch_live(&key).await {
            self.store(&key, value).await;
            return PriceQuote::Available {
                value,
                source: PriceSource::Provider(provider),
            };
        }

        if let Some(cached) = self.memory_get(&key, Duration::from_secs(PRICE_STALE_MAX_SECS)).await
        {
            tracing::warn!("Serving stale {} price ({} EUR)", key, cached.value);
            return PriceQuote::Available {
                value: cached.value,
                source: PriceSource::Stale,
            };
        }

        tracing::error!("No EUR price available for {}", key);
        PriceQuote::Unavailable
    }

    /// Forced refetch used by the periodic refresh job. Keeps the old value
    /// on total failure.
    pub async fn refresh(&self, currency: &str) {
        let key = normalize_token(currency);
        if let Some((value, provider)) = self.fetch_live(&key).await {
            self.store(&key, value).await;
            tracing::debug!("Price refresh: {} = {} EUR via {}", key, value, provider);
        } else {
            tracing::warn!("Price refresh failed for {}", key);
        }
    }

    pub async fn refresh_all(&self) {
        join_all(SUPPORTED_CURRENCIES.iter().map(|c| self.refresh(c))).await;
    }

    /// Round-robin across providers starting at a rotating offset; first
    /// success wins. Each provider call is bounded by the client timeout.
    async fn fetch_live(&self, key: &str) -> Option<(Decimal, String)> {
        if self.providers.is_empty() {
            return None;
        }
        let start = self
            .rotation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        for offset in 0..self.providers.len() {
            let provider = &self.providers[(start + offset) % self.providers.len()];
            match provider.fetch_eur(key).await {
                Ok(value) if value > Decimal::ZERO => {
                    return Some((value, provider.name().to_string()));
                }
                Ok(value) => {
                    tracing::warn!(
                        "Provider {} returned non-positive {} price: {}",
                        provider.name(),
                        key,
                        value
                    );
                }
                Err(err) => {
                    tracing::debug!("Provider {} failed for {}: {}", provider.name(), key, err);
                }
            }
        }
        None
    }

    async fn memory_get(&self, key: &str, max_age: Duration) -> Option<CachedPrice> {
        let memory = self.memory.read().await;
        memory
            .get(key)
            .filter(|c| c.fetched_at.elapsed() <= max_age)
            .cloned()
    }

    async fn memory_put(&self, key: &str, value: Decimal) {
        let mut memory = self.memory.write().await;
        memory.insert(
            key.to_string(),
            CachedPrice {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    async fn durable_get(&self, key: &str) -> Result<Option<Decimal>> {
        let setting = self
            .db
            .get_setting(&format!("{}{}", SETTING_PRICE_CACHE_PREFIX, key))
            .await?;
        let Some(raw) = setting else {
            return Ok(None);
        };
        let Ok(parsed) = serde_json::from_str::<DurablePrice>(&raw) else {
            return Ok(None);
        };
        let age = Utc::now().timestamp() - parsed.fetched_at_unix;
        if age < 0 || age as u64 > PRICE_DURABLE_TTL_SECS {
            return Ok(None);
        }
        Ok(Some(parsed.price))
    }

    /// Write-through: memory plus the settings row that survives restarts.
    async fn store(&self, key: &str, value: Decimal) {
        self.memory_put(key, value).await;

        let durable = DurablePrice {
            price: value,
            fetched_at_unix: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_string(&durable) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Err(err) = self
            .db
            .set_setting(&format!("{}{}", SETTING_PRICE_CACHE_PREFIX, key), &payload)
            .await
        {
            tracing::warn!("Durable price cache write failed for {}: {}", key, err);
        }
    }
}

// -------------------- providers --------------------

/// Gateway tickers → CoinGecko ids.
fn coingecko_id(currency: &str) -> Option<&'static str> {
    match currency {
        "sol" => Some("solana"),
        "btc" => Some("bitcoin"),
        "eth" => Some("ethereum"),
        "ltc" => Some("litecoin"),
        "usdttrc20" | "usdt" => Some("tether"),
        _ => None,
    }
}

/// Gateway tickers → exchange pair symbols (Kraken/Binance style).
fn exchange_symbol(currency: &str) -> Option<&'static str> {
    match currency {
        "sol" => Some("SOL"),
        "btc" => Some("BTC"),
        "eth" => Some("ETH"),
        "ltc" => Some("LTC"),
        "usdttrc20" | "usdt" => Some("USDT"),
        _ => None,
    }
}

struct CoinGeckoProvider {
    client: reqwest::Client,
}

#[async_trait]
impl PriceProvider for CoinGeckoProvider {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_eur(&self, currency: &str) -> anyhow::Result<Decimal> {
        let id = coingecko_id(currency)
            .ok_or_else(|| anyhow::anyhow!("unsupported currency {currency}"))?;
        let url = format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={}&vs_currencies=eur",
            id
        );
        let body: serde_json::Value = self.client.get(&url).send().await?.json().await?;
        let price = body
            .get(id)
            .and_then(|v| v.get("eur"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("missing eur price in response"))?;
        Decimal::try_from(price).map_err(Into::into)
    }
}

struct KrakenProvider {
    client: reqwest::Client,
}

#[async_trait]
impl PriceProvider for KrakenProvider {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn fetch_eur(&self, currency: &str) -> anyhow::Result<Decimal> {
        let symbol = exchange_symbol(currency)
            .ok_or_else(|| anyhow::anyhow!("unsupported currency {currency}"))?;
        let pair = format!("{}EUR", symbol);
        let url = format!("https://api.kraken.com/0/public/Ticker?pair={}", pair);
        let body: serde_json::Value = self.client.get(&url).send().await?.json().await?;
        let result = body
            .get("result")
            .and_then(|r| r.as_object())
            .and_then(|r| r.values().next())
            .ok_or_else(|| anyhow::anyhow!("empty ticker result"))?;
        let price = result
            .get("c")
            .and_then(|c| c.get(0))
            .and_then(|p| p.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing last-trade price"))?;
        Ok(price.parse()?)
    }
}

struct BinanceProvider {
    client: reqwest::Client,
}

#[async_trait]
impl PriceProvider for BinanceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_eur(&self, currency: &str) -> anyhow::Result<Decimal> {
        let symbol = exchange_symbol(currency)
            .ok_or_else(|| anyhow::anyhow!("unsupported currency {currency}"))?;
        let url = format!(
            "https://api.binance.com/api/v3/ticker/price?symbol={}EUR",
            symbol
        );
        let body: serde_json::Value = self.client.get(&url).send().await?.json().await?;
        let price = body
            .get("price")
            .and_then(|p| p.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing price field"))?;
        Ok(price.parse()?)
    }
}

/// Operator-supplied endpoint that answers `{ "<currency>": { "eur": n } }`.
/// Takes priority over the public providers when configured.
struct ConfiguredRpcProvider {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl PriceProvider for ConfiguredRpcProvider {
    fn name(&self) -> &'static str {
        "configured-rpc"
    }

    async fn fetch_eur(&self, currency: &str) -> anyhow::Result<Decimal> {
        let body: serde_json::Value = self.client.get(&self.url).send().await?.json().await?;
        let price = body
            .get(currency)
            .and_then(|v| v.get("eur"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("missing {currency} eur price"))?;
        Decimal::try_from(price).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coingecko_id_covers_supported_currencies() {
        for currency in SUPPORTED_CURRENCIES {
            assert!(coingecko_id(currency).is_some(), "no id for {currency}");
            assert!(exchange_symbol(currency).is_some(), "no symbol for {currency}");
        }
    }

    #[test]
    fn durable_price_round_trips() {
        let durable = DurablePrice {
            price: "123.45".parse().unwrap(),
            fetched_at_unix: 1_700_000_000,
        };
        let json = serde_json::to_string(&durable).unwrap();
        let back: DurablePrice = serde_json::from_str(&json).unwrap();
        assert_eq!(back.price, durable.price);
        assert_eq!(back.fetched_at_unix, durable.fetched_at_unix);
    }

    #[test]
    fn quote_value_accessor() {
        let quote = PriceQuote::Available {
            value: "5".parse().unwrap(),
            source: PriceSource::Memory,
        };
        assert_eq!(quote.value(), Some("5".parse().unwrap()));
        assert_eq!(PriceQuote::Unavailable.value(), None);
    }
}
