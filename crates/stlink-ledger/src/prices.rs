//! Historical LINK/USD prices from the CoinGecko API

use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::constants;
use crate::ledger::BlockRecord;
use crate::selector::RecordType;

/// CoinGecko coin history response (only the fields we read)
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    current_price: CurrentPrice,
}

#[derive(Debug, Deserialize)]
struct CurrentPrice {
    usd: Option<f64>,
}

/// Daily LINK price lookups, backed by the persistent cache
pub struct PriceClient<'a> {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    cache: &'a Cache,
    request_delay: Duration,
    rate_limit_wait: Duration,
}

impl<'a> PriceClient<'a> {
    pub fn new(api_base: &str, api_key: Option<&str>, cache: &'a Cache) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(constants::HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            cache,
            request_delay: Duration::from_millis(constants::PRICE_REQUEST_DELAY_MS),
            rate_limit_wait: Duration::from_secs(constants::PRICE_RATE_LIMIT_WAIT_SECS),
        })
    }

    #[cfg(test)]
    fn without_pacing(mut self) -> Self {
        self.request_delay = Duration::from_millis(1);
        self.rate_limit_wait = Duration::from_millis(1);
        self
    }

    /// LINK/USD on `date`, from the cache when known
    pub async fn link_price(&self, date: NaiveDate) -> Result<f64> {
        let key = date.format("%Y-%m-%d").to_string();
        match self.cache.get_price(&key).await {
            Ok(Some(price)) => return Ok(price),
            Ok(None) => {}
            Err(e) => warn!(date = %key, error = %e, "Price cache read failed"),
        }

        let price = self.fetch(date).await?;
        if let Err(e) = self.cache.put_price(&key, price).await {
            warn!(date = %key, error = %e, "Price cache write failed");
        }
        Ok(price)
    }

    /// Fill the price of a reward record; a failure becomes a warning on the record
    pub async fn annotate(&self, record: &mut BlockRecord) {
        if record.record_type != RecordType::Reward {
            return;
        }

        match self.link_price(record.timestamp.date_naive()).await {
            Ok(price) => record.link_price_usd = Some(price),
            Err(e) => {
                warn!(block = record.block_number, error = %e, "LINK price unavailable");
                record.warnings.push(format!("LINK price unavailable: {}", e));
            }
        }
    }

    async fn fetch(&self, date: NaiveDate) -> Result<f64> {
        let url = format!(
            "{}/coins/{}/history",
            self.api_base,
            constants::COINGECKO_LINK_ID
        );
        let query_date = date.format("%d-%m-%Y").to_string();
        let url = reqwest::Url::parse_with_params(
            &url,
            &[("date", query_date.as_str()), ("localization", "false")],
        )?;

        let mut last_error = None;

        for attempt in 0..constants::PRICE_MAX_ATTEMPTS {
            // Free tier allows roughly one call per second
            sleep(self.request_delay).await;

            let mut request = self
                .client
                .get(url.clone())
                .header("Accept", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("x-cg-demo-api-key", key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Request failed: {}", e))?;

            let status = response.status();
            if status.as_u16() == 429 {
                debug!(attempt, "CoinGecko rate limited, waiting");
                last_error = Some(anyhow::anyhow!("Rate limited (429)"));
                sleep(self.rate_limit_wait).await;
                continue;
            }
            if !status.is_success() {
                anyhow::bail!("CoinGecko API returned status: {}", status);
            }

            let data: HistoryResponse = response
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Parse error: {}", e))?;

            return data
                .market_data
                .and_then(|m| m.current_price.usd)
                .ok_or_else(|| anyhow::anyhow!("No LINK price for {}", query_date));
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("Failed after {} retries", constants::PRICE_MAX_ATTEMPTS)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn priced(usd: f64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "chainlink",
            "market_data": { "current_price": { "usd": usd, "eur": 1.0 } }
        }))
    }

    fn reward_record(timestamp: DateTime<Utc>) -> BlockRecord {
        BlockRecord {
            block_number: 1,
            timestamp,
            record_type: RecordType::Reward,
            direction: None,
            stlink_balance: U256::ZERO,
            link_balance: U256::ZERO,
            lsd_tokens: U256::ZERO,
            queued_tokens: U256::ZERO,
            reward_share: None,
            link_price_usd: None,
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_price_fetched_once_then_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/chainlink/history"))
            .and(query_param("date", "06-01-2025"))
            .and(header("x-cg-demo-api-key", "demo"))
            .respond_with(priced(21.5))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Cache::open_in_memory().await.unwrap();
        let prices = PriceClient::new(&server.uri(), Some("demo"), &cache)
            .unwrap()
            .without_pacing();

        assert_eq!(prices.link_price(date("2025-01-06")).await.unwrap(), 21.5);
        assert_eq!(prices.link_price(date("2025-01-06")).await.unwrap(), 21.5);
        assert_eq!(cache.get_price("2025-01-06").await.unwrap(), Some(21.5));
    }

    #[tokio::test]
    async fn test_rate_limit_is_waited_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(priced(14.0))
            .mount(&server)
            .await;

        let cache = Cache::open_in_memory().await.unwrap();
        let prices = PriceClient::new(&server.uri(), None, &cache)
            .unwrap()
            .without_pacing();
        assert_eq!(prices.link_price(date("2024-03-04")).await.unwrap(), 14.0);
    }

    #[tokio::test]
    async fn test_annotate_only_touches_reward_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = Cache::open_in_memory().await.unwrap();
        let prices = PriceClient::new(&server.uri(), None, &cache)
            .unwrap()
            .without_pacing();

        let ts = DateTime::from_timestamp(1_736_168_400, 0).unwrap();
        let mut reward = reward_record(ts);
        prices.annotate(&mut reward).await;
        assert_eq!(reward.link_price_usd, None);
        assert_eq!(reward.warnings.len(), 1);

        let mut snapshot = reward_record(ts);
        snapshot.record_type = RecordType::Snapshot;
        prices.annotate(&mut snapshot).await;
        assert!(snapshot.warnings.is_empty());
    }
}
