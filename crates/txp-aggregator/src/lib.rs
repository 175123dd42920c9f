//! Outbound aggregator client.
//!
//! The scheduler talks to the external broadcast aggregator exclusively
//! through the [`Aggregator`] trait; [`HttpAggregator`] is the production
//! adapter, `txp-testkit::FakeAggregator` the deterministic test one. The
//! aggregator is required to return verdicts aligned with submission order.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use txp_schemas::AggregatorVerdict;

#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Submit one ordered batch of serialized transactions; returns one
    /// verdict per transaction, in submission order.
    async fn broadcast(&self, raw_txs: &[Vec<u8>]) -> Result<Vec<AggregatorVerdict>>;
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastRequest {
    raw_txs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireVerdict {
    txid: String,
    status: String,
    #[serde(default)]
    extra_info: Option<String>,
}

pub struct HttpAggregator {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpAggregator {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build aggregator HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn broadcast(&self, raw_txs: &[Vec<u8>]) -> Result<Vec<AggregatorVerdict>> {
        let body = BroadcastRequest {
            raw_txs: raw_txs.iter().map(|tx| hex::encode(tx)).collect(),
        };

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .context("aggregator broadcast request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "aggregator refused batch: HTTP {} {}",
                status.as_u16(),
                text
            ));
        }

        let verdicts: Vec<WireVerdict> = resp
            .json()
            .await
            .context("aggregator returned an unparseable verdict list")?;

        tracing::debug!(
            submitted = raw_txs.len(),
            verdicts = verdicts.len(),
            "aggregator batch answered"
        );

        Ok(verdicts
            .into_iter()
            .map(|v| AggregatorVerdict {
                txid: v.txid,
                status: v.status,
                extra_info: v.extra_info,
            })
            .collect())
    }
}
