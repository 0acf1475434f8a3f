use crate::config::Config;
use crate::models::{AgentStat, Listing, RunOutcome};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const LISTINGS_TABLE: &str = "real_estate_logs";
const STATS_TABLE: &str = "agent_stats";
const HISTORY_TABLE: &str = "crawl_history";

/// A failed write to one sink table. Callers treat each table
/// independently; none of these escalate to a run failure.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to {table} failed: {source}")]
    Request {
        table: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{table} write rejected with {status}: {body}")]
    Rejected {
        table: &'static str,
        status: u16,
        body: String,
    },
}

/// Supabase REST (PostgREST) sink for crawl output.
pub struct SupabaseSink {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseSink {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            api_key: config.supabase_key.clone(),
        })
    }

    /// Upsert refined listings into the log table, keyed by article number.
    /// Re-running with the same rows is a no-op.
    pub async fn upsert_listings(&self, listings: &[Listing]) -> Result<(), SinkError> {
        if listings.is_empty() {
            debug!("no listings to upsert");
            return Ok(());
        }
        let url = format!(
            "{}/rest/v1/{}?on_conflict=article_no",
            self.base_url, LISTINGS_TABLE
        );
        self.post(LISTINGS_TABLE, &url, listings, true).await?;
        info!("💾 Upserted {} listings", listings.len());
        Ok(())
    }

    /// Insert the per-agent summary rows. Insert-only: each run gets its
    /// own rows under its crawl stamp.
    pub async fn insert_agent_stats(&self, stats: &[AgentStat]) -> Result<(), SinkError> {
        if stats.is_empty() {
            debug!("no agent stats to insert");
            return Ok(());
        }
        let url = format!("{}/rest/v1/{}", self.base_url, STATS_TABLE);
        self.post(STATS_TABLE, &url, stats, false).await?;
        info!("💾 Saved stats for {} agents", stats.len());
        Ok(())
    }

    /// Record the run's final disposition. One row per invocation.
    pub async fn record_run(&self, outcome: &RunOutcome) -> Result<(), SinkError> {
        let url = format!("{}/rest/v1/{}", self.base_url, HISTORY_TABLE);
        self.post(HISTORY_TABLE, &url, std::slice::from_ref(outcome), false)
            .await?;
        info!(status = ?outcome.status, count = outcome.record_count, "run recorded");
        Ok(())
    }

    async fn post<T: Serialize>(
        &self,
        table: &'static str,
        url: &str,
        rows: &[T],
        merge: bool,
    ) -> Result<(), SinkError> {
        let prefer = if merge {
            "resolution=merge-duplicates,return=minimal"
        } else {
            "return=minimal"
        };

        let response = self
            .client
            .post(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", prefer)
            .json(rows)
            .send()
            .await
            .map_err(|source| SinkError::Request { table, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                table,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
