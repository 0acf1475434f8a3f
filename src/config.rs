use crate::models::TradeType;
use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Everything the run needs, built once at process start and passed by
/// reference. No ambient globals.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target listing-complex identifier.
    pub complex_no: String,
    /// Complex name prefix stripped from rendered card titles.
    pub complex_name: String,
    /// Trade types to collect, in order.
    pub trade_types: Vec<TradeType>,
    pub supabase_url: String,
    pub supabase_key: String,
    pub headless: bool,
    /// Per-round settle wait for async data.
    pub settle: Duration,
    pub stability_window: u32,
    pub round_cap: u32,
    /// Full-session retry budget.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Config {
    /// Read configuration from the environment (after `dotenvy` has loaded
    /// any `.env` file). Sink credentials are required; everything else has
    /// a default.
    pub fn from_env() -> Result<Self> {
        let supabase_url = env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?;
        let supabase_key = env::var("SUPABASE_KEY").context("SUPABASE_KEY is not set")?;

        Ok(Self {
            complex_no: env_or("COMPLEX_NO", "108064"),
            complex_name: env_or("COMPLEX_NAME", "DMC파크뷰자이"),
            trade_types: parse_trade_types(&env_or("TRADE_TYPES", "sale,lease"))?,
            supabase_url,
            supabase_key,
            headless: env_or("HEADLESS", "true") != "false",
            settle: Duration::from_millis(parse_env("SETTLE_MS", 2000)?),
            stability_window: parse_env("STABILITY_WINDOW", 5)?,
            round_cap: parse_env("ROUND_CAP", 50)?,
            max_attempts: parse_env("MAX_ATTEMPTS", 3)?,
            backoff: Duration::from_secs(parse_env("RETRY_BACKOFF_SECS", 60)?),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} is not a valid number: {raw}")),
        Err(_) => Ok(default),
    }
}

fn parse_trade_types(raw: &str) -> Result<Vec<TradeType>> {
    let mut types = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let trade_type = match part.to_ascii_lowercase().as_str() {
            "sale" | "매매" => TradeType::Sale,
            "lease" | "jeonse" | "전세" => TradeType::Lease,
            other => bail!("unknown trade type: {other}"),
        };
        if !types.contains(&trade_type) {
            types.push(trade_type);
        }
    }
    if types.is_empty() {
        bail!("TRADE_TYPES selects nothing");
    }
    Ok(types)
}
