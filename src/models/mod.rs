use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trade type of a listing, with the site's wire labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeType {
    Sale,
    Lease,
}

impl TradeType {
    /// Label used both in the site's API responses and in the stored rows.
    pub fn label(&self) -> &'static str {
        match self {
            TradeType::Sale => "매매",
            TradeType::Lease => "전세",
        }
    }
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One listing as the complex-articles API emits it. Everything except the
/// article number is optional; responses vary by listing kind.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawArticle {
    pub article_no: Option<String>,
    pub trade_type_name: Option<String>,
    /// "15억 5,000" style price string, stored verbatim.
    pub deal_or_warrant_prc: Option<String>,
    pub building_name: Option<String>,
    /// Unit type designator, e.g. "110E-2".
    pub area_name: Option<String>,
    /// Exclusive area in m². The API sends either a number or a string.
    pub area_2: Option<serde_json::Value>,
    /// e.g. "저/22층".
    pub floor_info: Option<String>,
    /// e.g. "남서향".
    pub direction: Option<String>,
    pub realtor_name: Option<String>,
    pub cp_name: Option<String>,
    pub article_confirm_ymd: Option<String>,
    pub verification_type_code: Option<String>,
    #[serde(rename = "tradeCompleteYN")]
    pub trade_complete_yn: Option<String>,
    pub article_status: Option<String>,
    /// Pre-formatted spec text from the rendered card. Only set by the DOM
    /// harvest fallback, never by the API.
    #[serde(skip)]
    pub dom_spec: Option<String>,
}

impl RawArticle {
    fn area2_str(&self) -> String {
        match &self.area_2 {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

/// Fixed date/time stamp for one run. Captured once at process start so
/// every row written during the run carries the same bucket.
#[derive(Debug, Clone)]
pub struct CrawlStamp {
    /// "%Y-%m-%d" in KST.
    pub date: String,
    /// Hour bucket, e.g. "14시".
    pub time: String,
}

impl CrawlStamp {
    /// Current time in KST (UTC+9).
    pub fn now_kst() -> Self {
        let kst = FixedOffset::east_opt(9 * 3600).expect("valid KST offset");
        let now = Utc::now().with_timezone(&kst);
        Self {
            date: now.format("%Y-%m-%d").to_string(),
            time: format!("{}시", now.format("%H")),
        }
    }
}

/// Refined listing row as persisted to the listings log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub article_no: String,
    pub trade_type: String,
    pub price: String,
    pub dong: String,
    pub spec: String,
    pub agent: String,
    pub provider: String,
    pub confirm_date: String,
    pub is_owner: bool,
    pub crawl_date: String,
    pub crawl_time: String,
}

impl Listing {
    /// Refine a raw API record into a storable row. Fails only when the
    /// article number is missing; every other gap degrades to "".
    pub fn refine(raw: &RawArticle, trade_type: TradeType, stamp: &CrawlStamp) -> Option<Self> {
        let article_no = raw.article_no.as_deref()?.trim();
        if article_no.is_empty() {
            return None;
        }

        let spec = match &raw.dom_spec {
            Some(spec) => spec.clone(),
            None => format!(
                "{}/{}m², {}, {}",
                raw.area_name.as_deref().unwrap_or(""),
                raw.area2_str(),
                raw.floor_info.as_deref().unwrap_or(""),
                raw.direction.as_deref().unwrap_or(""),
            ),
        };

        Some(Self {
            article_no: article_no.to_string(),
            trade_type: trade_type.label().to_string(),
            price: raw.deal_or_warrant_prc.clone().unwrap_or_default(),
            dong: raw.building_name.clone().unwrap_or_default(),
            spec,
            agent: raw.realtor_name.clone().unwrap_or_default(),
            provider: raw.cp_name.clone().unwrap_or_default(),
            confirm_date: raw.article_confirm_ymd.clone().unwrap_or_default(),
            is_owner: raw.verification_type_code.as_deref() == Some("OWNER"),
            crawl_date: stamp.date.clone(),
            crawl_time: stamp.time.clone(),
        })
    }
}

/// Per-agent listing count for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStat {
    pub agent: String,
    pub count: i64,
    pub crawl_date: String,
    pub crawl_time: String,
}

/// Count listings per agent. Deterministic order (agent name ascending).
pub fn agent_counts(listings: &[Listing], stamp: &CrawlStamp) -> Vec<AgentStat> {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for listing in listings {
        let agent = if listing.agent.is_empty() {
            "알수없음"
        } else {
            listing.agent.as_str()
        };
        *counts.entry(agent).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(agent, count)| AgentStat {
            agent: agent.to_string(),
            count,
            crawl_date: stamp.date.clone(),
            crawl_time: stamp.time.clone(),
        })
        .collect()
}

/// Final disposition of one invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Fail,
}

/// One run-history row, written exactly once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub crawl_date: String,
    pub crawl_time: String,
    pub status: RunStatus,
    pub record_count: i64,
    pub error: Option<String>,
}

const ERROR_TEXT_CAP: usize = 500;

impl RunOutcome {
    pub fn success(stamp: &CrawlStamp, record_count: usize) -> Self {
        Self {
            crawl_date: stamp.date.clone(),
            crawl_time: stamp.time.clone(),
            status: RunStatus::Success,
            record_count: record_count as i64,
            error: None,
        }
    }

    pub fn failure(stamp: &CrawlStamp, error: &str) -> Self {
        Self {
            crawl_date: stamp.date.clone(),
            crawl_time: stamp.time.clone(),
            status: RunStatus::Fail,
            record_count: 0,
            error: Some(truncate_error(error)),
        }
    }
}

/// Cap error text so a deep anyhow chain never blows up the history row.
fn truncate_error(text: &str) -> String {
    if text.chars().count() <= ERROR_TEXT_CAP {
        text.to_string()
    } else {
        text.chars().take(ERROR_TEXT_CAP).collect()
    }
}
