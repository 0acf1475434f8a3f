use crate::crawler::traits::ListDriver;
use crate::models::{RawArticle, TradeType};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tunables for the fixed-point collection loop. Timing is injectable so
/// tests run against a fake driver with zero delays.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Blocking wait after each advance, for async data to arrive.
    pub settle: Duration,
    /// Consecutive equal non-zero group counts required to declare the
    /// list fully loaded.
    pub stability_window: u32,
    /// Hard cap on rounds regardless of stability.
    pub round_cap: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(2000),
            stability_window: 5,
            round_cap: 50,
        }
    }
}

/// Predicate for records belonging to the current collection pass.
#[derive(Debug, Clone, Copy)]
pub struct RecordFilter {
    trade_type: TradeType,
}

impl RecordFilter {
    pub fn new(trade_type: TradeType) -> Self {
        Self { trade_type }
    }

    pub fn trade_type(&self) -> TradeType {
        self.trade_type
    }

    /// Trade type must match, the listing must not be marked completed,
    /// and its status must be active ("R0").
    pub fn accepts(&self, raw: &RawArticle) -> bool {
        raw.trade_type_name.as_deref() == Some(self.trade_type.label())
            && raw.trade_complete_yn.as_deref() != Some("Y")
            && raw.article_status.as_deref() == Some("R0")
    }
}

/// Per-item failure, caught at the smallest scope and counted, never
/// aborting the round.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("record has no resolvable article number")]
    MissingId,
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Session-scope collection failure; the caller decides whether to retry
/// the whole session.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("list rendered no items within the round budget")]
    NothingRendered,
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// Result of one collection pass for one trade-type filter.
#[derive(Debug)]
pub struct Collected {
    /// Deduplicated records keyed by article number, last write wins.
    pub records: BTreeMap<String, RawArticle>,
    /// Records skipped for per-item errors (missing id, malformed).
    pub skipped: usize,
    /// Rounds actually driven.
    pub rounds: u32,
}

/// Drive the listing container to exhaustion and dedupe the records that
/// arrive, under bounded patience.
///
/// Fixed-point iteration: each round advances the view, waits the settle
/// interval, drains intercepted response bodies and upserts matching
/// records by article number. The rendered top-level group count is the
/// progress proxy; once it holds steady for the stability window (or the
/// round cap or expected-total hint is hit) the list is declared fully
/// loaded.
pub fn collect_listings<D: ListDriver>(
    driver: &mut D,
    filter: &RecordFilter,
    settings: &CollectorSettings,
    expected_total: Option<u64>,
) -> Result<Collected, CollectError> {
    let mut records: BTreeMap<String, RawArticle> = BTreeMap::new();
    let mut skipped = 0usize;
    let mut last_count = 0usize;
    let mut stable_rounds = 0u32;
    let mut rounds = 0u32;
    let mut final_count = 0usize;

    info!("collecting {} listings", filter.trade_type());

    for round in 1..=settings.round_cap {
        rounds = round;
        driver.advance()?;
        driver.settle(settings.settle);

        for body in driver.drain_captured() {
            absorb_body(&body, filter, &mut records, &mut skipped);
        }

        let count = driver.group_count()?;
        debug!(
            round,
            groups = count,
            collected = records.len(),
            "collection round"
        );

        // A streak of `stability_window` equal non-zero observations means
        // the list stopped growing.
        if count > 0 && count == last_count {
            stable_rounds += 1;
        } else if count > 0 {
            stable_rounds = 1;
        } else {
            stable_rounds = 0;
        }
        last_count = count;
        final_count = count;

        if stable_rounds >= settings.stability_window {
            info!(
                rounds = round,
                groups = count,
                "list stable, collection complete"
            );
            break;
        }

        if let Some(total) = expected_total {
            if total > 0 && records.len() as u64 >= total {
                info!(
                    rounds = round,
                    collected = records.len(),
                    "expected total reached"
                );
                break;
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, "records skipped for per-item errors");
    }

    // Zero items after the whole budget is a structural failure, not an
    // empty result, unless the site itself says there is nothing.
    if records.is_empty() && final_count == 0 {
        if driver.displayed_total() == Some(0) {
            info!("site reports zero listings for this filter");
        } else {
            return Err(CollectError::NothingRendered);
        }
    }

    info!(
        collected = records.len(),
        skipped, rounds, "[{}] pass finished", filter.trade_type()
    );

    Ok(Collected {
        records,
        skipped,
        rounds,
    })
}

/// Upsert every matching record of one intercepted response body. A
/// malformed row is skipped, never fatal.
fn absorb_body(
    body: &serde_json::Value,
    filter: &RecordFilter,
    records: &mut BTreeMap<String, RawArticle>,
    skipped: &mut usize,
) {
    let Some(articles) = body.get("articleList").and_then(|v| v.as_array()) else {
        return;
    };

    for item in articles {
        match parse_item(item) {
            Ok(raw) => {
                if filter.accepts(&raw) {
                    // Safe: parse_item already rejected missing ids.
                    let id = raw.article_no.clone().unwrap_or_default();
                    records.insert(id, raw);
                }
            }
            Err(err) => {
                debug!(%err, "skipping record");
                *skipped += 1;
            }
        }
    }
}

fn parse_item(item: &serde_json::Value) -> Result<RawArticle, ItemError> {
    let raw: RawArticle = serde_json::from_value(item.clone())?;
    match raw.article_no.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(raw),
        _ => Err(ItemError::MissingId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Scripted driver: each round yields a group count and the response
    /// bodies that "arrived" during it.
    struct FakeDriver {
        rounds: VecDeque<(usize, Vec<serde_json::Value>)>,
        current_count: usize,
        total: Option<u64>,
        advances: u32,
    }

    impl FakeDriver {
        fn new(rounds: Vec<(usize, Vec<serde_json::Value>)>) -> Self {
            Self {
                rounds: rounds.into(),
                current_count: 0,
                total: None,
                advances: 0,
            }
        }

        fn with_total(mut self, total: u64) -> Self {
            self.total = Some(total);
            self
        }
    }

    impl ListDriver for FakeDriver {
        fn advance(&mut self) -> Result<()> {
            self.advances += 1;
            Ok(())
        }

        fn settle(&mut self, _wait: Duration) {}

        fn group_count(&mut self) -> Result<usize> {
            Ok(self.current_count)
        }

        fn drain_captured(&mut self) -> Vec<serde_json::Value> {
            match self.rounds.pop_front() {
                Some((count, bodies)) => {
                    self.current_count = count;
                    bodies
                }
                // Past the script: list stays as it was, nothing arrives.
                None => Vec::new(),
            }
        }

        fn displayed_total(&mut self) -> Option<u64> {
            self.total
        }

        fn shutdown(&mut self) {}
    }

    fn body(articles: Vec<serde_json::Value>) -> serde_json::Value {
        json!({ "articleList": articles })
    }

    fn sale(no: &str, price: &str) -> serde_json::Value {
        json!({
            "articleNo": no,
            "tradeTypeName": "매매",
            "dealOrWarrantPrc": price,
            "tradeCompleteYN": "N",
            "articleStatus": "R0"
        })
    }

    fn fast() -> CollectorSettings {
        CollectorSettings {
            settle: Duration::ZERO,
            ..CollectorSettings::default()
        }
    }

    #[test]
    fn duplicate_ids_collapse_to_one_entry() {
        let mut driver = FakeDriver::new(vec![
            (3, vec![body(vec![sale("A1", "10억"), sale("A2", "9억")])]),
            (3, vec![body(vec![sale("A1", "10억"), sale("A2", "9억")])]),
            (3, vec![]),
            (3, vec![]),
            (3, vec![]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.records.len(), 2);
        assert!(out.records.contains_key("A1"));
    }

    #[test]
    fn later_observation_wins_on_price_drift() {
        let mut driver = FakeDriver::new(vec![
            (1, vec![body(vec![sale("A1", "10억")])]),
            (1, vec![body(vec![sale("A1", "10억 5000")])]),
            (1, vec![]),
            (1, vec![]),
            (1, vec![]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(
            out.records["A1"].deal_or_warrant_prc.as_deref(),
            Some("10억 5000")
        );
    }

    #[test]
    fn terminates_after_stability_window() {
        // Sizes [12, 20, 20, 20, 20, 20] with window 5: the five equal
        // observations are rounds 2..6, so round 6 is the last.
        let mut driver = FakeDriver::new(vec![
            (12, vec![body(vec![sale("A1", "10억")])]),
            (20, vec![body(vec![sale("A2", "11억")])]),
            (20, vec![]),
            (20, vec![]),
            (20, vec![]),
            (20, vec![]),
            (20, vec![body(vec![sale("A9", "must not arrive")])]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.rounds, 6);
        assert_eq!(out.records.len(), 2);
        assert!(!out.records.contains_key("A9"));
    }

    #[test]
    fn round_cap_bounds_an_unstable_list() {
        // Count changes every round: stability never triggers.
        let rounds: Vec<_> = (1..=200)
            .map(|i| (i as usize, vec![body(vec![sale(&format!("A{i}"), "1억")])]))
            .collect();
        let mut driver = FakeDriver::new(rounds);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.rounds, 50);
        assert_eq!(out.records.len(), 50);
    }

    #[test]
    fn expected_total_hint_short_circuits() {
        let mut driver = FakeDriver::new(vec![
            (5, vec![body(vec![sale("A1", "1억"), sale("A2", "2억")])]),
            (9, vec![body(vec![sale("A3", "3억")])]),
            (13, vec![body(vec![sale("A4", "4억")])]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            Some(3),
        )
        .unwrap();
        assert_eq!(out.rounds, 2);
        assert_eq!(out.records.len(), 3);
    }

    #[test]
    fn filter_rejects_wrong_type_completed_and_inactive() {
        let mixed = body(vec![
            sale("K1", "10억"),
            json!({
                "articleNo": "K2",
                "tradeTypeName": "전세",
                "tradeCompleteYN": "N",
                "articleStatus": "R0"
            }),
            json!({
                "articleNo": "K3",
                "tradeTypeName": "매매",
                "tradeCompleteYN": "Y",
                "articleStatus": "R0"
            }),
            json!({
                "articleNo": "K4",
                "tradeTypeName": "매매",
                "tradeCompleteYN": "N",
                "articleStatus": "R1"
            }),
        ]);
        let mut driver = FakeDriver::new(vec![
            (4, vec![mixed]),
            (4, vec![]),
            (4, vec![]),
            (4, vec![]),
            (4, vec![]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.records.len(), 1);
        assert!(out.records.contains_key("K1"));
        assert_eq!(out.skipped, 0);
    }

    #[test]
    fn malformed_record_is_skipped_not_fatal() {
        let batch = body(vec![
            sale("M1", "10억"),
            // No id: dropped consistently, never a sentinel entry.
            json!({
                "tradeTypeName": "매매",
                "tradeCompleteYN": "N",
                "articleStatus": "R0"
            }),
            // Wrong shape entirely.
            json!("not an object"),
            sale("M2", "11억"),
        ]);
        let mut driver = FakeDriver::new(vec![
            (2, vec![batch]),
            (2, vec![]),
            (2, vec![]),
            (2, vec![]),
            (2, vec![]),
        ]);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn nothing_rendered_is_a_failure() {
        let mut driver = FakeDriver::new(Vec::new());
        let err = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CollectError::NothingRendered));
        // The whole round budget was spent before giving up.
        assert_eq!(driver.advances, 50);
    }

    #[test]
    fn zero_listings_is_valid_when_site_confirms() {
        let mut driver = FakeDriver::new(Vec::new()).with_total(0);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Lease),
            &fast(),
            None,
        )
        .unwrap();
        assert!(out.records.is_empty());
    }

    #[test]
    fn steady_list_from_the_start_stops_at_the_window() {
        let rounds = vec![(7, vec![body(vec![sale("S1", "5억")])]); 10];
        let mut driver = FakeDriver::new(rounds);
        let out = collect_listings(
            &mut driver,
            &RecordFilter::new(TradeType::Sale),
            &fast(),
            None,
        )
        .unwrap();
        assert_eq!(out.rounds, 5);
    }
}
