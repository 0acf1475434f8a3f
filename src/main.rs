mod config;
mod crawler;
mod models;
mod retry;
mod sink;

use anyhow::{anyhow, bail, Result};
use config::Config;
use crawler::{collect_listings, ChromeDriver, CollectorSettings, ListDriver, RecordFilter, Session};
use models::{agent_counts, CrawlStamp, Listing, RawArticle, RunOutcome};
use retry::RetryPolicy;
use sink::SupabaseSink;
use std::collections::BTreeMap;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    // .env is optional; real deployments use plain environment variables.
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    info!("🏠 Land Scout - complex {} listing crawler", config.complex_no);
    info!("==========================================");

    // One stamp for the whole run, so every row shares the same bucket.
    let stamp = CrawlStamp::now_kst();
    info!("Run stamp: {} {}", stamp.date, stamp.time);

    let policy = RetryPolicy::new(config.max_attempts, config.backoff);
    let crawl_result = {
        let config = config.clone();
        let stamp = stamp.clone();
        // The browser session is a blocking, exclusively-owned resource;
        // keep it off the async runtime's workers.
        let handle =
            tokio::task::spawn_blocking(move || policy.run(|n| crawl_once(&config, &stamp, n)));
        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("crawl task panicked: {join_err}")),
        }
    };

    let sink = match SupabaseSink::new(&config) {
        Ok(sink) => sink,
        Err(err) => {
            error!("failed to build sink client: {err:#}");
            std::process::exit(1);
        }
    };

    match crawl_result {
        Ok(listings) => {
            info!("\n✅ Collected {} listings total\n", listings.len());

            // Sink writes are independent: a listings-log failure must not
            // skip the stats write, and neither fails the run.
            if let Err(err) = sink.upsert_listings(&listings).await {
                error!("listings write failed: {err}");
            }
            let stats = agent_counts(&listings, &stamp);
            if let Err(err) = sink.insert_agent_stats(&stats).await {
                error!("agent stats write failed: {err}");
            }
            if let Err(err) = sink
                .record_run(&RunOutcome::success(&stamp, listings.len()))
                .await
            {
                error!("run history write failed: {err}");
            }
        }
        Err(err) => {
            error!("all attempts exhausted: {err:#}");
            if let Err(sink_err) = sink
                .record_run(&RunOutcome::failure(&stamp, &format!("{err:#}")))
                .await
            {
                error!("run history write failed: {sink_err}");
            }
            std::process::exit(1);
        }
    }
}

/// One full crawl attempt: fresh browser session, one collection pass per
/// trade type, refinement into storable rows. The session is torn down on
/// every path out of this function.
fn crawl_once(config: &Config, stamp: &CrawlStamp, attempt: u32) -> Result<Vec<Listing>> {
    info!("🔎 Crawl attempt {attempt} starting");

    let driver = ChromeDriver::launch(config)?;
    let mut session = Session::new(driver);
    session.driver().open_complex(&config.complex_no)?;

    let settings = CollectorSettings {
        settle: config.settle,
        stability_window: config.stability_window,
        round_cap: config.round_cap,
    };

    let mut listings = Vec::new();
    for &trade_type in &config.trade_types {
        session.driver().apply_filters(trade_type)?;

        let filter = RecordFilter::new(trade_type);
        let expected = session.driver().displayed_total();
        let collected = collect_listings(session.driver(), &filter, &settings, expected)?;
        info!(
            "[{trade_type}] {} records in {} rounds ({} skipped)",
            collected.records.len(),
            collected.rounds,
            collected.skipped
        );

        let mut raws: BTreeMap<String, RawArticle> = collected.records;
        if raws.is_empty() {
            // Rendered cards without intercepted responses: fall back to
            // reading the DOM, expansion included.
            let rendered = session.driver().group_count()?;
            if rendered > 0 {
                for raw in session
                    .driver()
                    .harvest_rendered(trade_type, &config.complex_name)?
                {
                    if let Some(id) = raw.article_no.clone() {
                        raws.insert(id, raw);
                    }
                }
                if raws.is_empty() {
                    bail!("{rendered} groups rendered but no records were extractable");
                }
            }
        }

        let before = listings.len();
        listings.extend(
            raws.values()
                .filter_map(|raw| Listing::refine(raw, trade_type, stamp)),
        );
        let refined = listings.len() - before;
        if refined < raws.len() {
            warn!(
                dropped = raws.len() - refined,
                "records dropped during refinement"
            );
        }
        info!("[{trade_type}] {refined} listings refined");
    }

    session.close();
    Ok(listings)
}
