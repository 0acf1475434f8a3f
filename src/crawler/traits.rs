use anyhow::Result;
use std::time::Duration;
use tracing::debug;

/// Surface the collector needs from a page driver.
///
/// Deliberately synchronous: one browser tab is the single shared resource,
/// rounds are strictly sequential, and the settle wait is a blocking sleep.
/// Tests substitute a scripted fake with zero delays.
pub trait ListDriver {
    /// Push the listing container toward its bottom. Scroll-to-bottom,
    /// pull-last-item-into-view and a key nudge are complementary: the
    /// page's lazy-load trigger may react to any one of them.
    fn advance(&mut self) -> Result<()>;

    /// Blocking wait for asynchronous data to arrive.
    fn settle(&mut self, wait: Duration);

    /// Number of currently rendered top-level items. Collapsed multi-agent
    /// groups count once; this is the progress proxy for termination, not
    /// the record count.
    fn group_count(&mut self) -> Result<usize>;

    /// All listing-API response bodies intercepted since the previous
    /// drain, as raw JSON.
    fn drain_captured(&mut self) -> Vec<serde_json::Value>;

    /// The site's own displayed total-count affordance, best-effort.
    fn displayed_total(&mut self) -> Option<u64>;

    /// Release driver-owned resources. `Session` guarantees this runs
    /// exactly once.
    fn shutdown(&mut self);
}

/// Owns a driver and guarantees `shutdown` runs exactly once on every exit
/// path, including unwinds.
pub struct Session<D: ListDriver> {
    driver: Option<D>,
}

impl<D: ListDriver> Session<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Some(driver),
        }
    }

    /// The held driver. Panics only if called after `close`, which consumes
    /// the session.
    pub fn driver(&mut self) -> &mut D {
        self.driver.as_mut().expect("session already closed")
    }

    /// Explicit teardown. Equivalent to dropping, but lets the caller
    /// sequence it before sink writes.
    pub fn close(mut self) {
        if let Some(mut driver) = self.driver.take() {
            debug!("closing crawl session");
            driver.shutdown();
        }
    }
}

impl<D: ListDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            debug!("closing crawl session (drop)");
            driver.shutdown();
        }
    }
}
