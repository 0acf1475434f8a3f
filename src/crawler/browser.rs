use crate::config::Config;
use crate::crawler::traits::ListDriver;
use crate::models::{RawArticle, TradeType};
use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use scraper::{Html, Selector};
use std::ffi::OsStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";

/// Buffers listing-API response bodies on the page side. Installed after
/// navigation, before the filter toggles trigger the first list fetch.
const CAPTURE_HOOK_JS: &str = r#"
(() => {
    if (window.__lsCaptured) return true;
    window.__lsCaptured = [];
    const matches = (url) =>
        typeof url === 'string' &&
        url.includes('api/articles/complex') &&
        url.includes('realEstateType');
    const origFetch = window.fetch;
    window.fetch = function (...args) {
        return origFetch.apply(this, args).then((resp) => {
            try {
                const url = resp.url || (typeof args[0] === 'string' ? args[0] : args[0] && args[0].url);
                if (matches(url)) {
                    resp.clone().text().then((body) => { window.__lsCaptured.push(body); }).catch(() => {});
                }
            } catch (e) {}
            return resp;
        });
    };
    const origOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url, ...rest) {
        this.__lsUrl = url;
        return origOpen.call(this, method, url, ...rest);
    };
    const origSend = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function (...args) {
        this.addEventListener('load', () => {
            try {
                if (matches(this.__lsUrl)) window.__lsCaptured.push(this.responseText);
            } catch (e) {}
        });
        return origSend.apply(this, args);
    };
    return true;
})()
"#;

/// Headless-Chrome driver for the complex listing page.
pub struct ChromeDriver {
    // Owns the Chrome process; killed when the driver is dropped.
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeDriver {
    /// Launch Chrome and open a fresh tab with anti-automation fingerprints
    /// reduced. The page itself is opened by `open_complex`.
    pub fn launch(config: &Config) -> Result<Self> {
        info!("Launching headless Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false)
            .window_size(Some((1920, 1080)))
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--lang=ko_KR"),
            ])
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open tab")?;

        tab.set_user_agent(USER_AGENT, Some(ACCEPT_LANGUAGE), Some("MacIntel"))
            .context("Failed to override user agent")?;

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Navigate to the complex page and wait for the article list container.
    /// Container-not-found here is fatal to the session.
    pub fn open_complex(&self, complex_no: &str) -> Result<()> {
        let url = format!("https://new.land.naver.com/complexes/{complex_no}");
        info!("Opening complex page: {url}");

        self.tab.navigate_to(&url)?;
        self.tab.wait_until_navigated()?;
        self.tab
            .wait_for_element_with_custom_timeout("#articleListArea", Duration::from_secs(20))
            .context("article list container never appeared")?;

        // Hide the automation flag the page checks for.
        let _ = self.tab.evaluate(
            "Object.defineProperty(navigator, 'webdriver', { get: () => undefined }); true",
            false,
        );

        self.tab
            .evaluate(CAPTURE_HOOK_JS, false)
            .context("failed to install network capture hook")?;

        Ok(())
    }

    /// Drive the page's checkboxes into exactly one trade type, ungroup
    /// identical listings and sort by price. Individual toggle misses are
    /// tolerated; the list refresh settle follows.
    pub fn apply_filters(&self, trade_type: TradeType) -> Result<()> {
        info!("Applying filter: {trade_type}");

        // "All trade types" off first, otherwise the per-type boxes no-op.
        self.click_if(
            "#complex_article_trad_type_filter_0:checked",
            "#complex_article_trad_type_filter_0",
        );
        thread::sleep(Duration::from_millis(500));

        let (on, off) = match trade_type {
            TradeType::Sale => (
                "#complex_article_trad_type_filter_1",
                "#complex_article_trad_type_filter_2",
            ),
            TradeType::Lease => (
                "#complex_article_trad_type_filter_2",
                "#complex_article_trad_type_filter_1",
            ),
        };
        self.click_unless(&format!("{on}:checked"), on);
        thread::sleep(Duration::from_millis(500));
        self.click_if(&format!("{off}:checked"), off);
        thread::sleep(Duration::from_millis(500));

        // Ungroup identical listings so every offer renders as its own row.
        let ungroup = r#"
            (() => {
                const cb = document.getElementById('address_group2');
                if (cb && cb.checked) {
                    const label = document.querySelector("label[for='address_group2']");
                    if (label) label.click();
                }
                return true;
            })()
        "#;
        if self.tab.evaluate(ungroup, false).is_err() {
            warn!("failed to toggle listing grouping, continuing");
        }
        thread::sleep(Duration::from_millis(500));

        let sort = r#"
            (() => {
                const a = document.querySelector("a.sorting_type[data-nclk='TAA.price']");
                if (a) a.click();
                return true;
            })()
        "#;
        if self.tab.evaluate(sort, false).is_err() {
            warn!("failed to apply price sort, continuing");
        }

        // Let the filtered list re-fetch before collection starts.
        thread::sleep(Duration::from_secs(3));
        Ok(())
    }

    /// Click `selector` when `condition` matches an element.
    fn click_if(&self, condition: &str, selector: &str) {
        let expr = format!(
            "(() => {{ if (document.querySelector({cond:?})) {{ const el = document.querySelector({sel:?}); if (el) el.click(); }} return true; }})()",
            cond = condition,
            sel = selector,
        );
        if self.tab.evaluate(&expr, false).is_err() {
            debug!(selector, "filter toggle miss");
        }
    }

    /// Click `selector` when `condition` matches nothing.
    fn click_unless(&self, condition: &str, selector: &str) {
        let expr = format!(
            "(() => {{ if (!document.querySelector({cond:?})) {{ const el = document.querySelector({sel:?}); if (el) el.click(); }} return true; }})()",
            cond = condition,
            sel = selector,
        );
        if self.tab.evaluate(&expr, false).is_err() {
            debug!(selector, "filter toggle miss");
        }
    }

    fn eval_u64(&self, expr: &str) -> Option<u64> {
        self.tab
            .evaluate(expr, false)
            .ok()
            .and_then(|obj| obj.value)
            .and_then(|v| v.as_u64())
    }

    fn eval_string(&self, expr: &str) -> Option<String> {
        self.tab
            .evaluate(expr, false)
            .ok()
            .and_then(|obj| obj.value)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Fallback when network capture yields nothing but cards rendered:
    /// expand every collapsed multi-agent group, then parse the rendered
    /// cards out of their markup. Harvested rows carry only what the list
    /// shows (partial data by design).
    pub fn harvest_rendered(
        &self,
        trade_type: TradeType,
        complex_name: &str,
    ) -> Result<Vec<RawArticle>> {
        info!("Harvesting rendered cards (network capture was empty)");

        // Expansion is asynchronous; a group that ignores the click simply
        // keeps its single visible row.
        let expand = r##"
            (() => {
                const btns = document.querySelectorAll(
                    "#articleListArea div.item:not(.item--child) span.label--multicp");
                btns.forEach((b) => { try { b.click(); } catch (e) {} });
                return btns.length;
            })()
        "##;
        let expanded = self.eval_u64(expand).unwrap_or(0);
        if expanded > 0 {
            debug!(expanded, "expanded multi-agent groups");
            thread::sleep(Duration::from_millis(800));
        }

        let cards_json = self
            .eval_string(
                r##"JSON.stringify(Array.from(
                    document.querySelectorAll("#articleListArea div.item:not(.item--child)")
                ).map((e) => e.outerHTML))"##,
            )
            .context("failed to read rendered cards")?;
        let cards: Vec<String> =
            serde_json::from_str(&cards_json).context("unexpected card payload")?;

        let mut harvested = Vec::new();
        for card in &cards {
            // One bad card never aborts the harvest.
            match parse_card(card, trade_type, complex_name) {
                Ok(mut rows) => harvested.append(&mut rows),
                Err(err) => debug!(%err, "skipping unparsable card"),
            }
        }

        info!("Harvested {} rows from {} cards", harvested.len(), cards.len());
        Ok(harvested)
    }
}

/// Parse one rendered group card (possibly expanded) into raw records.
///
/// An expanded multi-agent card lists its offers as `item_inner` rows under
/// a `item--child` container, one per agency (`cp_area`). A card whose
/// expansion failed has no child container and degrades to its single
/// visible row.
fn parse_card(html: &str, trade_type: TradeType, complex_name: &str) -> Result<Vec<RawArticle>> {
    let sel_title = Selector::parse("div.item_title > span.text").expect("valid selector");
    let sel_spec = Selector::parse("div.info_area .spec").expect("valid selector");
    let sel_inner = Selector::parse("div.item_inner").expect("valid selector");
    let sel_child_inner =
        Selector::parse("div.item--child div.item_inner").expect("valid selector");
    let sel_cp = Selector::parse("div.cp_area").expect("valid selector");
    let sel_agent = Selector::parse("a.agent_name").expect("valid selector");
    let sel_price = Selector::parse("span.price").expect("valid selector");
    let sel_check = Selector::parse("input[name='item_check']").expect("valid selector");

    let doc = Html::parse_fragment(html);

    let title = doc
        .select(&sel_title)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();
    if title.is_empty() || title == "제목없음" {
        anyhow::bail!("card has no usable title");
    }
    let dong = title.replace(complex_name, "").trim().to_string();

    let spec = doc
        .select(&sel_spec)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let children: Vec<_> = doc
        .select(&sel_child_inner)
        .filter(|inner| inner.select(&sel_cp).next().is_some())
        .collect();
    let targets = if children.is_empty() {
        doc.select(&sel_inner).take(1).collect()
    } else {
        children
    };

    let mut rows = Vec::new();
    for inner in targets {
        // Identifier: data attribute first, legacy checkbox value second.
        let article_no = inner
            .value()
            .attr("data-article-no")
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                inner
                    .select(&sel_check)
                    .next()
                    .and_then(|cb| cb.value().attr("value"))
                    .map(str::to_string)
                    .filter(|s| !s.trim().is_empty())
            });
        let Some(article_no) = article_no else {
            debug!("rendered row has no article number, dropped");
            continue;
        };

        let agent = inner
            .select(&sel_agent)
            .last()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "알수없음".to_string());
        let price = inner
            .select(&sel_price)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        rows.push(RawArticle {
            article_no: Some(article_no),
            trade_type_name: Some(trade_type.label().to_string()),
            deal_or_warrant_prc: Some(price),
            building_name: Some(dong.clone()),
            realtor_name: Some(agent),
            trade_complete_yn: Some("N".to_string()),
            article_status: Some("R0".to_string()),
            dom_spec: Some(spec.clone()),
            ..RawArticle::default()
        });
    }

    Ok(rows)
}

impl ListDriver for ChromeDriver {
    fn advance(&mut self) -> Result<()> {
        let expr = r#"
            (() => {
                const area = document.querySelector('#articleListArea');
                if (!area) return 0;
                const items = area.querySelectorAll('div.item:not(.item--child)');
                if (items.length > 0) {
                    items[items.length - 1].scrollIntoView({ block: 'center' });
                }
                area.scrollTop = area.scrollHeight;
                area.dispatchEvent(new KeyboardEvent('keydown', { key: 'PageDown', bubbles: true }));
                return items.length;
            })()
        "#;
        self.tab
            .evaluate(expr, false)
            .context("failed to advance listing container")?;
        Ok(())
    }

    fn settle(&mut self, wait: Duration) {
        thread::sleep(wait);
    }

    fn group_count(&mut self) -> Result<usize> {
        let count = self
            .eval_u64(
                "document.querySelectorAll(\"#articleListArea div.item:not(.item--child)\").length",
            )
            .context("failed to count rendered items")?;
        Ok(count as usize)
    }

    fn drain_captured(&mut self) -> Vec<serde_json::Value> {
        let Some(raw) = self.eval_string("JSON.stringify((window.__lsCaptured || []).splice(0))")
        else {
            debug!("capture drain returned nothing");
            return Vec::new();
        };

        let bodies: Vec<String> = match serde_json::from_str(&raw) {
            Ok(bodies) => bodies,
            Err(err) => {
                debug!(%err, "capture buffer was not a string array");
                return Vec::new();
            }
        };

        bodies
            .iter()
            .filter_map(|body| match serde_json::from_str(body) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(%err, "dropping unparsable response body");
                    None
                }
            })
            .collect()
    }

    fn displayed_total(&mut self) -> Option<u64> {
        let expr = r#"
            (() => {
                const el = document.querySelector(
                    '#articleListArea .article_count, #complexTitle ~ .count, span.list_count');
                if (!el) return null;
                const digits = (el.textContent || '').replace(/[^0-9]/g, '');
                return digits === '' ? null : Number(digits);
            })()
        "#;
        self.eval_u64(expr)
    }

    fn shutdown(&mut self) {
        // The Browser drop kills the Chrome process; nothing else to release.
        info!("👋 Quitting browser");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_CARD: &str = r#"
        <div class="item">
          <div class="item_title"><span class="text">DMC파크뷰자이 103동</span></div>
          <div class="info_area"><span class="spec">110E-2/84m², 저/22층, 남서향</span></div>
          <div class="item_inner" data-article-no="111">
            <span class="price">15억</span>
            <a class="agent_name">가중개</a>
          </div>
          <div class="item item--child">
            <div class="item_inner" data-article-no="222">
              <span class="price">15억</span>
              <div class="cp_area"><a class="agent_name">나중개</a></div>
            </div>
            <div class="item_inner">
              <input name="item_check" value="333">
              <span class="price">15억 5,000</span>
              <div class="cp_area"><a class="agent_name">다중개</a></div>
            </div>
          </div>
        </div>
    "#;

    #[test]
    fn parse_card_enumerates_expanded_children() {
        let rows = parse_card(GROUP_CARD, TradeType::Sale, "DMC파크뷰자이").unwrap();

        // The collapsed summary row gives way to the per-agency children.
        let ids: Vec<_> = rows
            .iter()
            .map(|r| r.article_no.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["222", "333"]);

        assert_eq!(rows[0].building_name.as_deref(), Some("103동"));
        assert_eq!(rows[0].realtor_name.as_deref(), Some("나중개"));
        assert_eq!(rows[1].realtor_name.as_deref(), Some("다중개"));
        assert_eq!(rows[1].deal_or_warrant_prc.as_deref(), Some("15억 5,000"));
        assert_eq!(
            rows[0].dom_spec.as_deref(),
            Some("110E-2/84m², 저/22층, 남서향")
        );
        assert_eq!(rows[0].trade_type_name.as_deref(), Some("매매"));
    }

    #[test]
    fn parse_card_degrades_to_parent_row_when_not_expanded() {
        // Expansion failed: the multi-agent label is present but no child
        // container rendered. The visible row is kept as the only record.
        let card = r#"
            <div class="item">
              <div class="item_title"><span class="text">DMC파크뷰자이 102동</span></div>
              <div class="info_area"><span class="spec">84A/59m², 중/30층, 남향</span></div>
              <div class="item_inner" data-article-no="444">
                <span class="label--multicp">중개사 3곳</span>
                <span class="price">12억</span>
                <a class="agent_name">가중개</a>
              </div>
            </div>
        "#;
        let rows = parse_card(card, TradeType::Sale, "DMC파크뷰자이").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].article_no.as_deref(), Some("444"));
        assert_eq!(rows[0].building_name.as_deref(), Some("102동"));
    }

    #[test]
    fn parse_card_drops_rows_without_identifier() {
        let card = r#"
            <div class="item">
              <div class="item_title"><span class="text">101동</span></div>
              <div class="item_inner">
                <span class="price">7억</span>
                <a class="agent_name">중개사</a>
              </div>
            </div>
        "#;
        let rows = parse_card(card, TradeType::Lease, "").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn parse_card_rejects_untitled_cards() {
        let card = r#"<div class="item"><div class="item_title"><span class="text">제목없음</span></div></div>"#;
        assert!(parse_card(card, TradeType::Sale, "").is_err());
    }
}
