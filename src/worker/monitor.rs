use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::cli::config::FeedSettings;
use crate::storage::batch::save_batch;
use crate::storage::queue::ArchiveTask;
use crate::utils::filename::sanitize_filename;
use crate::utils::time::{self, dt_stamp, parse_feed_time};
use crate::worker::activity::{classify, split_meta_text, ActivityItem, ActivityMeta, Target};
use crate::worker::config::{ConfigField, Configurable};
use crate::worker::{Worker, WorkerContext};

/// The live activity feed as a queryable capability
///
/// The crawler only sees this seam; the production implementation drives a
/// browser session, tests script a fake.
#[async_trait]
pub trait FeedSurface {
    /// Number of entries currently loaded
    async fn entry_count(&self) -> Result<usize>;

    /// Meta text fragments of one entry (combined action text, timestamp)
    async fn meta_texts(&self, index: usize) -> Result<Vec<String>>;

    async fn is_pinned(&self, index: usize) -> Result<bool>;

    /// Pull the target block out of one entry; missing pieces come back empty
    async fn extract_target(&self, index: usize) -> Result<Target>;

    /// Screenshot one entry element
    async fn capture_entry(&self, index: usize, path: &Path) -> Result<()>;

    /// End-of-page gesture asking the surface to load older entries
    async fn request_more(&self) -> Result<()>;

    /// Bounded wait for the entry at `index` to materialize
    async fn wait_for_entry(&self, index: usize, timeout: Duration) -> Result<bool>;

    /// Full-page diagnostic screenshot
    async fn capture_page(&self, path: &Path) -> Result<()>;
}

/// Production feed surface over a browser session
pub struct LiveFeed<'a> {
    session: &'a BrowserSession,
    settings: &'a FeedSettings,
}

impl<'a> LiveFeed<'a> {
    pub fn new(session: &'a BrowserSession, settings: &'a FeedSettings) -> Self {
        Self { session, settings }
    }

    async fn entries(&self) -> Result<Vec<WebElement>> {
        Ok(self
            .session
            .driver()?
            .find_all(By::Css(&self.settings.activity_item_selector))
            .await?)
    }

    async fn entry(&self, index: usize) -> Result<WebElement> {
        self.entries()
            .await?
            .into_iter()
            .nth(index)
            .context(format!("Feed entry {} is no longer present", index))
    }

    async fn try_extract(&self, entry: &WebElement) -> Result<(String, String, String)> {
        let target = entry.find(By::Css(&self.settings.target_selector)).await?;
        let link_el = target
            .find(By::Css(&self.settings.target_link_selector))
            .await?;
        let title = link_el.text().await?;
        let link = link_el.attr("href").await?.unwrap_or_default();

        let author_el = target
            .find(By::Css(&self.settings.author_link_selector))
            .await?;
        let author_href = author_el.attr("href").await?.unwrap_or_default();
        let author = author_href
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Ok((title, link, author))
    }
}

#[async_trait]
impl FeedSurface for LiveFeed<'_> {
    async fn entry_count(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    async fn meta_texts(&self, index: usize) -> Result<Vec<String>> {
        let entry = self.entry(index).await?;
        let spans = entry.find_all(By::Css(&self.settings.meta_selector)).await?;

        let mut texts = Vec::with_capacity(spans.len());
        for span in spans {
            texts.push(span.text().await?);
        }
        Ok(texts)
    }

    async fn is_pinned(&self, index: usize) -> Result<bool> {
        let entry = self.entry(index).await?;
        for marker in entry
            .find_all(By::Css(&self.settings.pinned_marker_selector))
            .await?
        {
            if marker
                .text()
                .await?
                .contains(&self.settings.pinned_marker_text)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn extract_target(&self, index: usize) -> Result<Target> {
        let fetched_at = time::now();
        let entry = self.entry(index).await?;

        match self.try_extract(&entry).await {
            Ok((title, link, author)) => Ok(Target {
                title,
                link,
                author,
                fetched_at,
            }),
            Err(e) => {
                // The entry renders without a regular target block
                debug!("Target extraction failed for entry {}: {:#}", index, e);
                Ok(Target {
                    title: String::new(),
                    link: String::new(),
                    author: String::new(),
                    fetched_at,
                })
            }
        }
    }

    async fn capture_entry(&self, index: usize, path: &Path) -> Result<()> {
        let entry = self.entry(index).await?;
        let png = entry
            .screenshot_as_png()
            .await
            .context("Failed to screenshot feed entry")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, png)
            .context(format!("Failed to save entry screenshot to {}", path.display()))?;
        Ok(())
    }

    async fn request_more(&self) -> Result<()> {
        debug!("Scrolling to the end of the page");
        self.session
            .driver()?
            .execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
            .await?;
        Ok(())
    }

    async fn wait_for_entry(&self, index: usize, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.entry_count().await? > index {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    async fn capture_page(&self, path: &Path) -> Result<()> {
        self.session.screenshot(path).await
    }
}

/// Result of one crawl cycle
pub struct CrawlOutcome {
    /// Items in strictly decreasing `acted_at` order (feed order)
    pub items: Vec<ActivityItem>,

    /// Timestamp of the newest non-pinned entry seen this cycle
    pub checkpoint: NaiveDateTime,
}

struct PageScan {
    items: Vec<ActivityItem>,
    scanned: usize,
    last_seen: NaiveDateTime,
}

/// Checkpoint-driven pagination over a live, append-only feed
///
/// Scans newest to oldest from the cursor, stopping at the first entry at
/// or below the checkpoint. Pinned entries are skipped without stopping.
/// Timestamps are second precision; entries sharing exactly the checkpoint
/// second may be inconsistently included across cycles (known gap).
pub struct FeedCrawler {
    /// Stop collecting at or below this timestamp
    until: NaiveDateTime,

    /// Where per-entry screenshots land
    activities_dir: PathBuf,

    /// Where the feed-exhausted diagnostic screenshot lands
    diagnostics_dir: PathBuf,

    /// Bounded wait for new entries after a load-more gesture
    load_more_timeout: Duration,
}

impl FeedCrawler {
    pub fn new(
        until: NaiveDateTime,
        activities_dir: PathBuf,
        diagnostics_dir: PathBuf,
        load_more_timeout: Duration,
    ) -> Self {
        Self {
            until,
            activities_dir,
            diagnostics_dir,
            load_more_timeout,
        }
    }

    /// Crawl down to the checkpoint, paging as needed
    pub async fn crawl<F: FeedSurface>(&self, feed: &F) -> Result<CrawlOutcome> {
        let mut start = 0;
        let mut items = Vec::new();
        let mut latest: Option<NaiveDateTime> = None;
        let mut last_seen = time::now();
        let mut round = 1;

        info!("Scanning the feed newest to oldest, checkpoint: {}", self.until);
        while last_seen > self.until {
            info!("Scan round {}", round);
            let page = self
                .scan_loaded(feed, start, last_seen, &mut latest)
                .await?;
            start += page.scanned;
            items.extend(page.items);
            last_seen = page.last_seen;

            if last_seen <= self.until {
                info!(
                    "Entry at {} reached the checkpoint {}, stopping",
                    last_seen, self.until
                );
                break;
            }

            // Ask the surface for older entries and wait for one to land
            feed.request_more().await?;
            if !feed.wait_for_entry(start, self.load_more_timeout).await? {
                info!("Feed exhausted after {} entries, stopping", start);
                let shot = self
                    .diagnostics_dir
                    .join(format!("error_{}.png", dt_stamp(last_seen)));
                if let Err(e) = feed.capture_page(&shot).await {
                    warn!("Could not capture feed-exhausted screenshot: {:#}", e);
                }
                break;
            }

            round += 1;
            sleep(Duration::from_secs(1)).await;
        }

        Ok(CrawlOutcome {
            items,
            // No entry seen at all: carry the old checkpoint forward
            checkpoint: latest.unwrap_or(self.until),
        })
    }

    /// Scan the currently loaded entries from the cursor onward
    async fn scan_loaded<F: FeedSurface>(
        &self,
        feed: &F,
        start: usize,
        mut last_seen: NaiveDateTime,
        latest: &mut Option<NaiveDateTime>,
    ) -> Result<PageScan> {
        let total = feed.entry_count().await?;
        let mut items = Vec::new();
        let mut scanned = 0;

        info!("Cursor at {}, {} entries loaded", start, total);

        for index in start..total {
            debug!("Entry {}", index);
            let texts = feed.meta_texts(index).await?;
            scanned += 1;

            if texts.len() < 2 {
                continue;
            }

            if feed.is_pinned(index).await? {
                warn!("Skipping pinned entry {}", index);
                continue;
            }

            let acted_at = parse_feed_time(&texts[1])?;
            if latest.is_none() {
                info!("Newest entry this cycle: {}", acted_at);
                *latest = Some(acted_at);
            }
            last_seen = acted_at;

            if acted_at <= self.until {
                info!(
                    "Entry at {} is not newer than the checkpoint {}, stopping scan",
                    acted_at, self.until
                );
                break;
            }

            let Some((action_text, type_text)) = split_meta_text(&texts[0]) else {
                warn!("Unparseable meta text: {}", texts[0]);
                continue;
            };
            let Some(kind) = classify(action_text, type_text) else {
                warn!("Ignoring unclassified entry: {}", texts[0]);
                continue;
            };

            let target = feed.extract_target(index).await?;
            info!("At {} {}\n\t{}", acted_at, texts[0], target.title);

            let item = ActivityItem::new(
                ActivityMeta {
                    action: action_text.to_string(),
                    target_type: kind.as_text().to_string(),
                    acted_at,
                    raw: Some(texts.clone()),
                },
                target,
            );

            let shot_name = format!(
                "{}.png",
                sanitize_filename(&format!("{}-{}", action_text, item.target.title))
            );
            if let Err(e) = feed
                .capture_entry(index, &self.activities_dir.join(shot_name))
                .await
            {
                warn!("Could not capture entry screenshot: {:#}", e);
            }

            items.push(item);
        }

        Ok(PageScan {
            items,
            scanned,
            last_seen,
        })
    }
}

/// Feed monitor worker
///
/// Each cycle crawls the profile feed forward from the persisted checkpoint,
/// saves any discovered items as a batch, and queues the batch for the
/// archiver.
pub struct Monitor {
    ctx: Arc<WorkerContext>,
    people: String,
    interval_secs: u64,
    page_default_timeout_ms: u64,
    fetch_until: NaiveDateTime,
}

impl Monitor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let config = &ctx.config;
        let fetch_until =
            time::now() - chrono::Duration::days(config.monitor.initial_backfill_days);

        Self {
            people: config.people.clone(),
            interval_secs: config.monitor.interval_secs,
            page_default_timeout_ms: config.monitor.page_default_timeout_ms,
            fetch_until,
            ctx: ctx.clone(),
        }
    }
}

impl Configurable for Monitor {
    fn config_fields() -> &'static [ConfigField<Self>] {
        const FIELDS: &[ConfigField<Monitor>] = &[
            ConfigField {
                name: "people",
                read_only: false,
                depends_on: None,
                get: |w| Value::String(w.people.clone()),
                set: Some(|w, v| {
                    w.people = v.as_str().context("people must be a string")?.to_string();
                    Ok(())
                }),
            },
            ConfigField {
                name: "page_default_timeout",
                read_only: false,
                depends_on: None,
                get: |w| json!(w.page_default_timeout_ms),
                set: Some(|w, v| {
                    w.page_default_timeout_ms =
                        v.as_u64().context("page_default_timeout must be an integer")?;
                    Ok(())
                }),
            },
            ConfigField {
                name: "interval",
                read_only: false,
                depends_on: None,
                get: |w| json!(w.interval_secs),
                set: Some(|w, v| {
                    w.interval_secs = v.as_u64().context("interval must be an integer")?;
                    Ok(())
                }),
            },
            ConfigField {
                name: "person_page_url",
                read_only: true,
                depends_on: Some("people"),
                get: |w| Value::String(w.ctx.config.feed.person_page_url_for(&w.people)),
                set: None,
            },
            ConfigField {
                name: "results_dir",
                read_only: true,
                depends_on: Some("people"),
                get: |w| Value::String(w.ctx.people_dir(&w.people).display().to_string()),
                set: None,
            },
            ConfigField {
                name: "fetch_until",
                read_only: true,
                depends_on: None,
                get: |w| Value::String(time::to_iso(w.fetch_until)),
                set: Some(|w, v| {
                    let text = v.as_str().context("fetch_until must be a string")?;
                    w.fetch_until = time::from_iso(text)?;
                    Ok(())
                }),
            },
        ];
        FIELDS
    }
}

#[async_trait]
impl Worker for Monitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn people(&self) -> &str {
        &self.people
    }

    fn context(&self) -> Arc<WorkerContext> {
        self.ctx.clone()
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    async fn run_once(&mut self, session: &BrowserSession) -> Result<()> {
        info!("Starting a new fetch loop...");
        let ctx = self.ctx.clone();

        session
            .driver()?
            .set_page_load_timeout(Duration::from_millis(self.page_default_timeout_ms))
            .await?;

        let url = ctx.config.feed.person_page_url_for(&self.people);
        session.goto(&url).await?;
        session
            .wait_for_element(
                &ctx.config.feed.activity_item_selector,
                Duration::from_millis(self.page_default_timeout_ms),
            )
            .await?;

        let activities_dir = ctx.activities_dir(&self.people);
        let crawler = FeedCrawler::new(
            self.fetch_until,
            activities_dir.clone(),
            ctx.people_dir(&self.people),
            Duration::from_secs(ctx.config.feed.load_more_timeout_secs),
        );
        let feed = LiveFeed::new(session, &ctx.config.feed);

        let outcome = crawler.crawl(&feed).await?;
        self.fetch_until = outcome.checkpoint;

        if outcome.items.is_empty() {
            info!("No items, will do nothing.");
            return Ok(());
        }

        let path = save_batch(&activities_dir, time::now(), &outcome.items).await?;
        let task = ArchiveTask::new(&path);
        ctx.task_queue().push(&task).await?;
        info!("Pushed task {} to the task list", task);

        info!("Done, wait for next fetch loop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeEntry {
        meta: Vec<String>,
        pinned: bool,
        title: String,
    }

    impl FakeEntry {
        fn new(action: &str, stamp: &str, title: &str) -> Self {
            Self {
                meta: vec![action.to_string(), stamp.to_string()],
                pinned: false,
                title: title.to_string(),
            }
        }

        fn pinned(mut self) -> Self {
            self.pinned = true;
            self
        }
    }

    /// Scripted feed: `visible` entries are loaded, the rest appear one
    /// page at a time after a load-more gesture
    struct FakeFeed {
        entries: Vec<FakeEntry>,
        visible: Mutex<usize>,
        page_size: usize,
    }

    impl FakeFeed {
        fn new(entries: Vec<FakeEntry>, initially_visible: usize, page_size: usize) -> Self {
            let visible = initially_visible.min(entries.len());
            Self {
                entries,
                visible: Mutex::new(visible),
                page_size,
            }
        }
    }

    #[async_trait]
    impl FeedSurface for FakeFeed {
        async fn entry_count(&self) -> Result<usize> {
            Ok(*self.visible.lock().unwrap())
        }

        async fn meta_texts(&self, index: usize) -> Result<Vec<String>> {
            Ok(self.entries[index].meta.clone())
        }

        async fn is_pinned(&self, index: usize) -> Result<bool> {
            Ok(self.entries[index].pinned)
        }

        async fn extract_target(&self, index: usize) -> Result<Target> {
            Ok(Target {
                title: self.entries[index].title.clone(),
                link: format!("//www.zhihu.com/question/1/answer/{}", index),
                author: "someone".to_string(),
                fetched_at: time::now(),
            })
        }

        async fn capture_entry(&self, _index: usize, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn request_more(&self) -> Result<()> {
            let mut visible = self.visible.lock().unwrap();
            *visible = (*visible + self.page_size).min(self.entries.len());
            Ok(())
        }

        async fn wait_for_entry(&self, index: usize, _timeout: Duration) -> Result<bool> {
            Ok(*self.visible.lock().unwrap() > index)
        }

        async fn capture_page(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn crawler(until: NaiveDateTime) -> (FeedCrawler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let crawler = FeedCrawler::new(
            until,
            dir.path().join("activities"),
            dir.path().to_path_buf(),
            Duration::from_millis(10),
        );
        (crawler, dir)
    }

    fn t(stamp: &str) -> NaiveDateTime {
        parse_feed_time(stamp).unwrap()
    }

    #[tokio::test]
    async fn stops_at_the_checkpoint_and_advances_it() {
        let feed = FakeFeed::new(
            vec![
                FakeEntry::new("赞同了回答", "2024-05-01 12:00:03", "newest"),
                FakeEntry::new("赞同了回答", "2024-05-01 12:00:02", "middle"),
                FakeEntry::new("收藏了文章", "2024-05-01 12:00:01", "oldest kept"),
                FakeEntry::new("赞同了回答", "2024-04-30 11:59:59", "pinned old").pinned(),
                FakeEntry::new("赞同了回答", "2024-04-30 11:59:58", "below checkpoint"),
            ],
            5,
            5,
        );
        let (crawler, _dir) = crawler(t("2024-05-01 12:00:00"));

        let outcome = crawler.crawl(&feed).await.unwrap();

        let titles: Vec<&str> = outcome
            .items
            .iter()
            .map(|i| i.target.title.as_str())
            .collect();
        assert_eq!(titles, vec!["newest", "middle", "oldest kept"]);
        assert_eq!(outcome.checkpoint, t("2024-05-01 12:00:03"));
    }

    #[tokio::test]
    async fn pinned_entries_are_skipped_without_stopping() {
        // A pinned entry older than the checkpoint sits on top
        let feed = FakeFeed::new(
            vec![
                FakeEntry::new("赞同了回答", "2024-01-01 00:00:00", "pinned").pinned(),
                FakeEntry::new("赞同了回答", "2024-05-01 12:00:05", "fresh"),
            ],
            2,
            2,
        );
        let (crawler, _dir) = crawler(t("2024-05-01 12:00:00"));

        let outcome = crawler.crawl(&feed).await.unwrap();

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].target.title, "fresh");
        // The checkpoint comes from the first non-pinned entry
        assert_eq!(outcome.checkpoint, t("2024-05-01 12:00:05"));
    }

    #[tokio::test]
    async fn unclassified_entries_yield_no_items_and_no_errors() {
        let feed = FakeFeed::new(
            vec![
                FakeEntry::new("发布了想法", "2024-05-01 12:00:03", "a pin post"),
                FakeEntry::new("关注了问题", "2024-05-01 12:00:02", "a follow"),
            ],
            2,
            2,
        );
        let (crawler, _dir) = crawler(t("2024-05-01 12:00:00"));

        let outcome = crawler.crawl(&feed).await.unwrap();

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.checkpoint, t("2024-05-01 12:00:03"));
    }

    #[tokio::test]
    async fn pages_until_the_feed_is_exhausted() {
        let feed = FakeFeed::new(
            vec![
                FakeEntry::new("赞同了回答", "2024-05-01 12:00:05", "one"),
                FakeEntry::new("赞同了回答", "2024-05-01 12:00:04", "two"),
                FakeEntry::new("回答了问题", "2024-05-01 12:00:03", "three"),
            ],
            1,
            1,
        );
        let (crawler, _dir) = crawler(t("2024-05-01 12:00:00"));

        let outcome = crawler.crawl(&feed).await.unwrap();

        assert_eq!(outcome.items.len(), 3);
        let order: Vec<NaiveDateTime> = outcome.items.iter().map(|i| i.meta.acted_at).collect();
        assert!(order.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn empty_feed_keeps_the_old_checkpoint() {
        let feed = FakeFeed::new(vec![], 0, 1);
        let until = t("2024-05-01 12:00:00");
        let (crawler, _dir) = crawler(until);

        let outcome = crawler.crawl(&feed).await.unwrap();

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.checkpoint, until);
    }

    #[tokio::test]
    async fn monitor_config_round_trip() {
        use crate::cli::config::ArchiveConfig;
        use crate::storage::store::MemoryStore;
        use crate::worker::config::ConfigSynchronizer;
        use crate::worker::configs_key;
        use serde_json::json;

        let ctx = WorkerContext::new(Arc::new(MemoryStore::new()), ArchiveConfig::default());
        let sync = ConfigSynchronizer::new(ctx.store.clone(), configs_key("monitor"));

        let mut monitor = Monitor::new(ctx.clone());
        monitor.fetch_until = t("2024-05-01 12:00:00");
        sync.sync_from(&monitor).await.unwrap();

        // External write: mutable field accepted, dependents re-derived
        let partial = json!({"people": "bob", "fetch_until": "2030-01-01T00:00:00"})
            .as_object()
            .unwrap()
            .clone();
        let accepted = sync
            .apply_external_update(&mut monitor, &partial)
            .await
            .unwrap();
        assert_eq!(accepted["people"], json!("bob"));
        assert_eq!(
            accepted["person_page_url"],
            json!("https://www.zhihu.com/people/bob")
        );
        // The checkpoint is read-only on the external path
        assert!(!accepted.contains_key("fetch_until"));
        assert_eq!(monitor.fetch_until, t("2024-05-01 12:00:00"));

        // A fresh instance picks the persisted checkpoint back up
        let mut restarted = Monitor::new(ctx);
        sync.load(&mut restarted).await.unwrap();
        assert_eq!(restarted.fetch_until, t("2024-05-01 12:00:00"));
        assert_eq!(restarted.people, "bob");
    }

    #[tokio::test]
    async fn items_carry_raw_meta_and_classified_type() {
        let feed = FakeFeed::new(
            vec![FakeEntry::new("收藏了回答", "2024-05-01 12:00:01", "kept")],
            1,
            1,
        );
        let (crawler, _dir) = crawler(t("2024-05-01 12:00:00"));

        let outcome = crawler.crawl(&feed).await.unwrap();
        let item = &outcome.items[0];

        assert_eq!(item.meta.action, "收藏");
        assert_eq!(item.meta.target_type, "回答");
        assert_eq!(
            item.meta.raw.as_ref().unwrap()[0],
            "收藏了回答"
        );
        assert_eq!(item.meta.acted_at, t("2024-05-01 12:00:01"));
    }
}
