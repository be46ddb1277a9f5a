use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{AbnormalError, BrowserSession};
use crate::storage::batch::load_batch;
use crate::utils::filename::sanitize_filename;
use crate::utils::time;
use crate::worker::activity::{ActivityItem, TargetKind};
use crate::worker::config::{ConfigField, Configurable};
use crate::worker::{Worker, WorkerContext};

/// Force a feed link into an absolute https URL
///
/// Feed links are usually scheme-relative (`//host/path`); occasionally
/// absolute or site-relative.
pub fn normalize_target_url(link: &str, base: &str) -> Result<String> {
    if let Some(rest) = link.strip_prefix("//") {
        return Ok(format!("https://{}", rest));
    }

    let mut url = match Url::parse(link) {
        Ok(url) => url,
        Err(_) => Url::parse(base)
            .and_then(|b| b.join(link))
            .context(format!("Unusable target link: {}", link))?,
    };

    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }

    Ok(url.to_string())
}

/// Archiver worker
///
/// Each cycle pops one queued batch and visits every item's target in
/// order, capturing a snapshot and a small metadata record per item.
pub struct Archiver {
    ctx: Arc<WorkerContext>,
    people: String,
    interval_secs: u64,
    page_default_timeout_ms: u64,
}

impl Archiver {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let config = &ctx.config;
        Self {
            people: config.people.clone(),
            interval_secs: config.archiver.interval_secs,
            page_default_timeout_ms: config.archiver.page_default_timeout_ms,
            ctx: ctx.clone(),
        }
    }

    /// Visit one item's target in a fresh tab and snapshot it
    async fn store_one(&self, session: &BrowserSession, item: &ActivityItem) -> Result<()> {
        if item.target.link.is_empty() {
            debug!("Skipping item {} without a target link", item.id);
            return Ok(());
        }

        let url = normalize_target_url(&item.target.link, &self.ctx.config.browser.home_url)?;

        // One tab per target, closed on every exit path
        let previous = session.open_tab().await?;
        let result = self.snapshot_target(session, item, &url).await;
        if let Err(e) = session.close_tab(previous).await {
            warn!("Failed to close target tab: {:#}", e);
        }
        result
    }

    async fn snapshot_target(
        &self,
        session: &BrowserSession,
        item: &ActivityItem,
        url: &str,
    ) -> Result<()> {
        let settings = &self.ctx.config.archiver;

        // The surface expects targets to be reached from the profile feed
        session
            .set_extra_headers(json!({
                "Referer": self.ctx.config.feed.person_page_url_for(&self.people)
            }))
            .await?;

        session.goto(url).await?;

        // Bring lazy-loaded media into view before the shot
        let media_selector = if item.meta.target_type == TargetKind::Answer.as_text() {
            &settings.answer_media_selector
        } else {
            &settings.article_media_selector
        };
        for img in session.driver()?.find_all(By::Css(media_selector)).await? {
            img.scroll_into_view().await?;
        }
        sleep(Duration::from_millis(settings.settle_delay_ms)).await;

        let shot_at = time::now();
        let title = sanitize_filename(&format!(
            "{}-{}-{}",
            item.meta.action,
            item.target.title,
            &item.id[..8.min(item.id.len())]
        ));
        let target_dir = self
            .ctx
            .archive_dir(&self.people)
            .join(item.meta.acted_at.format("%Y/%m/%d").to_string())
            .join(&title);
        tokio::fs::create_dir_all(&target_dir).await?;

        let screenshot_path = target_dir.join(format!("{}.png", title));
        info!("Saving screenshot to {}", screenshot_path.display());
        session.screenshot(&screenshot_path).await?;

        let info = json!({
            "title": item.target.title,
            "url": url,
            "author": item.target.author,
            "shot_at": time::to_iso(shot_at),
        });
        tokio::fs::write(
            target_dir.join("info.json"),
            serde_json::to_string_pretty(&info)?,
        )
        .await?;

        // Nudge the page so anything below the fold finishes loading too
        let driver = session.driver()?;
        driver
            .execute("window.scrollBy(0, window.innerHeight);", Vec::new())
            .await?;
        sleep(Duration::from_millis(settings.settle_delay_ms)).await;
        driver
            .execute("window.scrollBy(0, window.innerHeight);", Vec::new())
            .await?;

        Ok(())
    }
}

impl Configurable for Archiver {
    fn config_fields() -> &'static [ConfigField<Self>] {
        const FIELDS: &[ConfigField<Archiver>] = &[
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
        ];
        FIELDS
    }
}

#[async_trait]
impl Worker for Archiver {
    fn name(&self) -> &'static str {
        "archiver"
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
        let Some(task) = self.ctx.task_queue().pop().await? else {
            debug!("No archive task queued");
            return Ok(());
        };
        info!("New archive task: {}", task);

        let items = load_batch(&task.activity_path).await?;
        info!("Will fetch {} items", items.len());

        session
            .driver()?
            .set_page_load_timeout(Duration::from_millis(self.page_default_timeout_ms))
            .await?;

        for item in &items {
            if let Err(e) = self.store_one(session, item).await {
                // A flagged session must bubble up and pause the worker;
                // anything else is a per-item failure the batch survives
                if e.downcast_ref::<AbnormalError>().is_some() {
                    return Err(e);
                }
                warn!("Failed to archive '{}': {:#}", item.target.title, e);
            }
            sleep(Duration::from_millis(
                self.ctx.config.archiver.item_delay_ms,
            ))
            .await;
        }

        info!("Fetch done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_relative_links_become_https() {
        assert_eq!(
            normalize_target_url("//www.zhihu.com/question/1/answer/2", "https://www.zhihu.com")
                .unwrap(),
            "https://www.zhihu.com/question/1/answer/2"
        );
    }

    #[test]
    fn http_links_are_upgraded() {
        assert_eq!(
            normalize_target_url("http://zhuanlan.zhihu.com/p/42", "https://www.zhihu.com")
                .unwrap(),
            "https://zhuanlan.zhihu.com/p/42"
        );
    }

    #[test]
    fn site_relative_links_join_the_base() {
        assert_eq!(
            normalize_target_url("/question/1/answer/2", "https://www.zhihu.com").unwrap(),
            "https://www.zhihu.com/question/1/answer/2"
        );
    }

    #[test]
    fn https_links_pass_through() {
        assert_eq!(
            normalize_target_url("https://www.zhihu.com/pin/7", "https://www.zhihu.com").unwrap(),
            "https://www.zhihu.com/pin/7"
        );
    }
}
