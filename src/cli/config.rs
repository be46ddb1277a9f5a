use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// User handle whose activity feed is archived
    pub people: String,

    /// Coordination store URL
    pub redis_url: String,

    /// Root of the on-disk result layout (`results/{people}/...`)
    pub results_dir: PathBuf,

    /// Session-state artifacts and QR images
    pub states_dir: PathBuf,

    /// Per-worker log files, tailed by the control surface
    pub logs_dir: PathBuf,

    pub browser: BrowserSettings,
    pub feed: FeedSettings,
    pub monitor: MonitorSettings,
    pub archiver: ArchiverSettings,
    pub login: LoginSettings,
    pub api: ApiSettings,
}

/// Browser automation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    /// WebDriver endpoint
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub locale: String,
    pub window_width: u32,
    pub window_height: u32,
    pub page_load_timeout_secs: u64,

    /// Origin page opened before restoring cookies
    pub home_url: String,

    /// URL rule list for the abnormal-traffic detector
    pub abnormal_url_patterns: Vec<String>,
}

/// Selectors and shape of the activity feed surface
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeedSettings {
    /// Profile page template; `{people}` is substituted with the user handle
    pub person_page_url: String,

    /// One feed entry
    pub activity_item_selector: String,

    /// Meta text fragments within an entry (action text, timestamp)
    pub meta_selector: String,

    /// Title span checked for the pinned marker
    pub pinned_marker_selector: String,

    /// Literal text marking a pinned entry
    pub pinned_marker_text: String,

    /// Target block within an entry
    pub target_selector: String,

    /// Target link within the target block
    pub target_link_selector: String,

    /// Author link within the target block
    pub author_link_selector: String,

    /// Element that must appear after a load-more gesture
    pub loaded_content_selector: String,

    /// Bounded wait for new entries after the load-more gesture
    pub load_more_timeout_secs: u64,
}

impl FeedSettings {
    /// Resolve the profile page URL for a user handle
    pub fn person_page_url_for(&self, people: &str) -> String {
        self.person_page_url.replace("{people}", people)
    }
}

/// Monitor worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorSettings {
    /// Seconds between crawl cycles
    pub interval_secs: u64,

    /// Element query timeout in milliseconds
    pub page_default_timeout_ms: u64,

    /// First-run checkpoint: now minus this many days
    pub initial_backfill_days: i64,
}

/// Archiver worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiverSettings {
    /// Seconds between queue polls
    pub interval_secs: u64,

    /// Element query timeout in milliseconds
    pub page_default_timeout_ms: u64,

    /// Fixed inter-item delay in milliseconds (rate limiting by construction)
    pub item_delay_ms: u64,

    /// Layout settling delay before the snapshot
    pub settle_delay_ms: u64,

    /// Selector for embedded media in answer pages
    pub answer_media_selector: String,

    /// Selector for embedded media in article pages
    pub article_media_selector: String,
}

/// Login worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginSettings {
    /// Seconds between handshake-slot polls
    pub interval_secs: u64,

    /// Element query timeout in milliseconds
    pub page_default_timeout_ms: u64,

    /// Sign-in page presenting the QR code
    pub signin_url: String,

    /// QR code image element
    pub qrcode_selector: String,

    /// Captures below this byte size are placeholders still loading
    pub qrcode_min_bytes: usize,

    /// Bounded wait for the operator to scan, in seconds
    pub scan_timeout_secs: u64,
}

/// Control surface settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiSettings {
    pub bind_addr: String,
    pub username: String,
    pub password: String,
    pub jwt_secret: String,
    pub cookie_max_age_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            people: "MarryMea".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            results_dir: PathBuf::from("results"),
            states_dir: PathBuf::from("states"),
            logs_dir: PathBuf::from("logs"),
            browser: BrowserSettings {
                webdriver_url: "http://localhost:4444".to_string(),
                headless: true,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
                locale: "zh-CN".to_string(),
                window_width: 1920,
                window_height: 1080,
                page_load_timeout_secs: 30,
                home_url: "https://www.zhihu.com".to_string(),
                abnormal_url_patterns: vec!["account/unhuman".to_string()],
            },
            feed: FeedSettings {
                person_page_url: "https://www.zhihu.com/people/{people}".to_string(),
                activity_item_selector: "div.Profile-main div[role=list] div.List-item"
                    .to_string(),
                meta_selector: "div.ActivityItem-meta span".to_string(),
                pinned_marker_selector: "div.ContentItem h2.ContentItem-title span".to_string(),
                pinned_marker_text: "置顶".to_string(),
                target_selector: "div.ContentItem".to_string(),
                target_link_selector: "h2 a[target=_blank]".to_string(),
                author_link_selector:
                    "div.ContentItem-meta div.AuthorInfo div.AuthorInfo-content span.UserLink a.UserLink-link"
                        .to_string(),
                loaded_content_selector: "div.ContentItem".to_string(),
                load_more_timeout_secs: 5,
            },
            monitor: MonitorSettings {
                interval_secs: 60 * 5,
                page_default_timeout_ms: 10 * 1000,
                initial_backfill_days: 10,
            },
            archiver: ArchiverSettings {
                interval_secs: 10,
                page_default_timeout_ms: 30 * 1000,
                item_delay_ms: 1000,
                settle_delay_ms: 500,
                answer_media_selector: "div.AnswerCard figure img".to_string(),
                article_media_selector: "div.Post-RichTextContainer figure img".to_string(),
            },
            login: LoginSettings {
                interval_secs: 5,
                page_default_timeout_ms: 30 * 1000,
                signin_url: "https://www.zhihu.com/signin?next=%2F".to_string(),
                qrcode_selector: "div.Qrcode-content img".to_string(),
                qrcode_min_bytes: 4096 + 100,
                scan_timeout_secs: 120,
            },
            api: ApiSettings {
                bind_addr: "127.0.0.1:8000".to_string(),
                username: "admin".to_string(),
                password: "admin".to_string(),
                jwt_secret: "change-me".to_string(),
                cookie_max_age_secs: 7 * 24 * 3600,
            },
        }
    }
}

impl ArchiveConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "zhi-archive", "zhi-archive")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load the default configuration, creating it on first run
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let config = ArchiveConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ArchiveConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.people, config.people);
        assert_eq!(parsed.feed.load_more_timeout_secs, 5);
        assert_eq!(parsed.login.qrcode_min_bytes, 4196);
    }

    #[test]
    fn person_page_url_substitutes_the_handle() {
        let config = ArchiveConfig::default();
        assert_eq!(
            config.feed.person_page_url_for("someone"),
            "https://www.zhihu.com/people/someone"
        );
    }
}
