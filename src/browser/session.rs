use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thirtyfour::{Cookie, WindowHandle};
use tracing::{debug, error, info, warn};

use crate::browser::abnormal::{AbnormalDetector, AbnormalError};
use crate::cli::config::BrowserSettings;
use crate::utils::time::{dt_stamp, now};

/// How a session's durable state is handled
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Cookie artifact to load on launch; `None` starts anonymous
    pub state_path: Option<PathBuf>,

    /// Persist cookies back to `state_path` when the session closes
    pub persist_state: bool,
}

impl SessionOptions {
    /// Authenticated session bound to a state artifact
    pub fn with_state(state_path: PathBuf) -> Self {
        Self {
            state_path: Some(state_path),
            persist_state: true,
        }
    }

    /// Anonymous session; the caller persists state itself if needed
    pub fn anonymous() -> Self {
        Self {
            state_path: None,
            persist_state: false,
        }
    }
}

/// Browser session scoped to one unit-of-work
///
/// Launching loads the session-state artifact into the cookie jar; closing
/// persists the jar back and quits the driver. Teardown runs on every exit
/// path: `close()` on the normal path, `Drop` as the backstop.
pub struct BrowserSession {
    /// Browser settings
    config: BrowserSettings,

    /// Abnormal-traffic detector applied after every navigation
    detector: Arc<dyn AbnormalDetector>,

    /// Where diagnostic screenshots land
    diagnostics_dir: PathBuf,

    /// State handling for this session
    options: SessionOptions,

    /// WebDriver instance
    driver: Option<WebDriver>,
}

impl BrowserSession {
    /// Launch a new session against the configured WebDriver endpoint
    pub async fn launch(
        config: &BrowserSettings,
        detector: Arc<dyn AbnormalDetector>,
        diagnostics_dir: PathBuf,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        // Set user agent and locale
        caps.add_chrome_arg(&format!("--user-agent={}", config.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", config.locale))?;

        // Set window size
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            config.window_width, config.window_height
        ))?;

        // Set headless mode if configured
        if config.headless {
            caps.set_headless()?;
        }

        // Keep the automation banner and flags off the surface
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        caps.add_chrome_option("excludeSwitches", json!(["enable-automation"]))?;
        caps.add_chrome_option("useAutomationExtension", false)?;

        // Connect to WebDriver
        let driver = WebDriver::new(&config.webdriver_url, caps)
            .await
            .context("Failed to connect to WebDriver")?;

        driver
            .set_page_load_timeout(Duration::from_secs(config.page_load_timeout_secs))
            .await?;

        let session = Self {
            config: config.clone(),
            detector,
            diagnostics_dir,
            options,
            driver: Some(driver),
        };

        session.restore_state().await?;

        Ok(session)
    }

    /// Access the underlying driver for element-level queries
    pub fn driver(&self) -> Result<&WebDriver> {
        self.driver
            .as_ref()
            .context("Browser session already closed")
    }

    /// Load cookies from the state artifact, if one is configured and exists
    async fn restore_state(&self) -> Result<()> {
        let Some(state_path) = &self.options.state_path else {
            return Ok(());
        };
        if !state_path.exists() {
            info!("No session state at {}, starting fresh", state_path.display());
            return Ok(());
        }

        let contents = std::fs::read_to_string(state_path)
            .context(format!("Failed to read session state {}", state_path.display()))?;
        let cookies: Vec<Cookie> = serde_json::from_str(&contents)
            .context(format!("Malformed session state {}", state_path.display()))?;

        // Cookies can only be attached once a page of the target origin is open
        let driver = self.driver()?;
        driver.goto(&self.config.home_url).await?;
        for cookie in cookies {
            if let Err(e) = driver.add_cookie(cookie.clone()).await {
                debug!("Skipping cookie {}: {}", cookie.name(), e);
            }
        }

        info!("Restored session state from {}", state_path.display());
        Ok(())
    }

    /// Persist the cookie jar to the given path
    pub async fn persist_state_to(&self, path: &std::path::Path) -> Result<()> {
        let driver = self.driver()?;
        let cookies = driver
            .get_all_cookies()
            .await
            .context("Failed to read cookies for session state")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&cookies)?;
        std::fs::write(path, contents)
            .context(format!("Failed to write session state {}", path.display()))?;

        info!("Persisted session state to {}", path.display());
        Ok(())
    }

    /// Navigate and verify the surface has not flagged the session
    pub async fn goto(&self, url: &str) -> Result<()> {
        let driver = self.driver()?;

        info!("Goto: {}", url);
        driver
            .goto(url)
            .await
            .context(format!("Failed to navigate to URL: {}", url))?;

        let landed = driver.current_url().await?;
        if self.detector.is_abnormal(landed.as_str()) {
            let shot = self
                .diagnostics_dir
                .join(format!("abnormal_{}.png", dt_stamp(now())));
            if let Err(e) = self.screenshot(&shot).await {
                warn!("Could not capture abnormal-traffic screenshot: {}", e);
            }
            return Err(AbnormalError {
                url: landed.to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Path component of the current URL
    pub async fn current_path(&self) -> Result<String> {
        let url = self.driver()?.current_url().await?;
        Ok(url.path().to_string())
    }

    /// Open a new tab and switch to it, returning the previous window handle
    pub async fn open_tab(&self) -> Result<WindowHandle> {
        let driver = self.driver()?;
        let previous = driver.window().await?;
        let tab = driver.new_tab().await?;
        driver.switch_to_window(tab).await?;
        Ok(previous)
    }

    /// Close the current tab and switch back to the given handle
    pub async fn close_tab(&self, previous: WindowHandle) -> Result<()> {
        let driver = self.driver()?;
        driver.close_window().await?;
        driver.switch_to_window(previous).await?;
        Ok(())
    }

    /// Attach extra HTTP headers to every request on the current tab
    pub async fn set_extra_headers(&self, headers: serde_json::Value) -> Result<()> {
        let driver = self.driver()?;
        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        dev_tools.execute_cdp("Network.enable").await?;
        dev_tools
            .execute_cdp_with_params("Network.setExtraHTTPHeaders", json!({ "headers": headers }))
            .await
            .context("Failed to set extra headers")?;
        Ok(())
    }

    /// Wait for an element to be present
    pub async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<WebElement> {
        let driver = self.driver()?;

        let element = driver
            .query(By::Css(selector))
            .wait(timeout, Duration::from_millis(250))
            .first()
            .await
            .context(format!("Element not found: {}", selector))?;

        Ok(element)
    }

    /// Take a screenshot of the current page
    pub async fn screenshot(&self, path: &std::path::Path) -> Result<()> {
        let driver = self.driver()?;

        let screenshot = driver
            .screenshot_as_png()
            .await
            .context("Failed to take screenshot")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, screenshot)
            .context(format!("Failed to save screenshot to: {}", path.display()))?;

        debug!("Screenshot saved to: {}", path.display());

        Ok(())
    }

    /// Close the session, persisting state first when configured
    pub async fn close(mut self) -> Result<()> {
        if self.options.persist_state {
            if let Some(state_path) = self.options.state_path.clone() {
                if let Err(e) = self.persist_state_to(&state_path).await {
                    error!("Failed to persist session state on close: {}", e);
                }
            }
        }

        if let Some(driver) = self.driver.take() {
            driver.quit().await.context("Failed to quit WebDriver")?;
            debug!("Browser session closed");
        }

        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}
