use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, SessionOptions};
use crate::worker::config::{ConfigField, Configurable};
use crate::worker::{qr_status_key, qr_task_key, Worker, WorkerContext};

/// Bounded wait for the sign-in surface to render a real QR image
const QR_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of one QR handshake, transitioned only by the login worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrScanStatus {
    NotExist,
    Pending,
    Ok,
    Failed,
}

impl QrScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotExist => "not_exist",
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "ok" => Self::Ok,
            "failed" => Self::Failed,
            _ => Self::NotExist,
        }
    }

    /// Legal forward transitions; statuses never regress
    fn can_become(&self, next: QrScanStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotExist, Self::Pending)
                | (Self::Pending, Self::Ok)
                | (Self::Pending, Self::Failed)
        )
    }
}

/// One pending QR handshake: where the QR image and the resulting session
/// state must land
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCodeTask {
    pub qrcode_path: PathBuf,
    pub state_path: PathBuf,
}

impl QrCodeTask {
    pub fn new(qrcode_path: PathBuf, state_path: PathBuf) -> Self {
        Self {
            qrcode_path,
            state_path,
        }
    }

    /// Task identity in the status hash
    pub fn task_name(&self) -> String {
        self.state_path.display().to_string()
    }
}

/// The store's single pending handshake slot plus its status hash
///
/// A requester writes a task into the slot (implicitly invalidating any
/// previous uncompleted one) and polls the status hash; the login worker
/// claims tasks and drives the status forward. Neither side clears the
/// slot: the requester observes the terminal status on its next poll.
pub struct QrSlot {
    store: Arc<dyn crate::storage::store::KeyValueStore>,
}

impl QrSlot {
    pub fn new(store: Arc<dyn crate::storage::store::KeyValueStore>) -> Self {
        Self { store }
    }

    /// Requester side: publish a new handshake task
    pub async fn create_task(&self, task: &QrCodeTask) -> Result<()> {
        let value = serde_json::to_string(task)?;
        self.store.set(&qr_task_key(), &value).await?;
        info!("Created login task {}", task.task_name());
        Ok(())
    }

    /// The task currently in the slot, if any
    pub async fn pending_task(&self) -> Result<Option<QrCodeTask>> {
        let Some(value) = self.store.get(&qr_task_key()).await? else {
            return Ok(None);
        };
        let task = serde_json::from_str(&value)
            .context("Malformed QR task in the coordination store")?;
        Ok(Some(task))
    }

    /// Status for a task identity; absent means `NotExist`
    pub async fn status(&self, task_name: &str) -> Result<QrScanStatus> {
        let value = self.store.hget(&qr_status_key(), task_name).await?;
        Ok(value
            .map(|v| QrScanStatus::from_str(&v))
            .unwrap_or(QrScanStatus::NotExist))
    }

    /// Advance a task's status; regressions are protocol violations
    pub async fn set_status(&self, task_name: &str, status: QrScanStatus) -> Result<()> {
        let current = self.status(task_name).await?;
        if !current.can_become(status) {
            bail!(
                "illegal QR status transition {} -> {} for {}",
                current.as_str(),
                status.as_str(),
                task_name
            );
        }
        self.store
            .hset(&qr_status_key(), task_name, status.as_str())
            .await
    }

    /// Worker side: take the pending task if nobody has started on it
    pub async fn claim(&self) -> Result<Option<QrCodeTask>> {
        let Some(task) = self.pending_task().await? else {
            return Ok(None);
        };
        if self.status(&task.task_name()).await? != QrScanStatus::NotExist {
            return Ok(None);
        }
        self.set_status(&task.task_name(), QrScanStatus::Pending)
            .await?;
        Ok(Some(task))
    }
}

/// Login worker
///
/// Each cycle claims a pending QR handshake, publishes the QR image and
/// waits for the operator's scan to land the session on the home surface.
pub struct LoginWorker {
    ctx: Arc<WorkerContext>,
    people: String,
    interval_secs: u64,
    page_default_timeout_ms: u64,
}

impl LoginWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let config = &ctx.config;
        Self {
            people: config.people.clone(),
            interval_secs: config.login.interval_secs,
            page_default_timeout_ms: config.login.page_default_timeout_ms,
            ctx: ctx.clone(),
        }
    }

    /// Drive one claimed handshake; `Ok(false)` means the scan timed out
    async fn handshake(&self, session: &BrowserSession, task: &QrCodeTask) -> Result<bool> {
        let settings = &self.ctx.config.login;

        session.goto(&settings.signin_url).await?;
        let qr_element = session
            .wait_for_element(
                &settings.qrcode_selector,
                Duration::from_millis(self.page_default_timeout_ms),
            )
            .await?;

        // The element first renders a placeholder well below the size of a
        // real code; capture until a real one shows up
        let render_deadline = Instant::now() + QR_RENDER_TIMEOUT;
        loop {
            let png = qr_element
                .screenshot_as_png()
                .await
                .context("Failed to capture the QR code element")?;
            if png.len() > settings.qrcode_min_bytes {
                if let Some(parent) = task.qrcode_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&task.qrcode_path, png).await?;
                info!("QR code written to {}", task.qrcode_path.display());
                break;
            }
            if Instant::now() >= render_deadline {
                bail!("QR code never rendered past the placeholder");
            }
            sleep(Duration::from_millis(250)).await;
        }

        // A successful scan navigates the session to the home surface
        let scan_deadline = Instant::now() + Duration::from_secs(settings.scan_timeout_secs);
        loop {
            if session.current_path().await? == "/" {
                info!("Scan confirmed, persisting session state");
                session.persist_state_to(&task.state_path).await?;
                return Ok(true);
            }
            if Instant::now() >= scan_deadline {
                return Ok(false);
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

impl Configurable for LoginWorker {
    fn config_fields() -> &'static [ConfigField<Self>] {
        const FIELDS: &[ConfigField<LoginWorker>] = &[
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
impl Worker for LoginWorker {
    fn name(&self) -> &'static str {
        "login"
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

    /// Handshakes start from an anonymous session; the worker persists the
    /// resulting state to the task's own state path
    async fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions::anonymous())
    }

    async fn run_once(&mut self, session: &BrowserSession) -> Result<()> {
        let slot = QrSlot::new(self.ctx.store.clone());
        let Some(task) = slot.claim().await? else {
            debug!("No login task pending");
            return Ok(());
        };
        info!("Claimed login task {}", task.task_name());

        match self.handshake(session, &task).await {
            Ok(true) => {
                slot.set_status(&task.task_name(), QrScanStatus::Ok).await?;
                info!("Login task {} completed", task.task_name());
                Ok(())
            }
            Ok(false) => {
                slot.set_status(&task.task_name(), QrScanStatus::Failed)
                    .await?;
                warn!("Login task {} timed out waiting for a scan", task.task_name());
                Ok(())
            }
            Err(e) => {
                if let Err(set_err) = slot
                    .set_status(&task.task_name(), QrScanStatus::Failed)
                    .await
                {
                    warn!("Could not mark login task failed: {:#}", set_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    fn slot() -> QrSlot {
        QrSlot::new(Arc::new(MemoryStore::new()))
    }

    fn task(prefix: &str) -> QrCodeTask {
        QrCodeTask::new(
            PathBuf::from(format!("states/{prefix}.qrcode.png")),
            PathBuf::from(format!("states/{prefix}.state.json")),
        )
    }

    #[tokio::test]
    async fn unknown_task_status_is_not_exist() {
        let slot = slot();
        assert_eq!(
            slot.status("states/nope.state.json").await.unwrap(),
            QrScanStatus::NotExist
        );
    }

    #[tokio::test]
    async fn claim_takes_a_fresh_task_exactly_once() {
        let slot = slot();
        let task = task("abc");
        slot.create_task(&task).await.unwrap();

        let claimed = slot.claim().await.unwrap();
        assert_eq!(claimed, Some(task.clone()));
        assert_eq!(
            slot.status(&task.task_name()).await.unwrap(),
            QrScanStatus::Pending
        );

        // Already pending: nothing left to claim
        assert_eq!(slot.claim().await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_advances_and_never_regresses() {
        let slot = slot();
        let task = task("xyz");
        slot.create_task(&task).await.unwrap();
        let name = task.task_name();

        slot.set_status(&name, QrScanStatus::Pending).await.unwrap();
        slot.set_status(&name, QrScanStatus::Ok).await.unwrap();

        assert!(slot.set_status(&name, QrScanStatus::Pending).await.is_err());
        assert!(slot.set_status(&name, QrScanStatus::Failed).await.is_err());
        assert_eq!(slot.status(&name).await.unwrap(), QrScanStatus::Ok);
    }

    #[tokio::test]
    async fn pending_to_failed_is_terminal_too() {
        let slot = slot();
        let task = task("fail");
        slot.create_task(&task).await.unwrap();
        let name = task.task_name();

        slot.set_status(&name, QrScanStatus::Pending).await.unwrap();
        slot.set_status(&name, QrScanStatus::Failed).await.unwrap();
        assert!(slot.set_status(&name, QrScanStatus::Ok).await.is_err());
    }

    #[tokio::test]
    async fn a_new_task_displaces_the_previous_one() {
        let slot = slot();
        slot.create_task(&task("old")).await.unwrap();
        slot.create_task(&task("new")).await.unwrap();

        let pending = slot.pending_task().await.unwrap().unwrap();
        assert_eq!(pending, task("new"));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            QrScanStatus::NotExist,
            QrScanStatus::Pending,
            QrScanStatus::Ok,
            QrScanStatus::Failed,
        ] {
            assert_eq!(QrScanStatus::from_str(status.as_str()), status);
        }
    }
}
