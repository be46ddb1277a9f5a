pub mod activity;
pub mod archiver;
pub mod config;
pub mod login;
pub mod monitor;

// Re-export common types
pub use archiver::Archiver;
pub use config::{ConfigField, ConfigSynchronizer, Configurable};
pub use login::LoginWorker;
pub use monitor::Monitor;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::browser::{AbnormalError, BrowserSession, SessionOptions, UrlPatternDetector};
use crate::cli::config::ArchiveConfig;
use crate::storage::queue::TaskQueue;
use crate::storage::store::KeyValueStore;

/// Store key namespace shared by every process
pub const KEY_PREFIX: &str = "zhi_archive:archive";

/// Default session-state artifact filename
pub const DEFAULT_STATE_FILE: &str = "zhihu.state.json";

pub fn pause_key(name: &str) -> String {
    format!("{KEY_PREFIX}:{name}:pause")
}

pub fn status_key(name: &str) -> String {
    format!("{KEY_PREFIX}:{name}:status")
}

pub fn configs_key(name: &str) -> String {
    format!("{KEY_PREFIX}:{name}:configs")
}

pub fn state_path_key() -> String {
    format!("{KEY_PREFIX}:state_path")
}

pub fn tasks_key() -> String {
    format!("{KEY_PREFIX}:tasks")
}

pub fn qr_task_key() -> String {
    format!("{KEY_PREFIX}:login:qrcode_task")
}

pub fn qr_status_key() -> String {
    format!("{KEY_PREFIX}:login:qrcode_task_status")
}

/// Observational worker state, overwritten around each unit-of-work
///
/// Never gates behavior; the control surface reads it for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Running,
    Waiting,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            _ => Self::Waiting,
        }
    }
}

/// Shared handles a worker needs besides its own fields
pub struct WorkerContext {
    pub store: Arc<dyn KeyValueStore>,
    pub config: ArchiveConfig,
}

impl WorkerContext {
    pub fn new(store: Arc<dyn KeyValueStore>, config: ArchiveConfig) -> Arc<Self> {
        Arc::new(Self { store, config })
    }

    /// Whether the worker may start a new unit-of-work
    ///
    /// An absent flag counts as paused: workers come up idle until resumed
    /// once through the control surface.
    pub async fn need_pause(&self, name: &str) -> Result<bool> {
        let value = self.store.get(&pause_key(name)).await?;
        Ok(value.map(|v| v != "0").unwrap_or(true))
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.store.set(&pause_key(name), "1").await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.store.set(&pause_key(name), "0").await
    }

    pub async fn get_status(&self, name: &str) -> Result<WorkStatus> {
        let value = self.store.get(&status_key(name)).await?;
        Ok(value
            .map(|v| WorkStatus::from_str(&v))
            .unwrap_or(WorkStatus::Waiting))
    }

    pub async fn set_status(&self, name: &str, status: WorkStatus) -> Result<()> {
        self.store.set(&status_key(name), status.as_str()).await
    }

    /// Active session-state artifact: the store override, else the default
    pub async fn state_path(&self) -> Result<PathBuf> {
        let value = self.store.get(&state_path_key()).await?;
        Ok(value
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.states_dir.join(DEFAULT_STATE_FILE)))
    }

    pub async fn set_state_path(&self, path: &str) -> Result<()> {
        self.store.set(&state_path_key(), path).await
    }

    /// The global batch queue between monitor and archiver
    pub fn task_queue(&self) -> TaskQueue {
        TaskQueue::new(self.store.clone(), tasks_key())
    }

    /// Per-user result root (`results/{people}`)
    pub fn people_dir(&self, people: &str) -> PathBuf {
        self.config.results_dir.join(people)
    }

    /// Where batches and per-item screenshots land
    pub fn activities_dir(&self, people: &str) -> PathBuf {
        self.people_dir(people).join("activities")
    }

    /// Date-partitioned archive snapshots
    pub fn archive_dir(&self, people: &str) -> PathBuf {
        self.people_dir(people).join("archive")
    }
}

/// One worker's specialization of the supervised run loop
#[async_trait]
pub trait Worker: Configurable + Send {
    /// Worker identity used in store keys and logs
    fn name(&self) -> &'static str;

    /// The archived user handle (current, possibly updated via configs)
    fn people(&self) -> &str;

    fn context(&self) -> Arc<WorkerContext>;

    /// Sleep between cycles
    fn interval(&self) -> Duration;

    /// How this worker's browser session is acquired each cycle
    async fn session_options(&self) -> Result<SessionOptions> {
        let state_path = self.context().state_path().await?;
        info!("Currently used state path: {}", state_path.display());
        Ok(SessionOptions::with_state(state_path))
    }

    /// The worker-specific unit-of-work, executed once per cycle
    async fn run_once(&mut self, session: &BrowserSession) -> Result<()>;
}

/// The generic supervised loop every worker runs
///
/// Never returns under normal operation. A unit-of-work failure is logged
/// and the loop continues; an [`AbnormalError`] additionally self-pauses
/// the worker until an operator clears the pause flag. Availability over
/// fail-fast: only external termination stops the process.
pub struct WorkerRuntime<W: Worker> {
    worker: W,
    synchronizer: ConfigSynchronizer,
    detector: Arc<UrlPatternDetector>,
}

impl<W: Worker + Sync + 'static> WorkerRuntime<W> {
    pub fn new(worker: W) -> Self {
        let ctx = worker.context();
        let synchronizer =
            ConfigSynchronizer::new(ctx.store.clone(), configs_key(worker.name()));
        let detector = Arc::new(UrlPatternDetector::new(
            &ctx.config.browser.abnormal_url_patterns,
        ));

        Self {
            worker,
            synchronizer,
            detector,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let name = self.worker.name();
        info!("{} started.", name);

        if let Err(e) = self.synchronizer.load(&mut self.worker).await {
            warn!("{}: initial config load failed: {:#}", name, e);
        }

        loop {
            // Pause gate: poll every second, no unit-of-work while paused
            if self.paused().await {
                info!("{} pausing", name);
                while self.paused().await {
                    sleep(Duration::from_secs(1)).await;
                }
                info!("{} resumed", name);
            }

            debug!("{}: New loop", name);
            if let Err(e) = self.cycle().await {
                if e.downcast_ref::<AbnormalError>().is_some() {
                    error!("{}: {}", name, e);
                    info!("{}: self-pausing until resumed by an operator", name);
                    if let Err(e) = self.worker.context().pause(name).await {
                        error!("{}: failed to set pause flag: {:#}", name, e);
                    }
                } else {
                    // Treated as transient: log with context, next cycle
                    error!("{}: cycle failed: {:#}", name, e);
                }
            }

            sleep(self.worker.interval()).await;
        }
    }

    async fn paused(&self) -> bool {
        let ctx = self.worker.context();
        ctx.need_pause(self.worker.name()).await.unwrap_or(true)
    }

    /// One full iteration: config load, status, scoped session, work, re-sync
    async fn cycle(&mut self) -> Result<()> {
        let name = self.worker.name();
        let ctx = self.worker.context();

        self.synchronizer.load(&mut self.worker).await?;

        ctx.set_status(name, WorkStatus::Running).await?;
        let result = self.unit_of_work().await;
        ctx.set_status(name, WorkStatus::Waiting).await?;

        // After-run hook: converge the store with whatever the cycle changed
        self.synchronizer.sync_from(&self.worker).await?;

        result
    }

    /// Acquire a scoped browser session and run the worker's work in it
    ///
    /// Teardown (including persisting session state) runs on every exit
    /// path, success or failure.
    async fn unit_of_work(&mut self) -> Result<()> {
        let ctx = self.worker.context();
        let options = self.worker.session_options().await?;
        let diagnostics_dir = ctx.people_dir(self.worker.people());

        let session = BrowserSession::launch(
            &ctx.config.browser,
            self.detector.clone(),
            diagnostics_dir,
            options,
        )
        .await?;

        let result = self.worker.run_once(&session).await;

        if let Err(e) = session.close().await {
            warn!("{}: session teardown failed: {:#}", self.worker.name(), e);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    fn test_context() -> Arc<WorkerContext> {
        let mut config = ArchiveConfig::default();
        // Nothing listens here; session launches fail fast in tests
        config.browser.webdriver_url = "http://127.0.0.1:9".to_string();
        WorkerContext::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn absent_pause_flag_counts_as_paused() {
        let ctx = test_context();
        assert!(ctx.need_pause("monitor").await.unwrap());

        ctx.resume("monitor").await.unwrap();
        assert!(!ctx.need_pause("monitor").await.unwrap());

        ctx.pause("monitor").await.unwrap();
        assert!(ctx.need_pause("monitor").await.unwrap());
    }

    #[tokio::test]
    async fn status_defaults_to_waiting() {
        let ctx = test_context();
        assert_eq!(ctx.get_status("monitor").await.unwrap(), WorkStatus::Waiting);

        ctx.set_status("monitor", WorkStatus::Running).await.unwrap();
        assert_eq!(ctx.get_status("monitor").await.unwrap(), WorkStatus::Running);
    }

    #[tokio::test]
    async fn state_path_falls_back_to_default() {
        let ctx = test_context();
        let path = ctx.state_path().await.unwrap();
        assert!(path.ends_with("zhihu.state.json"));

        ctx.set_state_path("/tmp/other.state.json").await.unwrap();
        assert_eq!(
            ctx.state_path().await.unwrap(),
            PathBuf::from("/tmp/other.state.json")
        );
    }

    #[tokio::test]
    async fn key_builders_scope_by_worker_name() {
        assert_eq!(pause_key("monitor"), "zhi_archive:archive:monitor:pause");
        assert_eq!(status_key("archiver"), "zhi_archive:archive:archiver:status");
        assert_eq!(configs_key("login"), "zhi_archive:archive:login:configs");
        assert_eq!(tasks_key(), "zhi_archive:archive:tasks");
    }

    struct IdleWorker {
        ctx: Arc<WorkerContext>,
    }

    impl Configurable for IdleWorker {
        fn config_fields() -> &'static [ConfigField<Self>] {
            const FIELDS: &[ConfigField<IdleWorker>] = &[];
            FIELDS
        }
    }

    #[async_trait]
    impl Worker for IdleWorker {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn people(&self) -> &str {
            "nobody"
        }

        fn context(&self) -> Arc<WorkerContext> {
            self.ctx.clone()
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&mut self, _session: &BrowserSession) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pause_flag_gates_the_cycle() {
        let ctx = test_context();
        let store = ctx.store.clone();
        let runtime = WorkerRuntime::new(IdleWorker { ctx: ctx.clone() });
        tokio::spawn(runtime.run());

        // Default-paused: no cycle starts, so no status is ever written
        sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get(&status_key("idle")).await.unwrap(), None);

        // Clearing the flag lets the next 1-second poll proceed
        ctx.resume("idle").await.unwrap();
        let mut observed = None;
        for _ in 0..30 {
            sleep(Duration::from_millis(100)).await;
            observed = store.get(&status_key("idle")).await.unwrap();
            if observed.is_some() {
                break;
            }
        }
        assert!(observed.is_some(), "cycle never started after resume");
    }
}
