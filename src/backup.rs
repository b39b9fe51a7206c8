use crate::config::Config;
use crate::engine::{CopyStatus, CopyStrategy, LineTail, ProgressSource, DIAGNOSTIC_LINES};
use crate::error::BackupError;
use crate::monitor::{
    follow_output, poll_destination, PollSettings, ProgressEvent, ProgressReporter,
};
use crate::naming::{allocate, BackupPlan, ConfirmOverwrite, NamingMode};
use crate::preferences::Preferences;
use crate::signal::{BackupContext, RunGuard, RunSlot};
use crate::utils::{
    estimate_size_until, format_size, validate_destination_root, validate_source,
};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;

/// How long a terminated tool gets to exit before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// One backup invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub source: PathBuf,
    pub destination_root: PathBuf,
    pub naming: NamingMode,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub folder_name: String,
    pub destination: PathBuf,
    pub bytes_estimated: Option<u64>,
    pub status: CopyStatus,
    pub duration: Duration,
}

impl BackupReport {
    pub fn summary(&self) -> String {
        let mut summary = format!("Backup successful! Folder saved as: {}", self.folder_name);
        if let Some(bytes) = self.bytes_estimated {
            summary.push_str(&format!(" ({})", format_size(bytes)));
        }
        if let CopyStatus::WithWarnings(code) = self.status {
            summary.push_str(&format!(
                "\nThe copy tool reported warnings (exit code {code})"
            ));
        }
        summary
    }
}

#[derive(Debug)]
pub enum BackupOutcome {
    Succeeded(BackupReport),
    Failed(BackupError),
    Cancelled,
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Succeeded(_))
    }
}

/// A backup in flight: its progress stream and, eventually, its outcome
pub struct BackupRun {
    events: mpsc::Receiver<ProgressEvent>,
    outcome: JoinHandle<BackupOutcome>,
    context: BackupContext,
}

impl BackupRun {
    /// Next progress event; `None` once the run has stopped reporting
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    pub fn context(&self) -> BackupContext {
        self.context.clone()
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// Wait for the terminal outcome, discarding unread progress
    pub async fn finish(mut self) -> BackupOutcome {
        self.events.close();
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(e) => BackupOutcome::Failed(BackupError::worker(format!(
                "Backup worker stopped unexpectedly: {e}"
            ))),
        }
    }
}

/// Runs backups one at a time on a worker task
pub struct Orchestrator {
    config: Arc<Config>,
    strategy: Option<CopyStrategy>,
    confirm: Arc<dyn ConfirmOverwrite>,
    preferences: Mutex<Preferences>,
    preferences_path: Option<PathBuf>,
    slot: RunSlot,
    current: Mutex<Option<BackupContext>>,
}

impl Orchestrator {
    pub fn new(config: Config, confirm: Arc<dyn ConfirmOverwrite>) -> Self {
        Self {
            config: Arc::new(config),
            strategy: None,
            confirm,
            preferences: Mutex::new(Preferences::default()),
            preferences_path: None,
            slot: RunSlot::new(),
            current: Mutex::new(None),
        }
    }

    /// Use a fixed strategy instead of detecting one from the platform
    pub fn with_strategy(mut self, strategy: CopyStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Load the naming preference from `path` and persist changes back to it
    pub fn with_preferences_file(mut self, path: PathBuf) -> Self {
        self.preferences = Mutex::new(Preferences::load_from(&path));
        self.preferences_path = Some(path);
        self
    }

    pub fn get_use_auto_naming(&self) -> bool {
        self.preferences
            .lock()
            .map(|prefs| prefs.use_auto_naming())
            .unwrap_or(true)
    }

    pub fn set_use_auto_naming(&self, enabled: bool) -> Result<()> {
        let snapshot = {
            let mut prefs = self
                .preferences
                .lock()
                .map_err(|_| BackupError::config("Preferences lock poisoned"))?;
            prefs.set_use_auto_naming(enabled);
            *prefs
        };

        if let Some(path) = &self.preferences_path {
            snapshot.save_to(path)?;
        }
        Ok(())
    }

    /// Naming mode implied by the preference, using `custom_name` when auto naming is off
    pub fn naming_mode(&self, custom_name: &str) -> NamingMode {
        if self.get_use_auto_naming() {
            NamingMode::Auto
        } else {
            NamingMode::Custom(custom_name.to_string())
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_busy()
    }

    /// Cancel the run in flight, if any
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(context) = current.as_ref() {
                info!("Cancellation requested");
                context.cancel();
            }
        }
    }

    /// Start a backup on a worker task. Must be called within a Tokio runtime.
    pub fn start_backup(&self, request: BackupRequest) -> Result<BackupRun> {
        if request.source.as_os_str().is_empty() || request.destination_root.as_os_str().is_empty()
        {
            return Err(BackupError::MissingPath);
        }

        let guard = self.slot.try_acquire().ok_or(BackupError::Busy)?;

        let context = BackupContext::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(context.clone());
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let worker = Worker {
            request,
            config: self.config.clone(),
            strategy: self.strategy,
            confirm: self.confirm.clone(),
            context: context.clone(),
        };

        let outcome = tokio::spawn(worker.run(guard, ProgressReporter::new(tx)));

        Ok(BackupRun {
            events: rx,
            outcome,
            context,
        })
    }
}

struct Worker {
    request: BackupRequest,
    config: Arc<Config>,
    strategy: Option<CopyStrategy>,
    confirm: Arc<dyn ConfirmOverwrite>,
    context: BackupContext,
}

impl Worker {
    async fn run(self, _guard: RunGuard, mut reporter: ProgressReporter) -> BackupOutcome {
        let started = Instant::now();
        info!(
            "Backing up {} into {}",
            self.request.source.display(),
            self.request.destination_root.display()
        );

        let outcome = match self.execute(&mut reporter, started).await {
            Ok(report) => BackupOutcome::Succeeded(report),
            Err(BackupError::Cancelled) => BackupOutcome::Cancelled,
            Err(e) => BackupOutcome::Failed(e),
        };

        match &outcome {
            BackupOutcome::Succeeded(report) => info!(
                "Backup {} finished in {:.2}s",
                report.folder_name,
                report.duration.as_secs_f64()
            ),
            BackupOutcome::Failed(e) => error!("Backup failed: {}", e),
            BackupOutcome::Cancelled => info!("Backup cancelled"),
        }
        outcome
    }

    async fn execute(
        &self,
        reporter: &mut ProgressReporter,
        started: Instant,
    ) -> Result<BackupReport> {
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => CopyStrategy::detect()?,
        };
        debug!("Using {:?} strategy", strategy);

        let plan = self.plan().await?;
        self.check_cancelled()?;

        let bytes_estimated = match strategy.progress_source() {
            ProgressSource::PollDestination => {
                reporter.estimating().await;
                Some(self.estimate().await?)
            }
            ProgressSource::ParseOutput => None,
        };

        let status = self
            .copy(strategy, &plan, bytes_estimated.unwrap_or(0), reporter)
            .await?;

        reporter.complete().await;

        Ok(BackupReport {
            folder_name: plan.folder_name,
            destination: plan.destination,
            bytes_estimated,
            status,
            duration: started.elapsed(),
        })
    }

    async fn plan(&self) -> Result<BackupPlan> {
        let request = self.request.clone();
        let confirm = self.confirm.clone();

        let plan = tokio::task::spawn_blocking(move || -> Result<BackupPlan> {
            validate_source(&request.source)?;
            validate_destination_root(&request.destination_root)?;
            allocate(&request.destination_root, &request.naming, confirm.as_ref())
        })
        .await
        .map_err(|e| BackupError::worker(format!("Planning task failed: {e}")))??;

        info!("Backup folder: {}", plan.destination.display());
        Ok(plan)
    }

    async fn estimate(&self) -> Result<u64> {
        let source = self.request.source.clone();
        let flag = self.context.cancel_flag();

        let total = tokio::task::spawn_blocking(move || estimate_size_until(&source, &flag))
            .await
            .map_err(|e| BackupError::worker(format!("Size estimation failed: {e}")))?
            .ok_or(BackupError::Cancelled)?;

        debug!("Source size estimate: {}", format_size(total));
        Ok(total)
    }

    async fn copy(
        &self,
        strategy: CopyStrategy,
        plan: &BackupPlan,
        total_bytes: u64,
        reporter: &mut ProgressReporter,
    ) -> Result<CopyStatus> {
        let mut handle = strategy.spawn(&self.request.source, &plan.destination, &self.config)?;
        let output = handle.take_output();
        let stop = Arc::new(AtomicBool::new(false));

        // The monitor owns a reporter while the tool runs and hands it back when joined
        let mut task_reporter = reporter.clone();

        let monitor: JoinHandle<(ProgressReporter, Vec<String>)> =
            match strategy.progress_source() {
                ProgressSource::ParseOutput => tokio::spawn(async move {
                    let lines = match output {
                        Some(lines) => follow_output(lines, &mut task_reporter).await,
                        None => Vec::new(),
                    };
                    (task_reporter, lines)
                }),
                ProgressSource::PollDestination => {
                    let settings = PollSettings {
                        destination: plan.destination.clone(),
                        total_bytes,
                        interval: self.config.poll_interval(),
                    };
                    let context = self.context.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        let drain = tokio::spawn(async move {
                            let mut tail = LineTail::new(DIAGNOSTIC_LINES);
                            if let Some(mut lines) = output {
                                while let Ok(Some(line)) = lines.next_line().await {
                                    tail.push(line);
                                }
                            }
                            tail.into_lines()
                        });
                        poll_destination(settings, context, stop, &mut task_reporter).await;
                        (task_reporter, drain.await.unwrap_or_default())
                    })
                }
            };

        let interval = self.config.poll_interval();
        let exit = tokio::select! {
            status = handle.wait() => Some(status),
            _ = self.context.cancelled(interval) => None,
        };

        let status = match exit {
            Some(status) => status?,
            None => {
                handle.terminate();
                monitor.abort();
                match tokio::time::timeout(TERMINATE_GRACE, handle.wait()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Could not reap {}: {}", handle.tool(), e),
                    Err(_) => {
                        warn!("{} ignored the terminate request", handle.tool());
                        handle.kill();
                        if let Err(e) = handle.wait().await {
                            warn!("Could not reap {}: {}", handle.tool(), e);
                        }
                    }
                }
                return Err(BackupError::Cancelled);
            }
        };

        stop.store(true, Ordering::SeqCst);
        let stdout_lines = match monitor.await {
            Ok((task_reporter, lines)) => {
                *reporter = task_reporter;
                lines
            }
            Err(e) => {
                warn!("Progress monitor stopped abnormally: {}", e);
                Vec::new()
            }
        };

        let stderr_lines = handle.stderr_lines().await;

        if self.context.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        // Killed by a signal: no exit code
        let exit_code = status.code().unwrap_or(-1);
        match strategy.classify(exit_code) {
            Some(copy_status) => Ok(copy_status),
            None => {
                let mut diagnostic = Vec::new();
                if strategy.progress_source() == ProgressSource::PollDestination {
                    diagnostic.extend(stdout_lines);
                }
                diagnostic.extend(stderr_lines);
                Err(BackupError::CopyToolFailure {
                    tool: handle.tool().to_string(),
                    exit_code,
                    diagnostic: diagnostic.join("\n"),
                })
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.context.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run a backup to completion, ignoring progress
pub async fn run_backup(orchestrator: &Orchestrator, request: BackupRequest) -> BackupOutcome {
    match orchestrator.start_backup(request) {
        Ok(run) => run.finish().await,
        Err(e) => BackupOutcome::Failed(e),
    }
}

/// Confirmation policy that never replaces an existing folder
pub fn never_overwrite() -> Arc<dyn ConfirmOverwrite> {
    Arc::new(|_: &str, _: &Path| false)
}

/// Confirmation policy that always replaces an existing folder
pub fn always_overwrite() -> Arc<dyn ConfirmOverwrite> {
    Arc::new(|_: &str, _: &Path| true)
}
