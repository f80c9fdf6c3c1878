//! Single-worker background task runner with a polled status table.
//!
//! Jobs run one at a time, in submission order, on a dedicated worker thread.
//! Callers observe them only through [`TaskSnapshot`]s. Once a task reaches a
//! terminal state (completed, failed, canceled) that state never changes, so a
//! job finishing after its timeout cannot resurrect it.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::progress::{ProgressUpdate, RenderStage};

pub type TaskId = String;

type Job = Box<dyn FnOnce(&TaskContext) -> Result<Value> + Send + 'static>;
type TaskTable = Arc<Mutex<HashMap<TaskId, TaskRecord>>>;

const MSG_STARTING: &str = "İşlem başlatılıyor...";
const MSG_RUNNING: &str = "İşlem çalışıyor...";
const MSG_COMPLETED: &str = "İşlem başarıyla tamamlandı.";
const MSG_TIMEOUT: &str = "Zaman aşımı hatası!";
const MSG_CANCELED: &str = "İşlem iptal edildi.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    Running,
    Preparing,
    ProcessingImages,
    GeneratingVideo,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Preparing => "preparing",
            Self::ProcessingImages => "processing_images",
            Self::GeneratingVideo => "generating_video",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Label shown next to the progress bar.
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "Başlatılıyor",
            Self::Running => "Çalışıyor",
            Self::Preparing => "Hazırlanıyor",
            Self::ProcessingImages => "Görüntüler İşleniyor",
            Self::GeneratingVideo => "Video Oluşturuluyor",
            Self::Completed => "Tamamlandı",
            Self::Failed => "Başarısız",
            Self::Canceled => "İptal Edildi",
        }
    }
}

impl From<RenderStage> for TaskStatus {
    fn from(stage: RenderStage) -> Self {
        match stage {
            RenderStage::Preparing => Self::Preparing,
            RenderStage::ProcessingImages => Self::ProcessingImages,
            RenderStage::GeneratingVideo | RenderStage::Done => Self::GeneratingVideo,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Percent in `0..=100`; only a completed task reports 100.
    pub progress: u8,
    pub message: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct TaskRecord {
    snapshot: TaskSnapshot,
    cancel: Arc<AtomicBool>,
}

impl TaskRecord {
    fn finish(&mut self, status: TaskStatus, message: impl Into<String>) {
        self.snapshot.status = status;
        self.snapshot.message = message.into();
        self.snapshot.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, message: impl Into<String>, error: String, details: String) {
        self.snapshot.error = Some(error);
        self.snapshot.error_details = Some(details);
        self.finish(TaskStatus::Failed, message);
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRunnerConfig {
    /// Applied to submissions that do not carry their own timeout.
    pub default_timeout: Option<Duration>,
}

/// Handle given to a running job for progress reporting and cooperative
/// cancellation.
pub struct TaskContext {
    id: TaskId,
    table: TaskTable,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once the task was canceled or timed out; the job should stop.
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn report(&self, status: TaskStatus, progress: u8, message: impl Into<String>) {
        let mut table = lock_table(&self.table);
        let Some(record) = table.get_mut(&self.id) else {
            return;
        };
        if record.snapshot.status.is_terminal() || status.is_terminal() {
            return;
        }
        record.snapshot.status = status;
        record.snapshot.progress = progress.min(99);
        record.snapshot.message = message.into();
    }

    pub fn report_progress(&self, update: &ProgressUpdate) {
        let percent = (update.fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        self.report(update.stage.into(), percent, update.message.clone());
    }
}

struct Queued {
    id: TaskId,
    timeout: Option<Duration>,
    job: Job,
}

pub struct TaskRunner {
    table: TaskTable,
    config: TaskRunnerConfig,
    sender: Option<mpsc::Sender<Queued>>,
    worker: Option<JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(config: TaskRunnerConfig) -> Result<Self> {
        let table: TaskTable = Arc::new(Mutex::new(HashMap::new()));
        let (sender, receiver) = mpsc::channel::<Queued>();
        let worker_table = Arc::clone(&table);
        let worker = thread::Builder::new()
            .name("property-reel-task-worker".to_owned())
            .spawn(move || worker_loop(worker_table, receiver))
            .context("failed to spawn task worker thread")?;

        Ok(Self {
            table,
            config,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Registers a task in `starting` state and queues it behind any earlier
    /// submission.
    pub fn submit<F>(&self, name: &str, timeout: Option<Duration>, job: F) -> Result<TaskId>
    where
        F: FnOnce(&TaskContext) -> Result<Value> + Send + 'static,
    {
        let id = format!("{name}-{}", Uuid::new_v4());
        let cancel = Arc::new(AtomicBool::new(false));
        let snapshot = TaskSnapshot {
            id: id.clone(),
            name: name.to_owned(),
            status: TaskStatus::Starting,
            progress: 0,
            message: MSG_STARTING.to_owned(),
            result: None,
            error: None,
            error_details: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        lock_table(&self.table).insert(id.clone(), TaskRecord { snapshot, cancel });

        let queued = Queued {
            id: id.clone(),
            timeout: timeout.or(self.config.default_timeout),
            job: Box::new(job),
        };
        let sent = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("task runner is shutting down"))
            .and_then(|sender| {
                sender
                    .send(queued)
                    .map_err(|_| anyhow!("task worker is no longer running"))
            });
        if let Err(error) = sent {
            lock_table(&self.table).remove(&id);
            return Err(error);
        }

        info!(task = %id, "task submitted");
        Ok(id)
    }

    pub fn status(&self, id: &str) -> Option<TaskSnapshot> {
        lock_table(&self.table)
            .get(id)
            .map(|record| record.snapshot.clone())
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = lock_table(&self.table)
            .values()
            .map(|record| record.snapshot.clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Cancels a task that has not reached a terminal state. Queued tasks never
    /// start; running jobs see [`TaskContext::is_canceled`] turn true.
    pub fn cancel(&self, id: &str) -> bool {
        let mut table = lock_table(&self.table);
        let Some(record) = table.get_mut(id) else {
            return false;
        };
        if record.snapshot.status.is_terminal() {
            return false;
        }
        record.cancel.store(true, Ordering::SeqCst);
        record.snapshot.error = Some("İşlem kullanıcı tarafından iptal edildi".to_owned());
        record.finish(TaskStatus::Canceled, MSG_CANCELED);
        info!(task = %id, "task canceled");
        true
    }

    /// Drops terminal records that finished more than `max_age` ago.
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut table = lock_table(&self.table);
        let before = table.len();
        table.retain(|_, record| match record.snapshot.finished_at {
            Some(finished) if record.snapshot.status.is_terminal() => now - finished <= max_age,
            _ => true,
        });
        let removed = before - table.len();
        if removed > 0 {
            debug!(removed, "finished tasks cleaned up");
        }
        removed
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("task worker thread panicked");
            }
        }
    }
}

fn lock_table(table: &TaskTable) -> MutexGuard<'_, HashMap<TaskId, TaskRecord>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn worker_loop(table: TaskTable, receiver: mpsc::Receiver<Queued>) {
    while let Ok(queued) = receiver.recv() {
        let cancel = {
            let mut guard = lock_table(&table);
            let Some(record) = guard.get_mut(&queued.id) else {
                continue;
            };
            if record.snapshot.status.is_terminal() {
                debug!(task = %queued.id, "skipping task finished before it started");
                continue;
            }
            record.snapshot.status = TaskStatus::Running;
            record.snapshot.message = MSG_RUNNING.to_owned();
            record.snapshot.started_at = Some(Utc::now());
            Arc::clone(&record.cancel)
        };

        let context = TaskContext {
            id: queued.id.clone(),
            table: Arc::clone(&table),
            cancel,
        };
        let watchdog = queued
            .timeout
            .map(|timeout| spawn_watchdog(&table, &context, timeout));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (queued.job)(&context)));

        if let Some((done, handle)) = watchdog {
            drop(done);
            if handle.join().is_err() {
                error!(task = %queued.id, "watchdog thread panicked");
            }
        }

        let mut guard = lock_table(&table);
        let Some(record) = guard.get_mut(&queued.id) else {
            continue;
        };
        if record.snapshot.status.is_terminal() {
            debug!(task = %queued.id, status = record.snapshot.status.keyword(), "ignoring late job result");
            continue;
        }
        match outcome {
            Ok(Ok(value)) => {
                record.snapshot.result = Some(value);
                record.snapshot.progress = 100;
                record.finish(TaskStatus::Completed, MSG_COMPLETED);
                info!(task = %queued.id, "task completed");
            }
            Ok(Err(job_error)) => {
                warn!(task = %queued.id, error = %format!("{job_error:#}"), "task failed");
                record.fail(
                    format!("Hata: {job_error}"),
                    job_error.to_string(),
                    format!("{job_error:?}"),
                );
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = %queued.id, panic = %message, "task panicked");
                record.fail(
                    format!("Hata: {message}"),
                    message.clone(),
                    format!("job panicked: {message}"),
                );
            }
        }
    }
}

/// Marks the task failed if it is still running when `timeout` elapses. The
/// returned sender is dropped when the job returns, which wakes and ends the
/// watchdog early.
fn spawn_watchdog(
    table: &TaskTable,
    context: &TaskContext,
    timeout: Duration,
) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (done, finished) = mpsc::channel::<()>();
    let table = Arc::clone(table);
    let cancel = Arc::clone(&context.cancel);
    let id = context.id.clone();

    let handle = thread::spawn(move || {
        if finished.recv_timeout(timeout) != Err(RecvTimeoutError::Timeout) {
            return;
        }
        let mut guard = lock_table(&table);
        let Some(record) = guard.get_mut(&id) else {
            return;
        };
        if record.snapshot.status.is_terminal() {
            return;
        }
        cancel.store(true, Ordering::SeqCst);
        record.fail(
            MSG_TIMEOUT,
            "İşlem zaman aşımına uğradı".to_owned(),
            format!("timed out after {:.1}s", timeout.as_secs_f64()),
        );
        warn!(task = %id, timeout_secs = timeout.as_secs_f64(), "task timed out");
    });
    (done, handle)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
