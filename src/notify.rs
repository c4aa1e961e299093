//! Notification dispatcher: a bounded queue drained by one background worker.
//!
//! Callers never wait on mail delivery. `enqueue` either places the job or rejects it
//! immediately. The worker delivers jobs in FIFO order with bounded retries.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::mail::{MailTransport, OutgoingMessage};

const BODY_PLACEHOLDER: &str = "[%body%]";

/// One outbound message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationJob {
    pub id: Ulid,
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    /// File name under the template directory; its `[%body%]` receives `body`.
    pub template: Option<String>,
}

impl NotificationJob {
    pub fn new(
        to: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            to: to.into(),
            from: from.into(),
            subject: subject.into(),
            body: body.into(),
            template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    /// Wait before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    pub send_timeout: Duration,
    pub template_dir: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
            template_dir: PathBuf::from("./email-templates"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull => write!(f, "notification queue is full"),
            EnqueueError::Closed => write!(f, "notification queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Jobs handled by the worker over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub dropped: u64,
}

enum MailCommand {
    Send(NotificationJob),
    /// Closes the queue; answered once every job still in it is handled. The worker then exits.
    Drain {
        response: oneshot::Sender<DispatchStats>,
    },
}

/// Handle to the dispatcher. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Mailer {
    tx: mpsc::Sender<MailCommand>,
    closed: Arc<AtomicBool>,
}

impl Mailer {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(transport: Arc<dyn MailTransport>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        info!(
            transport = transport.name(),
            capacity = config.capacity,
            max_attempts = config.max_attempts,
            "notification dispatcher started"
        );
        tokio::spawn(worker_loop(transport, config, rx));
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a job without waiting. A full or closed queue rejects it.
    pub fn enqueue(&self, job: NotificationJob) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.reject(&job, EnqueueError::Closed));
        }
        let id = job.id;
        match self.tx.try_send(MailCommand::Send(job)) {
            Ok(()) => {
                debug!(job_id = %id, "notification queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(MailCommand::Send(job))) => {
                Err(self.reject(&job, EnqueueError::QueueFull))
            }
            Err(mpsc::error::TrySendError::Closed(MailCommand::Send(job))) => {
                Err(self.reject(&job, EnqueueError::Closed))
            }
            Err(_) => Err(EnqueueError::Closed),
        }
    }

    fn reject(&self, job: &NotificationJob, reason: EnqueueError) -> EnqueueError {
        metrics::counter!(crate::observability::NOTIFY_QUEUE_REJECTED_TOTAL).increment(1);
        warn!(job_id = %job.id, to = %job.to, subject = %job.subject, "notification rejected: {reason}");
        reason
    }

    /// Close the queue and wait until every job already in it has been handled.
    pub async fn drain(&self) -> DispatchStats {
        self.closed.store(true, Ordering::SeqCst);
        let (response, rx) = oneshot::channel();
        if self.tx.send(MailCommand::Drain { response }).await.is_err() {
            return DispatchStats::default();
        }
        let stats = rx.await.unwrap_or_default();
        info!(
            delivered = stats.delivered,
            dropped = stats.dropped,
            "notification queue drained"
        );
        stats
    }
}

async fn worker_loop(
    transport: Arc<dyn MailTransport>,
    config: DispatcherConfig,
    mut rx: mpsc::Receiver<MailCommand>,
) {
    let mut stats = DispatchStats::default();
    let mut waiting = Vec::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            MailCommand::Send(job) => {
                if deliver(transport.as_ref(), &config, &job).await {
                    stats.delivered += 1;
                } else {
                    stats.dropped += 1;
                }
            }
            MailCommand::Drain { response } => {
                // A job can be accepted just before the closed flag is seen and land
                // behind this command. Stop intake and keep going until the queue is empty.
                rx.close();
                waiting.push(response);
            }
        }
    }
    for response in waiting {
        let _ = response.send(stats);
    }
}

/// Fill the job's template, or fall back to the bare body if it cannot be read.
async fn compose(config: &DispatcherConfig, job: &NotificationJob) -> OutgoingMessage {
    let body = match &job.template {
        None => job.body.clone(),
        Some(name) => match load_template(config, name).await {
            Ok(template) => template.replacen(BODY_PLACEHOLDER, &job.body, 1),
            Err(e) => {
                warn!(job_id = %job.id, template = %name, "template unavailable, sending bare body: {e}");
                job.body.clone()
            }
        },
    };
    OutgoingMessage {
        from: job.from.clone(),
        to: job.to.clone(),
        subject: job.subject.clone(),
        body,
    }
}

async fn load_template(config: &DispatcherConfig, name: &str) -> std::io::Result<String> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "template name must be a plain file name",
        ));
    }
    tokio::fs::read_to_string(config.template_dir.join(name)).await
}

/// Try a job up to `max_attempts` times. Returns whether it was delivered.
async fn deliver(transport: &dyn MailTransport, config: &DispatcherConfig, job: &NotificationJob) -> bool {
    let message = compose(config, job).await;
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(config.send_timeout, transport.send(&message)).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "delivered")
                    .increment(1);
                info!(job_id = %job.id, to = %job.to, subject = %job.subject, attempt, "notification delivered");
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", config.send_timeout.as_millis()),
        };
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "failed_attempt")
            .increment(1);
        warn!(job_id = %job.id, attempt, max_attempts = attempts, "notification attempt failed: {failure}");
        if attempt < attempts {
            tokio::time::sleep(config.retry_backoff * attempt).await;
        }
    }
    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "dropped").increment(1);
    error!(job_id = %job.id, to = %job.to, subject = %job.subject, "notification dropped");
    false
}
