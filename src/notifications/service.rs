use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::clients::ClientRegistry;
use super::models::NotifierConfig;
use super::senders::{ResolveError, ResolvedBackend, SendError, resolve_all};

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DISPATCH_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

#[derive(Debug)]
pub struct BackendFailure {
    pub label: String,
    pub error: SendError,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.error)
    }
}

/// Labels of the backends that accepted the notification.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid notifier {0}")]
    Config(#[from] ResolveError),
    #[error("{} of {total} backends failed: {}", .failures.len(), summarize(.failures))]
    Send {
        total: usize,
        failures: Vec<BackendFailure>,
        delivered: Vec<String>,
    },
    #[error("deadline exceeded with {} backends pending", .pending.len())]
    DeadlineExceeded {
        pending: Vec<String>,
        failures: Vec<BackendFailure>,
        delivered: Vec<String>,
    },
}

fn summarize(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fans one notification out to every configured backend.
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>, options: DispatchOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Resolves every config before any I/O, then sends to all of them.
    pub async fn dispatch(
        &self,
        title: &str,
        body: &str,
        configs: &[NotifierConfig],
    ) -> Result<DispatchReport, DispatchError> {
        let backends = resolve_all(configs, &self.registry).inspect_err(|e| {
            warn!(label = %e.label, error = %e.source, "Notifier configuration rejected; nothing sent.");
        })?;
        self.send_all(title, body, backends).await
    }

    /// Sends concurrently, at most `max_in_flight` at a time, until every backend
    /// finished or the deadline passed. Sends still running at the deadline are aborted.
    pub async fn send_all(
        &self,
        title: &str,
        body: &str,
        backends: Vec<ResolvedBackend>,
    ) -> Result<DispatchReport, DispatchError> {
        if backends.is_empty() {
            return Ok(DispatchReport::default());
        }
        let total = backends.len();
        let labels: Vec<String> = backends.iter().map(|b| b.label.clone()).collect();
        let title: Arc<str> = Arc::from(title);
        let body: Arc<str> = Arc::from(body);

        let semaphore = Arc::new(Semaphore::new(self.options.max_in_flight.max(1)));
        let mut workers = JoinSet::new();
        for (index, backend) in backends.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let title = Arc::clone(&title);
            let body = Arc::clone(&body);
            workers.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => backend.notifier.send(&title, &body).await,
                    Err(e) => Err(SendError::Task(e.to_string())),
                };
                (index, result)
            });
        }

        let mut outcomes: Vec<Option<Result<(), SendError>>> = (0..total).map(|_| None).collect();
        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);

        let timed_out = loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((index, result))) => outcomes[index] = Some(result),
                    Some(Err(e)) => warn!(error = %e, "Notification task ended without a result."),
                    None => break false,
                },
                _ = &mut deadline => break true,
            }
        };
        // aborts whatever is still running
        drop(workers);

        let mut delivered = Vec::new();
        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for (label, outcome) in labels.into_iter().zip(outcomes) {
            match outcome {
                Some(Ok(())) => delivered.push(label),
                Some(Err(error)) => {
                    warn!(backend = %label, error = %error, "Notification send failed.");
                    failures.push(BackendFailure { label, error });
                }
                None if timed_out => pending.push(label),
                None => failures.push(BackendFailure {
                    label,
                    error: SendError::Task("task panicked".to_string()),
                }),
            }
        }

        if !pending.is_empty() {
            warn!(
                timeout_ms = self.options.timeout.as_millis() as u64,
                pending = ?pending,
                delivered = delivered.len(),
                "Notification dispatch hit its deadline."
            );
            return Err(DispatchError::DeadlineExceeded {
                pending,
                failures,
                delivered,
            });
        }
        if !failures.is_empty() {
            return Err(DispatchError::Send {
                total,
                failures,
                delivered,
            });
        }
        info!(delivered = delivered.len(), "Notification dispatched.");
        debug!(backends = ?delivered, "Delivered backends.");
        Ok(DispatchReport { delivered })
    }
}
