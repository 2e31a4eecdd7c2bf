//! Single-flight execution of background tasks, with progress broadcast
//! through a [Monitor].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;

mod monitor;

pub use self::monitor::{Monitor, MonitorWriter, Session, MAX_SESSIONS, MONITOR_QUEUE_LEN};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Idle,
    /// Running the task with the given name.
    Busy(String),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Busy(name) => write!(f, "busy: {}", name),
        }
    }
}

/// What a task gets to work with.
pub struct TaskContext {
    /// Fires when the task is cancelled or the scheduler is closed.
    pub cancel: CancellationToken,
    pub progress: MonitorWriter,
}

/// Handle to an admitted task.
pub struct TaskHandle<T> {
    name: String,
    cancel: CancellationToken,
    result: oneshot::Receiver<Result<T, Error>>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token passed to the task as [TaskContext::cancel].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the task to finish. A task that panicked yields
    /// [Error::TaskFailed].
    pub async fn wait(self) -> Result<T, Error> {
        self.result.await.map_err(|_| Error::Closed)?
    }
}

/// Runs at most one task at a time. Admission never queues: starting a
/// task while another one runs fails with [Error::Busy].
pub struct Scheduler {
    status: Arc<watch::Sender<Status>>,
    cancel: CancellationToken,
    monitor: Monitor,
}

impl Scheduler {
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::Idle);
        Self {
            status: Arc::new(status),
            cancel: CancellationToken::new(),
            monitor: Monitor::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Attaches an observer to the progress of current and future tasks.
    pub async fn attach_monitor(&self, cancel: CancellationToken) -> Result<Session, Error> {
        self.monitor.attach(cancel).await
    }

    /// Starts `f` in the background if no other task is running.
    pub fn try_start<F, Fut, T>(&self, name: &str, f: F) -> Result<TaskHandle<T>, Error>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        // admission and the busy status are a single step under the status lock
        let mut running = String::new();
        let admitted = self.status.send_if_modified(|status| match status {
            Status::Idle => {
                *status = Status::Busy(name.to_string());
                true
            }
            Status::Busy(current) => {
                running.clone_from(current);
                false
            }
        });
        if !admitted {
            return Err(Error::Busy(running));
        }

        let cancel = self.cancel.child_token();
        let ctx = TaskContext {
            cancel: cancel.clone(),
            progress: self.monitor.writer(),
        };
        info!(task = name, "task started");

        let task = tokio::spawn(f(ctx));
        let (tx, rx) = oneshot::channel();
        let status = self.status.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(Error::TaskFailed(panic_message(e.into_panic()))),
                Err(e) => Err(Error::TaskFailed(e.to_string())),
            };
            match &result {
                Ok(_) => info!(task = %task_name, "task finished"),
                Err(e) => warn!(task = %task_name, err = %e, "task failed"),
            }

            status.send_replace(Status::Idle);
            // nobody may be waiting for the result
            let _ = tx.send(result);
        });

        Ok(TaskHandle {
            name: name.to_string(),
            cancel,
            result: rx,
        })
    }

    /// Stops admitting tasks, cancels the running one and closes the
    /// monitor.
    pub fn close(&self) {
        self.cancel.cancel();
        self.monitor.close();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "task panicked".to_string(),
        },
    }
}
