use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::Error;

/// Maximum number of concurrently attached sessions.
pub const MAX_SESSIONS: usize = 64;

/// Number of lines buffered towards the monitor, and towards each session.
pub const MONITOR_QUEUE_LEN: usize = 64;

enum Control {
    Attach {
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Session, Error>>,
    },
    Detach(u64),
}

/// Broadcasts progress lines to all attached [Session]s.
///
/// The session set is owned by a single actor task, which is spawned on
/// construction and runs until [Monitor::close] is called.
#[derive(Clone)]
pub struct Monitor {
    control: mpsc::Sender<Control>,
    lines: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new() -> Self {
        let (control_tx, control_rx) = mpsc::channel(MAX_SESSIONS);
        let (lines_tx, lines_rx) = mpsc::channel(MONITOR_QUEUE_LEN);
        let shutdown = CancellationToken::new();

        let actor = Actor {
            sessions: BTreeMap::new(),
            next_id: 0,
            control_tx: control_tx.clone(),
            control_rx,
            lines_rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            control: control_tx,
            lines: lines_tx,
            shutdown,
        }
    }

    /// Returns a handle for producing progress lines.
    pub fn writer(&self) -> MonitorWriter {
        MonitorWriter {
            lines: self.lines.clone(),
        }
    }

    /// Attaches a new session, which stays attached until `cancel` fires,
    /// it falls behind, or the monitor is closed.
    pub async fn attach(&self, cancel: CancellationToken) -> Result<Session, Error> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Attach { cancel, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Stops the actor. Lines already queued are delivered, then all
    /// sessions are detached. Writers fail from then on.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of a [Monitor].
#[derive(Clone)]
pub struct MonitorWriter {
    lines: mpsc::Sender<String>,
}

impl MonitorWriter {
    /// Queues a line for broadcast, waiting while the queue is full.
    pub async fn send(&self, line: impl Into<String>) -> Result<(), Error> {
        self.lines
            .send(line.into())
            .await
            .map_err(|_| Error::Closed)
    }
}

/// An attached observer of a [Monitor].
pub struct Session {
    id: u64,
    lines: mpsc::Receiver<String>,
    errors: oneshot::Receiver<Error>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next line. Returns `Ok(None)` once the session was
    /// detached, or the error that caused it to be detached.
    pub async fn recv(&mut self) -> Result<Option<String>, Error> {
        match self.lines.recv().await {
            Some(line) => Ok(Some(line)),
            None => match self.errors.try_recv() {
                Ok(e) => Err(e),
                Err(_) => Ok(None),
            },
        }
    }

    /// Splits the session into its line and error channels.
    pub fn into_parts(self) -> (mpsc::Receiver<String>, oneshot::Receiver<Error>) {
        (self.lines, self.errors)
    }
}

struct Slot {
    cancel: CancellationToken,
    lines: mpsc::Sender<String>,
    errors: oneshot::Sender<Error>,
    // stops the cancellation watcher once the slot is gone
    _watcher: DropGuard,
}

struct Actor {
    sessions: BTreeMap<u64, Slot>,
    next_id: u64,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    lines_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(control) = self.control_rx.recv() => self.handle(control),
                line = self.lines_rx.recv() => match line {
                    Some(line) => self.broadcast(line),
                    None => break,
                },
            }
        }

        // lines queued before closing are still delivered
        self.lines_rx.close();
        while let Some(line) = self.lines_rx.recv().await {
            self.broadcast(line);
        }
        debug!(sessions = self.sessions.len(), "monitor closed");
    }

    fn handle(&mut self, control: Control) {
        match control {
            Control::Attach { cancel, reply } => {
                let result = self.attach(cancel);
                // the caller may have gone away in the meantime
                if let Err(Ok(session)) = reply.send(result) {
                    self.sessions.remove(&session.id);
                }
            }
            Control::Detach(id) => {
                if self.sessions.remove(&id).is_some() {
                    debug!(session.id = id, "session detached");
                }
            }
        }
    }

    fn attach(&mut self, cancel: CancellationToken) -> Result<Session, Error> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(Error::CapacityExceeded(MAX_SESSIONS));
        }

        let id = self.next_id;
        self.next_id += 1;

        let (lines_tx, lines_rx) = mpsc::channel(MONITOR_QUEUE_LEN);
        let (errors_tx, errors_rx) = oneshot::channel();

        let gone = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            let gone = gone.clone();
            let control = self.control_tx.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = control.send(Control::Detach(id)).await;
                    }
                    _ = gone.cancelled() => {}
                }
            }
        };
        tokio::spawn(watcher);

        self.sessions.insert(
            id,
            Slot {
                cancel,
                lines: lines_tx,
                errors: errors_tx,
                _watcher: gone.drop_guard(),
            },
        );
        debug!(session.id = id, sessions = self.sessions.len(), "session attached");

        Ok(Session {
            id,
            lines: lines_rx,
            errors: errors_rx,
        })
    }

    fn broadcast(&mut self, line: String) {
        self.sessions.retain(|_, slot| !slot.cancel.is_cancelled());

        let mut failed = Vec::new();
        for (id, slot) in &self.sessions {
            match slot.lines.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    failed.push((*id, Some(Error::Lagged(MONITOR_QUEUE_LEN))))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push((*id, None)),
            }
        }

        for (id, err) in failed {
            let Some(slot) = self.sessions.remove(&id) else {
                continue;
            };
            if let Some(err) = err {
                warn!(session.id = id, err = %err, "detaching session");
                let _ = slot.errors.send(err);
            }
        }
    }
}
