use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::backend::{BackendTx, IndexBackend};
use crate::Error;

/// The write transaction of a pipeline run.
///
/// Whoever holds the lock owns the transaction. Backend calls run on the
/// blocking thread pool with the guard moved along, and a commit keeps the
/// lock until its successor transaction is open.
pub(crate) struct SharedTx {
    backend: Arc<dyn IndexBackend>,
    slot: Arc<Mutex<Option<Box<dyn BackendTx>>>>,
}

impl SharedTx {
    pub async fn begin(backend: Arc<dyn IndexBackend>) -> Result<Self, Error> {
        let tx = backend.begin_tx().await?;
        Ok(Self {
            backend,
            slot: Arc::new(Mutex::new(Some(tx))),
        })
    }

    /// Runs `f` on the open transaction.
    pub async fn with<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut dyn BackendTx) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self.slot.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let tx = guard
                .as_mut()
                .ok_or_else(|| Error::StorageError("transaction is closed".to_string()))?;
            f(tx.as_mut())
        })
        .await?
    }

    /// Commits the open transaction and starts a new one.
    pub async fn commit_and_renew(&self) -> Result<(), Error> {
        let mut guard = self.slot.lock().await;
        let tx = guard
            .take()
            .ok_or_else(|| Error::StorageError("transaction is closed".to_string()))?;
        tokio::task::spawn_blocking(move || tx.commit()).await??;
        *guard = Some(self.backend.begin_tx().await?);
        Ok(())
    }

    /// Commits the open transaction, leaving none open.
    pub async fn commit(&self) -> Result<(), Error> {
        let tx = self
            .slot
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::StorageError("transaction is closed".to_string()))?;
        tokio::task::spawn_blocking(move || tx.commit()).await?
    }

    /// Discards the open transaction, if any.
    pub async fn rollback(&self) {
        let Some(tx) = self.slot.lock().await.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || tx.rollback()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err=%e, "failed to roll back transaction"),
            Err(e) => warn!(err=%e, "failed to roll back transaction"),
        }
    }
}
