//! Runs lifecycle calls on a dedicated thread
//!
//! Bootstrap, migrations and remaps can take a while on a large store.
//! Hosts with an interactive thread hand the manager to a
//! `LifecycleExecutor` and await results instead of blocking.
//!
//! ```ignore
//! let executor = LifecycleExecutor::new(manager)?;
//! executor.run(|m| m.initialize()).await??;
//! let status = executor.run(|m| m.schema_status()).await??;
//! ```

use crate::manager::StoreManager;
use std::sync::mpsc;
use std::thread;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(&mut StoreManager) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor thread could not be started: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Channel closed - executor may have shut down")]
    ChannelClosed,
}

pub struct LifecycleExecutor {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LifecycleExecutor {
    /// Move `manager` onto its own thread
    pub fn new(mut manager: StoreManager) -> Result<Self, ExecutorError> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let handle = thread::Builder::new()
            .name("vaultkeeper-store".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job(&mut manager);
                }
                if let Err(e) = manager.close() {
                    tracing::warn!(error = %e, "store close on executor shutdown failed");
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn submit<F, T>(&self, op: F) -> Result<oneshot::Receiver<T>, ExecutorError>
    where
        F: FnOnce(&mut StoreManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |manager| {
            let _ = response_tx.send(op(manager));
        });
        self.sender
            .as_ref()
            .ok_or(ExecutorError::ChannelClosed)?
            .send(job)
            .map_err(|_| ExecutorError::ChannelClosed)?;
        Ok(response_rx)
    }

    /// Run `op` on the store thread and await its result
    pub async fn run<F, T>(&self, op: F) -> Result<T, ExecutorError>
    where
        F: FnOnce(&mut StoreManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(op)?.await.map_err(|_| ExecutorError::ChannelClosed)
    }

    /// Run `op` and block the calling thread until it finishes.
    /// Must not be called from inside an async runtime.
    pub fn run_blocking<F, T>(&self, op: F) -> Result<T, ExecutorError>
    where
        F: FnOnce(&mut StoreManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(op)?
            .blocking_recv()
            .map_err(|_| ExecutorError::ChannelClosed)
    }
}

impl Drop for LifecycleExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("store executor thread panicked");
            }
        }
    }
}
