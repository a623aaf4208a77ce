//! FDB ageing task.

use crate::epoch::Epoch;
use crate::fdb::Fdb;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Background sweeper. Wakes every half ageing time, removes idle dynamic
/// entries and drives deferred reclamation.
#[derive(Debug)]
pub struct Ager {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Ager {
    pub fn spawn(runtime: &Handle, fdb: Arc<Fdb>, epoch: Arc<Epoch>) -> Self {
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run(fdb, epoch, cancel.clone()));
        Self { cancel, task }
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "ageing task ended abnormally");
        }
    }
}

impl Drop for Ager {
    /// Cancels the task without waiting; it exits on its next poll.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(fdb: Arc<Fdb>, epoch: Arc<Epoch>, cancel: CancellationToken) {
    info!(ageing_time = ?fdb.ageing_time(), "fdb ageing started");
    loop {
        let period = (fdb.ageing_time() / 2).max(MIN_PERIOD);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {
                let aged = fdb.sweep(Instant::now());
                if aged > 0 {
                    debug!(aged, remaining = fdb.len(), "fdb ageing sweep");
                }
                epoch.try_reclaim();
            }
        }
    }
    info!("fdb ageing stopped");
}
