//! Run admission queue
//!
//! A single background task wakes every five seconds and admits the oldest
//! queued run when capacity allows, dispatching its executor without
//! awaiting completion. FIFO by `created_at`; the executor's conditional
//! claim makes duplicate dispatches of the same row harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testdeck_common::types::RunStatus;
use testdeck_common::Result;
use tracing::{debug, error, info};

use crate::executor::Executor;
use crate::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct QueueWorker {
    store: Store,
    executor: Executor,
    max_concurrent_runs: usize,
    ticking: Arc<AtomicBool>,
}

impl QueueWorker {
    pub fn new(store: Store, executor: Executor, max_concurrent_runs: usize) -> Self {
        Self {
            store,
            executor,
            max_concurrent_runs,
            ticking: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the admission loop
    pub async fn run(self) {
        info!(
            "Queue worker started (capacity {})",
            self.max_concurrent_runs
        );

        loop {
            if let Err(e) = self.tick() {
                error!("Queue tick error: {}", e);
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }

    /// One admission pass. Returns the dispatched run id, if any.
    ///
    /// The reentrancy flag keeps a slow tick from overlapping the next one.
    pub fn tick(&self) -> Result<Option<String>> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue tick still in progress; skipping");
            return Ok(None);
        }

        let result = self.admit_next();
        self.ticking.store(false, Ordering::SeqCst);
        result
    }

    fn admit_next(&self) -> Result<Option<String>> {
        let running = self.store.count_runs_by_status(RunStatus::Running)?;
        if running >= self.max_concurrent_runs as i64 {
            debug!("At capacity ({} running); not admitting", running);
            return Ok(None);
        }

        let Some(run) = self.store.next_queued_run()? else {
            return Ok(None);
        };

        info!("Admitting run {} (created {})", run.id, run.created_at);
        let executor = self.executor.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            executor.execute_run(&run_id).await;
        });

        Ok(Some(run.id))
    }
}
