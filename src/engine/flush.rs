use super::{
    kvtable::KVTable,
    memtable::{FlushQueue, FlushRequest, MemTablePool},
    tables::Tables,
    Error, Result,
};
use crate::util::shutdown::Listener;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

static FLUSH_ID_ALLOC: AtomicU64 = AtomicU64::new(0);

/// Single consumer of the flush queue, turns sealed tables into table files.
pub struct FlushWorker {
    queue: FlushQueue,
    pool: MemTablePool,
    tables: Arc<Tables>,
    shutdown: Listener,
    retry_attempts: u32,
    retry_backoff: Duration,
    last_error: Arc<Mutex<Option<String>>>,
}

impl FlushWorker {
    pub fn new(
        queue: FlushQueue,
        pool: MemTablePool,
        tables: Arc<Tables>,
        shutdown: Listener,
    ) -> Self {
        FlushWorker {
            queue,
            pool,
            tables,
            shutdown,
            retry_attempts: 0,
            retry_backoff: Duration::ZERO,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    // Retry a failed flush `attempts` more times, doubling the wait each time
    pub fn retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    // Share the slot where an abandoned flush leaves its error
    pub fn last_error(mut self, slot: Arc<Mutex<Option<String>>>) -> Self {
        self.last_error = slot;
        self
    }

    // Start the flush loop on given runtime
    pub fn spawn(self, handle: &Handle) -> JoinHandle<()> {
        handle.spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("start flush worker...");
        loop {
            match self.queue.take_table_to_flush(&mut self.shutdown).await {
                Ok(FlushRequest::Flush(table)) => {
                    if self.flush(&table).await.is_err() {
                        break;
                    }
                }
                Ok(FlushRequest::Poison) => {
                    self.drain().await;
                    break;
                }
                Err(err) => {
                    warn!(error = err.to_string(), "flush worker interrupted");
                    break;
                }
            }
        }
        info!("flush worker exit");
    }

    // Flush what was queued before the poison
    async fn drain(&mut self) {
        while let Some(request) = self.queue.try_take_table_to_flush() {
            if let FlushRequest::Flush(table) = request {
                if self.flush(&table).await.is_err() {
                    return;
                }
            }
        }
    }

    // Flush a sealed table, only fails when shutdown interrupts a retry wait
    async fn flush(&mut self, table: &KVTable) -> Result<()> {
        let id = FLUSH_ID_ALLOC.fetch_add(1, Ordering::Relaxed);
        let generation = table.generation();
        info!(id, generation, "start a new flush task...");

        let mut backoff = self.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.tables.flush(table) {
                Ok(written) => {
                    info!(id, generation, written, "flush task was finished");
                    self.pool.flushed(generation);
                    return Ok(());
                }
                Err(err) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(
                        id,
                        generation,
                        attempt,
                        error = err.to_string(),
                        "flush task failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.listen() => return Err(Error::Interrupted),
                        _ = sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    // Table stays in memory, reads keep seeing it
                    error!(
                        id,
                        generation,
                        error = err.to_string(),
                        "flush task was abandoned"
                    );
                    *self.last_error.lock() = Some(format!("generation {}: {}", generation, err));
                    self.pool.flush_abandoned(generation);
                    return Ok(());
                }
            }
        }
    }
}
