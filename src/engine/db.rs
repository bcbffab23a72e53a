use super::{
    cell::{now_millis, Cell},
    config::Config,
    flush::FlushWorker,
    memtable::MemTablePool,
    merge::{LiveIter, MergeIter},
    tables::Tables,
    Error, Result,
};
use crate::util::shutdown::Notifier;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};

// Wait for an interrupted worker before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// An ordered key-value storage engine.
///
/// Writes land in memory and are flushed in the background to one table file
/// per generation. Reads merge every generation, the newest one wins.
pub struct Engine {
    pool: MemTablePool,
    tables: Arc<Tables>,
    last_flush_error: Arc<Mutex<Option<String>>>,
    runtime: Mutex<Option<Runtime>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<Notifier>>,
    config: Config,
}

impl Engine {
    /// Open the engine on `config.root_path`, recovering existing tables.
    pub fn open(config: Config) -> Result<Self> {
        info!(root_path = ?config.root_path, "open engine...");
        let (tables, max_generation) = Tables::recover(&config.root_path)?;
        let tables = Arc::new(tables);
        let generation = max_generation.map_or(0, |generation| generation + 1);
        let pool = MemTablePool::new(
            generation,
            config.table_byte_size,
            config.memtable_pool_size,
        );

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("gendb-worker")
            .enable_time()
            .build()?;

        // Start the flush worker once nothing can fail anymore
        let shutdown = Notifier::new();
        let last_flush_error = Arc::new(Mutex::new(None));
        let (queue, listener) = match (pool.take_flush_queue(), shutdown.listen()) {
            (Some(queue), Some(listener)) => (queue, listener),
            _ => return Err(Error::Closed),
        };
        let worker = FlushWorker::new(queue, pool.clone(), Arc::clone(&tables), listener)
            .retry(config.flush_retry_attempts, config.flush_retry_backoff)
            .last_error(Arc::clone(&last_flush_error))
            .spawn(runtime.handle());

        info!(generation, tables = tables.len(), "open engine complete");
        Ok(Engine {
            pool,
            tables,
            last_flush_error,
            runtime: Mutex::new(Some(runtime)),
            worker: Mutex::new(Some(worker)),
            shutdown: Mutex::new(Some(shutdown)),
            config,
        })
    }

    /// Iterate live key-value pairs in key order, starting at the first key
    /// greater or equal than `from`.
    ///
    /// Writes made after the call may or may not be seen. Expiration is
    /// judged at the time of the call.
    pub fn iter(&self, from: &[u8]) -> Result<EngineIter> {
        self.check_open()?;
        let sources = self.tables.snapshot(from, || self.pool.sources(from))?;
        Ok(EngineIter {
            inner: LiveIter::new(MergeIter::by_generation(sources), now_millis()),
        })
    }

    /// Get the live value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_open()?;
        let sources = self.tables.snapshot(key, || self.pool.key_sources(key))?;
        let mut live = LiveIter::new(MergeIter::by_generation(sources), now_millis());
        match live.next() {
            Some(Ok(cell)) if cell.key() == key => Ok(Some(cell.into_pair().1)),
            Some(Err(err)) => Err(err),
            _ => Ok(None),
        }
    }

    /// Insert or overwrite `key`, invisible from `expire_at` on if given.
    #[inline]
    pub fn upsert(&self, key: Bytes, value: Bytes, expire_at: Option<SystemTime>) -> Result<()> {
        self.pool.upsert(key, value, expire_at)
    }

    #[inline]
    pub fn set(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.pool.upsert(key, value, None)
    }

    /// Delete value by key
    #[inline]
    pub fn remove(&self, key: Bytes) -> Result<()> {
        self.pool.remove(key)
    }

    /// Merge memory and every table into a single table of generation 0.
    ///
    /// On error the previous tables are left in place. Return the number of
    /// cells kept.
    pub fn compact(&self) -> Result<u64> {
        self.check_open()?;
        info!("start compaction...");
        let cells = self.tables.compact(&self.pool)?;
        info!(cells, "compaction was finished");
        Ok(cells)
    }

    /// Seal the active memtable and wait until it is on disk.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        let Some(generation) = self.pool.seal_active()? else {
            return Ok(());
        };
        if self
            .pool
            .wait_flushed(generation, self.config.shutdown_timeout)
        {
            Ok(())
        } else {
            Err(Error::FlushIncomplete(generation))
        }
    }

    /// Generation of the memtable taking writes.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.pool.generation()
    }

    /// Generations of the tables on disk, ascending.
    #[inline]
    pub fn generations(&self) -> Vec<u64> {
        self.tables.generations()
    }

    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Last flush the worker gave up on, if any.
    #[inline]
    pub fn last_flush_error(&self) -> Option<String> {
        self.last_flush_error.lock().clone()
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Flush what is in memory and stop the background worker.
    ///
    /// The worker gets `shutdown_timeout` to finish, then it is interrupted
    /// and finally aborted. Calling it again does nothing.
    pub fn close(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        info!("close engine...");
        self.pool.close();

        let worker = self.worker.lock().take();
        let mut shutdown = self.shutdown.lock().take();
        if Handle::try_current().is_ok() {
            // Blocking inside an async context would panic, leave the worker behind
            warn!("engine closed from async context, flush worker is not awaited");
            runtime.shutdown_background();
            return;
        }

        if let Some(mut worker) = worker {
            let wait = self.config.shutdown_timeout;
            runtime.block_on(async {
                match timeout(wait, &mut worker).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(error = err.to_string(), "flush worker failed"),
                    Err(_) => {
                        warn!(?wait, "flush worker is still running, interrupting");
                        if let Some(notifier) = shutdown.as_mut() {
                            if timeout(SHUTDOWN_GRACE, notifier.notify()).await.is_err() {
                                warn!("flush worker ignored shutdown, aborting");
                            }
                        }
                        worker.abort();
                    }
                }
            });
        }
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!("engine closed");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Live key-value pairs of an engine snapshot, in key order.
pub struct EngineIter {
    inner: LiveIter<MergeIter>,
}

impl Iterator for EngineIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|cell| cell.map(Cell::into_pair))
    }
}
