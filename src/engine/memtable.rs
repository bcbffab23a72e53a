use super::{
    block::check_entry_size,
    cell::{Cell, Value},
    kvtable::KVTable,
    merge::CellIter,
    Error, Result,
};
use crate::util::shutdown::Listener;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hand-off between the pool and the flush worker.
#[derive(Debug)]
pub enum FlushRequest {
    Flush(Arc<KVTable>),
    Poison,
}

struct PoolState {
    mutable: KVTable,
    closed: bool,
    // Sealed generations the worker gave up on, they stay readable
    abandoned: HashSet<u64>,
}

/// Buffers writes in memory and hands full tables over to be flushed.
///
/// The active table takes writes. Once it grows past the byte threshold it is
/// sealed, retained for reads and queued for flush. At most `pool_size`
/// sealed tables wait for flush at once; writers block until a slot frees.
#[derive(Clone)]
pub struct MemTablePool {
    state: Arc<Mutex<PoolState>>,
    // Sealed tables, ordered by generation
    immutable: Arc<RwLock<Vec<Arc<KVTable>>>>,
    released: Arc<Condvar>,
    sender: mpsc::UnboundedSender<FlushRequest>,
    queue: Arc<Mutex<Option<FlushQueue>>>,
    table_byte_size: usize,
    pool_size: usize,
}

impl MemTablePool {
    pub fn new(generation: u64, table_byte_size: usize, pool_size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        MemTablePool {
            state: Arc::new(Mutex::new(PoolState {
                mutable: KVTable::new(generation),
                closed: false,
                abandoned: HashSet::new(),
            })),
            immutable: Arc::new(RwLock::new(Vec::new())),
            released: Arc::new(Condvar::new()),
            sender,
            queue: Arc::new(Mutex::new(Some(FlushQueue { receiver }))),
            table_byte_size,
            pool_size: pool_size.max(1),
        }
    }

    // Insert or overwrite a value, expiring at the given time if any
    #[inline]
    pub fn upsert(&self, key: Bytes, data: Bytes, expire_at: Option<SystemTime>) -> Result<()> {
        self.set(key, Value::new(data, expire_at))
    }

    // Mark key as deleted
    #[inline]
    pub fn remove(&self, key: Bytes) -> Result<()> {
        self.set(key, Value::Tombstone)
    }

    fn set(&self, key: Bytes, value: Value) -> Result<()> {
        // Refuse what could never be flushed
        check_entry_size(key.len(), value.encode_bytes_len())?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.mutable.set(key, value);

        // Low-rate route, wait for a retention slot then seal
        while state.mutable.size() >= self.table_byte_size && !state.closed {
            if self.retained(&state) < self.pool_size {
                self.seal(&mut state);
                break;
            }
            debug!(
                generation = state.mutable.generation(),
                "memtable pool is full, waiting for flush"
            );
            self.released.wait(&mut state);
        }
        // Closing seals the active table, the write is kept either way
        Ok(())
    }

    /// Seal the active table now if it holds anything, return its generation.
    pub fn seal_active(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.mutable.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.seal(&mut state)))
    }

    // Caller holds the state lock
    fn seal(&self, state: &mut PoolState) -> u64 {
        let generation = state.mutable.generation();
        let table = Arc::new(std::mem::replace(
            &mut state.mutable,
            KVTable::new(generation + 1),
        ));
        // Readers see the sealed table before the next read of the active one
        self.immutable.write().push(Arc::clone(&table));

        info!(
            generation,
            entries = table.len(),
            size = table.size(),
            "memtable sealed"
        );
        if self.sender.send(FlushRequest::Flush(table)).is_err() {
            warn!(generation, "flush queue has been released");
        }
        generation
    }

    // Sealed tables counting against the pool capacity
    fn retained(&self, state: &PoolState) -> usize {
        self.immutable
            .read()
            .iter()
            .filter(|table| !state.abandoned.contains(&table.generation()))
            .count()
    }

    /// Generation of the active table.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.state.lock().mutable.generation()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Cell sources of the pool tagged with their generation, newest first.
    ///
    /// The active table is copied from `from` on; sealed tables are shared and
    /// read lazily.
    pub fn sources(&self, from: &[u8]) -> Vec<(u64, CellIter)> {
        self.collect_sources(from, |active| active.snapshot_from(from))
    }

    /// Cell sources for a point read of `key`.
    ///
    /// Only `key` itself is copied from the active table, sealed tables are
    /// read lazily from `key` on.
    pub fn key_sources(&self, key: &[u8]) -> Vec<(u64, CellIter)> {
        self.collect_sources(key, |active| active.snapshot_key(key).into_iter().collect())
    }

    fn collect_sources<F>(&self, from: &[u8], copy_active: F) -> Vec<(u64, CellIter)>
    where
        F: FnOnce(&KVTable) -> Vec<Cell>,
    {
        let state = self.state.lock();
        let immutable = self.immutable.read();
        let mut sources = Vec::with_capacity(immutable.len() + 1);

        let active = copy_active(&state.mutable);
        sources.push((
            state.mutable.generation(),
            Box::new(active.into_iter().map(Ok)) as CellIter,
        ));
        for table in immutable.iter().rev() {
            sources.push((table.generation(), Box::new(table.cursor(from)) as CellIter));
        }
        sources
    }

    // Merged view over every table held by the pool
    #[cfg(test)]
    pub fn iter(&self, from: &[u8]) -> super::merge::MergeIter {
        let sources = self.sources(from).into_iter().map(|(_, iter)| iter);
        super::merge::MergeIter::new(sources.collect())
    }

    /// Hand out the receiving end of the flush queue, only once.
    #[inline]
    pub fn take_flush_queue(&self) -> Option<FlushQueue> {
        self.queue.lock().take()
    }

    /// Release a sealed table whose content is now on disk.
    pub fn flushed(&self, generation: u64) {
        self.immutable
            .write()
            .retain(|table| table.generation() != generation);

        // Take the state lock so a writer between check and wait is not missed
        self.state.lock().abandoned.remove(&generation);
        self.released.notify_all();
    }

    /// Record that a sealed table could not be flushed. It stays resident and
    /// no longer counts against the pool capacity.
    pub fn flush_abandoned(&self, generation: u64) {
        self.state.lock().abandoned.insert(generation);
        self.released.notify_all();
    }

    /// Release every abandoned table, used once their content is persisted
    /// some other way.
    pub fn release_abandoned(&self) -> Vec<u64> {
        let abandoned: Vec<u64> = self.state.lock().abandoned.drain().collect();
        if !abandoned.is_empty() {
            self.immutable
                .write()
                .retain(|table| !abandoned.contains(&table.generation()));
            self.released.notify_all();
        }
        abandoned
    }

    /// Wait until the sealed table of `generation` is flushed.
    ///
    /// Return false on timeout or if its flush was abandoned.
    pub fn wait_flushed(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.abandoned.contains(&generation) {
                return false;
            }
            let retained = self
                .immutable
                .read()
                .iter()
                .any(|table| table.generation() == generation);
            if !retained {
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Stop taking writes. The active table is sealed if it holds anything,
    /// then the worker is poisoned. Calling it again does nothing.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if !state.mutable.is_empty() {
            // Capacity is ignored here
            self.seal(&mut state);
        }
        if self.sender.send(FlushRequest::Poison).is_err() {
            warn!("flush queue has been released before close");
        }
        drop(state);

        // Wake writers blocked on capacity
        self.released.notify_all();
        info!("memtable pool closed");
    }
}

/// Receiving end of the flush hand-off, owned by the single flush worker.
pub struct FlushQueue {
    receiver: mpsc::UnboundedReceiver<FlushRequest>,
}

impl FlushQueue {
    /// Suspend until a request is available, FIFO.
    ///
    /// Fails with `Interrupted` once the shutdown signal fires; a queue whose
    /// senders are all gone reads as `Poison`.
    pub async fn take_table_to_flush(&mut self, shutdown: &mut Listener) -> Result<FlushRequest> {
        tokio::select! {
            biased;
            _ = shutdown.listen() => Err(Error::Interrupted),
            request = self.receiver.recv() => Ok(request.unwrap_or(FlushRequest::Poison)),
        }
    }

    // Non-blocking take, used to drain the queue
    #[inline]
    pub fn try_take_table_to_flush(&mut self) -> Option<FlushRequest> {
        self.receiver.try_recv().ok()
    }
}
