use super::{cell::Cell, Result};
use std::cmp::Reverse;

pub type CellIter = Box<dyn Iterator<Item = Result<Cell>> + Send>;

/// K-way merge of key-sorted cell sources.
///
/// Sources are ordered from freshest to oldest: when several sources hold the
/// same key, the cell of the lowest source index is yielded and the others are
/// skipped. The first error from any source is yielded once and ends the merge.
pub struct MergeIter {
    iters: Vec<CellIter>,
    heads: Vec<Option<Cell>>,
    stop: bool,
}

impl MergeIter {
    pub fn new(iters: Vec<CellIter>) -> Self {
        let heads = iters.iter().map(|_| None).collect();
        MergeIter {
            iters,
            heads,
            stop: false,
        }
    }

    /// Merge sources tagged with their generation, the newest generation
    /// wins. Sources of the same generation keep their given order.
    pub fn by_generation(mut sources: Vec<(u64, CellIter)>) -> Self {
        sources.sort_by_key(|(generation, _)| Reverse(*generation));
        Self::new(sources.into_iter().map(|(_, iter)| iter).collect())
    }

    // Pull one cell for every source whose head was consumed
    fn fill_heads(&mut self) -> Result<()> {
        debug_assert_eq!(self.iters.len(), self.heads.len());
        for (iter, head) in self.iters.iter_mut().zip(self.heads.iter_mut()) {
            if head.is_none() {
                match iter.next() {
                    Some(Ok(cell)) => *head = Some(cell),
                    Some(Err(e)) => return Err(e),
                    None => {}
                }
            }
        }
        Ok(())
    }

    // Select minimal key in heads, and take it from the freshest source
    fn take_min_head(&mut self) -> Option<Cell> {
        let mut min_idx: Option<usize> = None;
        let mut shadowed = Vec::with_capacity(self.heads.len());
        for (idx, head) in self.heads.iter().enumerate() {
            let Some(cell) = head else { continue };
            match min_idx.and_then(|min| self.heads[min].as_ref()) {
                None => min_idx = Some(idx),
                Some(min) if cell.key() == min.key() => {
                    // Older source holds the same key, drop it
                    shadowed.push(idx);
                }
                Some(min) if cell.key() < min.key() => {
                    shadowed.clear();
                    min_idx = Some(idx);
                }
                Some(_) => {}
            }
        }

        for idx in shadowed {
            self.heads[idx].take();
        }
        self.heads[min_idx?].take()
    }
}

impl Iterator for MergeIter {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop {
            return None;
        }
        if let Err(e) = self.fill_heads() {
            self.stop = true;
            return Some(Err(e));
        }
        let cell = self.take_min_head();
        if cell.is_none() {
            self.stop = true;
        }
        cell.map(Ok)
    }
}

/// Drop tombstones and cells expired at `now` (ms since epoch).
pub struct LiveIter<I> {
    inner: I,
    now: u64,
}

impl<I> LiveIter<I> {
    pub fn new(inner: I, now: u64) -> Self {
        LiveIter { inner, now }
    }
}

impl<I: Iterator<Item = Result<Cell>>> Iterator for LiveIter<I> {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(cell) if cell.is_tombstone() || cell.is_expired(self.now) => continue,
                item => return Some(item),
            }
        }
    }
}
