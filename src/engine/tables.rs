use super::{
    cell::{now_millis, Cell},
    kvtable::KVTable,
    memtable::MemTablePool,
    merge::{CellIter, LiveIter, MergeIter},
    sstable::SSTable,
    Result,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

const TABLE_FILE_SUFFIX: &str = ".dat";
const TEMP_FILE_SUFFIX: &str = ".tmp";
const OLD_FILE_SUFFIX: &str = "_old.dat";
const COMPACTED_GENERATION: u64 = 0;

/// On-disk tables keyed by generation, and the file protocol that changes them.
///
/// Flush and compaction are serialized by the maintenance lock. The map is
/// only changed under its write lock, readers take a snapshot of table
/// iterators under the read lock.
pub struct Tables {
    root_path: PathBuf,
    tables: RwLock<BTreeMap<u64, Arc<SSTable>>>,
    maintenance: Mutex<()>,
}

impl Tables {
    /// Scan the root directory and open every table.
    ///
    /// Leftovers of an interrupted compaction or flush are resolved first.
    /// Return the tables and the greatest generation found.
    pub fn recover(root_path: impl Into<PathBuf>) -> Result<(Self, Option<u64>)> {
        let root_path = root_path.into();
        fs::create_dir_all(&root_path)?;

        recover_interrupted_compaction(&root_path)?;

        // Partial writes never became visible
        for (path, generation) in scan_generation_files(&root_path, TEMP_FILE_SUFFIX)? {
            warn!(generation, "remove unfinished table file");
            fs::remove_file(path)?;
        }

        let mut tables = BTreeMap::new();
        for (path, generation) in scan_generation_files(&root_path, TABLE_FILE_SUFFIX)? {
            let table = SSTable::open(generation, path)?;
            info!(generation, cells = table.len(), "table recovered");
            tables.insert(generation, Arc::new(table));
        }
        let max_generation = tables.keys().next_back().copied();

        Ok((
            Tables {
                root_path,
                tables: RwLock::new(tables),
                maintenance: Mutex::new(()),
            },
            max_generation,
        ))
    }

    /// Snapshot the in-memory sources and every table, newest generation first.
    ///
    /// `memory` runs under the map read lock, so a table moving from memory to
    /// disk is seen at least once.
    pub fn snapshot<F>(&self, from: &[u8], memory: F) -> Result<Vec<(u64, CellIter)>>
    where
        F: FnOnce() -> Vec<(u64, CellIter)>,
    {
        let tables = self.tables.read();
        let mut sources = memory();
        sources.reserve(tables.len());
        for (generation, table) in tables.iter().rev() {
            sources.push((*generation, Box::new(table.iter(from)?) as CellIter));
        }
        Ok(sources)
    }

    /// Persist a sealed table under its own generation and map it.
    ///
    /// Return false if the table is empty and nothing was written.
    pub fn flush(&self, table: &KVTable) -> Result<bool> {
        let generation = table.generation();
        if table.is_empty() {
            return Ok(false);
        }
        let _maintenance = self.maintenance.lock();

        let temp_path = self.file_path(generation, TEMP_FILE_SUFFIX);
        let table_path = self.file_path(generation, TABLE_FILE_SUFFIX);
        if let Err(err) = SSTable::serialize(&temp_path, table.iter().map(Ok)) {
            fs::remove_file(&temp_path).ok();
            return Err(err);
        }
        fs::rename(&temp_path, &table_path)?;
        let sstable = SSTable::open(generation, table_path)?;
        info!(
            generation,
            cells = sstable.len(),
            path = ?sstable.path(),
            "table flushed"
        );

        self.tables.write().insert(generation, Arc::new(sstable));
        Ok(true)
    }

    /// Fold the pool and every mapped table into a single table of generation 0.
    ///
    /// Tombstones and expired cells are dropped. On failure the previous files
    /// and map are kept. Return the number of cells written.
    pub fn compact(&self, pool: &MemTablePool) -> Result<u64> {
        let _maintenance = self.maintenance.lock();
        let mut tables = self.tables.write();

        let mut sources = pool.sources(b"");
        for (generation, table) in tables.iter().rev() {
            sources.push((*generation, Box::new(table.iter(b"")?) as CellIter));
        }
        let merged = LiveIter::new(MergeIter::by_generation(sources), now_millis());
        let generations: Vec<u64> = tables.keys().copied().collect();
        info!(?generations, "compaction started");

        let mut progress = Progress::default();
        let compacted = match self.write_compacted(&generations, merged, &mut progress) {
            Ok(table) => table,
            Err(err) => {
                warn!(error = err.to_string(), "compaction failed, rolling back");
                self.rollback(progress);
                return Err(err);
            }
        };

        for generation in generations {
            let old_path = self.file_path(generation, OLD_FILE_SUFFIX);
            if let Err(err) = fs::remove_file(&old_path) {
                warn!(
                    generation,
                    error = err.to_string(),
                    "remove compacted table failed"
                );
            }
        }

        let cells = compacted.len();
        if compacted.is_empty() {
            info!("compaction left no live cell");
        }
        tables.clear();
        tables.insert(COMPACTED_GENERATION, Arc::new(compacted));

        // Tables the flush worker gave up on are persisted now
        let released = pool.release_abandoned();
        info!(cells, ?released, "compaction finished");
        Ok(cells)
    }

    // Rename mapped tables aside, write and publish the compacted one
    fn write_compacted(
        &self,
        generations: &[u64],
        merged: impl Iterator<Item = Result<Cell>>,
        progress: &mut Progress,
    ) -> Result<SSTable> {
        for generation in generations {
            fs::rename(
                self.file_path(*generation, TABLE_FILE_SUFFIX),
                self.file_path(*generation, OLD_FILE_SUFFIX),
            )?;
            progress.renamed.push(*generation);
        }

        let temp_path = self.file_path(COMPACTED_GENERATION, TEMP_FILE_SUFFIX);
        let table_path = self.file_path(COMPACTED_GENERATION, TABLE_FILE_SUFFIX);
        progress.temp_written = true;
        SSTable::serialize(&temp_path, merged)?;
        fs::rename(&temp_path, &table_path)?;
        progress.published = true;

        SSTable::open(COMPACTED_GENERATION, table_path)
    }

    fn rollback(&self, progress: Progress) {
        if progress.published {
            let table_path = self.file_path(COMPACTED_GENERATION, TABLE_FILE_SUFFIX);
            if let Err(err) = fs::remove_file(table_path) {
                warn!(error = err.to_string(), "remove compacted table failed");
            }
        } else if progress.temp_written {
            fs::remove_file(self.file_path(COMPACTED_GENERATION, TEMP_FILE_SUFFIX)).ok();
        }

        for generation in progress.renamed {
            if let Err(err) = fs::rename(
                self.file_path(generation, OLD_FILE_SUFFIX),
                self.file_path(generation, TABLE_FILE_SUFFIX),
            ) {
                // Recovery at next open renames it back
                warn!(generation, error = err.to_string(), "restore table failed");
            }
        }
    }

    /// Generations currently mapped, ascending.
    #[inline]
    pub fn generations(&self) -> Vec<u64> {
        self.tables.read().keys().copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    #[inline]
    fn file_path(&self, generation: u64, suffix: &str) -> PathBuf {
        file_path(&self.root_path, generation, suffix)
    }
}

// Steps of a compaction already done, undone on failure
#[derive(Default)]
struct Progress {
    renamed: Vec<u64>,
    temp_written: bool,
    published: bool,
}

#[inline]
fn file_path(root_path: &Path, generation: u64, suffix: &str) -> PathBuf {
    root_path.join(format!("{}{}", generation, suffix))
}

// A compaction renames tables to `<g>_old.dat` before publishing `0.dat`.
// If `0.dat` exists the compaction got past its final rename.
fn recover_interrupted_compaction(root_path: &Path) -> Result<()> {
    let old_files = scan_generation_files(root_path, OLD_FILE_SUFFIX)?;
    if old_files.is_empty() {
        return Ok(());
    }

    let compacted = file_path(root_path, COMPACTED_GENERATION, TABLE_FILE_SUFFIX);
    if compacted.is_file() {
        warn!(count = old_files.len(), "finish interrupted compaction");
        for (path, _) in old_files {
            fs::remove_file(path)?;
        }
    } else {
        warn!(count = old_files.len(), "roll back interrupted compaction");
        for (path, generation) in old_files {
            fs::rename(path, file_path(root_path, generation, TABLE_FILE_SUFFIX))?;
        }
    }
    Ok(())
}

// Scan given directory, get every `<digits><suffix>` file sorted by generation
fn scan_generation_files(path: &Path, suffix: &str) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let generation = path
            .file_name()
            .and_then(std::ffi::OsStr::to_str)
            .and_then(|name| name.strip_suffix(suffix))
            .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(generation) = generation {
            files.push((path, generation));
        }
    }

    files.sort_by_key(|elem| elem.1);
    Ok(files)
}
