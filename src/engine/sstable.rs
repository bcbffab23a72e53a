use super::{
    block::{check_entry_size, Block, BlockBuilder, BlockIntoIterator},
    cell::{Cell, Value},
    Error, Result,
};
use crate::util::{checksum, from_le_bytes_32, from_le_bytes_64, seek_and_read_buf};
use bytes::Bytes;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

const FOOTER_SIZE: usize = 24; // index offset + index size + cell count + magic
const TABLE_MAGIC: u32 = 0x4745_4E44;
const CHECKSUM_SIZE: usize = 4;
const BLOCK_HANDLE_SIZE: usize = 12; // offset + size
const BLOCK_DEFAULT_SIZE: usize = 4 * 1024; // 4kb

/// An immutable, key-sorted table file bound to one generation.
///
/// Layout: data blocks each followed by a checksum, an index block whose
/// keys are the last key of every data block, then a fixed size footer.
#[derive(Debug)]
pub struct SSTable {
    generation: u64,
    path: PathBuf,
    index: Arc<Vec<BlockHandle>>,
    len: u64,
}

impl SSTable {
    /// Write a sorted, deduplicated stream of cells into `path`.
    ///
    /// The stream is consumed to exhaustion. The caller owns naming: the
    /// file is written in place and never renamed here.
    pub fn serialize<I>(path: &Path, cells: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Cell>>,
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut builder = SSTableBuilder::new(BufWriter::new(file));
        for cell in cells {
            builder.add(&cell?)?;
        }
        let len = builder.len();
        let file = builder.finish()?.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(len)
    }

    /// Open an existing table file, reading its footer and index.
    pub fn open(generation: u64, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = File::open(&path)?;
        let file_size = reader.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::BadSSTableFooter);
        }

        // Recover footer from file
        let footer_buffer = seek_and_read_buf(
            &mut reader,
            SeekFrom::End(-(FOOTER_SIZE as i64)),
            FOOTER_SIZE,
        )?;
        let footer = Footer::from_bytes(&footer_buffer)?;
        let data_end = file_size - FOOTER_SIZE as u64;
        let index_end = footer
            .index_offset
            .checked_add((footer.index_size + CHECKSUM_SIZE) as u64)
            .ok_or(Error::BadSSTableFooter)?;
        if index_end != data_end {
            return Err(Error::BadSSTableFooter);
        }

        // Read and validate index
        let index_block = read_block(
            &mut reader,
            footer.index_offset,
            footer.index_size,
        )?;
        let mut index = Vec::new();
        for pair in index_block {
            let (last_key, value) = pair?;
            let handle = BlockHandle::decode(last_key, &value)?;
            let block_end = handle
                .offset
                .checked_add((handle.size + CHECKSUM_SIZE) as u64)
                .ok_or(Error::BadSSTable)?;
            if block_end > footer.index_offset {
                return Err(Error::BadSSTable);
            }
            index.push(handle);
        }
        if index.is_empty() != (footer.len == 0) {
            return Err(Error::BadSSTable);
        }

        Ok(SSTable {
            generation,
            path,
            index: Arc::new(index),
            len: footer.len,
        })
    }

    /// Iterate cells in key order starting from the first key `>= from`.
    ///
    /// The file handle is opened here, so the iterator keeps working when the
    /// file is renamed or unlinked afterwards.
    pub fn iter(&self, from: &[u8]) -> Result<SSTableIter> {
        let reader = File::open(&self.path)?;
        // Index keys are the last key of every block
        let position = self
            .index
            .partition_point(|handle| &handle.last_key[..] < from);

        Ok(SSTableIter {
            index: Arc::clone(&self.index),
            position,
            reader,
            block: None,
            from: Some(Bytes::copy_from_slice(from)),
            stop: false,
        })
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Number of cells in the table
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// Read a block and its trailing checksum
fn read_block(reader: &mut File, offset: u64, size: usize) -> Result<Block> {
    let mut buffer = seek_and_read_buf(reader, SeekFrom::Start(offset), size + CHECKSUM_SIZE)?;
    if buffer.len() != size + CHECKSUM_SIZE {
        return Err(Error::BadSSTable);
    }
    let expected = from_le_bytes_32(&buffer[size..]) as u32;
    if checksum(&buffer[..size]) != expected {
        return Err(Error::BadSSTableBlock);
    }
    buffer.truncate(size);
    Block::from_bytes(buffer.into())
}

pub struct SSTableIter {
    index: Arc<Vec<BlockHandle>>,
    position: usize,
    reader: File,
    block: Option<BlockIntoIterator>,
    from: Option<Bytes>, // seek target, applied to the first block only
    stop: bool,
}

impl SSTableIter {
    fn next_block(&mut self) -> Result<Option<BlockIntoIterator>> {
        let Some(handle) = self.index.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        let block = read_block(&mut self.reader, handle.offset, handle.size)?;
        match self.from.take() {
            Some(from) => Ok(Some(block.seek(&from)?)),
            None => Ok(Some(block.into_iter())),
        }
    }
}

// Implement a Iterator to iterating the sstable
impl Iterator for SSTableIter {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop {
            return None;
        }

        loop {
            if let Some(block) = &mut self.block {
                match block.next() {
                    Some(Ok((key, value))) => match Value::decode_from_bytes(value) {
                        Ok(value) => return Some(Ok(Cell::new(key, value))),
                        Err(e) => {
                            self.stop = true;
                            return Some(Err(e));
                        }
                    },
                    Some(Err(e)) => {
                        self.stop = true;
                        return Some(Err(e));
                    }
                    // Reach the end of block, restart by index iteration
                    None => self.block = None,
                }
            }

            match self.next_block() {
                Ok(Some(block)) => self.block = Some(block),
                Ok(None) => {
                    self.stop = true;
                    return None;
                }
                Err(e) => {
                    self.stop = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

struct Footer {
    index_offset: u64, // Index block offset
    index_size: usize, // Index block size without checksum
    len: u64,          // Cell count
}

impl Footer {
    // Recover footer from bytes
    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::BadSSTableFooter);
        }
        if from_le_bytes_32(&data[20..24]) as u32 != TABLE_MAGIC {
            return Err(Error::BadSSTableFooter);
        }

        Ok(Footer {
            index_offset: from_le_bytes_64(&data[0..8]),
            index_size: from_le_bytes_32(&data[8..12]),
            len: from_le_bytes_64(&data[12..20]),
        })
    }

    // Convert Footer into bytes
    fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut footer = [0; FOOTER_SIZE];
        footer[0..8].copy_from_slice(&self.index_offset.to_le_bytes());
        footer[8..12].copy_from_slice(&(self.index_size as u32).to_le_bytes());
        footer[12..20].copy_from_slice(&self.len.to_le_bytes());
        footer[20..24].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        footer
    }
}

#[derive(Debug)]
struct BlockHandle {
    last_key: Bytes,
    offset: u64, // Data block offset in sstable file
    size: usize, // Data block size in sstable file, checksum excluded
}

impl BlockHandle {
    fn decode(last_key: Bytes, value: &[u8]) -> Result<Self> {
        if value.len() != BLOCK_HANDLE_SIZE {
            return Err(Error::BadSSTable);
        }
        Ok(BlockHandle {
            last_key,
            offset: from_le_bytes_64(&value[0..8]),
            size: from_le_bytes_32(&value[8..12]),
        })
    }

    fn encode(offset: u64, size: usize) -> [u8; BLOCK_HANDLE_SIZE] {
        let mut value = [0; BLOCK_HANDLE_SIZE];
        value[0..8].copy_from_slice(&offset.to_le_bytes());
        value[8..12].copy_from_slice(&(size as u32).to_le_bytes());
        value
    }
}

// Build a single sstable, use leveldb definition without filter block.
pub struct SSTableBuilder<W: Write> {
    writer: W,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    offset: u64,
    len: u64,
}

impl<W: Write> SSTableBuilder<W> {
    pub fn new(writer: W) -> Self {
        SSTableBuilder {
            writer,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            last_key: Vec::with_capacity(128),
            offset: 0,
            len: 0,
        }
    }

    // Add a new cell, keys must be strictly increasing
    pub fn add(&mut self, cell: &Cell) -> Result<()> {
        debug_assert!(self.len == 0 || cell.key()[..] > self.last_key[..]);
        let value = cell.value().to_bytes();
        check_entry_size(cell.key().len(), value.len())?;
        self.data_block.add(cell.key(), &value);
        self.last_key.clear();
        self.last_key.extend_from_slice(cell.key());
        self.len += 1;

        // Flush if block size is bigger enough, add a index
        if self.data_block.size_estimate() > BLOCK_DEFAULT_SIZE {
            self.flush_data_block()?;
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    // Finish a table construction and give back the writer
    pub fn finish(mut self) -> Result<W> {
        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        // Append index block
        let index = self.index_block.finish();
        let index_offset = self.offset;
        self.write_with_checksum(&index)?;

        // Append footer
        let footer = Footer {
            index_offset,
            index_size: index.len(),
            len: self.len,
        };
        self.writer.write_all(&footer.to_bytes())?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        let data = self.data_block.finish();
        let offset = self.offset;
        self.write_with_checksum(&data)?;
        self.index_block
            .add(&self.last_key, &BlockHandle::encode(offset, data.len()));
        Ok(())
    }

    fn write_with_checksum(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.write_all(&checksum(data).to_le_bytes())?;
        self.offset += (data.len() + CHECKSUM_SIZE) as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::MAX_ENTRY_SIZE;
    use crate::util::test_case::{generate_random_bytes, generate_step_by_bytes};
    use tempfile::tempdir;

    fn living(key: &Bytes, value: &Bytes) -> Result<Cell> {
        Ok(Cell::new(key.clone(), Value::Living(value.clone())))
    }

    #[test]
    fn test_table_build_and_iterate_with_random_case() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("1.dat");

        let mut test_case_key = generate_random_bytes(1000, 1000);
        test_case_key.sort();
        test_case_key.dedup();
        let test_case_value = generate_random_bytes(test_case_key.len(), 10 * 1024);

        let written = SSTable::serialize(
            &path,
            test_case_key
                .iter()
                .zip(test_case_value.iter())
                .map(|(k, v)| living(k, v)),
        )
        .unwrap();
        assert_eq!(written, test_case_key.len() as u64);

        let table = SSTable::open(1, &path).unwrap();
        assert_eq!(table.generation(), 1);
        assert_eq!(table.len(), written);
        assert!(table.index.len() > 1);

        let cells: Vec<_> = table.iter(b"").unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(cells.len(), test_case_key.len());
        for (cell, (key, value)) in cells
            .iter()
            .zip(test_case_key.iter().zip(test_case_value.iter()))
        {
            assert_eq!(cell.key(), key);
            assert_eq!(cell.value(), &Value::Living(value.clone()));
        }
    }

    #[test]
    fn test_table_iterate_from_key() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("0.dat");
        let keys = generate_step_by_bytes(2000);
        let value = Bytes::from(vec![b'v'; 64]);
        SSTable::serialize(&path, keys.iter().map(|k| living(k, &value))).unwrap();
        let table = SSTable::open(0, &path).unwrap();

        for start in [0, 1, 63, 64, 1000, 1999] {
            let mut iter = table.iter(&keys[start]).unwrap();
            assert_eq!(iter.next().unwrap().unwrap().key(), &keys[start]);
            assert_eq!(iter.count(), 1999 - start);
        }

        // between two keys, the next one is the first
        let mut iter = table.iter(b"00000500a").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key(), &keys[501]);
        // past the last key
        assert!(table.iter(b"00002000").unwrap().next().is_none());
    }

    #[test]
    fn test_table_keeps_tombstone_and_expiration() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("3.dat");
        let cells = vec![
            Cell::new(Bytes::from_static(b"a"), Value::Tombstone),
            Cell::new(
                Bytes::from_static(b"b"),
                Value::Expiring(Bytes::from_static(b"soon"), 42),
            ),
            Cell::new(Bytes::from_static(b"c"), Value::Living(Bytes::new())),
        ];
        SSTable::serialize(&path, cells.clone().into_iter().map(Ok)).unwrap();

        let table = SSTable::open(3, &path).unwrap();
        let read: Vec<_> = table.iter(b"").unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(read, cells);
    }

    #[test]
    fn test_empty_table() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("0.dat");
        SSTable::serialize(&path, std::iter::empty()).unwrap();

        let table = SSTable::open(0, &path).unwrap();
        assert!(table.is_empty());
        assert!(table.iter(b"").unwrap().next().is_none());
    }

    #[test]
    fn test_serialize_stops_on_source_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("0.tmp");
        let cells = vec![
            living(&Bytes::from_static(b"a"), &Bytes::from_static(b"1")),
            Err(Error::BadSSTableBlock),
        ];
        assert!(matches!(
            SSTable::serialize(&path, cells),
            Err(Error::BadSSTableBlock)
        ));
    }

    #[test]
    fn test_open_corrupted_table() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("0.dat");
        let keys = generate_step_by_bytes(500);
        SSTable::serialize(&path, keys.iter().map(|k| living(k, k))).unwrap();
        let origin = std::fs::read(&path).unwrap();

        // too short
        std::fs::write(&path, &origin[..10]).unwrap();
        assert!(SSTable::open(0, &path).unwrap_err().is_corruption());

        // bad magic
        let mut data = origin.clone();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(SSTable::open(0, &path).unwrap_err().is_corruption());

        // index checksum mismatch
        let mut data = origin.clone();
        let index_offset = from_le_bytes_64(&data[data.len() - FOOTER_SIZE..][0..8]) as usize;
        data[index_offset] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(SSTable::open(0, &path).unwrap_err().is_corruption());

        // data block checksum mismatch is reported while iterating
        let mut data = origin;
        data[0] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        let table = SSTable::open(0, &path).unwrap();
        let mut iter = table.iter(b"").unwrap();
        assert!(iter.next().unwrap().unwrap_err().is_corruption());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_open_table_with_overflowing_offsets() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("0.dat");
        let keys = generate_step_by_bytes(10);
        SSTable::serialize(&path, keys.iter().map(|k| living(k, k))).unwrap();
        let origin = std::fs::read(&path).unwrap();
        let footer_at = origin.len() - FOOTER_SIZE;

        // index offset at the end of the address space, magic untouched
        let mut data = origin.clone();
        data[footer_at..footer_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            SSTable::open(0, &path),
            Err(Error::BadSSTableFooter)
        ));

        // a block handle pointing past the end, rewritten with a valid index
        let footer = Footer::from_bytes(&origin[footer_at..]).unwrap();
        let mut index = BlockBuilder::new();
        index.add(&keys[9], &BlockHandle::encode(u64::MAX - 2, 16));
        let index = index.finish();
        let mut data = origin[..footer.index_offset as usize].to_vec();
        data.extend_from_slice(&index);
        data.extend_from_slice(&checksum(&index).to_le_bytes());
        let footer = Footer {
            index_offset: footer.index_offset,
            index_size: index.len(),
            len: footer.len,
        };
        data.extend_from_slice(&footer.to_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(SSTable::open(0, &path), Err(Error::BadSSTable)));
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        assert!(check_entry_size(16, 1024).is_ok());
        assert!(check_entry_size(0, MAX_ENTRY_SIZE).is_ok());
        assert!(matches!(
            check_entry_size(1, MAX_ENTRY_SIZE),
            Err(Error::OversizedEntry(_))
        ));
        assert!(check_entry_size(usize::MAX, 1).is_err());
    }

    #[test]
    fn test_iterator_survives_unlink() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("7.dat");
        let keys = generate_step_by_bytes(100);
        SSTable::serialize(&path, keys.iter().map(|k| living(k, k))).unwrap();

        let table = SSTable::open(7, &path).unwrap();
        let iter = table.iter(b"").unwrap();
        std::fs::rename(&path, temp_dir.path().join("7_old.dat")).unwrap();
        assert_eq!(iter.map(|c| c.unwrap()).count(), 100);
    }
}
