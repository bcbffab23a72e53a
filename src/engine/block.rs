use super::{Error, Result};
use crate::util::from_le_bytes_32;
use bytes::Bytes;
use std::mem::size_of;

const RESTART_INTERVAL: usize = 16;
const ENTRY_HEADER: usize = 12; // shared + non_shared + value_len, 4+4+4
const BLOCK_BUFFER_DEFAULT_SIZE: usize = 8 * 1024; // 8kb

// Lengths and offsets are stored as u32, keep room for the rest of the block
pub const MAX_ENTRY_SIZE: usize = u32::MAX as usize - 64 * 1024;

/// Check that a key and its encoded value fit in a single block entry.
pub fn check_entry_size(key_len: usize, value_len: usize) -> Result<()> {
    match key_len.checked_add(value_len) {
        Some(size) if size <= MAX_ENTRY_SIZE => Ok(()),
        Some(size) => Err(Error::OversizedEntry(size)),
        None => Err(Error::OversizedEntry(usize::MAX)),
    }
}

// Build Key-Value data block, use leveldb definition.
// Keys share their prefix with the previous key, except at restart points
// where the full key is stored.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    last_key: Vec<u8>,
    restarts: Vec<usize>, // byte offset of every restart entry
    counter: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder {
            buffer: Vec::with_capacity(BLOCK_BUFFER_DEFAULT_SIZE),
            last_key: Vec::with_capacity(128),
            restarts: Vec::with_capacity(16),
            counter: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counter == 0
    }

    #[inline]
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + (self.restarts.len() + 1) * size_of::<u32>()
    }

    // Key-value pair must be added by lexicographic order of key
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.is_empty() || key > &self.last_key[..]);

        let shared_prefix_count = if self.counter % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buffer.len());
            0
        } else {
            key.iter()
                .zip(self.last_key.iter())
                .take_while(|x| x.0 == x.1)
                .count()
        };
        let non_shared_prefix_count = key.len() - shared_prefix_count;

        // build length field
        self.buffer
            .extend_from_slice(&(shared_prefix_count as u32).to_le_bytes());
        self.buffer
            .extend_from_slice(&(non_shared_prefix_count as u32).to_le_bytes());
        self.buffer
            .extend_from_slice(&(value.len() as u32).to_le_bytes());

        // build kv field
        self.buffer.extend_from_slice(&key[shared_prefix_count..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared_prefix_count);
        self.last_key.extend_from_slice(&key[shared_prefix_count..]);
        self.counter += 1;
    }

    // Append the restart trailer, hand out the block and start a new one
    pub fn finish(&mut self) -> Bytes {
        for offset in self.restarts.iter() {
            self.buffer
                .extend_from_slice(&(*offset as u32).to_le_bytes());
        }
        self.buffer
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        let block = std::mem::take(&mut self.buffer);
        self.last_key.clear();
        self.restarts.clear();
        self.counter = 0;
        block.into()
    }
}

pub struct Block {
    data: Bytes,
    restarts: Vec<usize>,
}

impl Block {
    // Construct a new block from bytes built by BlockBuilder
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        let data_size = data.len();
        if data_size < 4 {
            return Err(Error::BadSSTableBlock);
        }
        let restart_count = from_le_bytes_32(&data[data_size - 4..]);

        // Trailer holds restart_count offsets plus the count itself
        let trailer_size = restart_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .ok_or(Error::BadSSTableBlock)?;
        if data_size < trailer_size {
            return Err(Error::BadSSTableBlock);
        }
        let restart_start = data_size - trailer_size;

        let mut restarts = Vec::with_capacity(restart_count);
        for offset in (restart_start..data_size - 4).step_by(4) {
            let restart = from_le_bytes_32(&data[offset..offset + 4]);
            if restart >= restart_start {
                return Err(Error::BadSSTableBlock);
            }
            restarts.push(restart);
        }
        // A block with entries always restarts at its first one
        if restarts.first().map_or(restart_start != 0, |first| *first != 0) {
            return Err(Error::BadSSTableBlock);
        }

        Ok(Block {
            data: data.slice(0..restart_start),
            restarts,
        })
    }

    // Position an iterator on the first key greater or equal than target
    pub fn seek(self, target: &[u8]) -> Result<BlockIntoIterator> {
        // Restart entries store full keys, binary search them first
        let mut left = 0;
        let mut right = self.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let entry = parse_entry(&self.data, self.restarts[mid])?;
            if entry.shared != 0 {
                return Err(Error::BadSSTableBlock);
            }
            if &self.data[entry.key.clone()] < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        // Scan forward from the last restart whose key is below target
        let offset = left.checked_sub(1).map_or(0, |idx| self.restarts[idx]);
        let mut iter = BlockIntoIterator {
            block: self,
            offset,
            last_key: Vec::with_capacity(128),
            peeked: None,
        };
        while let Some(pair) = iter.next() {
            let (key, value) = pair?;
            if &key[..] >= target {
                iter.peeked = Some((key, value));
                break;
            }
        }
        Ok(iter)
    }
}

impl IntoIterator for Block {
    type Item = Result<(Bytes, Bytes)>;
    type IntoIter = BlockIntoIterator;

    fn into_iter(self) -> BlockIntoIterator {
        BlockIntoIterator {
            block: self,
            offset: 0,
            last_key: Vec::with_capacity(128),
            peeked: None,
        }
    }
}

struct Entry {
    shared: usize,
    key: std::ops::Range<usize>,
    value: std::ops::Range<usize>,
}

// Parse the entry at offset, key range covers the non-shared part only
fn parse_entry(data: &[u8], offset: usize) -> Result<Entry> {
    let header_end = offset + ENTRY_HEADER;
    if header_end > data.len() {
        return Err(Error::BadSSTableBlock);
    }

    let shared = from_le_bytes_32(&data[offset..offset + 4]);
    let non_shared = from_le_bytes_32(&data[offset + 4..offset + 8]);
    let value_length = from_le_bytes_32(&data[offset + 8..header_end]);

    let value_offset = header_end + non_shared;
    let next_offset = value_offset + value_length;
    if next_offset > data.len() {
        return Err(Error::BadSSTableBlock);
    }

    Ok(Entry {
        shared,
        key: header_end..value_offset,
        value: value_offset..next_offset,
    })
}

// Owned block iteration, yields key and raw value
pub struct BlockIntoIterator {
    block: Block,
    offset: usize,
    last_key: Vec<u8>,
    peeked: Option<(Bytes, Bytes)>,
}

impl Iterator for BlockIntoIterator {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pair) = self.peeked.take() {
            return Some(Ok(pair));
        }
        if self.offset >= self.block.data.len() {
            return None;
        }

        let data = &self.block.data;
        match parse_entry(data, self.offset) {
            Ok(entry) if entry.shared <= self.last_key.len() => {
                // Advance state
                self.last_key.truncate(entry.shared);
                self.last_key.extend_from_slice(&data[entry.key]);
                self.offset = entry.value.end;

                let key = Bytes::copy_from_slice(&self.last_key);
                Some(Ok((key, data.slice(entry.value))))
            }
            Ok(_) => {
                self.offset = data.len();
                Some(Err(Error::BadSSTableBlock))
            }
            Err(e) => {
                // Error happened, stop iteration
                self.offset = data.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_case::{generate_random_bytes, generate_step_by_bytes};

    fn build(keys: &[Bytes], values: &[Bytes]) -> Block {
        let mut builder = BlockBuilder::new();
        for (key, value) in keys.iter().zip(values.iter()) {
            builder.add(key, value);
        }
        Block::from_bytes(builder.finish()).unwrap()
    }

    #[test]
    fn test_block_build_and_iterate_with_random_case() {
        let test_count = 1000;
        let mut test_case_key = generate_random_bytes(test_count, 100);
        test_case_key.sort();
        test_case_key.dedup();
        let test_case_value = generate_random_bytes(test_case_key.len(), 1024);

        let block = build(&test_case_key, &test_case_value);
        let pairs: Vec<_> = block.into_iter().map(|pair| pair.unwrap()).collect();
        assert_eq!(pairs.len(), test_case_key.len());
        for ((key, value), (k, v)) in pairs
            .iter()
            .zip(test_case_key.iter().zip(test_case_value.iter()))
        {
            assert_eq!(key, k);
            assert_eq!(value, v);
        }
    }

    #[test]
    fn test_block_seek() {
        let keys = generate_step_by_bytes(100);

        // exact hit at a restart and in the middle of a restart interval
        for target in [0, 16, 17, 99] {
            let mut iter = build(&keys, &keys).seek(&keys[target]).unwrap();
            let (key, value) = iter.next().unwrap().unwrap();
            assert_eq!(key, keys[target]);
            assert_eq!(value, keys[target]);
            assert_eq!(iter.count(), 99 - target);
        }

        // between keys and past the end
        let mut iter = build(&keys, &keys).seek(b"00000041x").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, keys[42]);
        let mut iter = build(&keys, &keys).seek(b"1").unwrap();
        assert!(iter.next().is_none());
        let mut iter = build(&keys, &keys).seek(b"").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, keys[0]);
    }

    #[test]
    fn test_empty_block() {
        let mut builder = BlockBuilder::new();
        assert!(builder.is_empty());
        let block = Block::from_bytes(builder.finish()).unwrap();
        assert!(block.seek(b"a").unwrap().next().is_none());
    }

    #[test]
    fn test_bad_block() {
        assert!(matches!(
            Block::from_bytes(Bytes::from_static(&[1, 0])),
            Err(Error::BadSSTableBlock)
        ));
        // restart count larger than the block
        assert!(matches!(
            Block::from_bytes(Bytes::from_static(&[9, 0, 0, 0])),
            Err(Error::BadSSTableBlock)
        ));

        // truncated entry
        let keys = generate_step_by_bytes(4);
        let mut builder = BlockBuilder::new();
        for key in keys.iter() {
            builder.add(key, b"value");
        }
        let data = builder.finish();
        let mut corrupted = data[..data.len() - 8].to_vec();
        corrupted.extend_from_slice(&0u32.to_le_bytes());
        corrupted.extend_from_slice(&1u32.to_le_bytes());
        corrupted[4] = 0xff; // non_shared length overflows the block
        let block = Block::from_bytes(corrupted.into()).unwrap();
        assert!(block.into_iter().any(|pair| pair.is_err()));
    }
}
