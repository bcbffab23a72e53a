use super::{
    cell::{Cell, Value},
    Result,
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    ops::Bound::{self, Excluded, Included, Unbounded},
    sync::Arc,
};

const ENTRY_OVERHEAD: usize = 16; // rough per-entry bookkeeping of the map

// Implement kv table of one generation
#[derive(Debug)]
pub struct KVTable {
    generation: u64,
    entries: BTreeMap<Bytes, Value>,
    size: usize,
}

impl KVTable {
    // Create a new empty table
    #[inline]
    pub fn new(generation: u64) -> KVTable {
        KVTable {
            generation,
            entries: BTreeMap::default(),
            size: 0,
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Return if kvtable is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Get length of inner map
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Approximate bytes held by the table
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    // Set key value pair into table, replacing the previous one
    pub fn set(&mut self, key: Bytes, value: Value) {
        let added = entry_size(&key, &value);
        if let Some(old) = self.entries.insert(key.clone(), value) {
            self.size -= entry_size(&key, &old);
        }
        self.size += added;
    }

    // Get iterator of the whole table
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Cell> + '_ {
        self.entries
            .iter()
            .map(|(key, value)| Cell::new(key.clone(), value.clone()))
    }

    /// Copy every cell with key `>= from`, used on the table still taking writes
    pub fn snapshot_from(&self, from: &[u8]) -> Vec<Cell> {
        self.entries
            .range::<[u8], _>((Included(from), Unbounded))
            .map(|(key, value)| Cell::new(key.clone(), value.clone()))
            .collect()
    }

    /// Copy the cell of `key` if any
    pub fn snapshot_key(&self, key: &[u8]) -> Option<Cell> {
        self.entries
            .get_key_value(key)
            .map(|(key, value)| Cell::new(key.clone(), value.clone()))
    }

    /// Lazy iteration over a sealed table, starting at `from`
    pub fn cursor(self: &Arc<Self>, from: &[u8]) -> KVTableIter {
        KVTableIter {
            table: Arc::clone(self),
            bound: Included(Bytes::copy_from_slice(from)),
        }
    }
}

#[inline]
fn entry_size(key: &[u8], value: &Value) -> usize {
    key.len() + value.encode_bytes_len() + ENTRY_OVERHEAD
}

// Cursor keeps the last yielded key instead of a borrow of the map
pub struct KVTableIter {
    table: Arc<KVTable>,
    bound: Bound<Bytes>,
}

impl Iterator for KVTableIter {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self
            .table
            .entries
            .range::<Bytes, _>((self.bound.clone(), Unbounded))
            .next()?;
        self.bound = Excluded(key.clone());
        Some(Ok(Cell::new(key.clone(), value.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_case::{generate_random_bytes, generate_step_by_bytes};

    #[test]
    fn test_kv_table_iter() {
        let test_count = 1000;

        let test_case_key = generate_random_bytes(test_count, 1000);
        let test_case_value = generate_random_bytes(test_count, 10 * 1024);

        let mut kv: Vec<_> = test_case_key
            .into_iter()
            .zip(test_case_value.into_iter().map(Value::Living))
            .collect();
        let mut table = KVTable::new(0);

        for (key, value) in kv.iter() {
            table.set(key.clone(), value.clone());
        }

        // Later duplicates overwrite earlier ones
        kv.reverse();
        kv.sort_by_key(|elem| elem.0.clone());
        kv.dedup_by_key(|elem| elem.0.clone());
        assert_eq!(table.len(), kv.len());

        for (cell, (k, v)) in table.iter().zip(kv.iter()) {
            assert_eq!(cell.key(), k);
            assert_eq!(cell.value(), v);
        }
    }

    #[test]
    fn test_kv_table_size_accounting() {
        let mut table = KVTable::new(3);
        assert_eq!(table.size(), 0);

        let key = Bytes::from_static(b"key");
        table.set(key.clone(), Value::Living(Bytes::from(vec![0; 100])));
        let first = table.size();
        assert_eq!(first, 3 + 101 + ENTRY_OVERHEAD);

        // overwrite replaces instead of adding up
        table.set(key.clone(), Value::Tombstone);
        assert_eq!(table.size(), 3 + 1 + ENTRY_OVERHEAD);
        assert!(table.snapshot_from(&key)[0].is_tombstone());
        assert_eq!(table.generation(), 3);
    }

    #[test]
    fn test_kv_table_cursor_and_snapshot() {
        let keys = generate_step_by_bytes(100);
        let mut table = KVTable::new(1);
        for key in keys.iter() {
            table.set(key.clone(), Value::Living(key.clone()));
        }
        let table = Arc::new(table);

        let cells: Vec<_> = table.cursor(&keys[40]).map(|c| c.unwrap()).collect();
        assert_eq!(cells.len(), 60);
        assert_eq!(cells[0].key(), &keys[40]);
        assert_eq!(cells[59].key(), &keys[99]);

        let snapshot = table.snapshot_from(b"00000095x");
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].key(), &keys[96]);

        assert!(table.cursor(b"1").next().is_none());
        assert_eq!(table.cursor(b"").count(), 100);
    }
}
