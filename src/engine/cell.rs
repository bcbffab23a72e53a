use super::{Error, Result};
use crate::util::from_le_bytes_64;
use bytes::Bytes;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

const TOMBSTONE_VALUE_TYPE: u8 = 0;
const LIVING_VALUE_TYPE: u8 = 1;
const EXPIRING_VALUE_TYPE: u8 = 2;

const VALUE_TYPE_HEADER: usize = 1;
const EXPIRING_VALUE_TYPE_HEADER: usize = 9; // type + expire_at

// LSM-Tree value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Living(Bytes),

    // Payload that disappears once the timestamp (ms since epoch) has passed
    Expiring(Bytes, u64),

    // Deleted value
    Tombstone,
}

impl Value {
    pub fn new(data: Bytes, expire_at: Option<SystemTime>) -> Self {
        match expire_at {
            Some(at) => Value::Expiring(data, to_millis(at)),
            None => Value::Living(data),
        }
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self, Value::Expiring(_, expire_at) if *expire_at <= now)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut v = Vec::with_capacity(self.encode_bytes_len());
        // IO always success on Vec
        self.encode_to(&mut v).ok();
        v.into()
    }

    // Parse value from the bytes produced by encode_to
    pub fn decode_from_bytes(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::IllegalValueBinary);
        }

        match data[0] {
            LIVING_VALUE_TYPE => Ok(Value::Living(data.slice(VALUE_TYPE_HEADER..))),
            EXPIRING_VALUE_TYPE => {
                if data.len() < EXPIRING_VALUE_TYPE_HEADER {
                    return Err(Error::IllegalValueBinary);
                }
                let expire_at = from_le_bytes_64(&data[1..EXPIRING_VALUE_TYPE_HEADER]);
                Ok(Value::Expiring(
                    data.slice(EXPIRING_VALUE_TYPE_HEADER..),
                    expire_at,
                ))
            }
            TOMBSTONE_VALUE_TYPE => {
                if data.len() != VALUE_TYPE_HEADER {
                    return Err(Error::IllegalValueBinary);
                }
                Ok(Value::Tombstone)
            }
            _ => Err(Error::IllegalValueBinary),
        }
    }

    //  Get pre-alloc bytes space for encode_to api
    #[inline]
    pub fn encode_bytes_len(&self) -> usize {
        match self {
            Value::Tombstone => VALUE_TYPE_HEADER,
            Value::Living(data) => VALUE_TYPE_HEADER + data.len(),
            Value::Expiring(data, _) => EXPIRING_VALUE_TYPE_HEADER + data.len(),
        }
    }

    // Encode into bytes and write to given Write
    pub fn encode_to<W: Write>(&self, mut w: W) -> Result<()> {
        match self {
            Value::Tombstone => w.write_all(&[TOMBSTONE_VALUE_TYPE])?,
            Value::Living(data) => {
                w.write_all(&[LIVING_VALUE_TYPE])?;
                w.write_all(data)?;
            }
            Value::Expiring(data, expire_at) => {
                w.write_all(&[EXPIRING_VALUE_TYPE])?;
                w.write_all(&expire_at.to_le_bytes())?;
                w.write_all(data)?;
            }
        };
        Ok(())
    }
}

/// A single versioned record: a key and what the latest write did to it.
///
/// Cells order by key first; the value order only makes the ordering total.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cell {
    key: Bytes,
    value: Value,
}

impl Cell {
    #[inline]
    pub fn new(key: Bytes, value: Value) -> Self {
        Cell { key, value }
    }

    #[inline]
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_tombstone()
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.value.is_expired(now)
    }

    // Key and payload, a tombstone has an empty payload
    pub fn into_pair(self) -> (Bytes, Bytes) {
        let payload = match self.value {
            Value::Living(data) | Value::Expiring(data, _) => data,
            Value::Tombstone => Bytes::new(),
        };
        (self.key, payload)
    }
}

#[inline]
pub fn to_millis(at: SystemTime) -> u64 {
    // Times before the epoch are already expired
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[inline]
pub fn now_millis() -> u64 {
    to_millis(SystemTime::now())
}
