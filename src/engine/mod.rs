mod block;
mod cell;
mod config;
mod db;
mod error;
mod flush;
mod kvtable;
mod memtable;
mod merge;
mod sstable;
mod tables;

pub use config::Config;
pub use db::{Engine, EngineIter};
pub use error::Error;

// Module result type
pub type Result<T> = std::result::Result<T, Error>;
