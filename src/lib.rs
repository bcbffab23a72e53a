mod engine;
mod util;

pub use engine::{Config, Engine, EngineIter, Error, Result};
