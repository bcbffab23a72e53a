#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("illegal value binary format")]
    IllegalValueBinary,

    #[error("bad sstable")]
    BadSSTable,

    #[error("bad sstable block")]
    BadSSTableBlock,

    #[error("bad sstable footer")]
    BadSSTableFooter,

    #[error("storage is closed")]
    Closed,

    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("entry of {0} bytes is too large for a table block")]
    OversizedEntry(usize),

    #[error("flush of generation {0} did not complete")]
    FlushIncomplete(u64),
}

impl Error {
    /// Whether the error comes from a malformed table file.
    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::IllegalValueBinary
                | Error::BadSSTable
                | Error::BadSSTableBlock
                | Error::BadSSTableFooter
        )
    }
}
