use std::{io, str};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal: {0}.")]
    InternalError(#[from] InternalError),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    UserError(#[from] UserError),
}

impl Error {
    /// Whether this error is the cancellation marker surfaced by a result
    /// stream after its cancellation handle fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::UserError(UserError::Cancelled))
    }
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error("index file `{path}` is corrupt: {reason}")]
    CorruptIndex { path: String, reason: String },
    #[error(
        "the geometry info file was written with format version {found} \
         but this build requires version {required}; rebuild the index"
    )]
    GeoInfoVersionMismatch { found: u32, required: u32 },
    #[error(
        "the index was built with format version {found} \
         but this build requires version {required}; rebuild the index"
    )]
    IndexVersionMismatch { found: u32, required: u32 },
    #[error("a thread of the geometry preprocessing pipeline panicked")]
    GeoPipelinePanicked,
    #[error("vocabulary index {index} is out of bounds ({len} words)")]
    VocabIndexOutOfBounds { index: u64, len: u64 },
    #[error("a local vocab id references chunk {chunk} which is not alive in this result")]
    DeadLocalVocabChunk { chunk: u32 },
    #[error(transparent)]
    Fst(#[from] fst::Error),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Utf8(#[from] str::Utf8Error),
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("the query was cancelled")]
    Cancelled,
    #[error(
        "memory budget exhausted: the query needed {requested} more bytes \
         on top of {used} already in use (budget: {budget} bytes)"
    )]
    MemoryBudgetExceeded { requested: usize, used: usize, budget: usize },
    #[error("the entity `{entity}` passed to ql:contains-entity is not part of the knowledge graph")]
    UnknownTextScanEntity { entity: String },
    #[error("invalid regular expression `{pattern}`: {source}")]
    InvalidRegex { pattern: String, source: regex::Error },
    #[error("query parse error: {0}")]
    QueryParse(String),
    #[error("variable `{0}` is used in the query but never bound by the pattern")]
    UnboundVariable(String),
    #[error("no text index was built for this knowledge graph")]
    NoTextIndex,
    #[error("unknown materialized view `{0}`")]
    UnknownView(String),
    #[error("cannot materialize a view over `{0}`, which is not part of the knowledge graph")]
    UnknownViewPredicate(String),
}
