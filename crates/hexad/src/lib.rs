#![allow(clippy::type_complexity)]

pub mod cancellation;
pub mod config;
mod error;
pub mod id_table;
pub mod index;
pub mod local_vocab;
pub mod prefilter;
pub mod search;
pub mod value_id;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod test_index;

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;

use fxhash::{FxHasher32, FxHasher64};

pub use self::cancellation::CancellationHandle;
pub use self::config::EngineConfig;
pub use self::error::{Error, InternalError, UserError};
pub use self::id_table::{IdTable, MemoryBudget};
pub use self::index::delta_triples::{DeltaTriples, DeltaTriplesCount};
pub use self::index::permutation::{BlockMetadata, Permutation};
pub use self::index::Index;
pub use self::local_vocab::LocalVocab;
pub use self::prefilter::PrefilterExpression;
pub use self::search::{execute_select, ExecutionContext, Operation, Operator, QueryExecutionTree};
pub use self::value_id::{Comparison, Datatype, ValueId};

pub type Result<T> = std::result::Result<T, error::Error>;

pub type FastMap4<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher32>>;
pub type FastMap8<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher64>>;
pub type FastSet8<T> = HashSet<T, BuildHasherDefault<FxHasher64>>;

/// A dense index into the on-disk vocabulary.
pub type VocabIndex = u64;

/// A triple of ids, in the column order of whatever permutation is in use.
pub type IdTriple = [ValueId; 3];

/// The version stamped into `meta.json`; bumped whenever any on-disk layout
/// changes incompatibly.
pub const INDEX_FORMAT_VERSION: u32 = 3;

/// The special predicate binding a text record to an entity it mentions.
pub const CONTAINS_ENTITY_PREDICATE: &str = "ql:contains-entity";
/// The special predicate binding a text record to a word it contains.
pub const CONTAINS_WORD_PREDICATE: &str = "ql:contains-word";
