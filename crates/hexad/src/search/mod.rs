//! Query execution: the operator tree, its shared attributes, and the lazy
//! result streams the operators exchange.
//!
//! Operators form a closed set, dispatched through the [`Operation`] enum
//! over the common [`Operator`] trait. A planned query is a DAG of
//! [`QueryExecutionTree`] nodes behind shared immutable handles; children
//! are shared rather than exclusively owned because alternative subtrees
//! are kept around for cost comparison.

pub mod executor;
pub mod expression;
pub mod index_scan;
pub mod join;
pub mod pattern_cache;
pub mod planner;
pub mod text_scan;
pub mod transitive_path;
pub mod view_scan;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use self::executor::execute_select;
use crate::index::delta_triples::DeltaSnapshot;
use crate::{
    CancellationHandle, EngineConfig, IdTable, Index, LocalVocab, MemoryBudget, Result,
};

/// A SPARQL variable, stored without the leading `?`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable(String);

impl Variable {
    pub fn new(name: impl Into<String>) -> Variable {
        let name = name.into();
        Variable(name.strip_prefix('?').map(str::to_owned).unwrap_or(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// Whether a column can carry the undefined id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definedness {
    AlwaysDefined,
    PossiblyUndefined,
}

/// Variable to `(column, definedness)`; ordered so iteration is stable.
pub type VariableColumns = BTreeMap<Variable, (usize, Definedness)>;

/// One lazily produced piece of a result: a table and the local vocab its
/// ids may reference.
pub struct TableFragment {
    pub table: IdTable,
    pub vocab: LocalVocab,
}

/// The pull-based stream every operator produces.
pub type TableStream = Box<dyn Iterator<Item = Result<TableFragment>> + Send>;

/// Everything an operator needs at compute time. Cloning is cheap; the
/// delta snapshot is taken once per query so all operators observe the same
/// overlay state.
#[derive(Clone)]
pub struct ExecutionContext {
    pub index: Arc<Index>,
    pub delta: Arc<DeltaSnapshot>,
    pub budget: Arc<MemoryBudget>,
    pub cancellation: CancellationHandle,
    pub config: Arc<EngineConfig>,
}

impl ExecutionContext {
    pub fn new(index: Arc<Index>, config: Arc<EngineConfig>) -> ExecutionContext {
        let delta = index.delta().snapshot();
        let budget = MemoryBudget::new(config.memory_budget_bytes);
        ExecutionContext {
            index,
            delta,
            budget,
            cancellation: CancellationHandle::default(),
            config,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationHandle) -> ExecutionContext {
        self.cancellation = cancellation;
        self
    }
}

/// The contract every operator fulfils.
pub trait Operator {
    fn result_width(&self) -> usize;

    /// Column indices the output is sorted by, most significant first.
    fn result_sorted_on(&self) -> Vec<usize>;

    fn variable_columns(&self) -> VariableColumns;

    /// A stable string identifying the operation and its children. Two
    /// trees with equal cache keys produce identical result tables (modulo
    /// row order where unordered); variable renames that do not change
    /// column-to-value bindings do not change the key.
    fn cache_key(&self) -> String;

    fn size_estimate(&self) -> u64;

    fn cost_estimate(&self) -> u64;

    fn known_empty_result(&self) -> bool {
        false
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>>;

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream>;
}

/// The closed set of operators. Cloning an operation clones handles, not
/// subtrees; children stay shared.
#[derive(Clone, Debug)]
pub enum Operation {
    IndexScan(index_scan::IndexScan),
    Join(join::Join),
    OptionalJoin(join::OptionalJoin),
    Union(join::Union),
    Distinct(join::Distinct),
    Sort(join::Sort),
    Filter(join::Filter),
    Bind(join::Bind),
    Values(join::Values),
    TransitivePath(transitive_path::TransitivePath),
    TextScanForWord(text_scan::TextIndexScanForWord),
    TextScanForEntity(text_scan::TextIndexScanForEntity),
    ViewScan(view_scan::ViewScan),
}

macro_rules! dispatch {
    ($self:expr, $operation:ident => $body:expr) => {
        match $self {
            Operation::IndexScan($operation) => $body,
            Operation::Join($operation) => $body,
            Operation::OptionalJoin($operation) => $body,
            Operation::Union($operation) => $body,
            Operation::Distinct($operation) => $body,
            Operation::Sort($operation) => $body,
            Operation::Filter($operation) => $body,
            Operation::Bind($operation) => $body,
            Operation::Values($operation) => $body,
            Operation::TransitivePath($operation) => $body,
            Operation::TextScanForWord($operation) => $body,
            Operation::TextScanForEntity($operation) => $body,
            Operation::ViewScan($operation) => $body,
        }
    };
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::IndexScan(_) => "IndexScan",
            Operation::Join(_) => "Join",
            Operation::OptionalJoin(_) => "OptionalJoin",
            Operation::Union(_) => "Union",
            Operation::Distinct(_) => "Distinct",
            Operation::Sort(_) => "Sort",
            Operation::Filter(_) => "Filter",
            Operation::Bind(_) => "Bind",
            Operation::Values(_) => "Values",
            Operation::TransitivePath(_) => "TransitivePath",
            Operation::TextScanForWord(_) => "TextScanForWord",
            Operation::TextScanForEntity(_) => "TextScanForEntity",
            Operation::ViewScan(_) => "ViewScan",
        }
    }
}

impl Operator for Operation {
    fn result_width(&self) -> usize {
        dispatch!(self, operation => operation.result_width())
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        dispatch!(self, operation => operation.result_sorted_on())
    }

    fn variable_columns(&self) -> VariableColumns {
        dispatch!(self, operation => operation.variable_columns())
    }

    fn cache_key(&self) -> String {
        dispatch!(self, operation => operation.cache_key())
    }

    fn size_estimate(&self) -> u64 {
        dispatch!(self, operation => operation.size_estimate())
    }

    fn cost_estimate(&self) -> u64 {
        dispatch!(self, operation => operation.cost_estimate())
    }

    fn known_empty_result(&self) -> bool {
        dispatch!(self, operation => operation.known_empty_result())
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        dispatch!(self, operation => operation.children())
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        dispatch!(self, operation => operation.compute(context))
    }
}

/// One planned node. The attribute accessors are cached at construction so
/// the planner can compare candidates without re-walking subtrees.
#[derive(Debug)]
pub struct QueryExecutionTree {
    operation: Operation,
    result_width: usize,
    result_sorted_on: Vec<usize>,
    variable_columns: VariableColumns,
    cache_key: String,
    size_estimate: u64,
    cost_estimate: u64,
}

impl QueryExecutionTree {
    pub fn new(operation: Operation) -> Arc<QueryExecutionTree> {
        Arc::new(QueryExecutionTree {
            result_width: operation.result_width(),
            result_sorted_on: operation.result_sorted_on(),
            variable_columns: operation.variable_columns(),
            cache_key: operation.cache_key(),
            size_estimate: operation.size_estimate(),
            cost_estimate: operation.cost_estimate(),
            operation,
        })
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn result_width(&self) -> usize {
        self.result_width
    }

    pub fn result_sorted_on(&self) -> &[usize] {
        &self.result_sorted_on
    }

    pub fn variable_columns(&self) -> &VariableColumns {
        &self.variable_columns
    }

    pub fn column_of(&self, variable: &Variable) -> Option<usize> {
        self.variable_columns.get(variable).map(|&(column, _)| column)
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn size_estimate(&self) -> u64 {
        self.size_estimate
    }

    pub fn cost_estimate(&self) -> u64 {
        self.cost_estimate
    }

    pub fn known_empty_result(&self) -> bool {
        self.operation.known_empty_result()
    }

    pub fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        self.operation.compute(context)
    }

    /// Fully materialises this subtree into one table with one merged
    /// local vocab covering every row.
    pub fn compute_materialised(&self, context: &ExecutionContext) -> Result<TableFragment> {
        let width = self.result_width();
        let mut table = IdTable::new(width, context.budget.clone());
        let mut vocab = LocalVocab::new();
        for fragment in self.compute(context)? {
            context.cancellation.check()?;
            let fragment = fragment?;
            for row in fragment.table.rows() {
                table.push_row(row)?;
            }
            vocab.merge(&fragment.vocab);
        }
        Ok(TableFragment { table, vocab })
    }
}

/// Wraps a stream so the cancellation handle is consulted at every
/// fragment boundary.
pub(crate) fn cancellable(stream: TableStream, handle: CancellationHandle) -> TableStream {
    Box::new(CancellableStream { stream, handle, fired: false })
}

struct CancellableStream {
    stream: TableStream,
    handle: CancellationHandle,
    fired: bool,
}

impl Iterator for CancellableStream {
    type Item = Result<TableFragment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fired {
            return None;
        }
        if let Err(cancelled) = self.handle.check() {
            self.fired = true;
            return Some(Err(cancelled.into()));
        }
        self.stream.next()
    }
}

/// A stream of exactly one already-computed fragment.
pub(crate) fn single_fragment_stream(fragment: TableFragment) -> TableStream {
    Box::new(std::iter::once(Ok(fragment)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_strips_question_mark() {
        assert_eq!(Variable::new("?x"), Variable::new("x"));
        assert_eq!(Variable::new("?x").name(), "x");
        assert_eq!(Variable::new("x").to_string(), "?x");
    }
}
