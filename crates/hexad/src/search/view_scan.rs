//! Scan over a materialized view: the precomputed rows of a chain pattern,
//! substituted for the two index scans and the join they would need.

use std::sync::Arc;

use super::{
    cancellable, single_fragment_stream, Definedness, ExecutionContext, Operator,
    QueryExecutionTree, TableFragment, TableStream, Variable, VariableColumns,
};
use crate::index::views::MaterializedView;
use crate::{IdTable, LocalVocab, Result};

#[derive(Clone, Debug)]
pub struct ViewScan {
    view: Arc<MaterializedView>,
    /// The query's variables for the chain's `(s, m, o)` columns.
    variables: [Variable; 3],
}

impl ViewScan {
    pub fn new(view: Arc<MaterializedView>, variables: [Variable; 3]) -> ViewScan {
        ViewScan { view, variables }
    }

    pub fn view(&self) -> &Arc<MaterializedView> {
        &self.view
    }
}

impl Operator for ViewScan {
    fn result_width(&self) -> usize {
        3
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        vec![0, 1, 2]
    }

    fn variable_columns(&self) -> VariableColumns {
        self.variables
            .iter()
            .enumerate()
            .map(|(column, variable)| (variable.clone(), (column, Definedness::AlwaysDefined)))
            .collect()
    }

    fn cache_key(&self) -> String {
        let (first, second) = self.view.predicates();
        format!("ViewScan({}, p=({first:?},{second:?}))", self.view.definition().name)
    }

    fn size_estimate(&self) -> u64 {
        self.view.rows().len() as u64
    }

    fn cost_estimate(&self) -> u64 {
        self.view.rows().len() as u64
    }

    fn known_empty_result(&self) -> bool {
        self.view.rows().is_empty()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        Vec::new()
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let mut table = IdTable::with_row_capacity(3, self.view.rows().len(), context.budget.clone())?;
        for row in self.view.rows() {
            table.push_row(row)?;
        }
        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab: LocalVocab::new() }),
            context.cancellation.clone(),
        ))
    }
}
