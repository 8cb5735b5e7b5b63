//! The relational workhorses: inner and optional joins, union, distinct,
//! sort, filter, bind and inline values.
//!
//! Joins pick a merge strategy when both inputs are already sorted on their
//! join column and fall back to hashing otherwise; either way the output is
//! sorted on the join column, which sits at column 0 of the result.

use std::sync::Arc;

use super::expression::{effective_boolean_value, EvalContext, SparqlExpression};
use super::{
    cancellable, single_fragment_stream, Definedness, ExecutionContext, Operator,
    QueryExecutionTree, TableFragment, TableStream, Variable, VariableColumns,
};
use crate::local_vocab::LocalVocabBuilder;
use crate::{FastMap8, IdTable, LocalVocab, Result, ValueId};

/// Layout shared by inner and optional joins: the join value first, then
/// the left side's remaining columns, then the right side's.
fn join_variable_columns(
    left: &Arc<QueryExecutionTree>,
    right: &Arc<QueryExecutionTree>,
    left_col: usize,
    right_col: usize,
    right_possibly_undef: bool,
) -> VariableColumns {
    let mut variables = VariableColumns::new();
    for (variable, &(column, definedness)) in left.variable_columns() {
        let mapped = if column == left_col {
            0
        } else if column < left_col {
            column + 1
        } else {
            column
        };
        variables.insert(variable.clone(), (mapped, definedness));
    }
    let offset = left.result_width();
    for (variable, &(column, definedness)) in right.variable_columns() {
        if column == right_col {
            // The join variable is already bound to column 0.
            continue;
        }
        let mapped = offset + if column < right_col { column } else { column - 1 };
        let definedness = if right_possibly_undef {
            Definedness::PossiblyUndefined
        } else {
            definedness
        };
        variables.insert(variable.clone(), (mapped, definedness));
    }
    variables
}

fn join_row(
    key: ValueId,
    left_row: &[ValueId],
    left_col: usize,
    right_row: &[ValueId],
    right_col: usize,
    out: &mut Vec<ValueId>,
) {
    out.clear();
    out.push(key);
    for (column, &id) in left_row.iter().enumerate() {
        if column != left_col {
            out.push(id);
        }
    }
    for (column, &id) in right_row.iter().enumerate() {
        if column != right_col {
            out.push(id);
        }
    }
}

fn is_sorted_on(tree: &QueryExecutionTree, column: usize) -> bool {
    tree.result_sorted_on().first() == Some(&column)
}

#[derive(Clone, Debug)]
pub struct Join {
    left: Arc<QueryExecutionTree>,
    right: Arc<QueryExecutionTree>,
    left_col: usize,
    right_col: usize,
}

impl Join {
    pub fn new(
        left: Arc<QueryExecutionTree>,
        right: Arc<QueryExecutionTree>,
        left_col: usize,
        right_col: usize,
    ) -> Join {
        debug_assert!(left_col < left.result_width());
        debug_assert!(right_col < right.result_width());
        Join { left, right, left_col, right_col }
    }
}

impl Operator for Join {
    fn result_width(&self) -> usize {
        self.left.result_width() + self.right.result_width() - 1
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        vec![0]
    }

    fn variable_columns(&self) -> VariableColumns {
        join_variable_columns(&self.left, &self.right, self.left_col, self.right_col, false)
    }

    fn cache_key(&self) -> String {
        format!(
            "Join(l={},r={}) [{}] [{}]",
            self.left_col,
            self.right_col,
            self.left.cache_key(),
            self.right.cache_key()
        )
    }

    fn size_estimate(&self) -> u64 {
        self.left.size_estimate().min(self.right.size_estimate())
    }

    fn cost_estimate(&self) -> u64 {
        self.size_estimate()
            + self.left.size_estimate()
            + self.right.size_estimate()
            + self.left.cost_estimate()
            + self.right.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.left.known_empty_result() || self.right.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let left = self.left.compute_materialised(context)?;
        let right = self.right.compute_materialised(context)?;
        let mut table = IdTable::new(self.result_width(), context.budget.clone());
        let mut row = Vec::with_capacity(self.result_width());

        let merge = is_sorted_on(&self.left, self.left_col)
            && is_sorted_on(&self.right, self.right_col);
        if merge {
            merge_join(
                &left.table,
                self.left_col,
                &right.table,
                self.right_col,
                |key, left_row, right_row| {
                    join_row(key, left_row, self.left_col, right_row, self.right_col, &mut row);
                    table.push_row(&row)
                },
            )?;
        } else {
            let by_key = hash_rows(&right.table, self.right_col);
            for left_row in left.table.rows() {
                let key = left_row[self.left_col];
                if key.is_undefined() {
                    continue;
                }
                if let Some(matches) = by_key.get(&key) {
                    for &right_index in matches {
                        join_row(
                            key,
                            left_row,
                            self.left_col,
                            right.table.row(right_index),
                            self.right_col,
                            &mut row,
                        );
                        table.push_row(&row)?;
                    }
                }
            }
            table.sort_by_columns(&[0]);
        }

        let vocab = LocalVocab::merged([&left.vocab, &right.vocab]);
        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab }),
            context.cancellation.clone(),
        ))
    }
}

fn hash_rows(table: &IdTable, column: usize) -> FastMap8<ValueId, Vec<usize>> {
    let mut by_key: FastMap8<ValueId, Vec<usize>> = FastMap8::default();
    for (index, row) in table.rows().enumerate() {
        let key = row[column];
        if !key.is_undefined() {
            by_key.entry(key).or_default().push(index);
        }
    }
    by_key
}

fn merge_join(
    left: &IdTable,
    left_col: usize,
    right: &IdTable,
    right_col: usize,
    mut emit: impl FnMut(ValueId, &[ValueId], &[ValueId]) -> Result<()>,
) -> Result<()> {
    let mut i = 0;
    let mut j = 0;
    while i < left.num_rows() && j < right.num_rows() {
        let a = left.at(i, left_col);
        let b = right.at(j, right_col);
        if a.is_undefined() {
            i += 1;
        } else if b.is_undefined() {
            j += 1;
        } else if a < b {
            i += 1;
        } else if b < a {
            j += 1;
        } else {
            // Emit the full cross product of both equal runs.
            let run_start = j;
            while i < left.num_rows() && left.at(i, left_col) == a {
                let mut k = run_start;
                while k < right.num_rows() && right.at(k, right_col) == a {
                    emit(a, left.row(i), right.row(k))?;
                    k += 1;
                }
                i += 1;
            }
            while j < right.num_rows() && right.at(j, right_col) == a {
                j += 1;
            }
        }
    }
    Ok(())
}

/// Left outer join; unmatched left rows are padded with the undefined id,
/// the identity element for this padding.
#[derive(Clone, Debug)]
pub struct OptionalJoin {
    left: Arc<QueryExecutionTree>,
    right: Arc<QueryExecutionTree>,
    left_col: usize,
    right_col: usize,
}

impl OptionalJoin {
    pub fn new(
        left: Arc<QueryExecutionTree>,
        right: Arc<QueryExecutionTree>,
        left_col: usize,
        right_col: usize,
    ) -> OptionalJoin {
        debug_assert!(left_col < left.result_width());
        debug_assert!(right_col < right.result_width());
        OptionalJoin { left, right, left_col, right_col }
    }
}

impl Operator for OptionalJoin {
    fn result_width(&self) -> usize {
        self.left.result_width() + self.right.result_width() - 1
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        vec![0]
    }

    fn variable_columns(&self) -> VariableColumns {
        join_variable_columns(&self.left, &self.right, self.left_col, self.right_col, true)
    }

    fn cache_key(&self) -> String {
        format!(
            "OptionalJoin(l={},r={}) [{}] [{}]",
            self.left_col,
            self.right_col,
            self.left.cache_key(),
            self.right.cache_key()
        )
    }

    fn size_estimate(&self) -> u64 {
        self.left.size_estimate().max(self.right.size_estimate())
    }

    fn cost_estimate(&self) -> u64 {
        self.size_estimate()
            + self.left.size_estimate()
            + self.right.size_estimate()
            + self.left.cost_estimate()
            + self.right.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.left.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let left = self.left.compute_materialised(context)?;
        let right = self.right.compute_materialised(context)?;
        let by_key = hash_rows(&right.table, self.right_col);
        let mut table = IdTable::new(self.result_width(), context.budget.clone());
        let padding = vec![ValueId::UNDEFINED; self.right.result_width() - 1];
        let mut row = Vec::with_capacity(self.result_width());
        for left_row in left.table.rows() {
            let key = left_row[self.left_col];
            let matches = if key.is_undefined() { None } else { by_key.get(&key) };
            match matches {
                Some(matches) => {
                    for &right_index in matches {
                        join_row(
                            key,
                            left_row,
                            self.left_col,
                            right.table.row(right_index),
                            self.right_col,
                            &mut row,
                        );
                        table.push_row(&row)?;
                    }
                }
                None => {
                    row.clear();
                    row.push(key);
                    for (column, &id) in left_row.iter().enumerate() {
                        if column != self.left_col {
                            row.push(id);
                        }
                    }
                    row.extend_from_slice(&padding);
                    table.push_row(&row)?;
                }
            }
        }
        table.sort_by_columns(&[0]);
        let vocab = LocalVocab::merged([&left.vocab, &right.vocab]);
        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab }),
            context.cancellation.clone(),
        ))
    }
}

/// Concatenation aligned by variable name; variables missing on one side
/// are padded with the undefined id.
#[derive(Clone, Debug)]
pub struct Union {
    left: Arc<QueryExecutionTree>,
    right: Arc<QueryExecutionTree>,
    variables: Vec<Variable>,
}

impl Union {
    pub fn new(left: Arc<QueryExecutionTree>, right: Arc<QueryExecutionTree>) -> Union {
        let mut variables: Vec<Variable> = left.variable_columns().keys().cloned().collect();
        for variable in right.variable_columns().keys() {
            if !variables.contains(variable) {
                variables.push(variable.clone());
            }
        }
        Union { left, right, variables }
    }

    fn column_mapping(&self, child: &QueryExecutionTree) -> Vec<Option<usize>> {
        let columns = child.variable_columns();
        self.variables
            .iter()
            .map(|variable| columns.get(variable).map(|&(column, _)| column))
            .collect()
    }
}

impl Operator for Union {
    fn result_width(&self) -> usize {
        self.variables.len()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        Vec::new()
    }

    fn variable_columns(&self) -> VariableColumns {
        let left = self.left.variable_columns();
        let right = self.right.variable_columns();
        self.variables
            .iter()
            .enumerate()
            .map(|(column, variable)| {
                let definedness = match (left.get(variable), right.get(variable)) {
                    (Some(&(_, Definedness::AlwaysDefined)), Some(&(_, Definedness::AlwaysDefined))) => {
                        Definedness::AlwaysDefined
                    }
                    _ => Definedness::PossiblyUndefined,
                };
                (variable.clone(), (column, definedness))
            })
            .collect()
    }

    fn cache_key(&self) -> String {
        format!("Union [{}] [{}]", self.left.cache_key(), self.right.cache_key())
    }

    fn size_estimate(&self) -> u64 {
        self.left.size_estimate() + self.right.size_estimate()
    }

    fn cost_estimate(&self) -> u64 {
        self.size_estimate() + self.left.cost_estimate() + self.right.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.left.known_empty_result() && self.right.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let width = self.result_width();
        let budget = context.budget.clone();
        let remap = |mapping: Vec<Option<usize>>, stream: TableStream| {
            let budget = budget.clone();
            stream.map(move |fragment| {
                let fragment = fragment?;
                let mut table = IdTable::new(width, budget.clone());
                let mut row = Vec::with_capacity(width);
                for input in fragment.table.rows() {
                    row.clear();
                    row.extend(
                        mapping
                            .iter()
                            .map(|&column| column.map_or(ValueId::UNDEFINED, |c| input[c])),
                    );
                    table.push_row(&row)?;
                }
                Ok(TableFragment { table, vocab: fragment.vocab })
            })
        };
        let left = remap(self.column_mapping(&self.left), self.left.compute(context)?);
        let right = remap(self.column_mapping(&self.right), self.right.compute(context)?);
        Ok(cancellable(Box::new(left.chain(right)), context.cancellation.clone()))
    }
}

/// Deduplication with respect to a set of columns, as required by SELECT
/// DISTINCT: rows equal on `columns` collapse to their first occurrence
/// after sorting.
#[derive(Clone, Debug)]
pub struct Distinct {
    child: Arc<QueryExecutionTree>,
    columns: Vec<usize>,
}

impl Distinct {
    pub fn new(child: Arc<QueryExecutionTree>, columns: Vec<usize>) -> Distinct {
        debug_assert!(columns.iter().all(|&c| c < child.result_width()));
        Distinct { child, columns }
    }
}

impl Operator for Distinct {
    fn result_width(&self) -> usize {
        self.child.result_width()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        self.columns.clone()
    }

    fn variable_columns(&self) -> VariableColumns {
        self.child.variable_columns().clone()
    }

    fn cache_key(&self) -> String {
        format!("Distinct(on={:?}) [{}]", self.columns, self.child.cache_key())
    }

    fn size_estimate(&self) -> u64 {
        self.child.size_estimate()
    }

    fn cost_estimate(&self) -> u64 {
        self.size_estimate() + self.child.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.child.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.child.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let fragment = self.child.compute_materialised(context)?;
        let width = self.result_width();
        let mut table = fragment.table;
        table.sort_by_columns(&self.columns);
        let mut deduped = IdTable::new(width, context.budget.clone());
        let mut previous: Option<Vec<ValueId>> = None;
        for row in table.rows() {
            let key: Vec<ValueId> = self.columns.iter().map(|&c| row[c]).collect();
            if previous.as_ref() != Some(&key) {
                deduped.push_row(row)?;
                previous = Some(key);
            }
        }
        Ok(cancellable(
            single_fragment_stream(TableFragment { table: deduped, vocab: fragment.vocab }),
            context.cancellation.clone(),
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Sort {
    child: Arc<QueryExecutionTree>,
    columns: Vec<usize>,
}

impl Sort {
    pub fn new(child: Arc<QueryExecutionTree>, columns: Vec<usize>) -> Sort {
        debug_assert!(columns.iter().all(|&c| c < child.result_width()));
        Sort { child, columns }
    }
}

impl Operator for Sort {
    fn result_width(&self) -> usize {
        self.child.result_width()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        self.columns.clone()
    }

    fn variable_columns(&self) -> VariableColumns {
        self.child.variable_columns().clone()
    }

    fn cache_key(&self) -> String {
        format!("Sort(on={:?}) [{}]", self.columns, self.child.cache_key())
    }

    fn size_estimate(&self) -> u64 {
        self.child.size_estimate()
    }

    fn cost_estimate(&self) -> u64 {
        // n log n over the child's estimate.
        let size = self.child.size_estimate();
        size * (64 - size.leading_zeros() as u64) + self.child.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.child.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.child.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let mut fragment = self.child.compute_materialised(context)?;
        fragment.table.sort_by_columns(&self.columns);
        Ok(cancellable(single_fragment_stream(fragment), context.cancellation.clone()))
    }
}

#[derive(Clone, Debug)]
pub struct Filter {
    child: Arc<QueryExecutionTree>,
    expression: SparqlExpression,
}

impl Filter {
    pub fn new(child: Arc<QueryExecutionTree>, expression: SparqlExpression) -> Filter {
        Filter { child, expression }
    }
}

impl Operator for Filter {
    fn result_width(&self) -> usize {
        self.child.result_width()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        // Filtering keeps the child's row order.
        self.child.result_sorted_on().to_vec()
    }

    fn variable_columns(&self) -> VariableColumns {
        self.child.variable_columns().clone()
    }

    fn cache_key(&self) -> String {
        format!(
            "Filter({}) [{}]",
            self.expression.cache_key(self.child.variable_columns()),
            self.child.cache_key()
        )
    }

    fn size_estimate(&self) -> u64 {
        (self.child.size_estimate() / 2).max(1)
    }

    fn cost_estimate(&self) -> u64 {
        self.child.size_estimate() + self.child.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.child.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.child.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let expression = self.expression.clone();
        let variable_columns = self.child.variable_columns().clone();
        let child_context = context.clone();
        let width = self.result_width();
        let stream = self.child.compute(context)?.map(move |fragment| {
            let fragment = fragment?;
            let mut builder = LocalVocabBuilder::new();
            let column = {
                let mut eval = EvalContext {
                    table: &fragment.table,
                    variable_columns: &variable_columns,
                    index: &child_context.index,
                    local_vocab: &fragment.vocab,
                    builder: &mut builder,
                };
                expression.evaluate(&mut eval)?
            };
            let mut table = IdTable::new(width, child_context.budget.clone());
            for (row, keep) in fragment.table.rows().zip(&column) {
                if effective_boolean_value(*keep) == Some(true) {
                    table.push_row(row)?;
                }
            }
            let mut vocab = fragment.vocab;
            if !builder.is_empty() {
                vocab.adopt(builder.freeze());
            }
            Ok(TableFragment { table, vocab })
        });
        Ok(cancellable(Box::new(stream), context.cancellation.clone()))
    }
}

#[derive(Clone, Debug)]
pub struct Bind {
    child: Arc<QueryExecutionTree>,
    expression: SparqlExpression,
    target: Variable,
}

impl Bind {
    pub fn new(child: Arc<QueryExecutionTree>, expression: SparqlExpression, target: Variable) -> Bind {
        debug_assert!(!child.variable_columns().contains_key(&target));
        Bind { child, expression, target }
    }

    pub fn target(&self) -> &Variable {
        &self.target
    }
}

impl Operator for Bind {
    fn result_width(&self) -> usize {
        self.child.result_width() + 1
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        self.child.result_sorted_on().to_vec()
    }

    fn variable_columns(&self) -> VariableColumns {
        let mut variables = self.child.variable_columns().clone();
        variables.insert(
            self.target.clone(),
            (self.child.result_width(), Definedness::PossiblyUndefined),
        );
        variables
    }

    fn cache_key(&self) -> String {
        format!(
            "Bind({}) [{}]",
            self.expression.cache_key(self.child.variable_columns()),
            self.child.cache_key()
        )
    }

    fn size_estimate(&self) -> u64 {
        self.child.size_estimate()
    }

    fn cost_estimate(&self) -> u64 {
        self.child.size_estimate() + self.child.cost_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.child.known_empty_result()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        vec![self.child.clone()]
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let expression = self.expression.clone();
        let variable_columns = self.child.variable_columns().clone();
        let child_context = context.clone();
        let width = self.result_width();
        let stream = self.child.compute(context)?.map(move |fragment| {
            let fragment = fragment?;
            let mut builder = LocalVocabBuilder::new();
            let column = {
                let mut eval = EvalContext {
                    table: &fragment.table,
                    variable_columns: &variable_columns,
                    index: &child_context.index,
                    local_vocab: &fragment.vocab,
                    builder: &mut builder,
                };
                expression.evaluate(&mut eval)?
            };
            let mut table = IdTable::new(width, child_context.budget.clone());
            let mut row = Vec::with_capacity(width);
            for (input, &value) in fragment.table.rows().zip(&column) {
                row.clear();
                row.extend_from_slice(input);
                row.push(value);
                table.push_row(&row)?;
            }
            let mut vocab = fragment.vocab;
            if !builder.is_empty() {
                vocab.adopt(builder.freeze());
            }
            Ok(TableFragment { table, vocab })
        });
        Ok(cancellable(Box::new(stream), context.cancellation.clone()))
    }
}

/// An inline table of constant rows, as introduced by a VALUES clause.
#[derive(Clone, Debug)]
pub struct Values {
    variables: Vec<Variable>,
    rows: Vec<Vec<ValueId>>,
}

impl Values {
    pub fn new(variables: Vec<Variable>, rows: Vec<Vec<ValueId>>) -> Values {
        debug_assert!(rows.iter().all(|row| row.len() == variables.len()));
        Values { variables, rows }
    }
}

impl Operator for Values {
    fn result_width(&self) -> usize {
        self.variables.len()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        Vec::new()
    }

    fn variable_columns(&self) -> VariableColumns {
        self.variables
            .iter()
            .enumerate()
            .map(|(column, variable)| {
                let definedness = if self.rows.iter().any(|row| row[column].is_undefined()) {
                    Definedness::PossiblyUndefined
                } else {
                    Definedness::AlwaysDefined
                };
                (variable.clone(), (column, definedness))
            })
            .collect()
    }

    fn cache_key(&self) -> String {
        let rows: Vec<String> = self
            .rows
            .iter()
            .map(|row| {
                row.iter().map(|id| format!("{id:?}")).collect::<Vec<_>>().join(",")
            })
            .collect();
        format!("Values({})", rows.join(";"))
    }

    fn size_estimate(&self) -> u64 {
        self.rows.len() as u64
    }

    fn cost_estimate(&self) -> u64 {
        self.rows.len() as u64
    }

    fn known_empty_result(&self) -> bool {
        self.rows.is_empty()
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        Vec::new()
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let mut table = IdTable::new(self.result_width(), context.budget.clone());
        for row in &self.rows {
            table.push_row(row)?;
        }
        Ok(single_fragment_stream(TableFragment { table, vocab: LocalVocab::new() }))
    }
}
