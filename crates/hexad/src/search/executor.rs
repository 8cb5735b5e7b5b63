//! Drives a planned operator tree: pulls the lazy stream, enforces
//! cancellation at fragment boundaries, merges local vocabs so one vocab
//! covers every emitted row, and applies LIMIT/OFFSET by stream
//! truncation.

use super::{ExecutionContext, QueryExecutionTree, Variable};
use crate::vocabulary::VocabularyRead;
use crate::{IdTable, Index, LocalVocab, Result, UserError, ValueId};

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryModifiers {
    pub limit: Option<u64>,
    pub offset: u64,
}

/// A fully pumped SELECT result: the projected table and the one merged
/// local vocab whose lifetime covers every row.
pub struct QueryResult {
    pub variables: Vec<Variable>,
    pub table: IdTable,
    pub vocab: LocalVocab,
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    /// Renders one row back into term strings.
    pub fn render_row(&self, index: &Index, row: usize) -> Result<Vec<String>> {
        self.table
            .row(row)
            .iter()
            .map(|&id| index.term_for_id(id, &self.vocab))
            .collect()
    }
}

/// Pumps the tree and projects the selected variables.
pub fn execute_select(
    tree: &QueryExecutionTree,
    select: &[Variable],
    modifiers: QueryModifiers,
    context: &ExecutionContext,
) -> Result<QueryResult> {
    let columns: Vec<usize> = select
        .iter()
        .map(|variable| {
            tree.column_of(variable)
                .ok_or_else(|| UserError::UnboundVariable(variable.name().to_owned()).into())
        })
        .collect::<Result<_>>()?;

    let mut table = IdTable::new(columns.len(), context.budget.clone());
    let mut vocab = LocalVocab::new();
    let mut to_skip = modifiers.offset;
    let mut remaining = modifiers.limit.unwrap_or(u64::MAX);
    let mut projected = Vec::with_capacity(columns.len());
    'pump: for fragment in tree.compute(context)? {
        context.cancellation.check()?;
        let fragment = fragment?;
        // Merge before projecting: the output vocab must cover every row
        // that makes it into the merged table.
        vocab.merge(&fragment.vocab);
        for row in fragment.table.rows() {
            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }
            if remaining == 0 {
                break 'pump;
            }
            remaining -= 1;
            projected.clear();
            projected.extend(columns.iter().map(|&column| row[column]));
            table.push_row(&projected)?;
        }
    }
    Ok(QueryResult { variables: select.to_vec(), table, vocab })
}

/// One position of a CONSTRUCT template.
#[derive(Debug, Clone)]
pub enum ConstructTerm {
    Variable(Variable),
    Fixed(String),
}

/// Pumps the tree and instantiates the CONSTRUCT template once per row.
/// Rows with an unbound variable in the template are skipped, as the
/// standard demands.
pub fn execute_construct(
    tree: &QueryExecutionTree,
    template: &[[ConstructTerm; 3]],
    modifiers: QueryModifiers,
    context: &ExecutionContext,
) -> Result<Vec<[String; 3]>> {
    let index = &context.index;
    let mut triples = Vec::new();
    let mut to_skip = modifiers.offset;
    let mut remaining = modifiers.limit.unwrap_or(u64::MAX);
    'pump: for fragment in tree.compute(context)? {
        context.cancellation.check()?;
        let fragment = fragment?;
        for row_index in 0..fragment.table.num_rows() {
            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }
            if remaining == 0 {
                break 'pump;
            }
            remaining -= 1;
            'template: for pattern in template {
                let mut rendered: [String; 3] = Default::default();
                for (slot, term) in rendered.iter_mut().zip(pattern) {
                    match term {
                        ConstructTerm::Fixed(text) => *slot = text.clone(),
                        ConstructTerm::Variable(variable) => {
                            let Some(column) = tree.column_of(variable) else {
                                continue 'template;
                            };
                            let id: ValueId = fragment.table.at(row_index, column);
                            if id.is_undefined() {
                                continue 'template;
                            }
                            *slot = index.term_for_id(id, &fragment.vocab)?;
                        }
                    }
                }
                triples.push(rendered);
            }
        }
    }
    Ok(triples)
}

/// Resolves a SELECT `*` against the tree's visible variables, skipping
/// the engine's internal score variables.
pub fn visible_variables(tree: &QueryExecutionTree) -> Vec<Variable> {
    tree.variable_columns()
        .keys()
        .filter(|variable| !variable.name().starts_with("ql_score_"))
        .cloned()
        .collect()
}

/// True if the index knows nothing about this term, which makes any scan
/// mentioning it empty.
pub fn term_exists(index: &Index, term: &str) -> Result<bool> {
    Ok(index.vocabulary().index_of(term)?.is_some())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::index_scan::IndexScan;
    use super::super::{Operation, QueryExecutionTree};
    use super::*;
    use crate::index::permutation::Permutation;
    use crate::test_index::TestIndex;
    use crate::CancellationHandle;

    fn knows_scan(test: &TestIndex) -> Arc<QueryExecutionTree> {
        let knows = test.id("<knows>");
        QueryExecutionTree::new(Operation::IndexScan(IndexScan::new(
            test.index.clone(),
            Permutation::Pso,
            vec![knows],
            vec![Variable::new("x"), Variable::new("y")],
        )))
    }

    #[test]
    fn select_projects_and_truncates() {
        let test = TestIndex::small();
        let tree = knows_scan(&test);
        let context = test.context();
        let result = execute_select(
            &tree,
            &[Variable::new("y")],
            QueryModifiers { limit: Some(2), offset: 1 },
            &context,
        )
        .unwrap();
        assert_eq!(result.num_rows(), 2);
        assert_eq!(result.variables, vec![Variable::new("y")]);
    }

    #[test]
    fn selecting_an_unbound_variable_fails() {
        let test = TestIndex::small();
        let tree = knows_scan(&test);
        let context = test.context();
        let result =
            execute_select(&tree, &[Variable::new("nope")], QueryModifiers::default(), &context);
        assert!(matches!(
            result,
            Err(crate::Error::UserError(UserError::UnboundVariable(_)))
        ));
    }

    #[test]
    fn cancellation_surfaces_as_the_cancellation_error() {
        let test = TestIndex::small();
        let tree = knows_scan(&test);
        let cancellation = CancellationHandle::default();
        cancellation.cancel();
        let context = test.context().with_cancellation(cancellation);
        let result =
            execute_select(&tree, &[Variable::new("x")], QueryModifiers::default(), &context);
        assert!(result.err().map_or(false, |error| error.is_cancelled()));
    }

    #[test]
    fn construct_instantiates_the_template() {
        let test = TestIndex::small();
        let tree = knows_scan(&test);
        let context = test.context();
        let template = [[
            ConstructTerm::Variable(Variable::new("x")),
            ConstructTerm::Fixed("<met>".to_owned()),
            ConstructTerm::Variable(Variable::new("y")),
        ]];
        let triples =
            execute_construct(&tree, &template, QueryModifiers::default(), &context).unwrap();
        assert_eq!(triples.len(), 3);
        assert!(triples
            .iter()
            .all(|[_, predicate, _]| predicate == "<met>"));
        assert!(triples.contains(&[
            "<alice>".to_owned(),
            "<met>".to_owned(),
            "<bob>".to_owned()
        ]));
    }
}
