//! The leaf operator: scans one permutation with a bound prefix, merges the
//! delta-triples overlay, and streams projected rows block by block.

use std::sync::Arc;

use super::{
    cancellable, Definedness, ExecutionContext, Operator, QueryExecutionTree, TableFragment,
    TableStream, Variable, VariableColumns,
};
use crate::index::delta_triples::DeltaSnapshot;
use crate::index::permutation::{BlockMetadata, Permutation};
use crate::prefilter::PrefilterExpression;
use crate::{IdTable, IdTriple, Index, LocalVocab, Result, ValueId};

#[derive(Clone, Debug)]
pub struct IndexScan {
    index: Arc<Index>,
    permutation: Permutation,
    /// Fixed ids for the first `bound.len()` columns of the permutation.
    bound: Vec<ValueId>,
    /// Variables of the remaining free columns, in permutation order.
    variables: Vec<Variable>,
    prefilter: Option<PrefilterExpression>,
    /// Candidate blocks after prefix narrowing and prefiltering, resolved
    /// at construction so the estimates are real.
    blocks: Vec<BlockMetadata>,
}

impl IndexScan {
    pub fn new(
        index: Arc<Index>,
        permutation: Permutation,
        bound: Vec<ValueId>,
        variables: Vec<Variable>,
    ) -> IndexScan {
        debug_assert_eq!(bound.len() + variables.len(), 3);
        let blocks = candidate_blocks(&index, permutation, &bound, None);
        IndexScan { index, permutation, bound, variables, prefilter: None, blocks }
    }

    /// Attaches a prefilter on the first free column; the candidate block
    /// list shrinks accordingly.
    pub fn with_prefilter(mut self, prefilter: PrefilterExpression) -> IndexScan {
        self.blocks = candidate_blocks(&self.index, self.permutation, &self.bound, Some(&prefilter));
        self.prefilter = Some(prefilter);
        self
    }

    pub fn permutation(&self) -> Permutation {
        self.permutation
    }
}

/// Narrows the permutation's blocks to the bound prefix, then lets the
/// prefilter prune the blocks that are column-consistent over the prefix.
/// Edge blocks that straddle a prefix boundary are always kept.
fn candidate_blocks(
    index: &Index,
    permutation: Permutation,
    bound: &[ValueId],
    prefilter: Option<&PrefilterExpression>,
) -> Vec<BlockMetadata> {
    let reader = index.permutation(permutation);
    let narrowed = reader.blocks_for_prefix(bound.first().copied(), bound.get(1).copied());
    let Some(prefilter) = prefilter else {
        return narrowed.to_vec();
    };
    let eval_col = bound.len();
    if eval_col >= 3 {
        return narrowed.to_vec();
    }
    let consistent = |block: &BlockMetadata| {
        (0..eval_col).all(|column| {
            block.first_triple[column] == block.last_triple[column]
                && Some(&block.first_triple[column]) == bound.get(column)
        })
    };
    let (inner, edges): (Vec<BlockMetadata>, Vec<BlockMetadata>) =
        narrowed.iter().partition(|block| consistent(block));
    let mut kept = prefilter.evaluate(&inner, eval_col);
    kept.extend(edges);
    kept.sort_unstable_by_key(|block| block.block_index);
    kept
}

impl Operator for IndexScan {
    fn result_width(&self) -> usize {
        self.variables.len()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        (0..self.variables.len()).collect()
    }

    fn variable_columns(&self) -> VariableColumns {
        self.variables
            .iter()
            .enumerate()
            .map(|(column, variable)| (variable.clone(), (column, Definedness::AlwaysDefined)))
            .collect()
    }

    fn cache_key(&self) -> String {
        let bound: Vec<String> = self.bound.iter().map(|id| format!("{id:?}")).collect();
        let prefilter = self
            .prefilter
            .as_ref()
            .map(|p| format!(" prefilter={p}"))
            .unwrap_or_default();
        format!(
            "IndexScan {:?} bound=[{}]{prefilter}",
            self.permutation,
            bound.join(",")
        )
    }

    fn size_estimate(&self) -> u64 {
        let per_block = self.index.meta().permutation_block_size as u64;
        (self.blocks.len() as u64 * per_block).min(self.index.meta().triple_count)
    }

    fn cost_estimate(&self) -> u64 {
        self.size_estimate()
    }

    fn known_empty_result(&self) -> bool {
        self.blocks.is_empty() && self.index.delta().count().total() == 0
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        Vec::new()
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let (inserted, deleted) = delta_for_scan(&context.delta, self.permutation, &self.bound);
        let stream = ScanStream {
            context: context.clone(),
            index: self.index.clone(),
            permutation: self.permutation,
            bound: self.bound.clone(),
            blocks: self.blocks.clone(),
            next_block: 0,
            inserted,
            next_inserted: 0,
            deleted,
            done: false,
        };
        Ok(cancellable(Box::new(stream), context.cancellation.clone()))
    }
}

fn delta_for_scan(
    delta: &DeltaSnapshot,
    permutation: Permutation,
    bound: &[ValueId],
) -> (Vec<IdTriple>, Vec<IdTriple>) {
    let col0 = bound.first().copied();
    let col1 = bound.get(1).copied();
    let matches_third = |triple: &IdTriple| bound.get(2).map_or(true, |&id| triple[2] == id);
    let mut inserted = delta.triples_for_scan(permutation, col0, col1, false);
    inserted.retain(matches_third);
    let mut deleted = delta.triples_for_scan(permutation, col0, col1, true);
    deleted.retain(matches_third);
    (inserted, deleted)
}

struct ScanStream {
    context: ExecutionContext,
    index: Arc<Index>,
    permutation: Permutation,
    bound: Vec<ValueId>,
    blocks: Vec<BlockMetadata>,
    next_block: usize,
    inserted: Vec<IdTriple>,
    next_inserted: usize,
    deleted: Vec<IdTriple>,
    done: bool,
}

impl ScanStream {
    fn width(&self) -> usize {
        3 - self.bound.len()
    }

    fn project(&self, triple: &IdTriple) -> Vec<ValueId> {
        triple[self.bound.len()..].to_vec()
    }

    fn matches_bound(&self, triple: &IdTriple) -> bool {
        self.bound.iter().zip(triple).all(|(expected, actual)| expected == actual)
    }

    /// Emits the pending inserted triples up to and including `limit`.
    fn drain_inserted(
        &mut self,
        table: &mut IdTable,
        limit: Option<IdTriple>,
    ) -> Result<()> {
        while self.next_inserted < self.inserted.len() {
            let triple = self.inserted[self.next_inserted];
            if limit.is_some_and(|limit| triple > limit) {
                break;
            }
            table.push_row(&self.project(&triple))?;
            self.next_inserted += 1;
        }
        Ok(())
    }

    fn next_fragment(&mut self) -> Result<Option<TableFragment>> {
        if self.done {
            return Ok(None);
        }
        let mut table = IdTable::new(self.width(), self.context.budget.clone());
        if self.next_block == self.blocks.len() {
            // Trailing inserted triples beyond the last block.
            self.drain_inserted(&mut table, None)?;
            self.done = true;
            if table.is_empty() {
                return Ok(None);
            }
            return Ok(Some(TableFragment { table, vocab: LocalVocab::new() }));
        }

        let block = self.blocks[self.next_block];
        self.next_block += 1;
        let triples = self.index.permutation(self.permutation).read_block(&block)?;
        for triple in triples {
            if !self.matches_bound(&triple) {
                continue;
            }
            if self.deleted.binary_search(&triple).is_ok() {
                continue;
            }
            // Merge inserted triples that sort before this row; a duplicate
            // of the row itself is emitted only once.
            self.drain_inserted(&mut table, Some(triple))?;
            if self.inserted.get(self.next_inserted.wrapping_sub(1)) == Some(&triple) {
                continue;
            }
            table.push_row(&self.project(&triple))?;
        }
        Ok(Some(TableFragment { table, vocab: LocalVocab::new() }))
    }
}

impl Iterator for ScanStream {
    type Item = Result<TableFragment>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_fragment() {
                Ok(Some(fragment)) => {
                    // Skip fragments a fully-deleted block left empty.
                    if fragment.table.is_empty() && !self.done {
                        continue;
                    }
                    if fragment.table.is_empty() {
                        return None;
                    }
                    return Some(Ok(fragment));
                }
                Ok(None) => return None,
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_index::TestIndex;
    use crate::vocabulary::VocabularyRead;

    fn scan(
        test: &TestIndex,
        permutation: Permutation,
        bound: &[&str],
        variables: &[&str],
    ) -> IndexScan {
        let bound = bound
            .iter()
            .map(|term| test.index.id_for_term(term).unwrap().expect("term exists"))
            .collect();
        IndexScan::new(
            test.index.clone(),
            permutation,
            bound,
            variables.iter().map(|v| Variable::new(*v)).collect(),
        )
    }

    #[test]
    fn full_scan_returns_every_triple() {
        let test = TestIndex::small();
        let scan = scan(&test, Permutation::Spo, &[], &["s", "p", "o"]);
        assert_eq!(scan.result_width(), 3);
        assert_eq!(scan.result_sorted_on(), vec![0, 1, 2]);
        let fragment = test.materialise(&scan);
        assert_eq!(fragment.table.num_rows() as u64, test.index.meta().triple_count);
    }

    #[test]
    fn bound_prefix_narrows_rows() {
        let test = TestIndex::small();
        let scan = scan(&test, Permutation::Pso, &["<knows>"], &["s", "o"]);
        let fragment = test.materialise(&scan);
        assert_eq!(fragment.table.num_rows(), 3);
        assert_eq!(scan.result_width(), 2);
        // Rows are sorted on the two free columns.
        let rows: Vec<Vec<ValueId>> = fragment.table.rows().map(|r| r.to_vec()).collect();
        let mut sorted = rows.clone();
        sorted.sort();
        assert_eq!(rows, sorted);
    }

    #[test]
    fn delta_triples_overlay_scans() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let knows = test.id("<knows>");
        let eve = test.id("<eve>");
        test.index.delta().insert(&[[alice, knows, eve]]);
        let scan = scan(&test, Permutation::Pso, &["<knows>"], &["s", "o"]);
        let fragment = test.materialise(&scan);
        assert_eq!(fragment.table.num_rows(), 4);

        // Deleting an index triple removes it from the scan.
        let bob = test.id("<bob>");
        test.index.delta().delete(&[[alice, knows, bob]]);
        let fragment = test.materialise(&scan);
        assert_eq!(fragment.table.num_rows(), 3);
    }

    #[test]
    fn prefilter_prunes_blocks() {
        let test = TestIndex::with_numbers(1000);
        assert!(test.index.vocabulary().len() > 0);
        // POS puts the integer objects on the first free column.
        let base = scan(&test, Permutation::Pos, &["<value>"], &["o", "s"]);
        let unfiltered_blocks = base.blocks.len();
        assert!(unfiltered_blocks >= 10);
        let filtered = base.with_prefilter(PrefilterExpression::greater_equal(
            ValueId::from_int(990),
        ));
        assert!(filtered.blocks.len() < unfiltered_blocks);
        let fragment = test.materialise(&filtered);
        // The prefilter is only a block-level bound; every qualifying row
        // must still be there, possibly among rows the real filter would
        // drop.
        assert!(fragment.table.num_rows() >= 10);
        let qualifying = fragment
            .table
            .column(0)
            .filter(|id| id.as_int().map_or(false, |i| i >= 990))
            .count();
        assert_eq!(qualifying, 10);
    }
}
