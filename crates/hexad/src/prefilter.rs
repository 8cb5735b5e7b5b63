//! Block-level predicate pushdown: decide from block metadata alone which
//! blocks of a permutation can contribute rows to a relational filter.
//!
//! The algebra is a small expression tree with relational leaves and
//! `And`/`Or`/`Not` nodes. `Not` is evaluated by rewriting its child via
//! [`PrefilterExpression::logical_complement`] (De Morgan plus per-relation
//! complement), so double negation cancels structurally. Everything here
//! operates on boundary ids only and is sound by construction: a block is
//! dropped only if no row in it can satisfy the predicate.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;

use itertools::Itertools;

use crate::index::permutation::BlockMetadata;
use crate::value_id::{Comparison, Datatype};
use crate::ValueId;

/// A predicate tree evaluated against block metadata before any payload is
/// read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefilterExpression {
    Relational { comparison: Comparison, reference: ValueId },
    And(Box<PrefilterExpression>, Box<PrefilterExpression>),
    Or(Box<PrefilterExpression>, Box<PrefilterExpression>),
    Not(Box<PrefilterExpression>),
}

impl PrefilterExpression {
    pub fn less_than(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::LessThan, reference }
    }

    pub fn less_equal(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::LessEqual, reference }
    }

    pub fn equal(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::Equal, reference }
    }

    pub fn not_equal(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::NotEqual, reference }
    }

    pub fn greater_equal(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::GreaterEqual, reference }
    }

    pub fn greater_than(reference: ValueId) -> PrefilterExpression {
        PrefilterExpression::Relational { comparison: Comparison::GreaterThan, reference }
    }

    pub fn and(self, other: PrefilterExpression) -> PrefilterExpression {
        PrefilterExpression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: PrefilterExpression) -> PrefilterExpression {
        PrefilterExpression::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> PrefilterExpression {
        PrefilterExpression::Not(Box::new(self))
    }

    /// The subset of `blocks` that may contain qualifying rows at
    /// `eval_col`, sorted and duplicate-free.
    pub fn evaluate(&self, blocks: &[BlockMetadata], eval_col: usize) -> Vec<BlockMetadata> {
        check_eval_requirements(blocks, eval_col);
        self.evaluate_impl(blocks, eval_col)
    }

    fn evaluate_impl(&self, blocks: &[BlockMetadata], eval_col: usize) -> Vec<BlockMetadata> {
        match self {
            PrefilterExpression::Relational { comparison, reference } => {
                evaluate_relational(*comparison, *reference, blocks, eval_col)
            }
            PrefilterExpression::And(a, b) => {
                let narrowed = a.evaluate_impl(blocks, eval_col);
                b.evaluate_impl(&narrowed, eval_col)
            }
            PrefilterExpression::Or(a, b) => set_union(
                a.evaluate_impl(blocks, eval_col),
                b.evaluate_impl(blocks, eval_col),
            ),
            PrefilterExpression::Not(inner) => {
                inner.logical_complement().evaluate_impl(blocks, eval_col)
            }
        }
    }

    /// An expression equivalent to the negation of `self`.
    pub fn logical_complement(&self) -> PrefilterExpression {
        match self {
            PrefilterExpression::Relational { comparison, reference } => {
                PrefilterExpression::Relational {
                    comparison: comparison.complement(),
                    reference: *reference,
                }
            }
            PrefilterExpression::And(a, b) => PrefilterExpression::Or(
                Box::new(a.logical_complement()),
                Box::new(b.logical_complement()),
            ),
            PrefilterExpression::Or(a, b) => PrefilterExpression::And(
                Box::new(a.logical_complement()),
                Box::new(b.logical_complement()),
            ),
            PrefilterExpression::Not(inner) => (**inner).clone(),
        }
    }
}

impl fmt::Display for PrefilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefilterExpression::Relational { comparison, reference } => {
                write!(f, "#col {} {:?}", comparison.as_str(), reference)
            }
            PrefilterExpression::And(a, b) => write!(f, "({a} && {b})"),
            PrefilterExpression::Or(a, b) => write!(f, "({a} || {b})"),
            PrefilterExpression::Not(inner) => write!(f, "!({inner})"),
        }
    }
}

/// The input contract of `evaluate`. A violation is a programmer bug, never
/// a data problem, so it tears the query down via panic.
fn check_eval_requirements(blocks: &[BlockMetadata], eval_col: usize) {
    for pair in blocks.windows(2) {
        assert!(
            pair[0].block_index < pair[1].block_index,
            "prefilter input blocks must be unique and sorted by block index"
        );
        assert!(
            pair[0].last_triple < pair[1].first_triple,
            "prefilter input blocks must be disjoint and ordered by content"
        );
        for column in 0..eval_col {
            let ids = [
                pair[0].first_triple[column],
                pair[0].last_triple[column],
                pair[1].first_triple[column],
                pair[1].last_triple[column],
            ];
            assert!(
                ids.iter().all(|&id| id == ids[0]),
                "prefilter input blocks must be column-consistent up to the evaluation column"
            );
        }
    }
}

/// Compares a boundary id against the reference, numerically across the
/// `Int`/`Double` boundary.
fn compare_to_reference(id: ValueId, reference: ValueId) -> Ordering {
    match (id.as_numeric(), reference.as_numeric()) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        _ => id.cmp(&reference),
    }
}

/// The datatype sections of the sorted id space that can hold values
/// comparable with `reference`.
fn comparable_sections(ids: &[ValueId], reference: ValueId) -> Vec<Range<usize>> {
    let datatypes: &[Datatype] = if reference.datatype().is_numeric() {
        &[Datatype::Int, Datatype::Double]
    } else {
        &[reference.datatype()]
    };
    datatypes
        .iter()
        .map(|&datatype| {
            let start = ids.partition_point(|id| id.datatype() < datatype);
            let end = ids.partition_point(|id| id.datatype() <= datatype);
            start..end
        })
        .filter(|range| !range.is_empty())
        .collect()
}

/// The half-open ranges of positions in the sorted `ids` whose value
/// satisfies `comparison` against `reference`. With `keep_empty_ranges`,
/// empty ranges are emitted too; their start still marks the insertion
/// point of the reference.
pub fn ranges_for_id(
    ids: &[ValueId],
    reference: ValueId,
    comparison: Comparison,
    keep_empty_ranges: bool,
) -> Vec<Range<usize>> {
    if reference.is_undefined() {
        return Vec::new();
    }
    let mut result = Vec::new();
    let mut push = |range: Range<usize>| {
        if keep_empty_ranges || !range.is_empty() {
            result.push(range);
        }
    };
    for section in comparable_sections(ids, reference) {
        let slice = &ids[section.clone()];
        let lower = section.start
            + slice.partition_point(|&id| compare_to_reference(id, reference) == Ordering::Less);
        let upper = section.start
            + slice.partition_point(|&id| compare_to_reference(id, reference) != Ordering::Greater);
        match comparison {
            Comparison::LessThan => push(section.start..lower),
            Comparison::LessEqual => push(section.start..upper),
            Comparison::Equal => push(lower..upper),
            Comparison::NotEqual => {
                push(section.start..lower);
                push(upper..section.end);
            }
            Comparison::GreaterEqual => push(lower..section.end),
            Comparison::GreaterThan => push(upper..section.end),
        }
    }
    result
}

fn evaluate_relational(
    comparison: Comparison,
    reference: ValueId,
    blocks: &[BlockMetadata],
    eval_col: usize,
) -> Vec<BlockMetadata> {
    // A block whose boundary ids straddle a datatype boundary may contain
    // anything in between; it is always kept.
    let (mixed, uniform): (Vec<BlockMetadata>, Vec<BlockMetadata>) =
        blocks.iter().partition(|block| {
            block.first_triple[eval_col].datatype() != block.last_triple[eval_col].datatype()
        });

    let ids: Vec<ValueId> = uniform
        .iter()
        .flat_map(|block| [block.first_triple[eval_col], block.last_triple[eval_col]])
        .collect();
    let ranges = ranges_for_id(&ids, reference, comparison, comparison == Comparison::Equal);

    let mut selected: Vec<BlockMetadata> = Vec::new();
    let mut push = |block: BlockMetadata| {
        if selected.last().map_or(true, |last| last.block_index < block.block_index) {
            selected.push(block);
        }
    };
    for range in ranges {
        if range.is_empty() {
            // An equality reference falling strictly inside one block's
            // boundaries selects that block even though no boundary matches.
            if range.start % 2 == 1 {
                let block = uniform[(range.start - 1) / 2];
                if compare_to_reference(block.first_triple[eval_col], reference).is_lt()
                    && compare_to_reference(block.last_triple[eval_col], reference).is_gt()
                {
                    push(block);
                }
            }
            continue;
        }
        for position in range.start / 2..=(range.end - 1) / 2 {
            push(uniform[position]);
        }
    }
    set_union(mixed, selected)
}

/// Merges two block lists sorted by block index into one, dropping
/// duplicates.
fn set_union(a: Vec<BlockMetadata>, b: Vec<BlockMetadata>) -> Vec<BlockMetadata> {
    a.into_iter()
        .merge_by(b, |x, y| x.block_index <= y.block_index)
        .dedup_by(|x, y| x.block_index == y.block_index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(i: u64) -> ValueId {
        ValueId::from_vocab_index(i)
    }

    /// Blocks over one `(subject, predicate)` pair whose objects are the
    /// given int ranges.
    fn int_blocks(ranges: &[(i64, i64)]) -> Vec<BlockMetadata> {
        ranges
            .iter()
            .enumerate()
            .map(|(i, &(first, last))| BlockMetadata {
                block_index: i as u64,
                first_triple: [vocab(0), vocab(1), ValueId::from_int(first)],
                last_triple: [vocab(0), vocab(1), ValueId::from_int(last)],
                byte_offset: 0,
                byte_length: 0,
            })
            .collect()
    }

    fn indices(blocks: &[BlockMetadata]) -> Vec<u64> {
        blocks.iter().map(|b| b.block_index).collect()
    }

    #[test]
    fn relational_evaluation_on_two_blocks() {
        let blocks = int_blocks(&[(1, 10), (11, 20)]);
        let le = PrefilterExpression::less_equal(ValueId::from_int(15));
        assert_eq!(indices(&le.evaluate(&blocks, 2)), vec![0, 1]);
        let lt = PrefilterExpression::less_than(ValueId::from_int(11));
        assert_eq!(indices(&lt.evaluate(&blocks, 2)), vec![0]);
        let not_le = PrefilterExpression::less_equal(ValueId::from_int(15)).not();
        assert_eq!(indices(&not_le.evaluate(&blocks, 2)), vec![1]);
        let gt = PrefilterExpression::greater_than(ValueId::from_int(15));
        assert_eq!(indices(&gt.evaluate(&blocks, 2)), vec![1]);
    }

    #[test]
    fn equality_inside_a_block_keeps_it() {
        let blocks = int_blocks(&[(1, 10), (20, 30)]);
        let eq = PrefilterExpression::equal(ValueId::from_int(5));
        assert_eq!(indices(&eq.evaluate(&blocks, 2)), vec![0]);
        // A reference in the gap between blocks selects nothing.
        let eq = PrefilterExpression::equal(ValueId::from_int(15));
        assert!(eq.evaluate(&blocks, 2).is_empty());
        // A reference on a boundary selects the touching block.
        let eq = PrefilterExpression::equal(ValueId::from_int(20));
        assert_eq!(indices(&eq.evaluate(&blocks, 2)), vec![1]);
    }

    #[test]
    fn and_or_combinations() {
        let blocks = int_blocks(&[(1, 10), (11, 20), (21, 30)]);
        let ge5 = PrefilterExpression::greater_equal(ValueId::from_int(5));
        let lt25 = PrefilterExpression::less_than(ValueId::from_int(25));
        assert_eq!(indices(&ge5.clone().and(lt25.clone()).evaluate(&blocks, 2)), vec![0, 1, 2]);
        let lt5 = PrefilterExpression::less_than(ValueId::from_int(5));
        let gt25 = PrefilterExpression::greater_than(ValueId::from_int(25));
        assert_eq!(indices(&lt5.clone().or(gt25).evaluate(&blocks, 2)), vec![0, 2]);
        let ge11 = PrefilterExpression::greater_equal(ValueId::from_int(11));
        assert_eq!(indices(&ge11.and(lt5).evaluate(&blocks, 2)), Vec::<u64>::new());
    }

    #[test]
    fn de_morgan_roundtrip_is_structural_identity() {
        let expression = PrefilterExpression::less_than(ValueId::from_int(3)).and(
            PrefilterExpression::equal(ValueId::from_int(7))
                .or(PrefilterExpression::not_equal(ValueId::from_int(9))),
        );
        assert_eq!(expression.logical_complement().logical_complement(), expression);
        // Double negation cancels through evaluation as well.
        let blocks = int_blocks(&[(1, 10), (11, 20)]);
        let double_not = expression.clone().not().not();
        assert_eq!(expression.evaluate(&blocks, 2), double_not.evaluate(&blocks, 2));
    }

    #[test]
    fn complement_flips_relations_via_de_morgan() {
        let a = PrefilterExpression::less_equal(ValueId::from_int(1));
        let b = PrefilterExpression::equal(ValueId::from_int(2));
        let complement = a.clone().and(b.clone()).logical_complement();
        assert_eq!(
            complement,
            PrefilterExpression::greater_than(ValueId::from_int(1))
                .or(PrefilterExpression::not_equal(ValueId::from_int(2)))
        );
    }

    #[test]
    fn mixed_datatype_boundary_blocks_are_kept() {
        let mut blocks = int_blocks(&[(1, 10)]);
        // A second block running from ints into doubles.
        blocks.push(BlockMetadata {
            block_index: 1,
            first_triple: [vocab(0), vocab(1), ValueId::from_int(11)],
            last_triple: [vocab(0), vocab(1), ValueId::from_double(0.5)],
            byte_offset: 0,
            byte_length: 0,
        });
        let lt = PrefilterExpression::less_than(ValueId::from_int(1));
        assert_eq!(indices(&lt.evaluate(&blocks, 2)), vec![1]);
    }

    #[test]
    fn evaluation_is_idempotent() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..100 {
            let mut bounds: Vec<i64> = (0..8).map(|_| rng.gen_range(-100..100)).collect();
            bounds.sort_unstable();
            bounds.dedup();
            let ranges: Vec<(i64, i64)> =
                bounds.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
            let blocks = int_blocks(&ranges);
            let reference = ValueId::from_int(rng.gen_range(-100..100));
            for comparison in [
                Comparison::LessThan,
                Comparison::LessEqual,
                Comparison::Equal,
                Comparison::NotEqual,
                Comparison::GreaterEqual,
                Comparison::GreaterThan,
            ] {
                let expression = PrefilterExpression::Relational { comparison, reference };
                let once = expression.evaluate(&blocks, 2);
                let twice = expression.evaluate(&once, 2);
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn prefilter_is_sound_for_boundary_values() {
        // Every boundary id satisfying the comparison must lie in a kept
        // block; spot-check by evaluating the comparison directly.
        let blocks = int_blocks(&[(-5, -1), (0, 9), (10, 19), (30, 40)]);
        for reference in [-3i64, 0, 9, 10, 25, 40, 50] {
            let reference = ValueId::from_int(reference);
            for comparison in [
                Comparison::LessThan,
                Comparison::LessEqual,
                Comparison::Equal,
                Comparison::NotEqual,
                Comparison::GreaterEqual,
                Comparison::GreaterThan,
            ] {
                let expression = PrefilterExpression::Relational { comparison, reference };
                let kept: Vec<u64> = indices(&expression.evaluate(&blocks, 2));
                for block in &blocks {
                    let any_boundary_matches = [block.first_triple[2], block.last_triple[2]]
                        .into_iter()
                        .any(|id| comparison.matches(compare_to_reference(id, reference)));
                    if any_boundary_matches {
                        assert!(
                            kept.contains(&block.block_index),
                            "{comparison:?} {reference:?} dropped block {}",
                            block.block_index
                        );
                    }
                }
            }
        }
    }
}
