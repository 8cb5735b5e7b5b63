//! The transitive-path operator: given a subtree computing a binary
//! relation `R` and two sides that are each free, fixed, or bound by
//! another subtree, produce all `(x, y)` with `x R^k y` for
//! `k ∈ [min_dist, max_dist]`.
//!
//! Two interchangeable implementations compute the hull: a hash-map BFS
//! that materialises the successor lists in a dictionary, and a
//! binary-search variant that keeps the relation sorted and seeks. The
//! runtime flag `use_bin_search_transitive_path` picks one.

use std::sync::Arc;

use either::Either;

use super::expression::SparqlExpression;
use super::index_scan::IndexScan;
use super::join::{Filter, Sort};
use super::{
    cancellable, single_fragment_stream, Definedness, ExecutionContext, Operation, Operator,
    QueryExecutionTree, TableFragment, TableStream, Variable, VariableColumns,
};
use crate::index::permutation::Permutation;
use crate::{EngineConfig, FastMap8, FastSet8, IdTable, LocalVocab, Result, ValueId};

/// One end of the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSide {
    Variable(Variable),
    Fixed(ValueId),
}

impl PathSide {
    fn cache_token(&self) -> String {
        match self {
            // A free side's variable name does not change the rows.
            PathSide::Variable(_) => "?".to_owned(),
            PathSide::Fixed(id) => format!("{id:?}"),
        }
    }

    fn fixed(&self) -> Option<ValueId> {
        match self {
            PathSide::Fixed(id) => Some(*id),
            PathSide::Variable(_) => None,
        }
    }
}

/// A side bound to another subtree: its join column provides the start
/// nodes, its remaining columns are propagated to columns 2+.
#[derive(Clone, Debug)]
pub struct BoundSide {
    tree: Arc<QueryExecutionTree>,
    join_col: usize,
    on_left: bool,
}

/// Traversal direction, decided at construction: start from whichever side
/// is bound or fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    LeftToRight,
    RightToLeft,
}

#[derive(Clone, Debug)]
pub struct TransitivePath {
    config: Arc<EngineConfig>,
    subtree: Arc<QueryExecutionTree>,
    sub_col: usize,
    obj_col: usize,
    left: PathSide,
    right: PathSide,
    min_dist: u64,
    max_dist: u64,
    bound: Option<BoundSide>,
}

impl TransitivePath {
    pub fn new(
        config: Arc<EngineConfig>,
        subtree: Arc<QueryExecutionTree>,
        sub_col: usize,
        obj_col: usize,
        left: PathSide,
        right: PathSide,
        mut min_dist: u64,
        max_dist: u64,
    ) -> TransitivePath {
        // Two distinct fixed ends can never match via the identity, so the
        // zero-length case is lifted away up front.
        if let (PathSide::Fixed(l), PathSide::Fixed(r)) = (&left, &right) {
            if l != r && min_dist == 0 {
                min_dist = 1;
            }
        }
        TransitivePath { config, subtree, sub_col, obj_col, left, right, min_dist, max_dist, bound: None }
    }

    pub fn min_dist(&self) -> u64 {
        self.min_dist
    }

    pub fn left(&self) -> &PathSide {
        &self.left
    }

    pub fn right(&self) -> &PathSide {
        &self.right
    }

    pub fn has_bound_side(&self) -> bool {
        self.bound.is_some()
    }

    /// Joins the left side against an additional subtree. The cheapest of
    /// the given alternative trees wins; the chosen tree is wrapped in a
    /// BOUND filter when its column may be undefined and in a sort when it
    /// is not already ordered by the join column.
    pub fn bind_left_side(
        &self,
        alternatives: &[Arc<QueryExecutionTree>],
        variable: &Variable,
    ) -> Option<TransitivePath> {
        self.bind_side(alternatives, variable, true)
    }

    /// Mirror image of [`TransitivePath::bind_left_side`].
    pub fn bind_right_side(
        &self,
        alternatives: &[Arc<QueryExecutionTree>],
        variable: &Variable,
    ) -> Option<TransitivePath> {
        self.bind_side(alternatives, variable, false)
    }

    fn bind_side(
        &self,
        alternatives: &[Arc<QueryExecutionTree>],
        variable: &Variable,
        on_left: bool,
    ) -> Option<TransitivePath> {
        debug_assert!(self.bound.is_none(), "only one side can be bound");
        let tree = alternatives
            .iter()
            .filter(|tree| tree.column_of(variable).is_some())
            .min_by_key(|tree| tree.cost_estimate())?
            .clone();
        let (column, definedness) = *tree.variable_columns().get(variable)?;

        // Undefined start values can never reach anything; filter them out
        // before they enter the hull computation.
        let tree = if definedness == Definedness::PossiblyUndefined {
            QueryExecutionTree::new(Operation::Filter(Filter::new(
                tree,
                SparqlExpression::Bound(variable.clone()),
            )))
        } else {
            tree
        };
        let tree = if tree.result_sorted_on().first() == Some(&column) {
            tree
        } else {
            QueryExecutionTree::new(Operation::Sort(Sort::new(tree, vec![column])))
        };
        Some(TransitivePath {
            config: self.config.clone(),
            subtree: self.subtree.clone(),
            sub_col: self.sub_col,
            obj_col: self.obj_col,
            left: self.left.clone(),
            right: self.right.clone(),
            min_dist: self.min_dist,
            max_dist: self.max_dist,
            bound: Some(BoundSide { tree, join_col: column, on_left }),
        })
    }

    fn direction(&self) -> Direction {
        if let Some(bound) = &self.bound {
            if bound.on_left {
                return Direction::LeftToRight;
            }
            return Direction::RightToLeft;
        }
        if self.left.fixed().is_some() {
            Direction::LeftToRight
        } else if self.right.fixed().is_some() {
            Direction::RightToLeft
        } else {
            Direction::LeftToRight
        }
    }

    fn bound_extra_width(&self) -> usize {
        self.bound.as_ref().map_or(0, |bound| bound.tree.result_width() - 1)
    }
}

impl Operator for TransitivePath {
    fn result_width(&self) -> usize {
        2 + self.bound_extra_width()
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        // Starts are visited in the bound side's order; each start's rows
        // land on the start's column.
        match (&self.bound, self.direction()) {
            (Some(_), Direction::LeftToRight) => vec![0],
            (Some(_), Direction::RightToLeft) => vec![1],
            (None, _) => Vec::new(),
        }
    }

    fn variable_columns(&self) -> VariableColumns {
        let mut variables = VariableColumns::new();
        if let PathSide::Variable(variable) = &self.left {
            variables.insert(variable.clone(), (0, Definedness::AlwaysDefined));
        }
        if let PathSide::Variable(variable) = &self.right {
            variables.insert(variable.clone(), (1, Definedness::AlwaysDefined));
        }
        if let Some(bound) = &self.bound {
            for (variable, &(column, definedness)) in bound.tree.variable_columns() {
                if column == bound.join_col {
                    continue;
                }
                let mapped = 2 + if column < bound.join_col { column } else { column - 1 };
                variables.entry(variable.clone()).or_insert((mapped, definedness));
            }
        }
        variables
    }

    fn cache_key(&self) -> String {
        let bound = self.bound.as_ref().map_or(String::new(), |bound| {
            format!(
                " bound(side={},col={})=[{}]",
                if bound.on_left { "left" } else { "right" },
                bound.join_col,
                bound.tree.cache_key()
            )
        });
        format!(
            "TransitivePath(min={},max={},left={},right={},cols=({},{})) sub=[{}]{bound}",
            self.min_dist,
            self.max_dist,
            self.left.cache_token(),
            self.right.cache_token(),
            self.sub_col,
            self.obj_col,
            self.subtree.cache_key(),
        )
    }

    fn size_estimate(&self) -> u64 {
        // A fixed side caps the fan-out at an observed bound on realistic
        // predicates; otherwise the worst-case blow-up factor applies.
        if self.left.fixed().is_some() || self.right.fixed().is_some() {
            self.config.transitive_path_bound_estimate
        } else {
            self.subtree
                .size_estimate()
                .saturating_mul(self.config.transitive_path_unbound_factor)
        }
    }

    fn cost_estimate(&self) -> u64 {
        let children: u64 = self
            .children()
            .iter()
            .map(|child| child.cost_estimate())
            .sum();
        self.size_estimate().saturating_add(children)
    }

    fn known_empty_result(&self) -> bool {
        self.subtree.known_empty_result() && self.min_dist > 0
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        let mut children = vec![self.subtree.clone()];
        if let Some(bound) = &self.bound {
            children.push(bound.tree.clone());
        }
        children
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let relation = self.subtree.compute_materialised(context)?;
        let direction = self.direction();
        let (source_col, target_col) = match direction {
            Direction::LeftToRight => (self.sub_col, self.obj_col),
            Direction::RightToLeft => (self.obj_col, self.sub_col),
        };
        let mut edges: Vec<(ValueId, ValueId)> = relation
            .table
            .rows()
            .map(|row| (row[source_col], row[target_col]))
            .collect();

        let successors = if self.config.use_bin_search_transitive_path {
            edges.sort_unstable();
            Successors::BinarySearch(edges)
        } else {
            let mut map: FastMap8<ValueId, Vec<ValueId>> = FastMap8::default();
            for (source, target) in edges {
                map.entry(source).or_default().push(target);
            }
            Successors::HashMap(map)
        };

        // The universe of the zero-length case: every node of the active
        // graphs, i.e. the distinct union of all subjects and all objects.
        let universe = if self.min_dist == 0 {
            Some(graph_universe(context)?)
        } else {
            None
        };

        let width = self.result_width();
        let mut table = IdTable::new(width, context.budget.clone());
        let mut vocab = LocalVocab::merged([&relation.vocab]);
        let mut row = Vec::with_capacity(width);
        let mut emit = |start: ValueId, target: ValueId, extras: &[ValueId], table: &mut IdTable| {
            row.clear();
            match direction {
                Direction::LeftToRight => {
                    row.push(start);
                    row.push(target);
                }
                Direction::RightToLeft => {
                    row.push(target);
                    row.push(start);
                }
            }
            row.extend_from_slice(extras);
            table.push_row(&row)
        };

        let fixed_target = match direction {
            Direction::LeftToRight => self.right.fixed(),
            Direction::RightToLeft => self.left.fixed(),
        };
        let mut hull = |start: ValueId, extras: &[ValueId], table: &mut IdTable| -> Result<()> {
            context.cancellation.check()?;
            if self.min_dist == 0
                && universe.as_ref().is_some_and(|universe| universe.contains(&start))
                && fixed_target.map_or(true, |target| target == start)
            {
                emit(start, start, extras, table)?;
            }
            for target in reachable(&successors, start, self.min_dist.max(1), self.max_dist) {
                if fixed_target.map_or(true, |fixed| fixed == target) {
                    emit(start, target, extras, table)?;
                }
            }
            Ok(())
        };

        match &self.bound {
            Some(bound) => {
                let input = bound.tree.compute_materialised(context)?;
                vocab.merge(&input.vocab);
                let mut extras = Vec::with_capacity(self.bound_extra_width());
                for input_row in input.table.rows() {
                    extras.clear();
                    extras.extend(
                        input_row
                            .iter()
                            .enumerate()
                            .filter(|&(column, _)| column != bound.join_col)
                            .map(|(_, &id)| id),
                    );
                    hull(input_row[bound.join_col], &extras, &mut table)?;
                }
            }
            None => {
                let start_side = match direction {
                    Direction::LeftToRight => &self.left,
                    Direction::RightToLeft => &self.right,
                };
                match start_side.fixed() {
                    Some(start) => hull(start, &[], &mut table)?,
                    None => {
                        // Both sides free: every node of the universe (for
                        // the identity) resp. every source seeds the hull.
                        match &universe {
                            Some(universe) => {
                                let mut starts: Vec<ValueId> = universe.iter().copied().collect();
                                starts.sort_unstable();
                                for start in starts {
                                    hull(start, &[], &mut table)?;
                                }
                            }
                            None => {
                                let mut starts = successors.sources();
                                starts.sort_unstable();
                                starts.dedup();
                                for start in starts {
                                    hull(start, &[], &mut table)?;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab }),
            context.cancellation.clone(),
        ))
    }
}

enum Successors {
    HashMap(FastMap8<ValueId, Vec<ValueId>>),
    BinarySearch(Vec<(ValueId, ValueId)>),
}

impl Successors {
    fn of(&self, node: ValueId) -> Either<std::slice::Iter<'_, ValueId>, impl Iterator<Item = &ValueId>> {
        match self {
            Successors::HashMap(map) => {
                Either::Left(map.get(&node).map(|v| v.iter()).unwrap_or_default())
            }
            Successors::BinarySearch(edges) => {
                let start = edges.partition_point(|&(source, _)| source < node);
                let end = edges[start..].partition_point(|&(source, _)| source == node) + start;
                Either::Right(edges[start..end].iter().map(|(_, target)| target))
            }
        }
    }

    fn sources(&self) -> Vec<ValueId> {
        match self {
            Successors::HashMap(map) => map.keys().copied().collect(),
            Successors::BinarySearch(edges) => edges.iter().map(|&(source, _)| source).collect(),
        }
    }
}

/// Breadth-first search from `start`, returning every node first reached at
/// a depth within `[min_dist, max_dist]` (`min_dist >= 1`).
fn reachable(successors: &Successors, start: ValueId, min_dist: u64, max_dist: u64) -> Vec<ValueId> {
    let mut visited: FastSet8<ValueId> = FastSet8::default();
    let mut result = Vec::new();
    let mut frontier = vec![start];
    let mut depth = 0u64;
    while !frontier.is_empty() && depth < max_dist {
        depth += 1;
        let mut next = Vec::new();
        for node in frontier {
            for &target in successors.of(node) {
                if visited.insert(target) {
                    if depth >= min_dist {
                        result.push(target);
                    }
                    next.push(target);
                }
            }
        }
        frontier = next;
    }
    result
}

/// All nodes of the graph: the distinct union of the subjects (first column
/// of SPO) and the objects (first column of OPS), delta overlay included.
fn graph_universe(context: &ExecutionContext) -> Result<FastSet8<ValueId>> {
    let mut universe = FastSet8::default();
    for permutation in [Permutation::Spo, Permutation::Ops] {
        let scan = IndexScan::new(
            context.index.clone(),
            permutation,
            Vec::new(),
            vec![Variable::new("s"), Variable::new("p"), Variable::new("o")],
        );
        for fragment in scan.compute(context)? {
            let fragment = fragment?;
            universe.extend(fragment.table.column(0));
        }
    }
    Ok(universe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_index::TestIndex;

    /// `<alice> <knows> <bob>`, `<bob> <knows> <carol>`,
    /// `<carol> <knows> <dave>` plus an unrelated triple.
    fn knows_path(test: &TestIndex) -> Arc<QueryExecutionTree> {
        let knows = test.id("<knows>");
        QueryExecutionTree::new(Operation::IndexScan(IndexScan::new(
            test.index.clone(),
            Permutation::Pso,
            vec![knows],
            vec![Variable::new("x"), Variable::new("y")],
        )))
    }

    fn path(
        test: &TestIndex,
        left: PathSide,
        right: PathSide,
        min_dist: u64,
        max_dist: u64,
    ) -> TransitivePath {
        TransitivePath::new(
            test.config.clone(),
            knows_path(test),
            0,
            1,
            left,
            right,
            min_dist,
            max_dist,
        )
    }

    fn rows_of(test: &TestIndex, operation: &TransitivePath) -> Vec<(String, String)> {
        let fragment = test.materialise(operation);
        fragment
            .table
            .rows()
            .map(|row| (test.term(row[0]), test.term(row[1])))
            .collect()
    }

    #[test]
    fn transitive_closure_from_fixed_start() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let operation = path(
            &test,
            PathSide::Fixed(alice),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        let mut rows = rows_of(&test, &operation);
        rows.sort();
        assert_eq!(
            rows,
            vec![
                ("<alice>".to_owned(), "<bob>".to_owned()),
                ("<alice>".to_owned(), "<carol>".to_owned()),
                ("<alice>".to_owned(), "<dave>".to_owned()),
            ]
        );
    }

    #[test]
    fn max_dist_bounds_the_hull() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let operation = path(
            &test,
            PathSide::Fixed(alice),
            PathSide::Variable(Variable::new("y")),
            1,
            2,
        );
        assert_eq!(rows_of(&test, &operation).len(), 2);
    }

    #[test]
    fn distinct_fixed_ends_lift_zero_min_dist() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let carol = test.id("<carol>");
        // <alice> <knows>* <carol> with distinct constants behaves as +.
        let operation =
            path(&test, PathSide::Fixed(alice), PathSide::Fixed(carol), 0, u64::MAX);
        assert_eq!(operation.min_dist(), 1);
        let rows = rows_of(&test, &operation);
        assert_eq!(rows, vec![("<alice>".to_owned(), "<carol>".to_owned())]);
    }

    #[test]
    fn zero_min_dist_with_fixed_start_adds_identity() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let operation = path(
            &test,
            PathSide::Fixed(alice),
            PathSide::Variable(Variable::new("y")),
            0,
            u64::MAX,
        );
        let rows = rows_of(&test, &operation);
        assert!(rows.contains(&("<alice>".to_owned(), "<alice>".to_owned())));
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn both_free_with_zero_min_dist_seeds_the_whole_graph() {
        let test = TestIndex::small();
        let operation = path(
            &test,
            PathSide::Variable(Variable::new("x")),
            PathSide::Variable(Variable::new("y")),
            0,
            u64::MAX,
        );
        let rows = rows_of(&test, &operation);
        // Every node of the graph contributes its identity pair.
        let identities = rows.iter().filter(|(x, y)| x == y).count();
        assert!(identities >= 5, "identities: {identities}");
    }

    #[test]
    fn hash_map_and_binary_search_agree() {
        let test = TestIndex::small();
        let mut bin_search_config = (*test.config).clone();
        bin_search_config.use_bin_search_transitive_path = true;
        let operation = path(
            &test,
            PathSide::Variable(Variable::new("x")),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        let bin_search_operation = TransitivePath::new(
            Arc::new(bin_search_config),
            knows_path(&test),
            0,
            1,
            PathSide::Variable(Variable::new("x")),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        let mut rows = rows_of(&test, &operation);
        let mut bin_search_rows = rows_of(&test, &bin_search_operation);
        rows.sort();
        bin_search_rows.sort();
        assert_eq!(rows, bin_search_rows);
    }

    #[test]
    fn binding_a_side_joins_and_propagates_columns() {
        let test = TestIndex::small();
        let operation = path(
            &test,
            PathSide::Variable(Variable::new("x")),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        // Bind the left side to the <likes> scan: ?s <likes> ?x . ?x <knows>+ ?y
        let likes = test.id("<likes>");
        let side = QueryExecutionTree::new(Operation::IndexScan(IndexScan::new(
            test.index.clone(),
            Permutation::Pos,
            vec![likes],
            vec![Variable::new("x"), Variable::new("s")],
        )));
        let bound = operation
            .bind_left_side(&[side], &Variable::new("x"))
            .expect("the side binds");
        assert_eq!(bound.result_width(), 3);
        assert_eq!(bound.result_sorted_on(), vec![0]);
        let fragment = test.materialise(&bound);
        // <eve> <likes> <bob>, and bob reaches carol and dave.
        let rows: Vec<(String, String, String)> = fragment
            .table
            .rows()
            .map(|row| (test.term(row[0]), test.term(row[1]), test.term(row[2])))
            .collect();
        assert!(rows.contains(&("<bob>".to_owned(), "<carol>".to_owned(), "<eve>".to_owned())));
        assert!(rows.contains(&("<bob>".to_owned(), "<dave>".to_owned(), "<eve>".to_owned())));
    }

    #[test]
    fn size_estimate_uses_the_configured_constants() {
        let test = TestIndex::small();
        let fixed = path(
            &test,
            PathSide::Fixed(test.id("<alice>")),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        assert_eq!(fixed.size_estimate(), test.config.transitive_path_bound_estimate);
        let free = path(
            &test,
            PathSide::Variable(Variable::new("x")),
            PathSide::Variable(Variable::new("y")),
            1,
            u64::MAX,
        );
        assert_eq!(
            free.size_estimate(),
            free.subtree.size_estimate() * test.config.transitive_path_unbound_factor
        );
    }
}
