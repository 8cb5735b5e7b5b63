//! The cost-based query planner: lowers a parsed query to an operator
//! tree.
//!
//! Leaves are seeded per triple pattern (an index scan over the cheapest
//! permutation, a text scan, a transitive path, inline values, or a
//! materialized-view scan when the pattern cache finds a chain), then the
//! cheapest joinable pair is fused greedily until one tree remains.
//! Relational filters on a scan's first free column are additionally
//! compiled to prefilters and pushed into the scan; the full filter stays
//! in the tree because block pruning is only an upper bound.

use std::sync::Arc;

use sparql_parser as sp;

use super::executor::{ConstructTerm, QueryModifiers};
use super::expression::SparqlExpression;
use super::index_scan::IndexScan;
use super::join::{Bind, Distinct, Filter, Join, OptionalJoin, Sort, Union, Values};
use super::pattern_cache::{self, PatternOperation};
use super::text_scan::{TextIndexScanForEntity, TextIndexScanForWord};
use super::transitive_path::{PathSide, TransitivePath};
use super::view_scan::ViewScan;
use super::{Operation, QueryExecutionTree, Variable};
use crate::index::permutation::Permutation;
use crate::prefilter::PrefilterExpression;
use crate::value_id::Comparison;
use crate::{
    EngineConfig, Index, Result, UserError, ValueId, CONTAINS_ENTITY_PREDICATE,
    CONTAINS_WORD_PREDICATE,
};

/// One position of a resolved triple pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternTerm {
    Variable(Variable),
    Id(ValueId),
}

/// A plain triple pattern with every fixed term resolved to its id.
#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
}

impl TriplePattern {
    fn variables(&self) -> Vec<Variable> {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .filter_map(|term| match term {
                PatternTerm::Variable(variable) => Some(variable.clone()),
                PatternTerm::Id(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum PlanKind {
    Select { variables: Vec<Variable> },
    Construct { template: Vec<[ConstructTerm; 3]> },
}

#[derive(Debug)]
pub struct Plan {
    pub tree: Arc<QueryExecutionTree>,
    pub kind: PlanKind,
    pub modifiers: QueryModifiers,
}

pub struct Planner {
    index: Arc<Index>,
    config: Arc<EngineConfig>,
}

fn parse_error(message: impl Into<String>) -> crate::Error {
    UserError::QueryParse(message.into()).into()
}

impl Planner {
    pub fn new(index: Arc<Index>, config: Arc<EngineConfig>) -> Planner {
        Planner { index, config }
    }

    pub fn plan(&self, query: &sp::Query) -> Result<Plan> {
        match query {
            sp::Query::Select(select) => self.plan_select(select),
            sp::Query::Construct(construct) => self.plan_construct(construct),
        }
    }

    fn plan_select(&self, select: &sp::SelectQuery) -> Result<Plan> {
        let mut tree = self.plan_pattern(&select.pattern)?;
        let variables: Vec<Variable> = match &select.projection {
            sp::Projection::Wildcard => super::executor::visible_variables(&tree),
            sp::Projection::Variables(names) => {
                names.iter().map(Variable::new).collect()
            }
        };
        if select.distinct {
            let columns = variables
                .iter()
                .map(|variable| {
                    tree.column_of(variable).ok_or_else(|| {
                        parse_error(format!("DISTINCT over unbound variable ?{}", variable.name()))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            tree = QueryExecutionTree::new(Operation::Distinct(Distinct::new(tree, columns)));
        }
        if !select.modifiers.order_by.is_empty() {
            let columns = select
                .modifiers
                .order_by
                .iter()
                .map(|name| {
                    let variable = Variable::new(name.as_str());
                    tree.column_of(&variable).ok_or_else(|| {
                        parse_error(format!("ORDER BY over unbound variable ?{name}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            tree = QueryExecutionTree::new(Operation::Sort(Sort::new(tree, columns)));
        }
        Ok(Plan {
            tree,
            kind: PlanKind::Select { variables },
            modifiers: QueryModifiers {
                limit: select.modifiers.limit,
                offset: select.modifiers.offset.unwrap_or(0),
            },
        })
    }

    fn plan_construct(&self, construct: &sp::ConstructQuery) -> Result<Plan> {
        let tree = self.plan_pattern(&construct.pattern)?;
        let mut template = Vec::with_capacity(construct.template.len());
        for pattern in &construct.template {
            let sp::PropertyPath::Direct(predicate) = &pattern.path else {
                return Err(parse_error("property paths are not allowed in a CONSTRUCT template"));
            };
            template.push([
                construct_term(&pattern.subject),
                construct_term(predicate),
                construct_term(&pattern.object),
            ]);
        }
        Ok(Plan {
            tree,
            kind: PlanKind::Construct { template },
            modifiers: QueryModifiers {
                limit: construct.modifiers.limit,
                offset: construct.modifiers.offset.unwrap_or(0),
            },
        })
    }

    fn plan_pattern(&self, elements: &[sp::PatternElement]) -> Result<Arc<QueryExecutionTree>> {
        let mut plain: Vec<TriplePattern> = Vec::new();
        let mut candidates: Vec<Arc<QueryExecutionTree>> = Vec::new();
        let mut filters: Vec<&sp::Expression> = Vec::new();
        let mut binds: Vec<(&sp::Expression, Variable)> = Vec::new();
        let mut bind_targets: Vec<Variable> = Vec::new();
        let mut values_variables: Vec<Variable> = Vec::new();
        let mut optionals: Vec<Arc<QueryExecutionTree>> = Vec::new();
        let mut contains_entity: Vec<(Variable, sp::Term)> = Vec::new();
        let mut contains_word: Vec<(Variable, String)> = Vec::new();

        for element in elements {
            match element {
                sp::PatternElement::Triple(triple) => match text_clause(triple)? {
                    Some(TextClause::Word { text, word }) => contains_word.push((text, word)),
                    Some(TextClause::Entity { text, entity }) => {
                        contains_entity.push((text, entity))
                    }
                    None => self.plan_triple(triple, &mut plain, &mut candidates)?,
                },
                sp::PatternElement::Filter(expression) => filters.push(expression),
                sp::PatternElement::Bind { expression, target } => {
                    let target = Variable::new(target.as_str());
                    bind_targets.push(target.clone());
                    binds.push((expression, target));
                }
                sp::PatternElement::Values { variable, values } => {
                    let variable = Variable::new(variable.as_str());
                    values_variables.push(variable.clone());
                    let mut rows = Vec::new();
                    for term in values {
                        // A value that is not part of the knowledge graph
                        // cannot join with anything; its row is dropped.
                        if let Some(PatternTerm::Id(id)) = self.resolve_term(term)? {
                            rows.push(vec![id]);
                        }
                    }
                    candidates.push(QueryExecutionTree::new(Operation::Values(Values::new(
                        vec![variable],
                        rows,
                    ))));
                }
                sp::PatternElement::Optional(inner) => {
                    optionals.push(self.plan_pattern(inner)?);
                }
                sp::PatternElement::Union(left, right) => {
                    candidates.push(QueryExecutionTree::new(Operation::Union(Union::new(
                        self.plan_pattern(left)?,
                        self.plan_pattern(right)?,
                    ))));
                }
            }
        }

        self.plan_text_scans(contains_entity, contains_word, &mut candidates)?;

        self.rewrite_chains(
            &mut plain,
            &mut candidates,
            &bind_targets,
            &values_variables,
            optionals.is_empty(),
        );
        if let Some(star) = pattern_cache::check_star(&plain) {
            tracing::debug!(
                subject = %star.subject,
                arms = star.arms.len(),
                "recognised a star pattern; star views are not rewritten"
            );
        }

        for pattern in &plain {
            let scan = self.scan_for_pattern(pattern);
            candidates.push(QueryExecutionTree::new(Operation::IndexScan(
                self.push_prefilter(scan, pattern, &filters),
            )));
        }

        if candidates.is_empty() {
            return Err(parse_error("the query needs at least one graph pattern"));
        }
        while candidates.len() > 1 {
            let mut best: Option<(usize, usize, Arc<QueryExecutionTree>)> = None;
            for i in 0..candidates.len() {
                for j in i + 1..candidates.len() {
                    if let Some(joined) = self.try_join(&candidates[i], &candidates[j]) {
                        let better = best
                            .as_ref()
                            .map_or(true, |(_, _, b)| joined.cost_estimate() < b.cost_estimate());
                        if better {
                            best = Some((i, j, joined));
                        }
                    }
                }
            }
            let Some((i, j, joined)) = best else {
                return Err(parse_error(
                    "the query's graph patterns are disconnected; cross products are not supported",
                ));
            };
            candidates.swap_remove(j);
            candidates.swap_remove(i);
            candidates.push(joined);
        }
        let mut tree = candidates.pop().expect("one candidate remains");

        for optional in optionals {
            let shared = shared_variable(&tree, &optional).ok_or_else(|| {
                parse_error("an OPTIONAL block must share a variable with the rest of the query")
            })?;
            let left_col = tree.column_of(&shared).expect("shared variable");
            let right_col = optional.column_of(&shared).expect("shared variable");
            tree = QueryExecutionTree::new(Operation::OptionalJoin(OptionalJoin::new(
                tree, optional, left_col, right_col,
            )));
        }
        for (expression, target) in binds {
            tree = QueryExecutionTree::new(Operation::Bind(Bind::new(
                tree,
                self.engine_expression(expression)?,
                target,
            )));
        }
        for filter in filters {
            tree = QueryExecutionTree::new(Operation::Filter(Filter::new(
                tree,
                self.engine_expression(filter)?,
            )));
        }
        Ok(tree)
    }

    /// Lowers one parsed triple: text-index predicates and property paths
    /// become their dedicated operators, everything else is collected for
    /// the basic graph pattern.
    fn plan_triple(
        &self,
        triple: &sp::TriplePattern,
        plain: &mut Vec<TriplePattern>,
        candidates: &mut Vec<Arc<QueryExecutionTree>>,
    ) -> Result<()> {
        match &triple.path {
            sp::PropertyPath::OneOrMore(predicate) => {
                self.plan_path(triple, predicate, 1, u64::MAX, candidates)
            }
            sp::PropertyPath::ZeroOrMore(predicate) => {
                self.plan_path(triple, predicate, 0, u64::MAX, candidates)
            }
            sp::PropertyPath::ZeroOrOne(predicate) => {
                self.plan_path(triple, predicate, 0, 1, candidates)
            }
            sp::PropertyPath::Direct(predicate) => {
                let (Some(subject), Some(predicate), Some(object)) = (
                    self.resolve_term(&triple.subject)?,
                    self.resolve_term(predicate)?,
                    self.resolve_term(&triple.object)?,
                ) else {
                    // A fixed term the graph has never seen: this pattern,
                    // and anything joined with it, is empty.
                    let variables = sp_pattern_variables(triple);
                    candidates.push(QueryExecutionTree::new(Operation::Values(Values::new(
                        variables,
                        Vec::new(),
                    ))));
                    return Ok(());
                };
                let pattern = TriplePattern { subject, predicate, object };
                let variables = pattern.variables();
                let mut deduped = variables.clone();
                deduped.sort();
                deduped.dedup();
                if deduped.len() != variables.len() {
                    return Err(parse_error(
                        "repeating a variable inside one triple pattern is not supported",
                    ));
                }
                plain.push(pattern);
                Ok(())
            }
        }
    }

    /// Pairs `ql:contains-entity` clauses with a `ql:contains-word` on the
    /// same text variable; leftover word clauses scan on their own.
    fn plan_text_scans(
        &self,
        contains_entity: Vec<(Variable, sp::Term)>,
        contains_word: Vec<(Variable, String)>,
        candidates: &mut Vec<Arc<QueryExecutionTree>>,
    ) -> Result<()> {
        let mut used = vec![false; contains_word.len()];
        for (text, entity) in contains_entity {
            let position = contains_word
                .iter()
                .enumerate()
                .position(|(i, (variable, _))| !used[i] && *variable == text)
                .or_else(|| contains_word.iter().position(|(variable, _)| *variable == text))
                .ok_or_else(|| {
                    parse_error(format!(
                        "{CONTAINS_ENTITY_PREDICATE} on {text} needs an accompanying \
                         {CONTAINS_WORD_PREDICATE} clause"
                    ))
                })?;
            used[position] = true;
            let word = &contains_word[position].1;
            let scan = match &entity {
                sp::Term::Variable(name) => TextIndexScanForEntity::with_variable(
                    self.index.clone(),
                    text,
                    Variable::new(name.as_str()),
                    word,
                )?,
                sp::Term::Iri(iri) => TextIndexScanForEntity::with_fixed_entity(
                    self.index.clone(),
                    text,
                    &format!("<{iri}>"),
                    word,
                )?,
                sp::Term::StringLiteral(literal) => TextIndexScanForEntity::with_fixed_entity(
                    self.index.clone(),
                    text,
                    literal,
                    word,
                )?,
                _ => {
                    return Err(parse_error(format!(
                        "{CONTAINS_ENTITY_PREDICATE} needs an IRI, literal, or variable entity"
                    )))
                }
            };
            candidates.push(QueryExecutionTree::new(Operation::TextScanForEntity(scan)));
        }
        for (position, (text, word)) in contains_word.into_iter().enumerate() {
            if !used[position] {
                candidates.push(QueryExecutionTree::new(Operation::TextScanForWord(
                    TextIndexScanForWord::new(self.index.clone(), text, &word)?,
                )));
            }
        }
        Ok(())
    }

    fn plan_path(
        &self,
        triple: &sp::TriplePattern,
        predicate: &str,
        min_dist: u64,
        max_dist: u64,
        candidates: &mut Vec<Arc<QueryExecutionTree>>,
    ) -> Result<()> {
        let iri = format!("<{predicate}>");
        let Some(predicate_id) = self.index.id_for_term(&iri)? else {
            let variables = sp_pattern_variables(triple);
            candidates.push(QueryExecutionTree::new(Operation::Values(Values::new(
                variables,
                Vec::new(),
            ))));
            return Ok(());
        };
        let side = |term: &sp::Term| -> Result<Option<PathSide>> {
            Ok(match self.resolve_term(term)? {
                Some(PatternTerm::Variable(variable)) => Some(PathSide::Variable(variable)),
                Some(PatternTerm::Id(id)) => Some(PathSide::Fixed(id)),
                None => None,
            })
        };
        let (Some(left), Some(right)) = (side(&triple.subject)?, side(&triple.object)?) else {
            candidates.push(QueryExecutionTree::new(Operation::Values(Values::new(
                sp_pattern_variables(triple),
                Vec::new(),
            ))));
            return Ok(());
        };
        let relation = QueryExecutionTree::new(Operation::IndexScan(IndexScan::new(
            self.index.clone(),
            Permutation::Pso,
            vec![predicate_id],
            vec![Variable::new("ql_internal_sub"), Variable::new("ql_internal_obj")],
        )));
        candidates.push(QueryExecutionTree::new(Operation::TransitivePath(
            TransitivePath::new(
                self.config.clone(),
                relation,
                0,
                1,
                left,
                right,
                min_dist,
                max_dist,
            ),
        )));
        Ok(())
    }

    /// Replaces chain patterns covered by a materialized view with view
    /// scans. Non-BGP operations block the rewrite unless they provably
    /// leave the view's variables untouched.
    fn rewrite_chains(
        &self,
        plain: &mut Vec<TriplePattern>,
        candidates: &mut Vec<Arc<QueryExecutionTree>>,
        bind_targets: &[Variable],
        values_variables: &[Variable],
        no_optionals: bool,
    ) {
        if !no_optionals {
            // OPTIONAL is conservatively treated as non-invariant.
            return;
        }
        while let Some(chain) = pattern_cache::find_chain_rewrite(&self.index, plain) {
            let invariant = bind_targets.iter().all(|target| {
                pattern_cache::is_invariant(
                    &PatternOperation::Bind { target },
                    &chain.variables,
                )
            }) && pattern_cache::is_invariant(
                &PatternOperation::Values { variables: values_variables },
                &chain.variables,
            );
            if !invariant {
                return;
            }
            let (first, second) = chain.covered;
            candidates.push(QueryExecutionTree::new(Operation::ViewScan(ViewScan::new(
                chain.view.clone(),
                chain.variables.clone(),
            ))));
            plain.remove(first.max(second));
            plain.remove(first.min(second));
        }
    }

    /// Chooses the permutation whose sort order puts the pattern's fixed
    /// terms in front.
    fn scan_for_pattern(&self, pattern: &TriplePattern) -> IndexScan {
        let fixed = |term: &PatternTerm| match term {
            PatternTerm::Id(id) => Some(*id),
            PatternTerm::Variable(_) => None,
        };
        let variable = |term: &PatternTerm| match term {
            PatternTerm::Variable(variable) => Some(variable.clone()),
            PatternTerm::Id(_) => None,
        };
        let (s, p, o) = (&pattern.subject, &pattern.predicate, &pattern.object);
        let (permutation, bound, variables) = match (fixed(s), fixed(p), fixed(o)) {
            (Some(s), Some(p), Some(o)) => (Permutation::Spo, vec![s, p, o], vec![]),
            (Some(s), Some(p), None) => {
                (Permutation::Spo, vec![s, p], vec![variable(o).unwrap()])
            }
            (Some(s), None, Some(o)) => {
                (Permutation::Sop, vec![s, o], vec![variable(p).unwrap()])
            }
            (None, Some(p), Some(o)) => {
                (Permutation::Pos, vec![p, o], vec![variable(s).unwrap()])
            }
            (Some(s), None, None) => (
                Permutation::Spo,
                vec![s],
                vec![variable(p).unwrap(), variable(o).unwrap()],
            ),
            (None, Some(p), None) => (
                Permutation::Pso,
                vec![p],
                vec![variable(s).unwrap(), variable(o).unwrap()],
            ),
            (None, None, Some(o)) => (
                Permutation::Osp,
                vec![o],
                vec![variable(s).unwrap(), variable(p).unwrap()],
            ),
            (None, None, None) => (
                Permutation::Spo,
                vec![],
                vec![
                    variable(s).unwrap(),
                    variable(p).unwrap(),
                    variable(o).unwrap(),
                ],
            ),
        };
        IndexScan::new(self.index.clone(), permutation, bound, variables)
    }

    /// Compiles the filters that exactly constrain the scan's first free
    /// column into a prefilter and pushes it down.
    fn push_prefilter(
        &self,
        scan: IndexScan,
        pattern: &TriplePattern,
        filters: &[&sp::Expression],
    ) -> IndexScan {
        // For every permutation chosen by `scan_for_pattern`, the first
        // free column belongs to the first unbound position in (s, p, o)
        // order.
        let first_free = match (&pattern.subject, &pattern.predicate, &pattern.object) {
            (PatternTerm::Variable(v), _, _) => v,
            (_, PatternTerm::Variable(v), _) => v,
            (_, _, PatternTerm::Variable(v)) => v,
            _ => return scan,
        };
        let mut combined: Option<PrefilterExpression> = None;
        for filter in filters {
            if let Some(prefilter) = self.exact_prefilter(filter, first_free) {
                combined = Some(match combined {
                    Some(existing) => existing.and(prefilter),
                    None => prefilter,
                });
            }
        }
        match combined {
            Some(prefilter) => {
                tracing::debug!(%prefilter, "pushing a prefilter into an index scan");
                scan.with_prefilter(prefilter)
            }
            None => scan,
        }
    }

    /// A prefilter that is exactly equivalent to `expression` over
    /// `variable`, or `None`. Only exact translations are usable: an
    /// approximation under a NOT or OR would be unsound.
    fn exact_prefilter(
        &self,
        expression: &sp::Expression,
        variable: &Variable,
    ) -> Option<PrefilterExpression> {
        match expression {
            sp::Expression::Compare { op, left, right } => {
                let comparison = comparison_of(*op);
                match (&**left, &**right) {
                    (sp::Expression::Variable(name), constant)
                        if Variable::new(name.as_str()) == *variable =>
                    {
                        let reference = self.constant_id(constant)?;
                        Some(PrefilterExpression::Relational { comparison, reference })
                    }
                    (constant, sp::Expression::Variable(name))
                        if Variable::new(name.as_str()) == *variable =>
                    {
                        let reference = self.constant_id(constant)?;
                        Some(PrefilterExpression::Relational {
                            comparison: comparison.reversed(),
                            reference,
                        })
                    }
                    _ => None,
                }
            }
            sp::Expression::And(children) => children
                .iter()
                .map(|child| self.exact_prefilter(child, variable))
                .collect::<Option<Vec<_>>>()?
                .into_iter()
                .reduce(PrefilterExpression::and),
            sp::Expression::Or(children) => children
                .iter()
                .map(|child| self.exact_prefilter(child, variable))
                .collect::<Option<Vec<_>>>()?
                .into_iter()
                .reduce(PrefilterExpression::or),
            sp::Expression::Not(inner) => {
                Some(self.exact_prefilter(inner, variable)?.not())
            }
            _ => None,
        }
    }

    fn constant_id(&self, expression: &sp::Expression) -> Option<ValueId> {
        match expression {
            sp::Expression::Int(value) => Some(ValueId::from_int(*value)),
            sp::Expression::Double(value) => Some(ValueId::from_double(*value)),
            sp::Expression::Bool(value) => Some(ValueId::from_bool(*value)),
            sp::Expression::Iri(iri) => {
                self.index.id_for_term(&format!("<{iri}>")).ok().flatten()
            }
            sp::Expression::StringLiteral(text) => self.index.id_for_term(text).ok().flatten(),
            _ => None,
        }
    }

    /// Resolves one parsed term. `None` means a fixed term the vocabulary
    /// does not contain, which forces an empty result.
    fn resolve_term(&self, term: &sp::Term) -> Result<Option<PatternTerm>> {
        Ok(match term {
            sp::Term::Variable(name) => Some(PatternTerm::Variable(Variable::new(name.as_str()))),
            sp::Term::Iri(iri) => self
                .index
                .id_for_term(&format!("<{iri}>"))?
                .map(PatternTerm::Id),
            sp::Term::StringLiteral(text) => {
                self.index.id_for_term(text)?.map(PatternTerm::Id)
            }
            sp::Term::Int(value) => Some(PatternTerm::Id(ValueId::from_int(*value))),
            sp::Term::Double(value) => Some(PatternTerm::Id(ValueId::from_double(*value))),
            sp::Term::Bool(value) => Some(PatternTerm::Id(ValueId::from_bool(*value))),
        })
    }

    fn try_join(
        &self,
        a: &Arc<QueryExecutionTree>,
        b: &Arc<QueryExecutionTree>,
    ) -> Option<Arc<QueryExecutionTree>> {
        let shared = shared_variable(a, b)?;
        // A transitive path with a free side on the shared variable binds
        // that side instead of joining generically.
        for (path_tree, other) in [(a, b), (b, a)] {
            if let Operation::TransitivePath(path) = path_tree.operation() {
                if path.has_bound_side() {
                    continue;
                }
                if *path.left() == PathSide::Variable(shared.clone()) {
                    if let Some(bound) = path.bind_left_side(std::slice::from_ref(other), &shared)
                    {
                        return Some(QueryExecutionTree::new(Operation::TransitivePath(bound)));
                    }
                }
                if *path.right() == PathSide::Variable(shared.clone()) {
                    if let Some(bound) = path.bind_right_side(std::slice::from_ref(other), &shared)
                    {
                        return Some(QueryExecutionTree::new(Operation::TransitivePath(bound)));
                    }
                }
            }
        }
        let left_col = a.column_of(&shared)?;
        let right_col = b.column_of(&shared)?;
        Some(QueryExecutionTree::new(Operation::Join(Join::new(
            a.clone(),
            b.clone(),
            left_col,
            right_col,
        ))))
    }

    /// Lowers a parsed expression to the engine's evaluator.
    fn engine_expression(&self, expression: &sp::Expression) -> Result<SparqlExpression> {
        use SparqlExpression as E;
        Ok(match expression {
            sp::Expression::Or(children) => E::Or(self.engine_expressions(children)?),
            sp::Expression::And(children) => E::And(self.engine_expressions(children)?),
            sp::Expression::Not(inner) => E::Not(Box::new(self.engine_expression(inner)?)),
            sp::Expression::Compare { op, left, right } => E::Compare(
                comparison_of(*op),
                Box::new(self.engine_expression(left)?),
                Box::new(self.engine_expression(right)?),
            ),
            sp::Expression::Add(a, b) => E::Add(
                Box::new(self.engine_expression(a)?),
                Box::new(self.engine_expression(b)?),
            ),
            sp::Expression::Subtract(a, b) => E::Subtract(
                Box::new(self.engine_expression(a)?),
                Box::new(self.engine_expression(b)?),
            ),
            sp::Expression::Multiply(a, b) => E::Multiply(
                Box::new(self.engine_expression(a)?),
                Box::new(self.engine_expression(b)?),
            ),
            sp::Expression::Divide(a, b) => E::Divide(
                Box::new(self.engine_expression(a)?),
                Box::new(self.engine_expression(b)?),
            ),
            sp::Expression::UnaryMinus(inner) => {
                E::UnaryMinus(Box::new(self.engine_expression(inner)?))
            }
            sp::Expression::Variable(name) => E::Variable(Variable::new(name.as_str())),
            sp::Expression::Int(value) => E::Constant(ValueId::from_int(*value)),
            sp::Expression::Double(value) => E::Constant(ValueId::from_double(*value)),
            sp::Expression::Bool(value) => E::Constant(ValueId::from_bool(*value)),
            // A term the graph does not know compares as undefined.
            sp::Expression::Iri(iri) => E::Constant(
                self.index
                    .id_for_term(&format!("<{iri}>"))?
                    .unwrap_or(ValueId::UNDEFINED),
            ),
            sp::Expression::StringLiteral(text) => {
                E::Constant(self.index.id_for_term(text)?.unwrap_or(ValueId::UNDEFINED))
            }
            sp::Expression::Function { name, args } => self.engine_function(name, args)?,
        })
    }

    fn engine_expressions(&self, children: &[sp::Expression]) -> Result<Vec<SparqlExpression>> {
        children.iter().map(|child| self.engine_expression(child)).collect()
    }

    fn engine_function(&self, name: &str, args: &[sp::Expression]) -> Result<SparqlExpression> {
        use SparqlExpression as E;
        let arity = |expected: usize| -> Result<()> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(parse_error(format!(
                    "{name} expects {expected} argument(s), got {}",
                    args.len()
                )))
            }
        };
        let unary = |planner: &Planner| -> Result<Box<SparqlExpression>> {
            Ok(Box::new(planner.engine_expression(&args[0])?))
        };
        let canonical = if name.contains(':') { name.to_owned() } else { name.to_uppercase() };
        Ok(match canonical.as_str() {
            "BOUND" => {
                arity(1)?;
                let sp::Expression::Variable(variable) = &args[0] else {
                    return Err(parse_error("BOUND expects a variable"));
                };
                E::Bound(Variable::new(variable.as_str()))
            }
            "REGEX" => {
                arity(2)?;
                let sp::Expression::StringLiteral(pattern) = &args[1] else {
                    return Err(parse_error("REGEX expects a literal pattern"));
                };
                SparqlExpression::regex(self.engine_expression(&args[0])?, pattern)?
            }
            "COALESCE" => E::Coalesce(self.engine_expressions(args)?),
            "CONCAT" => E::Concat(self.engine_expressions(args)?),
            "IF" => {
                arity(3)?;
                E::If(
                    Box::new(self.engine_expression(&args[0])?),
                    Box::new(self.engine_expression(&args[1])?),
                    Box::new(self.engine_expression(&args[2])?),
                )
            }
            "STR" => {
                arity(1)?;
                E::Str(unary(self)?)
            }
            "STRLEN" => {
                arity(1)?;
                E::StrLen(unary(self)?)
            }
            "UCASE" => {
                arity(1)?;
                E::UCase(unary(self)?)
            }
            "LCASE" => {
                arity(1)?;
                E::LCase(unary(self)?)
            }
            "CONTAINS" => {
                arity(2)?;
                E::Contains(
                    Box::new(self.engine_expression(&args[0])?),
                    Box::new(self.engine_expression(&args[1])?),
                )
            }
            "YEAR" => {
                arity(1)?;
                E::Year(unary(self)?)
            }
            "MONTH" => {
                arity(1)?;
                E::Month(unary(self)?)
            }
            "DAY" => {
                arity(1)?;
                E::Day(unary(self)?)
            }
            "geof:latitude" => {
                arity(1)?;
                E::Latitude(unary(self)?)
            }
            "geof:longitude" => {
                arity(1)?;
                E::Longitude(unary(self)?)
            }
            "geof:distance" => {
                arity(2)?;
                E::GeoDistance(
                    Box::new(self.engine_expression(&args[0])?),
                    Box::new(self.engine_expression(&args[1])?),
                )
            }
            "geof:area" => {
                arity(1)?;
                E::GeoArea(unary(self)?)
            }
            other => return Err(parse_error(format!("unknown function {other}"))),
        })
    }
}

enum TextClause {
    Word { text: Variable, word: String },
    Entity { text: Variable, entity: sp::Term },
}

/// Recognises the engine's text-search predicates.
fn text_clause(triple: &sp::TriplePattern) -> Result<Option<TextClause>> {
    let sp::PropertyPath::Direct(sp::Term::Iri(predicate)) = &triple.path else {
        return Ok(None);
    };
    if predicate == CONTAINS_WORD_PREDICATE {
        let text = term_as_variable(&triple.subject)
            .ok_or_else(|| parse_error("ql:contains-word needs a text variable subject"))?;
        let sp::Term::StringLiteral(word) = &triple.object else {
            return Err(parse_error("ql:contains-word needs a literal word object"));
        };
        return Ok(Some(TextClause::Word { text, word: word.clone() }));
    }
    if predicate == CONTAINS_ENTITY_PREDICATE {
        let text = term_as_variable(&triple.subject)
            .ok_or_else(|| parse_error("ql:contains-entity needs a text variable subject"))?;
        return Ok(Some(TextClause::Entity { text, entity: triple.object.clone() }));
    }
    Ok(None)
}

fn comparison_of(op: sp::ComparisonOp) -> Comparison {
    match op {
        sp::ComparisonOp::Less => Comparison::LessThan,
        sp::ComparisonOp::LessEqual => Comparison::LessEqual,
        sp::ComparisonOp::Equal => Comparison::Equal,
        sp::ComparisonOp::NotEqual => Comparison::NotEqual,
        sp::ComparisonOp::GreaterEqual => Comparison::GreaterEqual,
        sp::ComparisonOp::Greater => Comparison::GreaterThan,
    }
}

fn term_as_variable(term: &sp::Term) -> Option<Variable> {
    match term {
        sp::Term::Variable(name) => Some(Variable::new(name.as_str())),
        _ => None,
    }
}

fn sp_pattern_variables(triple: &sp::TriplePattern) -> Vec<Variable> {
    let mut variables = Vec::new();
    let mut push = |term: &sp::Term| {
        if let sp::Term::Variable(name) = term {
            variables.push(Variable::new(name.as_str()));
        }
    };
    push(&triple.subject);
    if let sp::PropertyPath::Direct(predicate) = &triple.path {
        push(predicate);
    }
    push(&triple.object);
    variables
}

fn shared_variable(
    a: &Arc<QueryExecutionTree>,
    b: &Arc<QueryExecutionTree>,
) -> Option<Variable> {
    a.variable_columns()
        .keys()
        .find(|variable| b.variable_columns().contains_key(*variable))
        .cloned()
}

fn construct_term(term: &sp::Term) -> ConstructTerm {
    match term {
        sp::Term::Variable(name) => ConstructTerm::Variable(Variable::new(name.as_str())),
        sp::Term::Iri(iri) => ConstructTerm::Fixed(format!("<{iri}>")),
        sp::Term::StringLiteral(text) => ConstructTerm::Fixed(text.clone()),
        sp::Term::Int(value) => ConstructTerm::Fixed(value.to_string()),
        sp::Term::Double(value) => ConstructTerm::Fixed(value.to_string()),
        sp::Term::Bool(value) => ConstructTerm::Fixed(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builder::build_chain_view;
    use crate::search::executor::execute_select;
    use crate::test_index::TestIndex;

    fn plan_for(test: &TestIndex, query: &str) -> Plan {
        let parsed = sparql_parser::parse_query(query).expect("query parses");
        Planner::new(test.index.clone(), test.config.clone())
            .plan(&parsed)
            .expect("query plans")
    }

    fn select_rows(test: &TestIndex, query: &str) -> Vec<Vec<String>> {
        let plan = plan_for(test, query);
        let PlanKind::Select { variables } = &plan.kind else {
            panic!("expected a SELECT plan");
        };
        let context = test.context();
        let result =
            execute_select(&plan.tree, variables, plan.modifiers, &context).expect("execution");
        (0..result.num_rows())
            .map(|row| result.render_row(&test.index, row).unwrap())
            .collect()
    }

    #[test]
    fn basic_graph_pattern_join() {
        let test = TestIndex::small();
        let rows = select_rows(&test, "SELECT ?x ?z { ?x <knows> ?y . ?y <knows> ?z }");
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&vec!["<alice>".to_owned(), "<carol>".to_owned()]));
        assert!(rows.contains(&vec!["<bob>".to_owned(), "<dave>".to_owned()]));
    }

    #[test]
    fn filter_restricts_rows_and_pushes_a_prefilter() {
        let test = TestIndex::with_numbers(200);
        let rows =
            select_rows(&test, "SELECT ?s { ?s <value> ?v . FILTER(?v >= 190) }");
        assert_eq!(rows.len(), 10);

        // With the subject bound the filtered variable is the scan's first
        // free column, so the filter also lands in the scan as a prefilter.
        let plan = plan_for(
            &test,
            "SELECT ?v { <s000010> <value> ?v . FILTER(?v < 100) }",
        );
        assert!(plan.tree.cache_key().contains("prefilter"), "{}", plan.tree.cache_key());
        let rows = select_rows(&test, "SELECT ?v { <s000010> <value> ?v . FILTER(?v < 100) }");
        assert_eq!(rows, vec![vec!["10".to_owned()]]);
    }

    #[test]
    fn transitive_path_from_fixed_subject() {
        let test = TestIndex::small();
        let rows = select_rows(&test, "SELECT ?y { <alice> <knows>+ ?y }");
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn zero_length_path_between_distinct_constants_is_lifted() {
        let test = TestIndex::small();
        let plan = plan_for(&test, "SELECT * { <alice> <knows>* <carol> }");
        let Operation::TransitivePath(path) = plan.tree.operation() else {
            panic!("expected a transitive path, got {}", plan.tree.operation().name());
        };
        assert_eq!(path.min_dist(), 1);
    }

    #[test]
    fn text_scan_with_entity_variable() {
        let test = TestIndex::small();
        let query = "SELECT ?t ?e { ?t ql:contains-word \"test*\" . ?t ql:contains-entity ?e }";
        let plan = plan_for(&test, query);
        assert_eq!(plan.tree.result_width(), 3);
        let rows = select_rows(&test, query);
        let entities: Vec<&str> = rows.iter().map(|row| row[1].as_str()).collect();
        // The entities are the text literals themselves, in index order.
        assert_eq!(
            entities,
            vec![
                "he failed the test",
                "testing can help",
                "the test on friday was really hard",
            ]
        );
    }

    #[test]
    fn text_scan_with_fixed_entity() {
        let test = TestIndex::small();
        let query = "SELECT ?t { ?t ql:contains-word \"sentence\" . \
                     ?t ql:contains-entity \"some other sentence\" }";
        let plan = plan_for(&test, query);
        assert_eq!(plan.tree.result_width(), 2);
        let rows = select_rows(&test, query);
        assert_eq!(rows, vec![vec!["some other sentence".to_owned()]]);
    }

    #[test]
    fn unknown_fixed_entity_fails_at_construction() {
        let test = TestIndex::small();
        let parsed = sparql_parser::parse_query(
            "SELECT ?t { ?t ql:contains-word \"sentence\" . \
             ?t ql:contains-entity \"non existent entity\" }",
        )
        .unwrap();
        let error = Planner::new(test.index.clone(), test.config.clone())
            .plan(&parsed)
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("non existent entity"), "{message}");
        assert!(message.contains("ql:contains-entity"), "{message}");
    }

    #[test]
    fn chain_patterns_rewrite_to_a_view_scan() {
        let test = TestIndex::small();
        build_chain_view(&test.index, "knows-knows", "<knows>", "<knows>").unwrap();
        let reopened = Arc::new(Index::open(test.index.dir()).unwrap());
        let planner = Planner::new(reopened.clone(), test.config.clone());
        let parsed = sparql_parser::parse_query(
            "SELECT ?s ?o { ?s <knows> ?m . ?m <knows> ?o }",
        )
        .unwrap();
        let plan = planner.plan(&parsed).unwrap();
        assert!(plan.tree.cache_key().contains("ViewScan"), "{}", plan.tree.cache_key());
        let context = super::super::ExecutionContext::new(reopened.clone(), test.config.clone());
        let PlanKind::Select { variables } = &plan.kind else { panic!() };
        let result = execute_select(&plan.tree, variables, plan.modifiers, &context).unwrap();
        assert_eq!(result.num_rows(), 2);
    }

    #[test]
    fn optional_pads_the_right_side_with_undefined() {
        let test = TestIndex::small();
        let rows =
            select_rows(&test, "SELECT ?x ?z { ?x <knows> ?y OPTIONAL { ?y <knows> ?z } }");
        assert_eq!(rows.len(), 3);
        // Dave knows nobody, so carol's row has an unbound ?z.
        assert!(rows.contains(&vec!["<carol>".to_owned(), String::new()]));
    }

    #[test]
    fn union_distinct_and_order_by() {
        let test = TestIndex::small();
        let rows = select_rows(
            &test,
            "SELECT DISTINCT ?x { { ?x <knows> ?y } UNION { ?y <likes> ?x } } ORDER BY ?x",
        );
        assert_eq!(
            rows,
            vec![
                vec!["<alice>".to_owned()],
                vec!["<bob>".to_owned()],
                vec!["<carol>".to_owned()],
            ]
        );
    }

    #[test]
    fn bind_adds_a_computed_column() {
        let test = TestIndex::with_numbers(20);
        let rows = select_rows(
            &test,
            "SELECT ?next { <s000010> <value> ?v . BIND(?v + 1 AS ?next) }",
        );
        assert_eq!(rows, vec![vec!["11".to_owned()]]);
    }

    #[test]
    fn values_narrow_a_scan() {
        let test = TestIndex::small();
        let rows = select_rows(
            &test,
            "SELECT ?y { VALUES ?x { <alice> <bob> } ?x <knows> ?y }",
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn unknown_terms_make_the_result_empty() {
        let test = TestIndex::small();
        let rows = select_rows(&test, "SELECT ?y { <nobody> <knows> ?y }");
        assert!(rows.is_empty());
    }

    #[test]
    fn cache_keys_are_stable_under_variable_renames() {
        let test = TestIndex::small();
        let first = plan_for(&test, "SELECT ?a { ?a <knows> ?b }");
        let second = plan_for(&test, "SELECT ?x { ?x <knows> ?y }");
        assert_eq!(first.tree.cache_key(), second.tree.cache_key());
        let different = plan_for(&test, "SELECT ?x { ?x <likes> ?y }");
        assert_ne!(first.tree.cache_key(), different.tree.cache_key());
    }

    #[test]
    fn disconnected_patterns_are_rejected() {
        let test = TestIndex::small();
        let parsed =
            sparql_parser::parse_query("SELECT * { ?a <knows> ?b . ?c <likes> ?d }").unwrap();
        let error = Planner::new(test.index.clone(), test.config.clone())
            .plan(&parsed)
            .unwrap_err();
        assert!(error.to_string().contains("disconnected"));
    }
}
