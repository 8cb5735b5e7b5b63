//! Recognises basic graph patterns that match a stored materialized view.
//!
//! Two shapes are understood: the simple chain `?s <p1> ?m . ?m <p2> ?o`,
//! which rewrites into a single view scan when a view for the ordered
//! predicate pair exists (both orientations of the user's triples are
//! checked), and the star on one subject, which is recognised and reported
//! but never rewritten.

use std::sync::Arc;

use super::planner::{PatternTerm, TriplePattern};
use super::Variable;
use crate::index::views::MaterializedView;
use crate::{Index, ValueId};

/// A successful chain match: the view, the user's variables for the
/// `(s, m, o)` columns, and the indices of the two covered patterns.
pub struct ChainMatch {
    pub view: Arc<MaterializedView>,
    pub variables: [Variable; 3],
    pub covered: (usize, usize),
}

/// A recognised star: one subject variable with several constant-predicate
/// arms ending in distinct variables. Kept as a recogniser only; star
/// views do not rewrite.
pub struct UserQueryStar {
    pub subject: Variable,
    /// `(pattern index, predicate id, object variable)` per arm.
    pub arms: Vec<(usize, ValueId, Variable)>,
}

fn variable_of(term: &PatternTerm) -> Option<&Variable> {
    match term {
        PatternTerm::Variable(variable) => Some(variable),
        PatternTerm::Id(_) => None,
    }
}

fn fixed_of(term: &PatternTerm) -> Option<ValueId> {
    match term {
        PatternTerm::Id(id) => Some(*id),
        PatternTerm::Variable(_) => None,
    }
}

/// How often each variable occurs across all patterns.
fn occurrences(patterns: &[TriplePattern], variable: &Variable) -> usize {
    patterns
        .iter()
        .flat_map(|pattern| [&pattern.subject, &pattern.predicate, &pattern.object])
        .filter(|term| variable_of(term) == Some(variable))
        .count()
}

/// Searches the basic graph pattern for a pair of triples forming a simple
/// chain covered by a stored view. The middle variable must be private to
/// the chain, and all three variables must be pairwise distinct.
pub fn find_chain_rewrite(index: &Index, patterns: &[TriplePattern]) -> Option<ChainMatch> {
    for (i, first) in patterns.iter().enumerate() {
        for (j, second) in patterns.iter().enumerate() {
            if i == j {
                continue;
            }
            let (Some(p1), Some(p2)) = (fixed_of(&first.predicate), fixed_of(&second.predicate))
            else {
                continue;
            };
            let (Some(s), Some(m1)) = (variable_of(&first.subject), variable_of(&first.object))
            else {
                continue;
            };
            let (Some(m2), Some(o)) = (variable_of(&second.subject), variable_of(&second.object))
            else {
                continue;
            };
            if m1 != m2 || s == m1 || m1 == o || s == o {
                continue;
            }
            // The middle variable must not leak out of the chain.
            if occurrences(patterns, m1) != 2 {
                continue;
            }
            let Some(view) = index.views().chain_view(p1, p2) else {
                continue;
            };
            tracing::debug!(
                view = view.definition().name,
                "rewriting a chain pattern to a view scan"
            );
            return Some(ChainMatch {
                view,
                variables: [s.clone(), m1.clone(), o.clone()],
                covered: (i, j),
            });
        }
    }
    None
}

/// Recognises a star pattern on one subject: at least two arms with
/// pairwise distinct constant predicates and pairwise distinct object
/// variables. An arm whose object occurs anywhere else in the pattern
/// would create an internal join between arms and is excluded.
pub fn check_star(patterns: &[TriplePattern]) -> Option<UserQueryStar> {
    let subject = patterns.iter().find_map(|pattern| variable_of(&pattern.subject))?;
    let mut arms: Vec<(usize, ValueId, Variable)> = Vec::new();
    for (index, pattern) in patterns.iter().enumerate() {
        if variable_of(&pattern.subject) != Some(subject) {
            continue;
        }
        let Some(predicate) = fixed_of(&pattern.predicate) else { continue };
        let Some(object) = variable_of(&pattern.object) else { continue };
        if object == subject || occurrences(patterns, object) != 1 {
            continue;
        }
        if arms.iter().any(|(_, p, o)| *p == predicate || o == object) {
            continue;
        }
        arms.push((index, predicate, object.clone()));
    }
    if arms.len() >= 2 {
        Some(UserQueryStar { subject: subject.clone(), arms })
    } else {
        None
    }
}

/// A graph-pattern operation outside the basic graph pattern, as far as
/// the invariance filter is concerned.
pub enum PatternOperation<'a> {
    Bind { target: &'a Variable },
    Values { variables: &'a [Variable] },
    Optional,
}

/// Whether the operation cannot affect the bindings of the view's
/// variables. `Optional` is conservatively treated as non-invariant.
pub fn is_invariant(operation: &PatternOperation<'_>, view_variables: &[Variable]) -> bool {
    match operation {
        PatternOperation::Bind { target } => !view_variables.contains(target),
        PatternOperation::Values { variables } => {
            variables.iter().all(|variable| !view_variables.contains(variable))
        }
        PatternOperation::Optional => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> PatternTerm {
        PatternTerm::Variable(Variable::new(name))
    }

    fn id(value: u64) -> PatternTerm {
        PatternTerm::Id(ValueId::from_vocab_index(value))
    }

    fn pattern(subject: PatternTerm, predicate: PatternTerm, object: PatternTerm) -> TriplePattern {
        TriplePattern { subject, predicate, object }
    }

    #[test]
    fn star_recogniser_finds_distinct_arms() {
        let patterns = vec![
            pattern(var("s"), id(1), var("a")),
            pattern(var("s"), id(2), var("b")),
            pattern(var("s"), id(3), var("c")),
        ];
        let star = check_star(&patterns).expect("a star");
        assert_eq!(star.subject, Variable::new("s"));
        assert_eq!(star.arms.len(), 3);
    }

    #[test]
    fn star_excludes_arms_that_join_internally() {
        // ?a is used twice, so its arm would create an internal join.
        let patterns = vec![
            pattern(var("s"), id(1), var("a")),
            pattern(var("s"), id(2), var("b")),
            pattern(var("a"), id(3), var("c")),
        ];
        let star = check_star(&patterns).expect("a star");
        assert_eq!(star.arms.len(), 2);
        assert!(star.arms.iter().all(|(_, _, o)| *o != Variable::new("a")));
    }

    #[test]
    fn repeated_predicates_do_not_form_a_star() {
        let patterns = vec![
            pattern(var("s"), id(1), var("a")),
            pattern(var("s"), id(1), var("b")),
        ];
        assert!(check_star(&patterns).is_none());
    }

    #[test]
    fn invariance_filter() {
        let view_variables = vec![Variable::new("s"), Variable::new("o")];
        assert!(is_invariant(
            &PatternOperation::Bind { target: &Variable::new("unrelated") },
            &view_variables
        ));
        assert!(!is_invariant(
            &PatternOperation::Bind { target: &Variable::new("s") },
            &view_variables
        ));
        let values = [Variable::new("x")];
        assert!(is_invariant(&PatternOperation::Values { variables: &values }, &view_variables));
        assert!(!is_invariant(&PatternOperation::Optional, &view_variables));
    }
}
