//! Tree-interpreted n-ary expressions over ValueId columns.
//!
//! Evaluation walks the tree once per fragment and produces one id column
//! per node, aligned with the input table's rows. Errors inside a row
//! (type mismatches, unbound variables) follow SPARQL semantics and yield
//! the undefined id for that row rather than failing the query.

use std::borrow::Cow;
use std::cmp::Ordering;

use super::{Variable, VariableColumns};
use crate::value_id::{compare_ids, Comparison, DateValue};
use crate::vocabulary::VocabularyRead;
use crate::{
    Datatype, IdTable, Index, LocalVocab, local_vocab::LocalVocabBuilder, Result, UserError,
    ValueId,
};

#[derive(Clone, Debug)]
pub enum SparqlExpression {
    Constant(ValueId),
    Variable(Variable),
    And(Vec<SparqlExpression>),
    Or(Vec<SparqlExpression>),
    Not(Box<SparqlExpression>),
    Compare(Comparison, Box<SparqlExpression>, Box<SparqlExpression>),
    Add(Box<SparqlExpression>, Box<SparqlExpression>),
    Subtract(Box<SparqlExpression>, Box<SparqlExpression>),
    Multiply(Box<SparqlExpression>, Box<SparqlExpression>),
    Divide(Box<SparqlExpression>, Box<SparqlExpression>),
    UnaryMinus(Box<SparqlExpression>),
    Bound(Variable),
    Coalesce(Vec<SparqlExpression>),
    If(Box<SparqlExpression>, Box<SparqlExpression>, Box<SparqlExpression>),
    Str(Box<SparqlExpression>),
    StrLen(Box<SparqlExpression>),
    UCase(Box<SparqlExpression>),
    LCase(Box<SparqlExpression>),
    Concat(Vec<SparqlExpression>),
    Contains(Box<SparqlExpression>, Box<SparqlExpression>),
    Regex { target: Box<SparqlExpression>, pattern: regex::Regex },
    Year(Box<SparqlExpression>),
    Month(Box<SparqlExpression>),
    Day(Box<SparqlExpression>),
    Latitude(Box<SparqlExpression>),
    Longitude(Box<SparqlExpression>),
    GeoDistance(Box<SparqlExpression>, Box<SparqlExpression>),
    GeoArea(Box<SparqlExpression>),
}

impl SparqlExpression {
    pub fn regex(target: SparqlExpression, pattern: &str) -> Result<SparqlExpression> {
        let compiled = regex::Regex::new(pattern).map_err(|source| UserError::InvalidRegex {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(SparqlExpression::Regex { target: Box::new(target), pattern: compiled })
    }

    /// Renders the expression with variables replaced by the child's column
    /// indices, so a pure rename does not change an operator's cache key.
    pub fn cache_key(&self, variables: &VariableColumns) -> String {
        use SparqlExpression::*;
        let column = |variable: &super::Variable| match variables.get(variable) {
            Some(&(column, _)) => format!("#{column}"),
            None => "#unbound".to_owned(),
        };
        let keys = |children: &[SparqlExpression]| {
            children.iter().map(|c| c.cache_key(variables)).collect::<Vec<_>>().join(",")
        };
        match self {
            Constant(id) => format!("{id:?}"),
            SparqlExpression::Variable(variable) => column(variable),
            And(children) => format!("And({})", keys(children)),
            Or(children) => format!("Or({})", keys(children)),
            Not(child) => format!("Not({})", child.cache_key(variables)),
            Compare(op, a, b) => format!(
                "({} {} {})",
                a.cache_key(variables),
                op.as_str(),
                b.cache_key(variables)
            ),
            Add(a, b) => format!("({} + {})", a.cache_key(variables), b.cache_key(variables)),
            Subtract(a, b) => format!("({} - {})", a.cache_key(variables), b.cache_key(variables)),
            Multiply(a, b) => format!("({} * {})", a.cache_key(variables), b.cache_key(variables)),
            Divide(a, b) => format!("({} / {})", a.cache_key(variables), b.cache_key(variables)),
            UnaryMinus(child) => format!("(-{})", child.cache_key(variables)),
            Bound(variable) => format!("Bound({})", column(variable)),
            Coalesce(children) => format!("Coalesce({})", keys(children)),
            If(c, t, e) => format!(
                "If({},{},{})",
                c.cache_key(variables),
                t.cache_key(variables),
                e.cache_key(variables)
            ),
            Str(child) => format!("Str({})", child.cache_key(variables)),
            StrLen(child) => format!("StrLen({})", child.cache_key(variables)),
            UCase(child) => format!("UCase({})", child.cache_key(variables)),
            LCase(child) => format!("LCase({})", child.cache_key(variables)),
            Concat(children) => format!("Concat({})", keys(children)),
            Contains(a, b) => {
                format!("Contains({},{})", a.cache_key(variables), b.cache_key(variables))
            }
            Regex { target, pattern } => {
                format!("Regex({},{})", target.cache_key(variables), pattern.as_str())
            }
            Year(child) => format!("Year({})", child.cache_key(variables)),
            Month(child) => format!("Month({})", child.cache_key(variables)),
            Day(child) => format!("Day({})", child.cache_key(variables)),
            Latitude(child) => format!("Latitude({})", child.cache_key(variables)),
            Longitude(child) => format!("Longitude({})", child.cache_key(variables)),
            GeoDistance(a, b) => {
                format!("GeoDistance({},{})", a.cache_key(variables), b.cache_key(variables))
            }
            GeoArea(child) => format!("GeoArea({})", child.cache_key(variables)),
        }
    }

    /// The variables this expression reads.
    pub fn referenced_variables(&self, out: &mut Vec<Variable>) {
        use SparqlExpression::*;
        match self {
            Constant(_) => {}
            SparqlExpression::Variable(variable) | Bound(variable) => {
                out.push(variable.clone())
            }
            And(children) | Or(children) | Coalesce(children) | Concat(children) => {
                for child in children {
                    child.referenced_variables(out);
                }
            }
            Not(child) | UnaryMinus(child) | Str(child) | StrLen(child) | UCase(child)
            | LCase(child) | Year(child) | Month(child) | Day(child) | Latitude(child)
            | Longitude(child) | GeoArea(child) => child.referenced_variables(out),
            Compare(_, a, b)
            | Add(a, b)
            | Subtract(a, b)
            | Multiply(a, b)
            | Divide(a, b)
            | Contains(a, b)
            | GeoDistance(a, b) => {
                a.referenced_variables(out);
                b.referenced_variables(out);
            }
            If(c, t, e) => {
                c.referenced_variables(out);
                t.referenced_variables(out);
                e.referenced_variables(out);
            }
            Regex { target, .. } => target.referenced_variables(out),
        }
    }
}

pub struct EvalContext<'a> {
    pub table: &'a IdTable,
    pub variable_columns: &'a VariableColumns,
    pub index: &'a Index,
    pub local_vocab: &'a LocalVocab,
    pub builder: &'a mut LocalVocabBuilder,
}

impl<'a> EvalContext<'a> {
    fn variable_column(&self, variable: &Variable) -> Option<usize> {
        self.variable_columns.get(variable).map(|&(column, _)| column)
    }

    /// Resolves a string-valued id; numeric ids are rendered, so string
    /// functions compose with arithmetic results.
    fn string_value(&self, id: ValueId) -> Result<Option<Cow<'_, str>>> {
        Ok(match id.datatype() {
            Datatype::VocabIndex | Datatype::TextRecordIndex => {
                Some(self.index.vocabulary().word(id.payload())?)
            }
            Datatype::LocalVocabIndex => {
                let (chunk, word) = id.as_local_vocab_index().expect("checked datatype");
                if chunk == self.builder.chunk_id() {
                    self.builder.word(word).map(|w| Cow::Owned(w.to_owned()))
                } else {
                    Some(Cow::Borrowed(self.local_vocab.resolve(id)?))
                }
            }
            Datatype::Int => Some(Cow::Owned(id.as_int().unwrap().to_string())),
            Datatype::Double => Some(Cow::Owned(format!("{}", id.as_double().unwrap()))),
            Datatype::Bool => {
                Some(Cow::Borrowed(if id.as_bool().unwrap() { "true" } else { "false" }))
            }
            _ => None,
        })
    }
}

/// SPARQL's effective boolean value; `None` is the type error case.
pub fn effective_boolean_value(id: ValueId) -> Option<bool> {
    match id.datatype() {
        Datatype::Bool => id.as_bool(),
        Datatype::Int => Some(id.as_int().unwrap() != 0),
        Datatype::Double => {
            let value = id.as_double().unwrap();
            Some(value != 0.0 && !value.is_nan())
        }
        _ => None,
    }
}

fn is_stringish(id: ValueId) -> bool {
    matches!(
        id.datatype(),
        Datatype::VocabIndex | Datatype::LocalVocabIndex | Datatype::TextRecordIndex
    )
}

impl SparqlExpression {
    /// Evaluates to one id per row of the context's table.
    pub fn evaluate(&self, context: &mut EvalContext<'_>) -> Result<Vec<ValueId>> {
        use SparqlExpression::*;
        let rows = context.table.num_rows();
        match self {
            Constant(id) => Ok(vec![*id; rows]),
            SparqlExpression::Variable(variable) => match context.variable_column(variable) {
                Some(column) => Ok(context.table.column(column).collect()),
                None => Ok(vec![ValueId::UNDEFINED; rows]),
            },
            Bound(variable) => match context.variable_column(variable) {
                Some(column) => Ok(context
                    .table
                    .column(column)
                    .map(|id| ValueId::from_bool(!id.is_undefined()))
                    .collect()),
                None => Ok(vec![ValueId::from_bool(false); rows]),
            },
            And(children) => {
                let columns = evaluate_all(children, context)?;
                Ok(combine_rows(rows, |row| {
                    let mut result = Some(true);
                    for column in &columns {
                        match effective_boolean_value(column[row]) {
                            Some(false) => return ValueId::from_bool(false),
                            Some(true) => {}
                            None => result = None,
                        }
                    }
                    result.map(ValueId::from_bool).unwrap_or(ValueId::UNDEFINED)
                }))
            }
            Or(children) => {
                let columns = evaluate_all(children, context)?;
                Ok(combine_rows(rows, |row| {
                    let mut result = Some(false);
                    for column in &columns {
                        match effective_boolean_value(column[row]) {
                            Some(true) => return ValueId::from_bool(true),
                            Some(false) => {}
                            None => result = None,
                        }
                    }
                    result.map(ValueId::from_bool).unwrap_or(ValueId::UNDEFINED)
                }))
            }
            Not(child) => {
                let column = child.evaluate(context)?;
                Ok(column
                    .into_iter()
                    .map(|id| match effective_boolean_value(id) {
                        Some(value) => ValueId::from_bool(!value),
                        None => ValueId::UNDEFINED,
                    })
                    .collect())
            }
            Compare(op, a, b) => {
                let left = a.evaluate(context)?;
                let right = b.evaluate(context)?;
                let mut result = Vec::with_capacity(rows);
                for row in 0..rows {
                    result.push(compare_values(context, *op, left[row], right[row])?);
                }
                Ok(result)
            }
            Add(a, b) => arithmetic(context, a, b, i64::checked_add, |x, y| x + y),
            Subtract(a, b) => arithmetic(context, a, b, i64::checked_sub, |x, y| x - y),
            Multiply(a, b) => arithmetic(context, a, b, i64::checked_mul, |x, y| x * y),
            Divide(a, b) => {
                // SPARQL division is always numeric division.
                let left = a.evaluate(context)?;
                let right = b.evaluate(context)?;
                Ok(combine_rows(rows, |row| {
                    match (left[row].as_numeric(), right[row].as_numeric()) {
                        (Some(x), Some(y)) if y != 0.0 => ValueId::from_double(x / y),
                        _ => ValueId::UNDEFINED,
                    }
                }))
            }
            UnaryMinus(child) => {
                let column = child.evaluate(context)?;
                Ok(column
                    .into_iter()
                    .map(|id| match id.datatype() {
                        Datatype::Int => ValueId::from_int(-id.as_int().unwrap()),
                        Datatype::Double => ValueId::from_double(-id.as_double().unwrap()),
                        _ => ValueId::UNDEFINED,
                    })
                    .collect())
            }
            Coalesce(children) => {
                let columns = evaluate_all(children, context)?;
                Ok(combine_rows(rows, |row| {
                    columns
                        .iter()
                        .map(|column| column[row])
                        .find(|id| !id.is_undefined())
                        .unwrap_or(ValueId::UNDEFINED)
                }))
            }
            If(condition, then, otherwise) => {
                let condition = condition.evaluate(context)?;
                let then = then.evaluate(context)?;
                let otherwise = otherwise.evaluate(context)?;
                Ok(combine_rows(rows, |row| match effective_boolean_value(condition[row]) {
                    Some(true) => then[row],
                    Some(false) => otherwise[row],
                    None => ValueId::UNDEFINED,
                }))
            }
            Str(child) => string_function(context, child, |s| Some(s.into_owned())),
            UCase(child) => string_function(context, child, |s| Some(s.to_uppercase())),
            LCase(child) => string_function(context, child, |s| Some(s.to_lowercase())),
            StrLen(child) => {
                let column = child.evaluate(context)?;
                let mut result = Vec::with_capacity(rows);
                for id in column {
                    result.push(match context.string_value(id)? {
                        Some(string) => ValueId::from_int(string.chars().count() as i64),
                        None => ValueId::UNDEFINED,
                    });
                }
                Ok(result)
            }
            Concat(children) => {
                let columns = evaluate_all(children, context)?;
                let mut result = Vec::with_capacity(rows);
                for row in 0..rows {
                    let mut concatenated = String::new();
                    let mut valid = true;
                    for column in &columns {
                        match context.string_value(column[row])? {
                            Some(string) => concatenated.push_str(&string),
                            None => {
                                valid = false;
                                break;
                            }
                        }
                    }
                    result.push(if valid {
                        context.builder.get_or_add(&concatenated)
                    } else {
                        ValueId::UNDEFINED
                    });
                }
                Ok(result)
            }
            Contains(haystack, needle) => {
                let haystacks = haystack.evaluate(context)?;
                let needles = needle.evaluate(context)?;
                let mut result = Vec::with_capacity(rows);
                for row in 0..rows {
                    result.push(
                        match (
                            context.string_value(haystacks[row])?,
                            context.string_value(needles[row])?,
                        ) {
                            (Some(h), Some(n)) => ValueId::from_bool(h.contains(n.as_ref())),
                            _ => ValueId::UNDEFINED,
                        },
                    );
                }
                Ok(result)
            }
            Regex { target, pattern } => {
                let column = target.evaluate(context)?;
                let mut result = Vec::with_capacity(rows);
                for id in column {
                    result.push(match context.string_value(id)? {
                        Some(string) => ValueId::from_bool(pattern.is_match(&string)),
                        None => ValueId::UNDEFINED,
                    });
                }
                Ok(result)
            }
            Year(child) => date_accessor(context, child, |date| date.year as i64),
            Month(child) => date_accessor(context, child, |date| date.month as i64),
            Day(child) => date_accessor(context, child, |date| date.day as i64),
            Latitude(child) => {
                let column = child.evaluate(context)?;
                Ok(column
                    .into_iter()
                    .map(|id| geo_coordinate(context, id).map_or(ValueId::UNDEFINED, |(lat, _)| {
                        ValueId::from_double(lat)
                    }))
                    .collect())
            }
            Longitude(child) => {
                let column = child.evaluate(context)?;
                Ok(column
                    .into_iter()
                    .map(|id| geo_coordinate(context, id).map_or(ValueId::UNDEFINED, |(_, lng)| {
                        ValueId::from_double(lng)
                    }))
                    .collect())
            }
            GeoDistance(a, b) => {
                let left = a.evaluate(context)?;
                let right = b.evaluate(context)?;
                Ok(combine_rows(rows, |row| {
                    match (
                        geo_coordinate(context, left[row]),
                        geo_coordinate(context, right[row]),
                    ) {
                        (Some(from), Some(to)) => ValueId::from_double(haversine_meters(from, to)),
                        _ => ValueId::UNDEFINED,
                    }
                }))
            }
            GeoArea(child) => {
                let column = child.evaluate(context)?;
                Ok(column
                    .into_iter()
                    .map(|id| match id.as_vocab_index() {
                        Some(index) => match context.index.vocabulary().geo_info(index) {
                            Some(info) => ValueId::from_double(info.metric_area()),
                            None => ValueId::UNDEFINED,
                        },
                        None => ValueId::UNDEFINED,
                    })
                    .collect())
            }
        }
    }
}

fn evaluate_all(
    children: &[SparqlExpression],
    context: &mut EvalContext<'_>,
) -> Result<Vec<Vec<ValueId>>> {
    children.iter().map(|child| child.evaluate(context)).collect()
}

fn combine_rows(rows: usize, f: impl Fn(usize) -> ValueId) -> Vec<ValueId> {
    (0..rows).map(f).collect()
}

fn arithmetic(
    context: &mut EvalContext<'_>,
    a: &SparqlExpression,
    b: &SparqlExpression,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    double_op: impl Fn(f64, f64) -> f64,
) -> Result<Vec<ValueId>> {
    let left = a.evaluate(context)?;
    let right = b.evaluate(context)?;
    Ok(left
        .into_iter()
        .zip(right)
        .map(|(x, y)| match (x.datatype(), y.datatype()) {
            (Datatype::Int, Datatype::Int) => {
                match int_op(x.as_int().unwrap(), y.as_int().unwrap()) {
                    Some(result) => ValueId::from_int(result),
                    // Integer overflow escalates to doubles.
                    None => ValueId::from_double(double_op(
                        x.as_int().unwrap() as f64,
                        y.as_int().unwrap() as f64,
                    )),
                }
            }
            _ => match (x.as_numeric(), y.as_numeric()) {
                (Some(x), Some(y)) => ValueId::from_double(double_op(x, y)),
                _ => ValueId::UNDEFINED,
            },
        })
        .collect())
}

fn compare_values(
    context: &EvalContext<'_>,
    op: Comparison,
    a: ValueId,
    b: ValueId,
) -> Result<ValueId> {
    // Two materialised strings compare lexicographically even when one of
    // them lives in a local vocab and the other in the global one.
    let ordering: Option<Ordering> = if is_stringish(a) && is_stringish(b) {
        match (string_for_compare(context, a)?, string_for_compare(context, b)?) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        }
    } else {
        compare_ids(a, b)
    };
    Ok(match ordering {
        Some(ordering) => ValueId::from_bool(op.matches(ordering)),
        None => ValueId::UNDEFINED,
    })
}

fn string_for_compare<'a>(
    context: &'a EvalContext<'_>,
    id: ValueId,
) -> Result<Option<Cow<'a, str>>> {
    Ok(match id.datatype() {
        Datatype::VocabIndex | Datatype::TextRecordIndex => {
            Some(context.index.vocabulary().word(id.payload())?)
        }
        Datatype::LocalVocabIndex => {
            let (chunk, word) = id.as_local_vocab_index().expect("checked datatype");
            if chunk == context.builder.chunk_id() {
                context.builder.word(word).map(|w| Cow::Owned(w.to_owned()))
            } else {
                Some(Cow::Borrowed(context.local_vocab.resolve(id)?))
            }
        }
        _ => None,
    })
}

fn string_function(
    context: &mut EvalContext<'_>,
    child: &SparqlExpression,
    f: impl Fn(Cow<'_, str>) -> Option<String>,
) -> Result<Vec<ValueId>> {
    let column = child.evaluate(context)?;
    let mut result = Vec::with_capacity(column.len());
    for id in column {
        let value = context.string_value(id)?.map(|s| s.into_owned());
        result.push(match value.map(Cow::Owned).and_then(&f) {
            Some(string) => context.builder.get_or_add(&string),
            None => ValueId::UNDEFINED,
        });
    }
    Ok(result)
}

fn date_accessor(
    context: &mut EvalContext<'_>,
    child: &SparqlExpression,
    accessor: impl Fn(DateValue) -> i64,
) -> Result<Vec<ValueId>> {
    let column = child.evaluate(context)?;
    Ok(column
        .into_iter()
        .map(|id| match id.as_date() {
            Some(date) => ValueId::from_int(accessor(date)),
            None => ValueId::UNDEFINED,
        })
        .collect())
}

/// A `(lat, lng)` for a geo-point id, or the centroid of a WKT literal.
fn geo_coordinate(context: &EvalContext<'_>, id: ValueId) -> Option<(f64, f64)> {
    if let Some(point) = id.as_geo_point() {
        return Some(point);
    }
    let index = id.as_vocab_index()?;
    let info = context.index.vocabulary().geo_info(index)?;
    let (lng, lat) = info.centroid();
    Some((lat, lng))
}

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

fn haversine_meters((lat1, lng1): (f64, f64), (lat2, lng2): (f64, f64)) -> f64 {
    let (lat1, lng1, lat2, lng2) =
        (lat1.to_radians(), lng1.to_radians(), lat2.to_radians(), lng2.to_radians());
    let half_dlat = (lat2 - lat1) / 2.0;
    let half_dlng = (lng2 - lng1) / 2.0;
    let a = half_dlat.sin().powi(2) + lat1.cos() * lat2.cos() * half_dlng.sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_index::TestIndex;
    use crate::MemoryBudget;

    fn eval_single(
        test: &TestIndex,
        expression: &SparqlExpression,
        columns: &[(&str, ValueId)],
    ) -> ValueId {
        let mut table = IdTable::new(columns.len(), MemoryBudget::unlimited());
        table.push_row(&columns.iter().map(|&(_, id)| id).collect::<Vec<_>>()).unwrap();
        let variable_columns: VariableColumns = columns
            .iter()
            .enumerate()
            .map(|(i, &(name, _))| (Variable::new(name), (i, super::super::Definedness::AlwaysDefined)))
            .collect();
        let local_vocab = LocalVocab::new();
        let mut builder = LocalVocabBuilder::new();
        let mut context = EvalContext {
            table: &table,
            variable_columns: &variable_columns,
            index: &test.index,
            local_vocab: &local_vocab,
            builder: &mut builder,
        };
        let column = expression.evaluate(&mut context).unwrap();
        column[0]
    }

    #[test]
    fn arithmetic_and_comparison() {
        let test = TestIndex::small();
        let x = SparqlExpression::Variable(Variable::new("x"));
        let sum = SparqlExpression::Add(
            Box::new(x.clone()),
            Box::new(SparqlExpression::Constant(ValueId::from_int(8))),
        );
        assert_eq!(
            eval_single(&test, &sum, &[("x", ValueId::from_int(34))]),
            ValueId::from_int(42)
        );
        let compare = SparqlExpression::Compare(
            Comparison::LessThan,
            Box::new(x.clone()),
            Box::new(SparqlExpression::Constant(ValueId::from_double(2.5))),
        );
        assert_eq!(
            eval_single(&test, &compare, &[("x", ValueId::from_int(2))]),
            ValueId::from_bool(true)
        );
        let division = SparqlExpression::Divide(
            Box::new(x),
            Box::new(SparqlExpression::Constant(ValueId::from_int(0))),
        );
        assert_eq!(
            eval_single(&test, &division, &[("x", ValueId::from_int(1))]),
            ValueId::UNDEFINED
        );
    }

    #[test]
    fn logical_connectives_follow_sparql_three_valued_logic() {
        let test = TestIndex::small();
        let t = SparqlExpression::Constant(ValueId::from_bool(true));
        let undefined = SparqlExpression::Constant(ValueId::UNDEFINED);
        // true || error = true, true && error = error
        assert_eq!(
            eval_single(
                &test,
                &SparqlExpression::Or(vec![t.clone(), undefined.clone()]),
                &[("x", ValueId::from_int(0))]
            ),
            ValueId::from_bool(true)
        );
        assert_eq!(
            eval_single(
                &test,
                &SparqlExpression::And(vec![t, undefined]),
                &[("x", ValueId::from_int(0))]
            ),
            ValueId::UNDEFINED
        );
    }

    #[test]
    fn concat_materialises_into_the_local_vocab() {
        let test = TestIndex::small();
        let alice = test.id("<alice>");
        let concat = SparqlExpression::Concat(vec![
            SparqlExpression::Variable(Variable::new("x")),
            SparqlExpression::Constant(ValueId::from_int(1)),
        ]);
        let result = eval_single(&test, &concat, &[("x", alice)]);
        assert_eq!(result.datatype(), Datatype::LocalVocabIndex);
    }

    #[test]
    fn bound_and_coalesce() {
        let test = TestIndex::small();
        let bound = SparqlExpression::Bound(Variable::new("x"));
        assert_eq!(
            eval_single(&test, &bound, &[("x", ValueId::UNDEFINED)]),
            ValueId::from_bool(false)
        );
        let coalesce = SparqlExpression::Coalesce(vec![
            SparqlExpression::Variable(Variable::new("x")),
            SparqlExpression::Constant(ValueId::from_int(7)),
        ]);
        assert_eq!(
            eval_single(&test, &coalesce, &[("x", ValueId::UNDEFINED)]),
            ValueId::from_int(7)
        );
    }

    #[test]
    fn regex_rejects_invalid_patterns_at_construction() {
        let expression =
            SparqlExpression::regex(SparqlExpression::Variable(Variable::new("x")), "[invalid");
        assert!(expression.is_err());
    }

    #[test]
    fn geo_distance_between_points() {
        let test = TestIndex::small();
        let paris = ValueId::from_geo_point(48.8566, 2.3522);
        let london = ValueId::from_geo_point(51.5074, -0.1278);
        let distance = SparqlExpression::GeoDistance(
            Box::new(SparqlExpression::Variable(Variable::new("a"))),
            Box::new(SparqlExpression::Variable(Variable::new("b"))),
        );
        let result = eval_single(&test, &distance, &[("a", paris), ("b", london)]);
        let meters = result.as_double().unwrap();
        // Paris to London is about 344 km.
        assert!((meters - 344_000.0).abs() < 10_000.0, "{meters}");
    }
}
