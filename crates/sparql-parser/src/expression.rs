//! The FILTER/BIND expression grammar.
//!
//! BNF grammar:
//!
//! ```text
//! expression = or
//! or         = and ("||" and)*
//! and        = relational ("&&" relational)*
//! relational = additive (("=" | "!=" | "<=" | ">=" | "<" | ">") additive)?
//! additive   = multiplicative (("+" | "-") multiplicative)*
//! multiplicative = unary (("*" | "/") unary)*
//! unary      = "!" unary | "-" unary | primary
//! primary    = "(" expression ")" | function | var | literal | iri
//! function   = name "(" (expression ("," expression)*)? ")"
//! ```

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::InputTake;

use crate::error::{cut_with_err, Error, ErrorKind};
use crate::{parse_term, ws, IResult, Prefixes, Span, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Or(Vec<Expression>),
    And(Vec<Expression>),
    Not(Box<Expression>),
    Compare { op: ComparisonOp, left: Box<Expression>, right: Box<Expression> },
    Add(Box<Expression>, Box<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Box<Expression>, Box<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    UnaryMinus(Box<Expression>),
    /// Builtin calls like `REGEX(…)` and namespaced ones like
    /// `geof:latitude(…)`; resolution happens in the engine.
    Function { name: String, args: Vec<Expression> },
    Variable(String),
    Iri(String),
    StringLiteral(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

pub(crate) fn parse_expression<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    parse_or(input, prefixes)
}

fn parse_or<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (mut rest, first) = parse_and(input, prefixes)?;
    let mut children = vec![first];
    loop {
        let (after, _) = ws(rest)?;
        match tag::<_, _, Error>("||")(after) {
            Ok((after, _)) => {
                let (after, next) = parse_and(after, prefixes)?;
                children.push(next);
                rest = after;
            }
            Err(_) => {
                return Ok((
                    rest,
                    if children.len() == 1 { children.pop().unwrap() } else { Expression::Or(children) },
                ))
            }
        }
    }
}

fn parse_and<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (mut rest, first) = parse_relational(input, prefixes)?;
    let mut children = vec![first];
    loop {
        let (after, _) = ws(rest)?;
        match tag::<_, _, Error>("&&")(after) {
            Ok((after, _)) => {
                let (after, next) = parse_relational(after, prefixes)?;
                children.push(next);
                rest = after;
            }
            Err(_) => {
                return Ok((
                    rest,
                    if children.len() == 1 { children.pop().unwrap() } else { Expression::And(children) },
                ))
            }
        }
    }
}

fn parse_relational<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (rest, left) = parse_additive(input, prefixes)?;
    let (after, _) = ws(rest)?;
    let operator = alt((
        tag::<_, _, Error>("<="),
        tag(">="),
        tag("!="),
        tag("<"),
        tag(">"),
        tag("="),
    ))(after);
    match operator {
        Ok((after, op)) => {
            let op = match *op.fragment() {
                "<=" => ComparisonOp::LessEqual,
                ">=" => ComparisonOp::GreaterEqual,
                "!=" => ComparisonOp::NotEqual,
                "<" => ComparisonOp::Less,
                ">" => ComparisonOp::Greater,
                "=" => ComparisonOp::Equal,
                _ => unreachable!(),
            };
            let (after, right) = cut_with_err(
                |i| parse_additive(i, prefixes),
                |i| Error::new_from_kind(i, ErrorKind::ExpectedExpression),
            )(after)?;
            Ok((
                after,
                Expression::Compare { op, left: Box::new(left), right: Box::new(right) },
            ))
        }
        Err(_) => Ok((rest, left)),
    }
}

fn parse_additive<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (mut rest, mut left) = parse_multiplicative(input, prefixes)?;
    loop {
        let (after, _) = ws(rest)?;
        match alt((char::<_, Error>('+'), char('-')))(after) {
            Ok((after, operator)) => {
                let (after, right) = parse_multiplicative(after, prefixes)?;
                left = match operator {
                    '+' => Expression::Add(Box::new(left), Box::new(right)),
                    _ => Expression::Subtract(Box::new(left), Box::new(right)),
                };
                rest = after;
            }
            Err(_) => return Ok((rest, left)),
        }
    }
}

fn parse_multiplicative<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (mut rest, mut left) = parse_unary(input, prefixes)?;
    loop {
        let (after, _) = ws(rest)?;
        match alt((char::<_, Error>('*'), char('/')))(after) {
            Ok((after, operator)) => {
                let (after, right) = parse_unary(after, prefixes)?;
                left = match operator {
                    '*' => Expression::Multiply(Box::new(left), Box::new(right)),
                    _ => Expression::Divide(Box::new(left), Box::new(right)),
                };
                rest = after;
            }
            Err(_) => return Ok((rest, left)),
        }
    }
}

fn parse_unary<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (input, _) = ws(input)?;
    if let Ok((after, _)) = char::<_, Error>('!')(input) {
        let (after, inner) = parse_unary(after, prefixes)?;
        return Ok((after, Expression::Not(Box::new(inner))));
    }
    if let Ok((after, _)) = char::<_, Error>('-')(input) {
        let (after, inner) = parse_unary(after, prefixes)?;
        return Ok((after, Expression::UnaryMinus(Box::new(inner))));
    }
    parse_primary(input, prefixes)
}

/// A function name: `REGEX`, `geof:latitude`, …
fn parse_function_name(input: Span) -> IResult<String> {
    let text: &str = &input;
    let mut end = 0;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() || c == '_' || c == '-' || c == ':' {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    if end == 0 || !text.starts_with(|c: char| c.is_alphabetic()) {
        return Err(nom::Err::Error(Error::new_from_kind(input, ErrorKind::ExpectedExpression)));
    }
    let (rest, name) = input.take_split(end);
    Ok((rest, name.to_string()))
}

fn parse_primary<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Expression> {
    let (input, _) = ws(input)?;
    if let Ok((after, _)) = char::<_, Error>('(')(input) {
        let (after, inner) = parse_expression(after, prefixes)?;
        let (after, _) = ws(after)?;
        let (after, _) = cut_with_err(
            |i| char::<_, Error>(')')(i),
            |i| Error::new_from_kind(i, ErrorKind::ExpectedClosingParenthesis),
        )(after)?;
        return Ok((after, inner));
    }
    // A name directly followed by `(` is a function call; the probe runs
    // before term parsing because a prefixed name would swallow it.
    if let Ok((after, name)) = parse_function_name(input) {
        let (after_ws, _) = ws(after)?;
        if let Ok((mut rest, _)) = char::<_, Error>('(')(after_ws) {
            let mut args = Vec::new();
            loop {
                let (after, _) = ws(rest)?;
                if let Ok((after, _)) = char::<_, Error>(')')(after) {
                    return Ok((after, Expression::Function { name, args }));
                }
                if !args.is_empty() {
                    let (after, _) = cut_with_err(
                        |i| char::<_, Error>(',')(i),
                        |i| Error::new_from_kind(i, ErrorKind::ExpectedClosingParenthesis),
                    )(after)?;
                    let (after, argument) = parse_expression(after, prefixes)?;
                    args.push(argument);
                    rest = after;
                } else {
                    let (after, argument) = parse_expression(after, prefixes)?;
                    args.push(argument);
                    rest = after;
                }
            }
        }
    }
    map(|i| parse_term(i, prefixes), |term| match term {
        Term::Variable(name) => Expression::Variable(name),
        Term::Iri(iri) => Expression::Iri(iri),
        Term::StringLiteral(text) => Expression::StringLiteral(text),
        Term::Int(value) => Expression::Int(value),
        Term::Double(value) => Expression::Double(value),
        Term::Bool(value) => Expression::Bool(value),
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expression {
        let prefixes = Prefixes::new();
        let (rest, expression) =
            parse_expression(Span::new(input), &prefixes).expect("expression parses");
        assert!(rest.trim_start().is_empty(), "unparsed rest: {rest}");
        expression
    }

    #[test]
    fn precedence_of_connectives() {
        let expression = parse("?x < 5 && ?y = 2 || ?z != 1");
        match expression {
            Expression::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], Expression::And(_)));
                assert!(matches!(children[1], Expression::Compare { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let expression = parse("?x + 2 * 3");
        match expression {
            Expression::Add(_, right) => assert!(matches!(*right, Expression::Multiply(_, _))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn function_calls() {
        let expression = parse("REGEX(?name, \"^a.*\")");
        match expression {
            Expression::Function { name, args } => {
                assert_eq!(name, "REGEX");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        let expression = parse("geof:latitude(?point)");
        assert!(
            matches!(expression, Expression::Function { name, .. } if name == "geof:latitude")
        );
    }

    #[test]
    fn negation_and_parentheses() {
        let expression = parse("!(?x = 1)");
        assert!(matches!(expression, Expression::Not(_)));
        let expression = parse("(?x + 1) * 2");
        assert!(matches!(expression, Expression::Multiply(_, _)));
    }
}
