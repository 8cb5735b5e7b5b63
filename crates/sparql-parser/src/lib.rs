//! Parser for the SPARQL 1.1 subset the engine executes.
//!
//! BNF grammar:
//!
//! ```text
//! query          = prologue (selectQuery | constructQuery) EOF
//! prologue       = ("PREFIX" PNAME ":" IRIREF)*
//! selectQuery    = "SELECT" "DISTINCT"? projection "WHERE"? group solutionModifier
//! constructQuery = "CONSTRUCT" "{" triples "}" "WHERE" group solutionModifier
//! projection     = "*" | var+
//! group          = "{" element* "}"
//! element        = group "UNION" group
//!                | "OPTIONAL" group
//!                | "FILTER" "(" expression ")"
//!                | "BIND" "(" expression "AS" var ")"
//!                | "VALUES" var "{" term* "}"
//!                | triple "."?
//! triple         = term path term
//! path           = (iri | var) ("+" | "*" | "?")?
//! term           = var | iri | literal
//! var            = "?" name
//! iri            = "<" .* ">" | PNAME ":" name
//! literal        = string ("^^" iri | LANGTAG)? | number | boolean
//! solutionModifier = ("ORDER" "BY" var+)? ("LIMIT" int)? ("OFFSET" int)?
//! ```
//!
//! Prefixed names are expanded against the prologue; the builtin `ql:` and
//! `geof:` prefixes pass through verbatim so the engine can recognise its
//! text-search predicates and spatial functions.

mod error;
mod expression;

use std::collections::HashMap;

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_till, take_while1};
use nom::character::complete::char;
use nom::combinator::{eof, map, opt, value};
use nom::multi::many1;
use nom::sequence::{delimited, preceded, tuple};
use nom::{Finish, InputTake};
use nom_locate::LocatedSpan;

pub use crate::error::{cut_with_err, Error, ErrorKind};
pub use crate::expression::{ComparisonOp, Expression};

pub type Span<'a> = LocatedSpan<&'a str>;

pub(crate) type IResult<'a, Ret> = nom::IResult<Span<'a>, Ret, Error<'a>>;

/// One RDF term position of a triple pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Variable(String),
    /// Without the angle brackets, prefixes already expanded.
    Iri(String),
    StringLiteral(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// A predicate position: a plain term or a property path with a
/// transitive modifier.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyPath {
    Direct(Term),
    /// `<p>+`
    OneOrMore(String),
    /// `<p>*`
    ZeroOrMore(String),
    /// `<p>?`
    ZeroOrOne(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern {
    pub subject: Term,
    pub path: PropertyPath,
    pub object: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternElement {
    Triple(TriplePattern),
    Filter(Expression),
    Bind { expression: Expression, target: String },
    Values { variable: String, values: Vec<Term> },
    Optional(Vec<PatternElement>),
    Union(Vec<PatternElement>, Vec<PatternElement>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Wildcard,
    Variables(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolutionModifiers {
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projection: Projection,
    pub pattern: Vec<PatternElement>,
    pub modifiers: SolutionModifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstructQuery {
    pub template: Vec<TriplePattern>,
    pub pattern: Vec<PatternElement>,
    pub modifiers: SolutionModifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(SelectQuery),
    Construct(ConstructQuery),
}

type Prefixes = HashMap<String, String>;

/// Parses a full query string.
pub fn parse_query(input: &str) -> Result<Query, Error<'_>> {
    let span = Span::new(input);
    let (rest, (prefixes, _)) = tuple((parse_prologue, ws))(span).finish()?;
    let (rest, query) = alt((
        |i| parse_select(i, &prefixes),
        |i| parse_construct(i, &prefixes),
    ))(rest)
    .finish()?;
    let (_, _) = tuple((
        ws,
        cut_with_err(eof, |i| Error::new_from_kind(i, ErrorKind::TrailingInput)),
    ))(rest)
    .finish()?;
    Ok(query)
}

/// Skips whitespace and `#` comments.
fn ws(input: Span) -> IResult<()> {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        let consumed = rest.len() - trimmed.len();
        rest = rest.take_split(consumed).0;
        if rest.starts_with('#') {
            let (after, _) = take_till::<_, _, Error>(|c| c == '\n')(rest)
                .expect("take_till cannot fail");
            rest = after;
        } else {
            return Ok((rest, ()));
        }
    }
}

fn keyword<'a>(word: &'static str) -> impl FnMut(Span<'a>) -> IResult<'a, ()> {
    move |input| {
        let (input, _) = ws(input)?;
        value((), tag_no_case(word))(input)
    }
}

fn parse_prologue(input: Span) -> IResult<Prefixes> {
    let mut prefixes = Prefixes::new();
    let mut rest = input;
    loop {
        match keyword("PREFIX")(rest) {
            Ok((after, _)) => {
                let (after, _) = ws(after)?;
                let (after, name) = opt(parse_name)(after)?;
                let (after, _) = cut_with_err(
                    |i| value((), char(':'))(i),
                    |i| Error::new_from_kind(i, ErrorKind::ExpectedKeyword(":")),
                )(after)?;
                let (after, _) = ws(after)?;
                let (after, iri) = parse_iri_ref(after)?;
                prefixes.insert(name.unwrap_or_default(), iri);
                rest = after;
            }
            Err(_) => return Ok((rest, prefixes)),
        }
    }
}

/// `<http://…>`
fn parse_iri_ref(input: Span) -> IResult<String> {
    map(
        delimited(char('<'), take_till(|c| c == '>' || c == '\n'), char('>')),
        |iri: Span| iri.to_string(),
    )(input)
}

fn parse_name(input: Span) -> IResult<String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
        |name: Span| name.to_string(),
    )(input)
}

/// `?variable`
fn parse_variable(input: Span) -> IResult<String> {
    let (input, _) = ws(input)?;
    preceded(
        char('?'),
        cut_with_err(parse_name, |i| Error::new_from_kind(i, ErrorKind::ExpectedVariable)),
    )(input)
}

/// A prefixed name such as `foaf:knows`, `ql:contains-word` or `a`.
fn parse_prefixed_name<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, String> {
    let start = input;
    let (input, prefix) = opt(parse_name)(input)?;
    let (input, _) = char(':')(input)?;
    let (input, local) = opt(parse_name)(input)?;
    let prefix = prefix.unwrap_or_default();
    let local = local.unwrap_or_default();
    match prefixes.get(&prefix) {
        Some(expansion) => Ok((input, format!("{expansion}{local}"))),
        // The engine's builtin namespaces stay un-expanded.
        None if prefix == "ql" || prefix == "geof" => Ok((input, format!("{prefix}:{local}"))),
        None => Err(nom::Err::Failure(Error::new_from_kind(
            start,
            ErrorKind::UnknownPrefix(prefix),
        ))),
    }
}

fn parse_iri<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, String> {
    let (input, _) = ws(input)?;
    alt((parse_iri_ref, |i| parse_prefixed_name(i, prefixes)))(input)
}

/// A double-quoted string with backslash escapes.
fn parse_string(input: Span) -> IResult<String> {
    let (mut rest, _) = char('"')(input)?;
    let mut text = String::new();
    loop {
        let mut chars = rest.char_indices();
        match chars.next() {
            None => {
                return Err(nom::Err::Failure(Error::new_from_kind(
                    input,
                    ErrorKind::UnterminatedString,
                )))
            }
            Some((_, '"')) => return Ok((rest.take_split(1).0, text)),
            Some((_, '\\')) => match chars.next() {
                Some((i, escaped)) => {
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    rest = rest.take_split(i + escaped.len_utf8()).0;
                }
                None => {
                    return Err(nom::Err::Failure(Error::new_from_kind(
                        input,
                        ErrorKind::UnterminatedString,
                    )))
                }
            },
            Some((i, c)) => {
                text.push(c);
                rest = rest.take_split(i + c.len_utf8()).0;
            }
        }
    }
}

fn parse_number(input: Span) -> IResult<Term> {
    let text: &str = &input;
    let mut end = text
        .char_indices()
        .take_while(|&(_, c)| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    // A trailing dot terminates the triple, it is not part of the number.
    while end > 0 && text[..end].ends_with('.') {
        end -= 1;
    }
    if end == 0 {
        return Err(nom::Err::Error(Error::new_from_kind(input, ErrorKind::InvalidNumber)));
    }
    let slice = &text[..end];
    let (rest, _) = input.take_split(end);
    if slice.contains(['.', 'e', 'E']) {
        match slice.parse::<f64>() {
            Ok(double) => Ok((rest, Term::Double(double))),
            Err(_) => {
                Err(nom::Err::Failure(Error::new_from_kind(input, ErrorKind::InvalidNumber)))
            }
        }
    } else {
        match slice.parse::<i64>() {
            Ok(int) => Ok((rest, Term::Int(int))),
            Err(_) => {
                Err(nom::Err::Failure(Error::new_from_kind(input, ErrorKind::InvalidNumber)))
            }
        }
    }
}

/// A literal: string (with optional datatype or language tag), number, or
/// boolean. Numeric datatypes fold into the inline numeric terms.
fn parse_literal<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Term> {
    let (input, _) = ws(input)?;
    if input.starts_with('"') {
        let (input, text) = parse_string(input)?;
        let datatype = match preceded(tag::<_, _, Error>("^^"), |i| parse_iri(i, prefixes))(input)
        {
            Ok(parsed) => Some(parsed),
            Err(failure @ nom::Err::Failure(_)) => return Err(failure),
            Err(_) => None,
        };
        if let Some((input, datatype)) = datatype {
            let term = match datatype.as_str() {
                "http://www.w3.org/2001/XMLSchema#integer"
                | "http://www.w3.org/2001/XMLSchema#int"
                | "http://www.w3.org/2001/XMLSchema#long" => {
                    text.parse::<i64>().map(Term::Int).unwrap_or(Term::StringLiteral(text))
                }
                "http://www.w3.org/2001/XMLSchema#double"
                | "http://www.w3.org/2001/XMLSchema#decimal"
                | "http://www.w3.org/2001/XMLSchema#float" => {
                    text.parse::<f64>().map(Term::Double).unwrap_or(Term::StringLiteral(text))
                }
                "http://www.w3.org/2001/XMLSchema#boolean" => {
                    if text == "true" {
                        Term::Bool(true)
                    } else if text == "false" {
                        Term::Bool(false)
                    } else {
                        Term::StringLiteral(text)
                    }
                }
                _ => Term::StringLiteral(text),
            };
            return Ok((input, term));
        }
        // An optional language tag is parsed and dropped.
        let (input, _) = opt(preceded(char('@'), parse_name))(input)?;
        return Ok((input, Term::StringLiteral(text)));
    }
    if let Ok((rest, _)) = tag_no_case::<_, _, Error>("true")(input) {
        return Ok((rest, Term::Bool(true)));
    }
    if let Ok((rest, _)) = tag_no_case::<_, _, Error>("false")(input) {
        return Ok((rest, Term::Bool(false)));
    }
    parse_number(input)
}

pub(crate) fn parse_term<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Term> {
    let (input, _) = ws(input)?;
    if input.starts_with('?') {
        return map(parse_variable, Term::Variable)(input);
    }
    if input.starts_with('<') {
        return map(parse_iri_ref, Term::Iri)(input);
    }
    if let Ok(result) = parse_literal(input, prefixes) {
        return Ok(result);
    }
    if let Ok((rest, iri)) = parse_prefixed_name(input, prefixes) {
        return Ok((rest, Term::Iri(iri)));
    }
    Err(nom::Err::Error(Error::new_from_kind(input, ErrorKind::ExpectedTerm)))
}

fn parse_path<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, PropertyPath> {
    let (input, _) = ws(input)?;
    if input.starts_with('?') {
        return map(parse_variable, |v| PropertyPath::Direct(Term::Variable(v)))(input);
    }
    let (input, iri) = parse_iri(input, prefixes)?;
    let (input, modifier) = opt(alt((char('+'), char('*'), char('?'))))(input)?;
    Ok((
        input,
        match modifier {
            Some('+') => PropertyPath::OneOrMore(iri),
            Some('*') => PropertyPath::ZeroOrMore(iri),
            Some('?') => PropertyPath::ZeroOrOne(iri),
            _ => PropertyPath::Direct(Term::Iri(iri)),
        },
    ))
}

fn parse_triple<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, TriplePattern> {
    let (input, subject) = parse_term(input, prefixes)?;
    let (input, path) = parse_path(input, prefixes)?;
    let (input, object) = cut_with_err(
        |i| parse_term(i, prefixes),
        |i| Error::new_from_kind(i, ErrorKind::ExpectedTerm),
    )(input)?;
    Ok((input, TriplePattern { subject, path, object }))
}

fn parse_group<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Vec<PatternElement>> {
    let (input, _) = ws(input)?;
    let (mut rest, _) = char('{')(input)?;
    let mut elements = Vec::new();
    loop {
        let (after_ws, _) = ws(rest)?;
        if let Ok((after, _)) = char::<_, Error>('}')(after_ws) {
            return Ok((after, elements));
        }
        if after_ws.is_empty() {
            return Err(nom::Err::Failure(Error::new_from_kind(
                after_ws,
                ErrorKind::ExpectedClosingBrace,
            )));
        }
        let (after, element) = parse_element(after_ws, prefixes)?;
        elements.push(element);
        rest = after;
    }
}

fn parse_element<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, PatternElement> {
    // A nested group is either the left arm of a UNION or a plain group.
    if let Ok((after, left)) = parse_group(input, prefixes) {
        let (after, _) = cut_with_err(keyword("UNION"), |i| {
            Error::new_from_kind(i, ErrorKind::ExpectedKeyword("UNION"))
        })(after)?;
        let (after, right) = parse_group(after, prefixes)?;
        return Ok((after, PatternElement::Union(left, right)));
    }
    if let Ok((after, _)) = keyword("OPTIONAL")(input) {
        let (after, group) = parse_group(after, prefixes)?;
        return Ok((after, PatternElement::Optional(group)));
    }
    if let Ok((after, _)) = keyword("FILTER")(input) {
        let (after, _) = ws(after)?;
        let (after, expression) = delimited(
            char('('),
            |i| expression::parse_expression(i, prefixes),
            cut_with_err(
                preceded(ws, char(')')),
                |i| Error::new_from_kind(i, ErrorKind::ExpectedClosingParenthesis),
            ),
        )(after)?;
        return Ok((after, PatternElement::Filter(expression)));
    }
    if let Ok((after, _)) = keyword("BIND")(input) {
        let (after, _) = ws(after)?;
        let (after, _) = char('(')(after)?;
        let (after, expression) = expression::parse_expression(after, prefixes)?;
        let (after, _) = cut_with_err(keyword("AS"), |i| {
            Error::new_from_kind(i, ErrorKind::ExpectedKeyword("AS"))
        })(after)?;
        let (after, target) = parse_variable(after)?;
        let (after, _) = ws(after)?;
        let (after, _) = cut_with_err(
            |i| char::<_, Error>(')')(i),
            |i| Error::new_from_kind(i, ErrorKind::ExpectedClosingParenthesis),
        )(after)?;
        return Ok((after, PatternElement::Bind { expression, target }));
    }
    if let Ok((after, _)) = keyword("VALUES")(input) {
        let (after, variable) = parse_variable(after)?;
        let (after, _) = ws(after)?;
        let (after, _) = char('{')(after)?;
        let (mut rest, _) = ws(after)?;
        let mut values = Vec::new();
        loop {
            if let Ok((after, _)) = char::<_, Error>('}')(rest) {
                return Ok((after, PatternElement::Values { variable, values }));
            }
            let (after, term) = parse_term(rest, prefixes)?;
            values.push(term);
            let (after, _) = ws(after)?;
            rest = after;
        }
    }
    let (after, triple) = parse_triple(input, prefixes)?;
    let (after, _) = ws(after)?;
    let (after, _) = opt(char('.'))(after)?;
    Ok((after, PatternElement::Triple(triple)))
}

fn parse_integer(input: Span) -> IResult<u64> {
    let (input, _) = ws(input)?;
    let (rest, digits) = take_while1(|c: char| c.is_ascii_digit())(input)?;
    match digits.parse::<u64>() {
        Ok(number) => Ok((rest, number)),
        Err(_) => Err(nom::Err::Failure(Error::new_from_kind(input, ErrorKind::InvalidNumber))),
    }
}

fn parse_modifiers(input: Span) -> IResult<SolutionModifiers> {
    let mut modifiers = SolutionModifiers::default();
    let (mut rest, _) = ws(input)?;
    if let Ok((after, _)) = tuple((keyword("ORDER"), keyword("BY")))(rest) {
        let (after, variables) = many1(parse_variable)(after)?;
        modifiers.order_by = variables;
        rest = after;
    }
    if let Ok((after, _)) = keyword("LIMIT")(rest) {
        let (after, limit) = parse_integer(after)?;
        modifiers.limit = Some(limit);
        rest = after;
    }
    if let Ok((after, _)) = keyword("OFFSET")(rest) {
        let (after, offset) = parse_integer(after)?;
        modifiers.offset = Some(offset);
        rest = after;
    }
    Ok((rest, modifiers))
}

fn parse_select<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Query> {
    let (input, _) = keyword("SELECT")(input)?;
    let (input, distinct) = opt(keyword("DISTINCT"))(input)?;
    let (input, _) = ws(input)?;
    let (input, projection) = cut_with_err(
        alt((
            map(char('*'), |_| Projection::Wildcard),
            map(many1(parse_variable), Projection::Variables),
        )),
        |i| Error::new_from_kind(i, ErrorKind::ExpectedProjection),
    )(input)?;
    let (input, _) = opt(keyword("WHERE"))(input)?;
    let (input, pattern) = parse_group(input, prefixes)?;
    let (input, modifiers) = parse_modifiers(input)?;
    Ok((
        input,
        Query::Select(SelectQuery {
            distinct: distinct.is_some(),
            projection,
            pattern,
            modifiers,
        }),
    ))
}

fn parse_construct<'a>(input: Span<'a>, prefixes: &Prefixes) -> IResult<'a, Query> {
    let (input, _) = keyword("CONSTRUCT")(input)?;
    let (input, _) = ws(input)?;
    let (mut rest, _) = char('{')(input)?;
    let mut template = Vec::new();
    loop {
        let (after, _) = ws(rest)?;
        if let Ok((after, _)) = char::<_, Error>('}')(after) {
            rest = after;
            break;
        }
        let (after, triple) = parse_triple(after, prefixes)?;
        template.push(triple);
        let (after, _) = ws(after)?;
        let (after, _) = opt(char('.'))(after)?;
        rest = after;
    }
    let (input, _) = cut_with_err(keyword("WHERE"), |i| {
        Error::new_from_kind(i, ErrorKind::ExpectedKeyword("WHERE"))
    })(rest)?;
    let (input, pattern) = parse_group(input, prefixes)?;
    let (input, modifiers) = parse_modifiers(input)?;
    Ok((input, Query::Construct(ConstructQuery { template, pattern, modifiers })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(input: &str) -> SelectQuery {
        match parse_query(input).unwrap() {
            Query::Select(select) => select,
            Query::Construct(_) => panic!("expected a SELECT query"),
        }
    }

    #[test]
    fn minimal_select() {
        let query = select("SELECT * WHERE { ?s ?p ?o }");
        assert_eq!(query.projection, Projection::Wildcard);
        assert_eq!(query.pattern.len(), 1);
        assert_eq!(
            query.pattern[0],
            PatternElement::Triple(TriplePattern {
                subject: Term::Variable("s".to_owned()),
                path: PropertyPath::Direct(Term::Variable("p".to_owned())),
                object: Term::Variable("o".to_owned()),
            })
        );
    }

    #[test]
    fn prefixes_expand() {
        let query = select(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/>\n\
             SELECT ?x { ?x foaf:knows ?y . }",
        );
        match &query.pattern[0] {
            PatternElement::Triple(triple) => {
                assert_eq!(
                    triple.path,
                    PropertyPath::Direct(Term::Iri(
                        "http://xmlns.com/foaf/0.1/knows".to_owned()
                    ))
                );
            }
            other => panic!("unexpected element {other:?}"),
        }
    }

    #[test]
    fn unknown_prefix_is_an_error_with_position() {
        let error = parse_query("SELECT ?x { ?x foaf:knows ?y }").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("foaf"), "{message}");
        assert!(message.contains("line 1"), "{message}");
    }

    #[test]
    fn builtin_prefixes_pass_through() {
        let query = select("SELECT ?t { ?t ql:contains-word \"test*\" }");
        match &query.pattern[0] {
            PatternElement::Triple(triple) => {
                assert_eq!(
                    triple.path,
                    PropertyPath::Direct(Term::Iri("ql:contains-word".to_owned()))
                );
                assert_eq!(triple.object, Term::StringLiteral("test*".to_owned()));
            }
            other => panic!("unexpected element {other:?}"),
        }
    }

    #[test]
    fn property_paths() {
        let query = select("SELECT * { <x> <p>* <y> . ?a <q>+ ?b }");
        match (&query.pattern[0], &query.pattern[1]) {
            (PatternElement::Triple(first), PatternElement::Triple(second)) => {
                assert_eq!(first.path, PropertyPath::ZeroOrMore("p".to_owned()));
                assert_eq!(second.path, PropertyPath::OneOrMore("q".to_owned()));
            }
            other => panic!("unexpected elements {other:?}"),
        }
    }

    #[test]
    fn filters_and_binds() {
        let query = select(
            "SELECT ?x { ?x <age> ?age . FILTER(?age >= 18 && ?age != 99) \
             BIND(?age + 1 AS ?next) }",
        );
        assert!(matches!(query.pattern[1], PatternElement::Filter(_)));
        assert!(
            matches!(&query.pattern[2], PatternElement::Bind { target, .. } if target == "next")
        );
    }

    #[test]
    fn optional_union_values() {
        let query = select(
            "SELECT * { ?x <p> ?y OPTIONAL { ?y <q> ?z } \
             { ?x <r> ?w } UNION { ?x <s> ?w } VALUES ?x { <a> <b> } }",
        );
        assert!(matches!(query.pattern[1], PatternElement::Optional(_)));
        assert!(matches!(query.pattern[2], PatternElement::Union(_, _)));
        assert!(
            matches!(&query.pattern[3], PatternElement::Values { values, .. } if values.len() == 2)
        );
    }

    #[test]
    fn solution_modifiers() {
        let query = select("SELECT ?x { ?x <p> ?y } ORDER BY ?y LIMIT 10 OFFSET 5");
        assert_eq!(query.modifiers.order_by, vec!["y".to_owned()]);
        assert_eq!(query.modifiers.limit, Some(10));
        assert_eq!(query.modifiers.offset, Some(5));
    }

    #[test]
    fn typed_literals_fold_to_numbers() {
        let query = select(
            "SELECT * { ?x <age> \"42\"^^<http://www.w3.org/2001/XMLSchema#integer> . \
             ?x <height> 1.82 }",
        );
        match (&query.pattern[0], &query.pattern[1]) {
            (PatternElement::Triple(first), PatternElement::Triple(second)) => {
                assert_eq!(first.object, Term::Int(42));
                assert_eq!(second.object, Term::Double(1.82));
            }
            other => panic!("unexpected elements {other:?}"),
        }
    }

    #[test]
    fn construct_query() {
        let query = parse_query(
            "CONSTRUCT { ?x <met> ?y } WHERE { ?x <knows> ?y } LIMIT 3",
        )
        .unwrap();
        match query {
            Query::Construct(construct) => {
                assert_eq!(construct.template.len(), 1);
                assert_eq!(construct.modifiers.limit, Some(3));
            }
            Query::Select(_) => panic!("expected CONSTRUCT"),
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let error = parse_query("SELECT * { ?s ?p ?o } garbage").unwrap_err();
        assert!(error.to_string().contains("trailing"), "{error}");
    }

    #[test]
    fn missing_object_reports_position() {
        let error = parse_query("SELECT * { ?s <p> }").unwrap_err();
        let (line, column) = error.position();
        assert_eq!(line, 1);
        assert!(column > 10);
    }
}
