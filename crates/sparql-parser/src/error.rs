use std::fmt::Display;

use nom::error::{self as nom_error, ParseError};
use nom::Parser;

use crate::{IResult, Span};

/// Replaces the error returned by `parser` with `error(input)` and commits
/// to it, so the message the user sees names the construct that actually
/// failed instead of the innermost combinator.
pub fn cut_with_err<'a, O>(
    mut parser: impl FnMut(Span<'a>) -> IResult<'a, O>,
    mut error: impl FnMut(Span<'a>) -> Error<'a>,
) -> impl FnMut(Span<'a>) -> IResult<'a, O> {
    move |input| match parser.parse(input) {
        Err(nom::Err::Error(_)) => Err(nom::Err::Failure(error(input))),
        result => result,
    }
}

#[derive(Debug)]
pub struct Error<'a> {
    context: Span<'a>,
    kind: ErrorKind,
}

#[derive(Debug)]
pub enum ErrorKind {
    ExpectedKeyword(&'static str),
    ExpectedVariable,
    ExpectedTerm,
    ExpectedTripleTermination,
    ExpectedClosingBrace,
    ExpectedClosingParenthesis,
    ExpectedProjection,
    ExpectedExpression,
    UnknownPrefix(String),
    InvalidNumber,
    UnterminatedString,
    TrailingInput,
    Nom(nom_error::ErrorKind),
    External(String),
}

impl<'a> Error<'a> {
    pub fn new_from_kind(context: Span<'a>, kind: ErrorKind) -> Self {
        Self { context, kind }
    }

    pub fn new_from_external(context: Span<'a>, error: impl std::error::Error) -> Self {
        Self::new_from_kind(context, ErrorKind::External(error.to_string()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// 1-based line and column of the failure.
    pub fn position(&self) -> (u32, usize) {
        (self.context.location_line(), self.context.get_utf8_column())
    }
}

impl<'a> ParseError<Span<'a>> for Error<'a> {
    fn from_error_kind(input: Span<'a>, kind: nom_error::ErrorKind) -> Self {
        Self::new_from_kind(input, ErrorKind::Nom(kind))
    }

    fn append(_input: Span<'a>, _kind: nom_error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl Display for Error<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (line, column) = self.position();
        match &self.kind {
            ErrorKind::ExpectedKeyword(keyword) => {
                write!(f, "expected `{keyword}`")?;
            }
            ErrorKind::ExpectedVariable => write!(f, "expected a variable starting with `?`")?,
            ErrorKind::ExpectedTerm => {
                write!(f, "expected an IRI, a literal, or a variable")?;
            }
            ErrorKind::ExpectedTripleTermination => {
                write!(f, "expected `.` or `}}` after a triple pattern")?;
            }
            ErrorKind::ExpectedClosingBrace => write!(f, "expected a closing `}}`")?,
            ErrorKind::ExpectedClosingParenthesis => write!(f, "expected a closing `)`")?,
            ErrorKind::ExpectedProjection => {
                write!(f, "expected `*` or a list of variables after SELECT")?;
            }
            ErrorKind::ExpectedExpression => write!(f, "expected an expression")?,
            ErrorKind::UnknownPrefix(prefix) => {
                write!(f, "the prefix `{prefix}:` was not declared in the prologue")?;
            }
            ErrorKind::InvalidNumber => write!(f, "invalid numeric literal")?,
            ErrorKind::UnterminatedString => write!(f, "unterminated string literal")?,
            ErrorKind::TrailingInput => {
                write!(f, "unexpected trailing input after the end of the query")?;
            }
            ErrorKind::Nom(_) => write!(f, "could not parse the query")?,
            ErrorKind::External(message) => write!(f, "{message}")?,
        }
        write!(f, " at line {line}, column {column}")
    }
}

impl std::error::Error for Error<'_> {}
