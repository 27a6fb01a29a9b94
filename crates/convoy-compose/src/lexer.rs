//! Tokenization of compose string values using `nom`.
//!
//! Two small grammars live here: POSIX-style shell words (used to split
//! string-form `command` / `entrypoint` values) and `$`-templates (used by
//! variable interpolation).

use convoy_common::error::{ComposeError, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{anychar, char, multispace0, satisfy},
    combinator::{map, opt},
    multi::many1,
    sequence::{delimited, preceded},
};

/// Parses a single-quoted run; the body is taken literally.
fn single_quoted(input: &str) -> IResult<&str, String> {
    let (input, body) =
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')).parse(input)?;
    Ok((input, body.to_owned()))
}

/// Parses a double-quoted run with shell escape rules.
///
/// Inside double quotes a backslash only escapes `$`, `` ` ``, `"`, `\` and
/// newline; before any other character it is kept.
fn double_quoted(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let mut result = String::new();
    let mut chars = input.char_indices();
    loop {
        match chars.next() {
            Some((idx, '"')) => return Ok((&input[idx + 1..], result)),
            Some((_, '\\')) => match chars.next() {
                Some((_, '\n')) => {}
                Some((_, c @ ('$' | '`' | '"' | '\\'))) => result.push(c),
                Some((_, c)) => {
                    result.push('\\');
                    result.push(c);
                }
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::Char,
                    )));
                }
            },
            Some((_, c)) => result.push(c),
            None => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )));
            }
        }
    }
}

/// Parses a backslash escape outside quotes. An escaped newline vanishes.
fn escaped_char(input: &str) -> IResult<&str, String> {
    let (input, c) = preceded(char('\\'), anychar).parse(input)?;
    let text = if c == '\n' { String::new() } else { c.to_string() };
    Ok((input, text))
}

const fn is_bare(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '\'' | '"' | '\\')
}

fn bare_run(input: &str) -> IResult<&str, String> {
    let (input, run) = take_while1(is_bare)(input)?;
    Ok((input, run.to_owned()))
}

/// Parses one shell word: adjacent quoted and unquoted pieces concatenate.
fn shell_word(input: &str) -> IResult<&str, String> {
    let (input, pieces) =
        many1(alt((single_quoted, double_quoted, escaped_char, bare_run))).parse(input)?;
    Ok((input, pieces.concat()))
}

/// Splits `input` into words the way a POSIX shell would, without
/// performing any expansion.
///
/// `field` names the value being split and is used in error messages.
///
/// # Errors
///
/// Returns [`ComposeError::Normalization`] on an unterminated quote or a
/// trailing backslash.
pub fn split_shell(field: &str, input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut remaining = input;

    loop {
        let (rest, _) = multispace0::<&str, nom::error::Error<&str>>(remaining).map_err(|e| {
            ComposeError::Normalization {
                field: field.to_owned(),
                message: format!("cannot skip whitespace: {e}"),
            }
        })?;
        remaining = rest;

        if remaining.is_empty() {
            break;
        }

        let (rest, word) = shell_word(remaining).map_err(|_| ComposeError::Normalization {
            field: field.to_owned(),
            message: format!("unterminated quote or escape in \"{input}\""),
        })?;
        words.push(word);
        remaining = rest;
    }

    Ok(words)
}

/// How a `${NAME...}` reference treats a missing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier<'a> {
    /// `${NAME-default}` / `${NAME:-default}`.
    Default {
        /// Replacement text.
        value: &'a str,
        /// `:` form: an empty value counts as missing.
        empty_is_missing: bool,
    },
    /// `${NAME?err}` / `${NAME:?err}`.
    Required {
        /// Error text reported when the value is missing.
        message: &'a str,
        /// `:` form: an empty value counts as missing.
        empty_is_missing: bool,
    },
}

/// One piece of a tokenized `$`-template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Text copied as-is.
    Literal(&'a str),
    /// `$$`, which stands for a single `$`.
    Dollar,
    /// A variable reference.
    Variable {
        /// Variable name.
        name: &'a str,
        /// Missing-value handling, if any.
        modifier: Option<Modifier<'a>>,
    },
}

const fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_name_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn variable_name(input: &str) -> IResult<&str, &str> {
    let _ = satisfy(is_name_start)(input)?;
    take_while1(is_name_continue)(input)
}

fn modifier(input: &str) -> IResult<&str, Modifier<'_>> {
    let (input, colon) = opt(char(':')).parse(input)?;
    let empty_is_missing = colon.is_some();
    let body = |c: char| c != '}';
    alt((
        map(preceded(char('-'), take_while(body)), move |value| {
            Modifier::Default {
                value,
                empty_is_missing,
            }
        }),
        map(preceded(char('?'), take_while(body)), move |message| {
            Modifier::Required {
                message,
                empty_is_missing,
            }
        }),
    ))
    .parse(input)
}

fn dollar_escape(input: &str) -> IResult<&str, Segment<'_>> {
    let (input, _) = tag("$$")(input)?;
    Ok((input, Segment::Dollar))
}

fn braced_variable(input: &str) -> IResult<&str, Segment<'_>> {
    let (input, (name, modifier)) =
        delimited(tag("${"), (variable_name, opt(modifier)), char('}')).parse(input)?;
    Ok((input, Segment::Variable { name, modifier }))
}

fn bare_variable(input: &str) -> IResult<&str, Segment<'_>> {
    let (input, name) = preceded(char('$'), variable_name).parse(input)?;
    Ok((
        input,
        Segment::Variable {
            name,
            modifier: None,
        },
    ))
}

/// Text up to the next `$`, or a `$` that starts no valid reference.
fn literal(input: &str) -> IResult<&str, Segment<'_>> {
    alt((
        map(take_while1(|c: char| c != '$'), Segment::Literal),
        map(tag("$"), Segment::Literal),
    ))
    .parse(input)
}

fn segment(input: &str) -> IResult<&str, Segment<'_>> {
    alt((dollar_escape, braced_variable, bare_variable, literal)).parse(input)
}

/// Tokenizes a `$`-template.
///
/// Never fails: anything that is not a well-formed reference is returned as
/// literal text.
#[must_use]
pub fn template_segments(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut remaining = input;
    while !remaining.is_empty() {
        if let Ok((rest, seg)) = segment(remaining) {
            segments.push(seg);
            remaining = rest;
        } else {
            segments.push(Segment::Literal(remaining));
            break;
        }
    }
    segments
}
