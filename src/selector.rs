// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Display;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, multispace0, none_of},
    combinator::{all_consuming, cut, map, opt, recognize},
    error::{Error as NomError, context},
    multi::{fold_many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
};
use thiserror::Error;

use crate::labels::METRIC_NAME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub name: String,
    pub value: String,
    pub kind: MatchKind,
}

impl Matcher {
    pub fn new(kind: MatchKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNotMatch,
}

impl Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchKind::Equal => write!(f, "="),
            MatchKind::NotEqual => write!(f, "!="),
            MatchKind::RegexMatch => write!(f, "=~"),
            MatchKind::RegexNotMatch => write!(f, "!~"),
        }
    }
}

impl Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind, self.value)
    }
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("failed to parse series selector: {0}")]
    Invalid(String),
    #[error("series selector must contain at least one matcher")]
    Empty,
}

/// Parses `metric{a="b", c=~"d"}` into matchers. A leading metric name
/// becomes an `__name__` equality matcher placed first.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>, SelectorError> {
    let matchers = all_consuming(delimited(multispace0, selector, multispace0))
        .parse(input)
        .map(|(_, matchers)| matchers)
        .map_err(|err| SelectorError::Invalid(err.to_string()))?;
    if matchers.is_empty() {
        return Err(SelectorError::Empty);
    }
    Ok(matchers)
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

fn selector(input: &str) -> NomResult<'_, Vec<Matcher>> {
    let (input, name) = opt(metric_identifier).parse(input)?;
    let (input, braces) = if name.is_some() {
        opt(matcher_list).parse(input)?
    } else {
        map(matcher_list, Some).parse(input)?
    };
    let mut matchers = Vec::new();
    if let Some(name) = name {
        matchers.push(Matcher::new(MatchKind::Equal, METRIC_NAME, name));
    }
    matchers.extend(braces.unwrap_or_default());
    Ok((input, matchers))
}

fn matcher_list(input: &str) -> NomResult<'_, Vec<Matcher>> {
    context(
        "label matchers",
        delimited(
            preceded(multispace0, char('{')),
            terminated(
                separated_list0(
                    preceded(multispace0, char(',')),
                    preceded(multispace0, label_matcher),
                ),
                opt(preceded(multispace0, char(','))),
            ),
            preceded(multispace0, char('}')),
        ),
    )
    .parse(input)
}

fn label_matcher(input: &str) -> NomResult<'_, Matcher> {
    context(
        "label matcher",
        map(
            context("label name", recognize(pair(label_start, label_chars)))
                .and(preceded(
                    multispace0,
                    context(
                        "match operator",
                        alt((tag("=~"), tag("!~"), tag("!="), tag("="))),
                    ),
                ))
                .and(preceded(multispace0, string_literal)),
            |((name, op), value)| {
                let kind = match op {
                    "=~" => MatchKind::RegexMatch,
                    "!~" => MatchKind::RegexNotMatch,
                    "!=" => MatchKind::NotEqual,
                    _ => MatchKind::Equal,
                };
                Matcher::new(kind, name, value)
            },
        ),
    )
    .parse(input)
}

fn metric_identifier(input: &str) -> NomResult<'_, String> {
    map(
        recognize(pair(take_while1(is_metric_start), take_while(is_metric_char))),
        |ident: &str| ident.to_string(),
    )
    .parse(input)
}

fn string_literal(input: &str) -> NomResult<'_, String> {
    context(
        "string literal",
        alt((double_quoted_literal, single_quoted_literal, backtick_literal)),
    )
    .parse(input)
}

fn double_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('"'),
        cut(fold_many0(
            alt((none_of("\\\""), escaped_char)),
            String::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
        )),
        char('"'),
    )
    .parse(input)
}

fn single_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('\''),
        cut(fold_many0(
            alt((none_of("\\'"), escaped_char)),
            String::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
        )),
        char('\''),
    )
    .parse(input)
}

fn backtick_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('`'),
        cut(map(take_until("`"), |value: &str| value.to_string())),
        char('`'),
    )
    .parse(input)
}

fn escaped_char(input: &str) -> NomResult<'_, char> {
    preceded(
        char('\\'),
        alt((
            map(char('\\'), |_| '\\'),
            map(char('"'), |_| '"'),
            map(char('\''), |_| '\''),
            map(char('n'), |_| '\n'),
            map(char('r'), |_| '\r'),
            map(char('t'), |_| '\t'),
        )),
    )
    .parse(input)
}

fn label_start(input: &str) -> NomResult<'_, &str> {
    take_while1(is_label_start)(input)
}

fn label_chars(input: &str) -> NomResult<'_, &str> {
    take_while(is_label_char)(input)
}

fn is_label_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_label_char(ch: char) -> bool {
    is_label_start(ch) || ch.is_ascii_digit()
}

fn is_metric_start(ch: char) -> bool {
    is_label_start(ch) || ch == ':'
}

fn is_metric_char(ch: char) -> bool {
    is_metric_start(ch) || ch.is_ascii_digit()
}
