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

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, recognize},
    error::{Error as NomError, context},
    multi::separated_list1,
    sequence::{delimited, pair, preceded},
};
use regex::Regex;

use crate::labels::{ENGINE_NAME_FIELD, LabelSet, METRIC_NAME};

use super::engine::EngineError;

/// Conjunction of filter clauses in the engine's expression grammar.
#[derive(Debug, Clone, Default)]
pub struct FilterExpr {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
enum Clause {
    Compare {
        field: String,
        negated: bool,
        value: String,
    },
    RegexpInstr {
        field: String,
        regex: Regex,
        negated: bool,
        position: usize,
    },
}

#[derive(Debug)]
enum RawClause<'a> {
    Compare {
        field: &'a str,
        negated: bool,
        value: &'a str,
    },
    RegexpInstr {
        field: &'a str,
        pattern: &'a str,
        negated: bool,
        position: usize,
    },
}

impl FilterExpr {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let invalid = |reason: String| EngineError::InvalidFilter {
            expr: input.to_string(),
            reason,
        };
        let (_, raw) = all_consuming(delimited(multispace0, clauses, multispace0))
            .parse(input)
            .map_err(|err| invalid(err.to_string()))?;
        let clauses = raw
            .into_iter()
            .map(|clause| match clause {
                RawClause::Compare {
                    field,
                    negated,
                    value,
                } => Ok(Clause::Compare {
                    field: field.to_string(),
                    negated,
                    value: value.to_string(),
                }),
                RawClause::RegexpInstr {
                    field,
                    pattern,
                    negated,
                    position,
                } => Regex::new(pattern)
                    .map(|regex| Clause::RegexpInstr {
                        field: field.to_string(),
                        regex,
                        negated,
                        position,
                    })
                    .map_err(|err| invalid(err.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, metric_name: &str, labels: &LabelSet) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.matches(metric_name, labels))
    }
}

impl Clause {
    fn matches(&self, metric_name: &str, labels: &LabelSet) -> bool {
        match self {
            Clause::Compare {
                field,
                negated,
                value,
            } => (field_value(field, metric_name, labels) == value.as_str()) != *negated,
            Clause::RegexpInstr {
                field,
                regex,
                negated,
                position,
            } => {
                let found = regexp_instr(regex, field_value(field, metric_name, labels));
                (found == *position) != *negated
            }
        }
    }
}

fn field_value<'a>(field: &str, metric_name: &'a str, labels: &'a LabelSet) -> &'a str {
    if field == METRIC_NAME || field == ENGINE_NAME_FIELD {
        metric_name
    } else {
        labels.get(field).unwrap_or("")
    }
}

/// 1-based character position of the first match, 0 when there is none.
fn regexp_instr(regex: &Regex, value: &str) -> usize {
    regex
        .find(value)
        .map(|found| value[..found.start()].chars().count() + 1)
        .unwrap_or(0)
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

fn clauses(input: &str) -> NomResult<'_, Vec<RawClause<'_>>> {
    separated_list1(
        delimited(multispace1, tag("and"), multispace1),
        alt((regexp_clause, compare_clause)),
    )
    .parse(input)
}

fn compare_clause(input: &str) -> NomResult<'_, RawClause<'_>> {
    context(
        "comparison",
        map(
            (
                identifier,
                preceded(multispace0, comparison),
                preceded(multispace0, quoted),
            ),
            |(field, negated, value)| RawClause::Compare {
                field,
                negated,
                value,
            },
        ),
    )
    .parse(input)
}

fn regexp_clause(input: &str) -> NomResult<'_, RawClause<'_>> {
    context(
        "regexp_instr",
        map(
            (
                preceded(tag("regexp_instr"), preceded(multispace0, char('('))),
                preceded(multispace0, identifier),
                preceded(multispace0, char(',')),
                preceded(multispace0, quoted),
                preceded(multispace0, char(')')),
                preceded(multispace0, comparison),
                preceded(multispace0, map_res(digit1, str::parse::<usize>)),
            ),
            |(_, field, _, pattern, _, negated, position)| RawClause::RegexpInstr {
                field,
                pattern,
                negated,
                position,
            },
        ),
    )
    .parse(input)
}

fn comparison(input: &str) -> NomResult<'_, bool> {
    alt((map(tag("=="), |_| false), map(tag("!="), |_| true))).parse(input)
}

fn quoted(input: &str) -> NomResult<'_, &str> {
    delimited(char('\''), take_till(|ch: char| ch == '\''), char('\'')).parse(input)
}

fn identifier(input: &str) -> NomResult<'_, &str> {
    recognize(pair(
        take_while1(|ch: char| ch.is_ascii_alphabetic() || ch == '_'),
        take_while(|ch: char| ch.is_ascii_alphanumeric() || ch == '_'),
    ))
    .parse(input)
}
