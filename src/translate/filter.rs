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

use log::debug;

use crate::{
    labels::{AGGREGATE_LABEL, METRIC_NAME},
    selector::{MatchKind, Matcher},
};

/// Role a matcher plays in the translated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherClass<'a> {
    MetricName(&'a str),
    Aggregation(&'a str),
    Generic {
        name: &'a str,
        value: &'a str,
        kind: MatchKind,
    },
}

/// Only an equality on `__name__` selects the metric; other kinds on that
/// field are filtered like any other label.
pub fn classify(matcher: &Matcher) -> MatcherClass<'_> {
    if matcher.name == AGGREGATE_LABEL {
        MatcherClass::Aggregation(&matcher.value)
    } else if matcher.name == METRIC_NAME && matcher.kind == MatchKind::Equal {
        MatcherClass::MetricName(&matcher.value)
    } else {
        MatcherClass::Generic {
            name: &matcher.name,
            value: &matcher.value,
            kind: matcher.kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledMatchers {
    pub metric_name: String,
    pub filter: String,
    pub aggregation: String,
}

pub fn compile_matchers(matchers: &[Matcher]) -> CompiledMatchers {
    let mut compiled = CompiledMatchers::default();
    let mut clauses = Vec::new();
    for matcher in matchers {
        debug!("matcher: {matcher}");
        match classify(matcher) {
            MatcherClass::Aggregation(value) => compiled.aggregation = value.to_string(),
            MatcherClass::MetricName(value) => compiled.metric_name = value.to_string(),
            MatcherClass::Generic { name, value, kind } => {
                clauses.push(filter_clause(name, value, kind))
            }
        }
    }
    compiled.filter = clauses.join(" and ");
    compiled
}

// regexp_instr yields 0 when nothing matches; the comparison polarity below
// is what the engine expects and must not be flipped.
fn filter_clause(name: &str, value: &str, kind: MatchKind) -> String {
    match kind {
        MatchKind::Equal => format!("{name}=='{value}'"),
        MatchKind::NotEqual => format!("{name}!='{value}'"),
        MatchKind::RegexMatch => format!("regexp_instr({name},'{value}') == 0"),
        MatchKind::RegexNotMatch => format!("regexp_instr({name},'{value}') != 0"),
    }
}
