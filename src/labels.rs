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

use std::{collections::BTreeMap, fmt::Display};

use xxhash_rust::xxh64::Xxh64;

/// Label carrying the metric name.
pub const METRIC_NAME: &str = "__name__";
/// Matcher name used to request an explicit engine aggregate.
pub const AGGREGATE_LABEL: &str = "Aggregate";
/// Engine field the metric name is stored under in update expressions.
pub const ENGINE_NAME_FIELD: &str = "_name";

const SEP: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered label pairs. Order is preserved verbatim: callers that need a
/// stable key string must sort before encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<Label>,
}

/// Storage identity derived from a label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesKey {
    pub metric_name: String,
    pub key: String,
    pub hash: u64,
}

impl LabelSet {
    pub fn new(labels: Vec<Label>) -> Self {
        Self { labels }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.push(Label::new(name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }

    pub fn metric_name(&self) -> &str {
        self.get(METRIC_NAME).unwrap_or("")
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|label| label.name.clone()).collect()
    }

    /// Digest over every name/value pair, metric name included. Pairs are
    /// sorted first so the digest does not depend on input order.
    pub fn hash(&self) -> u64 {
        let mut sorted: Vec<&Label> = self.labels.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));
        let mut hasher = Xxh64::new(0);
        for label in sorted {
            hasher.update(label.name.as_bytes());
            hasher.update(&[SEP]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[SEP]);
        }
        hasher.digest()
    }

    /// Encodes the set as metric name, `a=1,b=2` key string and hash.
    pub fn encode_key(&self) -> SeriesKey {
        let mut metric_name = String::new();
        let mut parts = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            if label.name == METRIC_NAME {
                metric_name = label.value.clone();
            } else {
                parts.push(format!("{}={}", label.name, label.value));
            }
        }
        SeriesKey {
            metric_name,
            key: parts.join(","),
            hash: self.hash(),
        }
    }

    /// Builds the engine mutation expression, e.g. `_name='cpu'; host='a'; `.
    pub fn update_expression(&self) -> String {
        let mut expr = String::new();
        for label in &self.labels {
            let field = if label.name == METRIC_NAME {
                ENGINE_NAME_FIELD
            } else {
                label.name.as_str()
            };
            expr.push_str(&format!("{field}='{}'; ", label.value));
        }
        expr
    }

    /// Keeps the metric name plus any label listed in `keep`.
    pub fn filter(&self, keep: &[String]) -> LabelSet {
        let labels = self
            .labels
            .iter()
            .filter(|label| {
                label.name == METRIC_NAME || keep.iter().any(|name| *name == label.name)
            })
            .cloned()
            .collect();
        LabelSet { labels }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|label| (label.name.clone(), label.value.clone()))
            .collect()
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self::from_pairs(map)
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (idx, label) in self.labels.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}
