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

use std::sync::Arc;

use thiserror::Error;

use crate::labels::{LabelSet, SeriesKey};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("metric not found for reference {0}")]
    MetricNotFound(u64),
    #[error("invalid filter expression `{expr}`: {reason}")]
    InvalidFilter { expr: String, reason: String },
    #[error("query failed: {0}")]
    Query(String),
}

/// Translated select request handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub name: String,
    pub filter: String,
    pub functions: String,
    pub step: i64,
    pub aggregation_window: i64,
    pub from: i64,
    pub to: i64,
}

/// A label set in the shape the write cache consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSeries {
    pub key: SeriesKey,
    pub update_expr: String,
    pub labels: LabelSet,
}

impl EncodedSeries {
    pub fn encode(labels: &LabelSet) -> Self {
        Self {
            key: labels.encode_key(),
            update_expr: labels.update_expression(),
            labels: labels.clone(),
        }
    }
}

pub trait Engine: Send + Sync {
    fn querier(&self) -> Result<Box<dyn TsdbQuerier>, EngineError>;

    /// Prepares the write path and hands out the shared cache.
    fn metrics_cache(&self) -> Result<Arc<dyn MetricsCache>, EngineError>;

    fn start_time(&self) -> Result<i64, EngineError>;
}

pub trait TsdbQuerier: Send {
    /// With `no_aggr` set the engine returns raw samples even if
    /// `functions` is populated.
    fn select(
        &self,
        params: &QueryDescriptor,
        no_aggr: bool,
    ) -> Result<Box<dyn TsdbSeriesSet>, EngineError>;

    fn label_sets(&self, name: &str, filter: &str) -> Result<Vec<LabelSet>, EngineError>;

    fn label_names(&self) -> Result<Vec<String>, EngineError>;

    fn label_values(&self, name: &str) -> Result<Vec<String>, EngineError>;
}

pub trait TsdbSeriesSet: Send {
    fn next(&mut self) -> bool;
    fn at(&self) -> Box<dyn TsdbSeries>;
    fn err(&self) -> Option<&EngineError>;
}

pub trait TsdbSeries: Send {
    fn labels(&self) -> LabelSet;
    fn iterator(&self) -> Box<dyn TsdbSeriesIterator>;
}

pub trait TsdbSeriesIterator: Send {
    fn seek(&mut self, t: i64) -> bool;
    fn next(&mut self) -> bool;
    fn at(&self) -> (i64, f64);
    fn err(&self) -> Option<&EngineError>;
}

pub trait MetricsCache: Send + Sync {
    /// Writes a sample and returns the reference for later fast-path writes.
    fn add(&self, series: &EncodedSeries, t: i64, v: f64) -> Result<u64, EngineError>;

    fn add_fast(&self, reference: u64, t: i64, v: f64) -> Result<(), EngineError>;
}
