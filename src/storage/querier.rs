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
    error::StorageError,
    selector::Matcher,
    translate::{AggregationState, SelectHints, compile_matchers},
    tsdb::{QueryDescriptor, TsdbQuerier},
};

use super::series::{MetadataSeriesSet, PromSeriesSet, SeriesSet};

/// Read side bound to one `[mint, maxt]` range.
pub struct PromQuerier {
    querier: Box<dyn TsdbQuerier>,
    mint: i64,
    maxt: i64,
    aggregation: AggregationState,
}

impl PromQuerier {
    pub(crate) fn new(
        querier: Box<dyn TsdbQuerier>,
        mint: i64,
        maxt: i64,
        use_aggregates_config: bool,
    ) -> Self {
        Self {
            querier,
            mint,
            maxt,
            aggregation: AggregationState::new(use_aggregates_config),
        }
    }

    /// Marks whether the next selects may be aggregated by the engine.
    pub fn set_use_aggregates(&mut self, eligible: bool) {
        self.aggregation.set_session_eligible(eligible);
    }

    pub fn use_tsdb_aggregations(&self) -> bool {
        self.aggregation.eligible()
    }

    pub fn is_already_aggregated(&self, op: &str) -> bool {
        self.aggregation.is_already_aggregated(op)
    }

    pub fn time_range(&self) -> (i64, i64) {
        (self.mint, self.maxt)
    }

    /// Without hints only label sets are fetched and the returned series
    /// carry no samples.
    pub fn select(
        &mut self,
        hints: Option<&SelectHints>,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>, StorageError> {
        let compiled = compile_matchers(matchers);

        let Some(hints) = hints else {
            debug!(
                "metadata select name={:?} filter={:?}",
                compiled.metric_name, compiled.filter
            );
            let label_sets = self
                .querier
                .label_sets(&compiled.metric_name, &compiled.filter)?;
            return Ok(Box::new(MetadataSeriesSet::new(label_sets)));
        };

        let plan = self.aggregation.plan(hints, &compiled.aggregation);
        let params = QueryDescriptor {
            name: compiled.metric_name,
            filter: compiled.filter,
            functions: plan.function,
            step: plan.step,
            aggregation_window: plan.window,
            from: self.mint,
            to: self.maxt,
        };
        debug!(
            "querying tsdb params={params:?} no_pushdown={} use_aggregates={}",
            plan.no_pushdown,
            self.aggregation.eligible()
        );
        let set = self.querier.select(&params, plan.no_pushdown)?;
        Ok(Box::new(PromSeriesSet::new(set)))
    }

    pub fn label_values(&self, name: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.querier.label_values(name)?)
    }

    pub fn label_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.querier.label_names()?)
    }

    pub fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        labels::LabelSet,
        selector::{MatchKind, parse_selector},
        storage::{AdapterConfig, PromAdapter},
        tsdb::{EngineError, MemoryEngine},
    };

    fn adapter(engine: &MemoryEngine, use_tsdb_aggregations: bool) -> PromAdapter {
        let adapter = PromAdapter::new(
            Arc::new(engine.clone()),
            AdapterConfig {
                use_tsdb_aggregations,
            },
        );
        let appender = adapter.appender().unwrap();
        for (host, dc) in [("a", "eu"), ("b", "us")] {
            let labels = LabelSet::from_pairs([("__name__", "cpu"), ("dc", dc), ("host", host)]);
            for t in 1..=4 {
                appender.add(&labels, t * 1_000, t as f64).unwrap();
            }
        }
        adapter
    }

    fn drain(set: &mut dyn SeriesSet) -> Vec<(LabelSet, Vec<(i64, f64)>)> {
        let mut result = Vec::new();
        while set.next() {
            let series = set.at();
            let mut iter = series.iterator();
            let mut samples = Vec::new();
            while iter.next() {
                samples.push(iter.at());
            }
            assert!(iter.err().is_none());
            result.push((series.labels(), samples));
        }
        assert!(set.err().is_none());
        result
    }

    fn hints(func: &str, step: i64) -> SelectHints {
        SelectHints {
            func: func.into(),
            step,
            window: 0,
        }
    }

    #[test]
    fn select_raw_samples() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, false).querier(2_000, 3_000).unwrap();
        let matchers = parse_selector("cpu{host=\"a\"}").unwrap();
        let series = drain(querier.select(Some(&hints("", 0)), &matchers).unwrap().as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1, vec![(2_000, 2.0), (3_000, 3.0)]);
    }

    #[test]
    fn select_limited_pushdown_when_disabled() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, false).querier(0, 10_000).unwrap();
        let matchers = parse_selector("cpu{dc=\"eu\"}").unwrap();
        let series = drain(
            querier
                .select(Some(&hints("sum_over_time", 0)), &matchers)
                .unwrap()
                .as_mut(),
        );
        assert_eq!(series[0].1, vec![(0, 10.0)]);
        assert!(!querier.is_already_aggregated("sum_over_time"));
    }

    #[test]
    fn select_rejected_pushdown_returns_raw() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, false).querier(0, 10_000).unwrap();
        let matchers = parse_selector("cpu{dc=\"eu\"}").unwrap();
        let series = drain(
            querier
                .select(Some(&hints("sum_over_time", 1_000)), &matchers)
                .unwrap()
                .as_mut(),
        );
        assert_eq!(series[0].1.len(), 4);
    }

    #[test]
    fn select_cross_series_when_eligible() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, true).querier(1_000, 4_000).unwrap();
        querier.set_use_aggregates(true);
        assert!(querier.use_tsdb_aggregations());
        let matchers = parse_selector("cpu").unwrap();
        let series = drain(
            querier
                .select(Some(&hints("max", 2_000)), &matchers)
                .unwrap()
                .as_mut(),
        );
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("Aggregate"), Some("max"));
        assert_eq!(series[0].1, vec![(1_000, 2.0), (3_000, 4.0)]);
        assert!(querier.is_already_aggregated("max"));
        assert!(!querier.is_already_aggregated("sum"));
    }

    #[test]
    fn aggregation_label_requests_engine_aggregate() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, true).querier(0, 10_000).unwrap();
        querier.set_use_aggregates(true);
        let matchers = parse_selector("cpu{host=\"b\", Aggregate=\"avg\"}").unwrap();
        let series = drain(querier.select(Some(&hints("", 0)), &matchers).unwrap().as_mut());
        assert_eq!(series[0].1, vec![(0, 2.5)]);
    }

    #[test]
    fn metadata_select_lists_label_sets() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, false).querier(0, 0).unwrap();
        let matchers = vec![Matcher::new(MatchKind::RegexNotMatch, "host", "^a$")];
        let series = drain(querier.select(None, &matchers).unwrap().as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("host"), Some("a"));
        assert!(series[0].1.is_empty());
    }

    #[test]
    fn label_queries_delegate() {
        let engine = MemoryEngine::new();
        let querier = adapter(&engine, false).querier(0, 0).unwrap();
        assert_eq!(
            querier.label_names().unwrap(),
            vec!["__name__".to_string(), "dc".into(), "host".into()]
        );
        assert_eq!(querier.label_values("dc").unwrap(), vec!["eu".to_string(), "us".into()]);
        assert_eq!(querier.time_range(), (0, 0));
        querier.close().unwrap();
    }

    #[test]
    fn engine_errors_propagate() {
        let engine = MemoryEngine::new();
        let mut querier = adapter(&engine, false).querier(0, 10_000).unwrap();
        engine.set_available(false);
        let err = querier
            .select(Some(&hints("", 0)), &parse_selector("cpu").unwrap())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StorageError::Engine(EngineError::Unavailable(_))
        ));
    }
}
