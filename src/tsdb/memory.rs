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

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use log::{debug, info};
use parking_lot::RwLock;

use crate::labels::{AGGREGATE_LABEL, LabelSet, METRIC_NAME};

use super::{
    engine::{
        EncodedSeries, Engine, EngineError, MetricsCache, QueryDescriptor, TsdbQuerier, TsdbSeries,
        TsdbSeriesIterator, TsdbSeriesSet,
    },
    expr::FilterExpr,
};

const CROSS_SERIES_SUFFIX: &str = "_all";
const MAX_BUCKETS: i64 = 11_000;

/// In-process engine holding every series in memory.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

struct Shared {
    store: RwLock<Store>,
    available: AtomicBool,
    start_time: i64,
}

#[derive(Default)]
struct Store {
    series: Vec<StoredSeries>,
    refs: HashMap<u64, u64>,
}

struct StoredSeries {
    labels: LabelSet,
    metric_name: String,
    samples: BTreeMap<i64, f64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        let start_time = Utc::now().timestamp_millis();
        info!("memory engine created (start_time={start_time})");
        Self {
            shared: Arc::new(Shared {
                store: RwLock::new(Store::default()),
                available: AtomicBool::new(true),
                start_time,
            }),
        }
    }

    /// Simulates losing the backing store; every call fails until restored.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn check_available(&self) -> Result<(), EngineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable("memory engine is offline".into()))
        }
    }
}

impl Engine for MemoryEngine {
    fn querier(&self) -> Result<Box<dyn TsdbQuerier>, EngineError> {
        self.shared.check_available()?;
        Ok(Box::new(MemoryQuerier {
            shared: self.shared.clone(),
        }))
    }

    fn metrics_cache(&self) -> Result<Arc<dyn MetricsCache>, EngineError> {
        self.shared.check_available()?;
        Ok(Arc::new(MemoryCache {
            shared: self.shared.clone(),
        }))
    }

    fn start_time(&self) -> Result<i64, EngineError> {
        self.shared.check_available()?;
        Ok(self.shared.start_time)
    }
}

struct MemoryCache {
    shared: Arc<Shared>,
}

impl MetricsCache for MemoryCache {
    fn add(&self, series: &EncodedSeries, t: i64, v: f64) -> Result<u64, EngineError> {
        self.shared.check_available()?;
        let mut store = self.shared.store.write();
        let existing = store.refs.get(&series.key.hash).copied();
        let reference = match existing {
            Some(reference) => reference,
            None => {
                store.series.push(StoredSeries {
                    labels: series.labels.clone(),
                    metric_name: series.key.metric_name.clone(),
                    samples: BTreeMap::new(),
                });
                let reference = store.series.len() as u64;
                store.refs.insert(series.key.hash, reference);
                debug!(
                    "new series ref={reference} name={} key={} expr={}",
                    series.key.metric_name, series.key.key, series.update_expr
                );
                reference
            }
        };
        store.append(reference, t, v)?;
        Ok(reference)
    }

    fn add_fast(&self, reference: u64, t: i64, v: f64) -> Result<(), EngineError> {
        self.shared.check_available()?;
        self.shared.store.write().append(reference, t, v)
    }
}

impl Store {
    fn append(&mut self, reference: u64, t: i64, v: f64) -> Result<(), EngineError> {
        let series = reference
            .checked_sub(1)
            .and_then(|idx| self.series.get_mut(idx as usize))
            .ok_or(EngineError::MetricNotFound(reference))?;
        series.samples.insert(t, v);
        Ok(())
    }

    fn matching<'a>(
        &'a self,
        name: &'a str,
        filter: &'a FilterExpr,
    ) -> impl Iterator<Item = &'a StoredSeries> + 'a {
        self.series.iter().filter(move |series| {
            (name.is_empty() || series.metric_name == name)
                && filter.matches(&series.metric_name, &series.labels)
        })
    }
}

struct MemoryQuerier {
    shared: Arc<Shared>,
}

impl TsdbQuerier for MemoryQuerier {
    fn select(
        &self,
        params: &QueryDescriptor,
        no_aggr: bool,
    ) -> Result<Box<dyn TsdbSeriesSet>, EngineError> {
        self.shared.check_available()?;
        let filter = FilterExpr::parse(&params.filter)?;
        let matched: Vec<(LabelSet, Vec<(i64, f64)>)> = {
            let store = self.shared.store.read();
            store
                .matching(&params.name, &filter)
                .map(|series| {
                    let samples = if params.from <= params.to {
                        series
                            .samples
                            .range(params.from..=params.to)
                            .map(|(t, v)| (*t, *v))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    (series.labels.clone(), samples)
                })
                .filter(|(_, samples)| !samples.is_empty())
                .collect()
        };

        let series = if no_aggr || params.functions.is_empty() {
            matched
                .into_iter()
                .map(|(labels, samples)| MemorySeries::new(labels, samples))
                .collect()
        } else {
            aggregate(params, matched)?
        };
        debug!(
            "memory select name={} filter={} functions={} returned {} series",
            params.name,
            params.filter,
            params.functions,
            series.len()
        );
        Ok(Box::new(MemorySeriesSet::new(series)))
    }

    fn label_sets(&self, name: &str, filter: &str) -> Result<Vec<LabelSet>, EngineError> {
        self.shared.check_available()?;
        let filter = FilterExpr::parse(filter)?;
        let store = self.shared.store.read();
        Ok(store
            .matching(name, &filter)
            .map(|series| series.labels.clone())
            .collect())
    }

    fn label_names(&self) -> Result<Vec<String>, EngineError> {
        self.shared.check_available()?;
        let store = self.shared.store.read();
        let names: BTreeSet<String> = store
            .series
            .iter()
            .flat_map(|series| series.labels.label_names())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, EngineError> {
        self.shared.check_available()?;
        let store = self.shared.store.read();
        let values: BTreeSet<String> = store
            .series
            .iter()
            .filter_map(|series| series.labels.get(name).map(str::to_string))
            .collect();
        Ok(values.into_iter().collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Last,
    Stddev,
    Stdvar,
}

impl Aggregate {
    fn parse(name: &str) -> Result<Self, EngineError> {
        match name {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "last" => Ok(Self::Last),
            "stddev" => Ok(Self::Stddev),
            "stdvar" => Ok(Self::Stdvar),
            other => Err(EngineError::Query(format!("unsupported aggregate `{other}`"))),
        }
    }

    /// `samples` is ordered by timestamp and never empty.
    fn apply(self, samples: &[(i64, f64)]) -> f64 {
        let count = samples.len() as f64;
        let values = samples.iter().map(|(_, v)| *v);
        match self {
            Self::Count => count,
            Self::Sum => values.sum(),
            Self::Avg => values.sum::<f64>() / count,
            Self::Min => values.fold(f64::INFINITY, f64::min),
            Self::Max => values.fold(f64::NEG_INFINITY, f64::max),
            Self::Last => samples.last().map(|(_, v)| *v).unwrap_or(f64::NAN),
            Self::Stddev => variance(samples).sqrt(),
            Self::Stdvar => variance(samples),
        }
    }
}

fn variance(samples: &[(i64, f64)]) -> f64 {
    let count = samples.len() as f64;
    let mean = samples.iter().map(|(_, v)| *v).sum::<f64>() / count;
    samples
        .iter()
        .map(|(_, v)| (v - mean) * (v - mean))
        .sum::<f64>()
        / count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    timestamp: i64,
    start: i64,
    end: i64,
}

/// With a window each bucket covers `(t - window, t]`, otherwise
/// `[t, t + step)`. A zero step yields a single bucket for the whole range.
fn buckets(params: &QueryDescriptor) -> Result<Vec<Bucket>, EngineError> {
    let (from, to) = (params.from, params.to);
    if from > to {
        return Ok(Vec::new());
    }
    let timestamps: Vec<i64> = if params.step > 0 {
        let count = to
            .checked_sub(from)
            .and_then(|span| (span / params.step).checked_add(1))
            .ok_or_else(|| {
                EngineError::Query(format!("time range [{from}, {to}] overflows"))
            })?;
        if count > MAX_BUCKETS {
            return Err(EngineError::Query(format!(
                "step {} over [{from}, {to}] exceeds {MAX_BUCKETS} buckets",
                params.step
            )));
        }
        (0..count).map(|idx| from + idx * params.step).collect()
    } else if params.aggregation_window > 0 {
        vec![to]
    } else {
        vec![from]
    };

    Ok(timestamps
        .into_iter()
        .map(|timestamp| {
            let (start, end) = if params.aggregation_window > 0 {
                (
                    timestamp
                        .saturating_sub(params.aggregation_window)
                        .saturating_add(1),
                    timestamp,
                )
            } else if params.step > 0 {
                (timestamp, timestamp.saturating_add(params.step - 1))
            } else {
                (from, to)
            };
            Bucket {
                timestamp,
                start: start.max(from),
                end: end.min(to),
            }
        })
        .collect())
}

fn apply_buckets(function: Aggregate, buckets: &[Bucket], samples: &[(i64, f64)]) -> Vec<(i64, f64)> {
    buckets
        .iter()
        .filter_map(|bucket| {
            let lo = samples.partition_point(|(t, _)| *t < bucket.start);
            let hi = samples.partition_point(|(t, _)| *t <= bucket.end);
            (lo < hi).then(|| (bucket.timestamp, function.apply(&samples[lo..hi])))
        })
        .collect()
}

fn aggregate(
    params: &QueryDescriptor,
    matched: Vec<(LabelSet, Vec<(i64, f64)>)>,
) -> Result<Vec<MemorySeries>, EngineError> {
    let (base, cross_series) = match params.functions.strip_suffix(CROSS_SERIES_SUFFIX) {
        Some(base) => (base, true),
        None => (params.functions.as_str(), false),
    };
    let function = Aggregate::parse(base)?;
    let buckets = buckets(params)?;

    if cross_series {
        let mut merged: Vec<(i64, f64)> = matched
            .into_iter()
            .flat_map(|(_, samples)| samples)
            .collect();
        merged.sort_by_key(|(t, _)| *t);
        let samples = apply_buckets(function, &buckets, &merged);
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let mut labels = LabelSet::default();
        if !params.name.is_empty() {
            labels.push(METRIC_NAME, params.name.clone());
        }
        labels.push(AGGREGATE_LABEL, base);
        return Ok(vec![MemorySeries::new(labels, samples)]);
    }

    Ok(matched
        .into_iter()
        .filter_map(|(mut labels, samples)| {
            let samples = apply_buckets(function, &buckets, &samples);
            if samples.is_empty() {
                return None;
            }
            labels.push(AGGREGATE_LABEL, base);
            Some(MemorySeries::new(labels, samples))
        })
        .collect())
}

struct MemorySeriesSet {
    series: Vec<MemorySeries>,
    current: Option<usize>,
}

impl MemorySeriesSet {
    fn new(series: Vec<MemorySeries>) -> Self {
        Self {
            series,
            current: None,
        }
    }
}

impl TsdbSeriesSet for MemorySeriesSet {
    fn next(&mut self) -> bool {
        let next = self.current.map_or(0, |idx| idx.saturating_add(1));
        self.current = Some(next);
        next < self.series.len()
    }

    fn at(&self) -> Box<dyn TsdbSeries> {
        let series = self
            .current
            .and_then(|idx| self.series.get(idx))
            .cloned()
            .unwrap_or_default();
        Box::new(series)
    }

    fn err(&self) -> Option<&EngineError> {
        None
    }
}

#[derive(Clone, Default)]
struct MemorySeries {
    labels: LabelSet,
    samples: Arc<[(i64, f64)]>,
}

impl MemorySeries {
    fn new(labels: LabelSet, samples: Vec<(i64, f64)>) -> Self {
        Self {
            labels,
            samples: samples.into(),
        }
    }
}

impl TsdbSeries for MemorySeries {
    fn labels(&self) -> LabelSet {
        self.labels.clone()
    }

    fn iterator(&self) -> Box<dyn TsdbSeriesIterator> {
        Box::new(MemoryIterator {
            samples: self.samples.clone(),
            current: None,
        })
    }
}

struct MemoryIterator {
    samples: Arc<[(i64, f64)]>,
    current: Option<usize>,
}

impl TsdbSeriesIterator for MemoryIterator {
    fn seek(&mut self, t: i64) -> bool {
        let start = self.current.unwrap_or(0);
        if start >= self.samples.len() {
            return false;
        }
        let idx = start + self.samples[start..].partition_point(|(ts, _)| *ts < t);
        self.current = Some(idx);
        idx < self.samples.len()
    }

    fn next(&mut self) -> bool {
        let next = self.current.map_or(0, |idx| idx.saturating_add(1));
        self.current = Some(next);
        next < self.samples.len()
    }

    fn at(&self) -> (i64, f64) {
        self.current
            .and_then(|idx| self.samples.get(idx))
            .copied()
            .unwrap_or((0, f64::NAN))
    }

    fn err(&self) -> Option<&EngineError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(engine: &MemoryEngine, pairs: &[(&str, &str)], samples: &[(i64, f64)]) -> u64 {
        let cache = engine.metrics_cache().unwrap();
        let series = EncodedSeries::encode(&LabelSet::from_pairs(pairs.iter().copied()));
        let mut reference = 0;
        for (t, v) in samples {
            reference = cache.add(&series, *t, *v).unwrap();
        }
        reference
    }

    fn seeded() -> MemoryEngine {
        let engine = MemoryEngine::new();
        write(
            &engine,
            &[("__name__", "cpu"), ("host", "a"), ("dc", "eu")],
            &[(1_000, 1.0), (2_000, 2.0), (3_000, 3.0), (4_000, 4.0)],
        );
        write(
            &engine,
            &[("__name__", "cpu"), ("host", "b"), ("dc", "us")],
            &[(1_000, 10.0), (3_000, 30.0)],
        );
        write(&engine, &[("__name__", "mem"), ("host", "a")], &[(1_000, 5.0)]);
        engine
    }

    fn collect(set: &mut dyn TsdbSeriesSet) -> Vec<(LabelSet, Vec<(i64, f64)>)> {
        let mut result = Vec::new();
        while set.next() {
            let series = set.at();
            let mut iter = series.iterator();
            let mut samples = Vec::new();
            while iter.next() {
                samples.push(iter.at());
            }
            result.push((series.labels(), samples));
        }
        result
    }

    fn descriptor(name: &str, filter: &str, functions: &str) -> QueryDescriptor {
        QueryDescriptor {
            name: name.into(),
            filter: filter.into(),
            functions: functions.into(),
            from: 0,
            to: 10_000,
            ..QueryDescriptor::default()
        }
    }

    #[test]
    fn raw_select_applies_name_filter_and_range() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let mut params = descriptor("cpu", "host=='a'", "");
        params.from = 2_000;
        params.to = 3_000;
        let mut set = querier.select(&params, false).unwrap();
        let series = collect(set.as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("host"), Some("a"));
        assert_eq!(series[0].1, vec![(2_000, 2.0), (3_000, 3.0)]);
    }

    #[test]
    fn regex_filter_uses_position_semantics() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let params = descriptor("cpu", "regexp_instr(dc,'^eu') == 0", "");
        let series = collect(querier.select(&params, false).unwrap().as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("dc"), Some("us"));
    }

    #[test]
    fn per_series_aggregate_with_step() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let mut params = descriptor("cpu", "host=='a'", "sum");
        params.from = 1_000;
        params.to = 4_000;
        params.step = 2_000;
        let series = collect(querier.select(&params, false).unwrap().as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("Aggregate"), Some("sum"));
        assert_eq!(series[0].1, vec![(1_000, 3.0), (3_000, 7.0)]);
    }

    #[test]
    fn aggregation_window_covers_trailing_range() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let mut params = descriptor("cpu", "host=='a'", "max");
        params.from = 1_000;
        params.to = 4_000;
        params.step = 3_000;
        params.aggregation_window = 1_500;
        let series = collect(querier.select(&params, false).unwrap().as_mut());
        assert_eq!(series[0].1, vec![(1_000, 1.0), (4_000, 4.0)]);
    }

    #[test]
    fn extreme_range_is_rejected_without_overflow() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let mut params = descriptor("cpu", "", "sum");
        params.from = -9_000_000_000_000_000_000;
        params.to = 9_000_000_000_000_000_000;
        params.step = 1_000;
        assert!(matches!(
            querier.select(&params, false),
            Err(EngineError::Query(_))
        ));

        params.from = i64::MIN;
        params.to = i64::MIN + 10;
        params.step = 0;
        params.aggregation_window = 5_000;
        let series = collect(querier.select(&params, false).unwrap().as_mut());
        assert!(series.is_empty());
    }

    #[test]
    fn add_with_reordered_labels_reuses_series() {
        let engine = MemoryEngine::new();
        let first = write(
            &engine,
            &[("__name__", "cpu"), ("host", "a"), ("dc", "eu")],
            &[(1_000, 1.0)],
        );
        let second = write(
            &engine,
            &[("dc", "eu"), ("__name__", "cpu"), ("host", "a")],
            &[(2_000, 2.0)],
        );
        assert_eq!(first, second);
        let querier = engine.querier().unwrap();
        let mut set = querier.select(&descriptor("cpu", "", ""), false).unwrap();
        let series = collect(set.as_mut());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1, vec![(1_000, 1.0), (2_000, 2.0)]);
    }

    #[test]
    fn cross_series_aggregate_merges_series() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let series = collect(
            querier
                .select(&descriptor("cpu", "", "count_all"), false)
                .unwrap()
                .as_mut(),
        );
        assert_eq!(series.len(), 1);
        assert_eq!(
            series[0].0,
            LabelSet::from_pairs([("__name__", "cpu"), ("Aggregate", "count")])
        );
        assert_eq!(series[0].1, vec![(0, 6.0)]);
    }

    #[test]
    fn no_aggr_returns_raw_samples() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let series = collect(
            querier
                .select(&descriptor("mem", "", "sum"), true)
                .unwrap()
                .as_mut(),
        );
        assert_eq!(series[0].1, vec![(1_000, 5.0)]);
        assert_eq!(series[0].0.get("Aggregate"), None);
    }

    #[test]
    fn unknown_aggregate_is_rejected() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let err = querier
            .select(&descriptor("cpu", "", "quantile"), false)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Query(_)));
    }

    #[test]
    fn metadata_queries() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let sets = querier.label_sets("cpu", "dc=='us'").unwrap();
        assert_eq!(
            sets,
            vec![LabelSet::from_pairs([("__name__", "cpu"), ("host", "b"), ("dc", "us")])]
        );
        assert_eq!(
            querier.label_names().unwrap(),
            vec!["__name__".to_string(), "dc".into(), "host".into()]
        );
        assert_eq!(querier.label_values("host").unwrap(), vec!["a".to_string(), "b".into()]);
    }

    #[test]
    fn references_are_stable_and_checked() {
        let engine = MemoryEngine::new();
        let first = write(&engine, &[("__name__", "up")], &[(1, 1.0)]);
        let second = write(&engine, &[("__name__", "up")], &[(2, 1.0)]);
        assert_eq!(first, second);
        let cache = engine.metrics_cache().unwrap();
        cache.add_fast(first, 3, 0.0).unwrap();
        assert_eq!(
            cache.add_fast(first + 7, 3, 0.0),
            Err(EngineError::MetricNotFound(first + 7))
        );
        assert_eq!(cache.add_fast(0, 3, 0.0), Err(EngineError::MetricNotFound(0)));
    }

    #[test]
    fn iterator_seek_moves_forward_only() {
        let engine = seeded();
        let querier = engine.querier().unwrap();
        let mut set = querier.select(&descriptor("cpu", "host=='a'", ""), false).unwrap();
        assert!(set.next());
        let mut iter = set.at().iterator();
        assert!(iter.seek(2_500));
        assert_eq!(iter.at(), (3_000, 3.0));
        assert!(iter.seek(1_000));
        assert_eq!(iter.at(), (3_000, 3.0));
        assert!(!iter.seek(9_000));
    }

    #[test]
    fn offline_engine_reports_unavailable() {
        let engine = seeded();
        engine.set_available(false);
        assert!(matches!(engine.querier().err(), Some(EngineError::Unavailable(_))));
        assert!(matches!(engine.start_time(), Err(EngineError::Unavailable(_))));
    }
}
