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

use log::debug;

use crate::{
    error::StorageError,
    labels::LabelSet,
    tsdb::{EncodedSeries, EngineError, MetricsCache},
};

/// Write path. The engine commits every sample as it arrives, so `commit`
/// and `rollback` have nothing to do.
#[derive(Clone)]
pub struct PromAppender {
    cache: Arc<dyn MetricsCache>,
}

impl PromAppender {
    pub fn new(cache: Arc<dyn MetricsCache>) -> Self {
        Self { cache }
    }

    pub fn add(&self, labels: &LabelSet, t: i64, v: f64) -> Result<u64, StorageError> {
        let series = EncodedSeries::encode(labels);
        Ok(self.cache.add(&series, t, v)?)
    }

    /// Writes through a reference returned by [`PromAppender::add`]. An
    /// unknown reference yields [`StorageError::NotFound`].
    pub fn add_fast(
        &self,
        labels: &LabelSet,
        reference: u64,
        t: i64,
        v: f64,
    ) -> Result<(), StorageError> {
        match self.cache.add_fast(reference, t, v) {
            Ok(()) => Ok(()),
            Err(EngineError::MetricNotFound(_)) => {
                debug!("reference {reference} unknown for {labels}");
                Err(StorageError::NotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::{Engine, MemoryEngine};

    fn appender(engine: &MemoryEngine) -> PromAppender {
        PromAppender::new(engine.metrics_cache().unwrap())
    }

    fn labels() -> LabelSet {
        LabelSet::from_pairs([("__name__", "cpu"), ("host", "a")])
    }

    #[test]
    fn add_returns_reusable_reference() {
        let engine = MemoryEngine::new();
        let appender = appender(&engine);
        let reference = appender.add(&labels(), 1_000, 1.0).unwrap();
        appender.add_fast(&labels(), reference, 2_000, 2.0).unwrap();
        assert_eq!(appender.add(&labels(), 3_000, 3.0).unwrap(), reference);
        appender.commit().unwrap();
        appender.rollback().unwrap();
    }

    #[test]
    fn add_fast_with_unknown_reference_is_not_found() {
        let engine = MemoryEngine::new();
        let err = appender(&engine)
            .add_fast(&labels(), 42, 1_000, 1.0)
            .unwrap_err();
        assert_eq!(err, StorageError::NotFound);
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn add_fast_propagates_other_engine_errors() {
        let engine = MemoryEngine::new();
        let appender = appender(&engine);
        let reference = appender.add(&labels(), 1_000, 1.0).unwrap();
        engine.set_available(false);
        let err = appender.add_fast(&labels(), reference, 2_000, 2.0).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Engine(EngineError::Unavailable(_))
        ));
    }
}
