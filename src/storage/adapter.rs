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

use log::{debug, info};

use crate::{error::StorageError, tsdb::Engine};

use super::{appender::PromAppender, querier::PromQuerier};

#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterConfig {
    /// Allow engine-side aggregation for queries that ask for it.
    pub use_tsdb_aggregations: bool,
}

/// Entry point the frontend holds: hands out queriers and appenders.
#[derive(Clone)]
pub struct PromAdapter {
    engine: Arc<dyn Engine>,
    use_tsdb_aggregations: bool,
}

impl PromAdapter {
    pub fn new(engine: Arc<dyn Engine>, config: AdapterConfig) -> Self {
        info!(
            "prom adapter ready (use_tsdb_aggregations={})",
            config.use_tsdb_aggregations
        );
        Self {
            engine,
            use_tsdb_aggregations: config.use_tsdb_aggregations,
        }
    }

    pub fn set_use_tsdb_aggregations(&mut self, enabled: bool) {
        self.use_tsdb_aggregations = enabled;
    }

    pub fn use_tsdb_aggregations(&self) -> bool {
        self.use_tsdb_aggregations
    }

    /// Each querier owns its own aggregation state; do not share one across
    /// concurrent queries.
    pub fn querier(&self, mint: i64, maxt: i64) -> Result<PromQuerier, StorageError> {
        debug!("creating querier for [{mint}, {maxt}]");
        let querier = self.engine.querier()?;
        Ok(PromQuerier::new(
            querier,
            mint,
            maxt,
            self.use_tsdb_aggregations,
        ))
    }

    pub fn appender(&self) -> Result<PromAppender, StorageError> {
        let cache = self.engine.metrics_cache()?;
        Ok(PromAppender::new(cache))
    }

    pub fn start_time(&self) -> Result<i64, StorageError> {
        Ok(self.engine.start_time()?)
    }

    pub fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
