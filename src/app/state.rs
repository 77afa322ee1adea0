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

use log::info;

use crate::{
    error::AppError,
    selector::{Matcher, parse_selector},
    storage::{AdapterConfig, PromAdapter, PromAppender, PromQuerier},
    tsdb::Engine,
};

pub(crate) const DEFAULT_LOOKBACK_MS: i64 = 5 * 60 * 1_000;

#[derive(Clone)]
pub struct AppState {
    adapter: PromAdapter,
    default_lookback_ms: i64,
}

pub struct AppConfig {
    pub adapter: AdapterConfig,
    pub default_lookback_ms: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            default_lookback_ms: DEFAULT_LOOKBACK_MS,
        }
    }
}

impl AppState {
    pub fn bootstrap(engine: Arc<dyn Engine>, config: AppConfig) -> Result<Self, AppError> {
        let AppConfig {
            adapter,
            default_lookback_ms,
        } = config;
        let adapter = PromAdapter::new(engine, adapter);
        let start_time = adapter.start_time()?;
        info!("engine reachable, start time {start_time}");
        Ok(Self {
            adapter,
            default_lookback_ms: default_lookback_ms.max(1),
        })
    }

    pub fn adapter(&self) -> &PromAdapter {
        &self.adapter
    }

    pub fn default_lookback_ms(&self) -> i64 {
        self.default_lookback_ms
    }

    pub fn parse(&self, selector: &str) -> Result<Vec<Matcher>, AppError> {
        parse_selector(selector).map_err(AppError::from)
    }

    pub fn querier(&self, mint: i64, maxt: i64) -> Result<PromQuerier, AppError> {
        Ok(self.adapter.querier(mint, maxt)?)
    }

    pub fn appender(&self) -> Result<PromAppender, AppError> {
        Ok(self.adapter.appender()?)
    }
}
