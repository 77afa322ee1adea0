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

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use log::{LevelFilter, info};
use tsdb_prom_adapter::{
    app::{AppConfig, AppState, router},
    error::AppError,
    storage::AdapterConfig,
    tsdb::MemoryEngine,
};

#[derive(Debug, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
struct Args {
    /// HTTP bind address for the adapter server
    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:9201")]
    bind: SocketAddr,
    /// Let the engine compute `*_over_time` and cross-series aggregates
    #[arg(long = "use-tsdb-aggregations", env = "USE_TSDB_AGGREGATIONS")]
    use_tsdb_aggregations: bool,
    /// Lookback in seconds for label queries without an explicit start
    #[arg(long = "default-lookback", env = "DEFAULT_LOOKBACK_SECS", default_value_t = 300)]
    default_lookback: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let args = Args::parse();
    info!(
        "starting tsdb-prom-adapter (bind={}, use_tsdb_aggregations={}, default_lookback={}s)",
        args.bind, args.use_tsdb_aggregations, args.default_lookback
    );
    let lookback_ms = i64::try_from(args.default_lookback.saturating_mul(1_000))
        .map_err(|_| AppError::Internal("default lookback is too large".into()))?;
    let config = AppConfig {
        adapter: AdapterConfig {
            use_tsdb_aggregations: args.use_tsdb_aggregations,
        },
        default_lookback_ms: lookback_ms,
    };
    info!("bootstrapping application state");
    let state = AppState::bootstrap(Arc::new(MemoryEngine::new()), config)?;
    info!("router initialized, preparing HTTP server");
    let app = router(state);

    info!("binding TCP listener on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind listener: {err}")))?;
    info!("tsdb-prom-adapter listening on {}", args.bind);
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;
    Ok(())
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("tsdb_prom_adapter", LevelFilter::Info)
            .init();
    }
}
