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

use std::{collections::BTreeMap, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use chrono::Utc;
use log::{debug, info};
use serde::Deserialize;

use crate::{
    error::{AppError, StorageError},
    labels::{LabelSet, METRIC_NAME},
    translate::SelectHints,
};

use super::{
    responses::{
        LabelsResponse, MatrixData, MatrixResponse, SeriesResponse, StatusResponse, TsdbStatus,
        WriteData, WriteResponse, series_to_labels, series_to_matrix,
    },
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/labels", get(label_names))
        .route("/api/v1/label/{name}/values", get(label_values))
        .route("/api/v1/series", get(series))
        .route("/api/v1/query_range", get(range_query))
        .route("/api/v1/write", post(write))
        .route("/api/v1/status/tsdb", get(tsdb_status))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

#[derive(Debug, Deserialize)]
struct LabelsQueryParams {
    start: Option<f64>,
    end: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SeriesQueryParams {
    #[serde(rename = "match[]")]
    selector: String,
    start: Option<f64>,
    end: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RangeQueryParams {
    query: String,
    start: Option<f64>,
    end: Option<f64>,
    func: Option<String>,
    step: Option<f64>,
    window: Option<f64>,
    pushdown: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    samples: Vec<WriteSample>,
}

#[derive(Debug, Deserialize)]
struct WriteSample {
    labels: BTreeMap<String, String>,
    timestamp: i64,
    value: f64,
    #[serde(rename = "ref", default)]
    reference: Option<u64>,
}

async fn label_names(
    State(state): State<AppState>,
    Query(params): Query<LabelsQueryParams>,
) -> Result<Json<LabelsResponse>, AppError> {
    let (start, end) = resolve_label_bounds(&state, params.start, params.end)?;
    let querier = state.querier(start, end)?;
    let mut names = querier.label_names()?;
    names.sort();
    names.dedup();
    Ok(Json(LabelsResponse::success(names)))
}

async fn label_values(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<LabelsQueryParams>,
) -> Result<Json<LabelsResponse>, AppError> {
    let (start, end) = resolve_label_bounds(&state, params.start, params.end)?;
    let querier = state.querier(start, end)?;
    let mut values = querier.label_values(&name)?;
    values.sort();
    values.dedup();
    Ok(Json(LabelsResponse::success(values)))
}

async fn series(
    State(state): State<AppState>,
    Query(params): Query<SeriesQueryParams>,
) -> Result<Json<SeriesResponse>, AppError> {
    let matchers = state.parse(&params.selector)?;
    debug!(
        "series request: selector=`{}` start={:?} end={:?}",
        params.selector,
        params.start,
        params.end
    );
    let labels = if params.start.is_none() && params.end.is_none() {
        let mut querier = state.querier(0, 0)?;
        let mut set = querier.select(None, &matchers)?;
        series_to_labels(set.as_mut())?
    } else {
        let (start, end) = resolve_label_bounds(&state, params.start, params.end)?;
        let mut querier = state.querier(start, end)?;
        let mut set = querier.select(Some(&SelectHints::default()), &matchers)?;
        series_to_labels(set.as_mut())?
    };
    Ok(Json(SeriesResponse::success(labels)))
}

async fn range_query(
    State(state): State<AppState>,
    Query(params): Query<RangeQueryParams>,
) -> Result<Json<MatrixResponse>, AppError> {
    debug!(
        "range query received: query=`{}` start={:?} end={:?} func={:?} step={:?} window={:?}",
        params.query,
        params.start,
        params.end,
        params.func,
        params.step,
        params.window
    );
    let matchers = state.parse(&params.query)?;
    let start = params
        .start
        .ok_or_else(|| AppError::BadRequest("start is required".into()))
        .and_then(|value| seconds_to_ms(value, "start"))?;
    let end = match params.end {
        Some(value) => seconds_to_ms(value, "end")?,
        None => current_time_ms(),
    };
    if start > end {
        return Err(AppError::BadRequest("end must not be before start".into()));
    }
    let hints = SelectHints {
        func: params.func.unwrap_or_default(),
        step: optional_duration_ms(params.step, "step")?,
        window: optional_duration_ms(params.window, "window")?,
    };

    let mut querier = state.querier(start, end)?;
    querier.set_use_aggregates(params.pushdown.unwrap_or(true));
    let mut set = querier.select(Some(&hints), &matchers)?;
    let result = series_to_matrix(set.as_mut())?;
    let pushed_down = !hints.func.is_empty() && querier.is_already_aggregated(&hints.func);
    Ok(Json(MatrixResponse::success(MatrixData::new(result, pushed_down))))
}

async fn write(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<WriteResponse>, AppError> {
    let appender = state.appender()?;
    let mut refs = Vec::with_capacity(request.samples.len());
    for sample in request.samples {
        if !sample.labels.contains_key(METRIC_NAME) {
            appender.rollback()?;
            return Err(AppError::BadRequest(format!(
                "sample is missing the `{METRIC_NAME}` label"
            )));
        }
        let labels = LabelSet::from(sample.labels);
        let reference = match sample.reference {
            Some(reference) => {
                match appender.add_fast(&labels, reference, sample.timestamp, sample.value) {
                    Ok(()) => reference,
                    Err(StorageError::NotFound) => {
                        appender.add(&labels, sample.timestamp, sample.value)?
                    }
                    Err(err) => {
                        appender.rollback()?;
                        return Err(err.into());
                    }
                }
            }
            None => appender.add(&labels, sample.timestamp, sample.value)?,
        };
        refs.push(reference);
    }
    appender.commit()?;
    Ok(Json(WriteResponse::success(WriteData { refs })))
}

async fn tsdb_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let start_time = state.adapter().start_time()?;
    Ok(Json(StatusResponse::success(TsdbStatus { start_time })))
}

fn resolve_label_bounds(
    state: &AppState,
    start: Option<f64>,
    end: Option<f64>,
) -> Result<(i64, i64), AppError> {
    let end = match end {
        Some(value) => seconds_to_ms(value, "end")?,
        None => current_time_ms(),
    };
    let start = match start {
        Some(value) => seconds_to_ms(value, "start")?,
        None => end.saturating_sub(state.default_lookback_ms()),
    };
    if start > end {
        return Err(AppError::BadRequest("end must not be before start".into()));
    }
    Ok((start, end))
}

fn seconds_to_ms(seconds: f64, field: &str) -> Result<i64, AppError> {
    if !seconds.is_finite() {
        return Err(AppError::BadRequest(format!("{field} must be finite")));
    }
    let millis = (seconds * 1_000_f64).round();
    if millis.abs() > i64::MAX as f64 {
        return Err(AppError::BadRequest(format!("{field} exceeds supported range")));
    }
    Ok(millis as i64)
}

fn optional_duration_ms(seconds: Option<f64>, field: &str) -> Result<i64, AppError> {
    let Some(seconds) = seconds else {
        return Ok(0);
    };
    let millis = seconds_to_ms(seconds, field)?;
    if millis < 0 {
        return Err(AppError::BadRequest(format!("{field} must not be negative")));
    }
    Ok(millis)
}

fn current_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    let elapsed = start.elapsed();
    info!(
        "method={} path={} status={} duration_ms={:.3}",
        method,
        uri.path(),
        status.as_u16(),
        elapsed.as_secs_f64() * 1_000_f64
    );
    response
}
