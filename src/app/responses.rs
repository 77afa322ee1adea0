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

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{error::AppError, storage::SeriesSet};

#[derive(Serialize)]
pub(crate) struct ApiResponse<T> {
    status: &'static str,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

pub(crate) type LabelsResponse = ApiResponse<Vec<String>>;

pub(crate) type SeriesResponse = ApiResponse<Vec<BTreeMap<String, String>>>;

pub(crate) type MatrixResponse = ApiResponse<MatrixData>;

pub(crate) type WriteResponse = ApiResponse<WriteData>;

pub(crate) type StatusResponse = ApiResponse<TsdbStatus>;

#[derive(Serialize)]
pub(crate) struct MatrixData {
    #[serde(rename = "resultType")]
    result_type: &'static str,
    result: Vec<MatrixSeries>,
    /// The engine already applied the requested function.
    #[serde(rename = "pushedDown")]
    pushed_down: bool,
}

impl MatrixData {
    pub(crate) fn new(result: Vec<MatrixSeries>, pushed_down: bool) -> Self {
        Self {
            result_type: "matrix",
            result,
            pushed_down,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct MatrixSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

#[derive(Serialize)]
pub(crate) struct WriteData {
    pub(crate) refs: Vec<u64>,
}

#[derive(Serialize)]
pub(crate) struct TsdbStatus {
    #[serde(rename = "startTime")]
    pub(crate) start_time: i64,
}

pub(crate) fn series_to_matrix(set: &mut dyn SeriesSet) -> Result<Vec<MatrixSeries>, AppError> {
    let mut result = Vec::new();
    while set.next() {
        let series = set.at();
        let mut iter = series.iterator();
        let mut values = Vec::new();
        while iter.next() {
            let (t, v) = iter.at();
            values.push((t as f64 / 1_000_f64, format_sample_value(v)));
        }
        if let Some(err) = iter.err() {
            return Err(err.into());
        }
        result.push(MatrixSeries {
            metric: series.labels().to_map(),
            values,
        });
    }
    if let Some(err) = set.err() {
        return Err(err.into());
    }
    Ok(result)
}

pub(crate) fn series_to_labels(
    set: &mut dyn SeriesSet,
) -> Result<Vec<BTreeMap<String, String>>, AppError> {
    let mut result = Vec::new();
    while set.next() {
        result.push(set.at().labels().to_map());
    }
    if let Some(err) = set.err() {
        return Err(err.into());
    }
    Ok(result)
}

fn format_sample_value(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".into()
    } else if value == f64::NEG_INFINITY {
        "-Inf".into()
    } else {
        value.to_string()
    }
}
