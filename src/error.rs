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

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{selector::SelectorError, tsdb::EngineError};

/// Errors surfaced to the frontend by queriers, series sets and appenders.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// The write reference is unknown; retry with a keyed add.
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_type) = match self {
            Self::BadRequest(_) | Self::Selector(_) => (StatusCode::BAD_REQUEST, "bad_data"),
            Self::Storage(StorageError::NotFound) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Storage(StorageError::Engine(EngineError::Unavailable(_))) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            Self::Storage(StorageError::Engine(EngineError::InvalidFilter { .. })) => {
                (StatusCode::BAD_REQUEST, "bad_data")
            }
            Self::Storage(StorageError::Engine(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "execution")
            }
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = PromErrorResponse {
            status: "error",
            error_type,
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct PromErrorResponse<'a> {
    status: &'a str,
    #[serde(rename = "errorType")]
    error_type: &'a str,
    error: String,
}
