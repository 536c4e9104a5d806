//! Read-only relay status endpoints.
//!
//! Every answer comes from relay storage; the API never talks to a chain.

use axum::{http::StatusCode, response::IntoResponse, Json};
use relay_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod status;
pub mod transaction;

/// API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Error type/code
	pub error: String,
	/// Human-readable description
	pub message: String,
}

/// Errors returned by the status endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error("Invalid transaction hash: {0}")]
	InvalidHash(String),
	#[error("{0} has not been observed yet")]
	NotObserved(&'static str),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}

impl ApiError {
	fn status_code(&self) -> StatusCode {
		match self {
			ApiError::InvalidHash(_) => StatusCode::UNPROCESSABLE_ENTITY,
			ApiError::NotObserved(_) => StatusCode::SERVICE_UNAVAILABLE,
			ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn error_type(&self) -> &'static str {
		match self {
			ApiError::InvalidHash(_) => "INVALID_TX_HASH",
			ApiError::NotObserved(_) => "NOT_OBSERVED",
			ApiError::Storage(_) => "STORAGE_ERROR",
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> axum::response::Response {
		let body = ErrorResponse {
			error: self.error_type().to_string(),
			message: self.to_string(),
		};
		(self.status_code(), Json(body)).into_response()
	}
}
