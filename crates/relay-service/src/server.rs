//! HTTP server for the relay status API.
//!
//! Serves read-only views of relay storage under `/api`.

use crate::apis::status::{self, MaintenanceResponse, StatusResponse};
use crate::apis::transaction::{self, BatchResponse, TransactionQuery, TransactionResponse};
use crate::apis::ApiError;
use axum::{
	extract::{Query, State},
	response::Json,
	routing::get,
	Router,
};
use relay_config::{ApiConfig, Config};
use relay_storage::StorageService;
use relay_types::BalanceRecord;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub storage: Arc<StorageService>,
	pub source_chain: String,
	pub destination_chain: String,
	pub maintenance: bool,
}

impl AppState {
	pub fn new(config: &Config, storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			source_chain: config.source.name.clone(),
			destination_chain: config.destination.name.clone(),
			maintenance: config.api.as_ref().is_some_and(|api| api.maintenance),
		}
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.nest(
			"/api",
			Router::new()
				.route("/status", get(handle_status))
				.route("/transaction", get(handle_transaction))
				.route("/batch", get(handle_batch))
				.route("/balance", get(handle_balance))
				.route("/maintenance", get(handle_maintenance)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
		.with_state(state)
}

/// Serves the API until the listener fails.
pub async fn start_server(api_config: ApiConfig, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!(address = %bind_address, "Relay status API listening");

	axum::serve(listener, router(state)).await?;

	Ok(())
}

/// Handles GET /api/status requests.
async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
	status::get_status(&state.storage, &state.source_chain, &state.destination_chain)
		.await
		.map(Json)
}

/// Handles GET /api/transaction?source_tx_hash= requests.
async fn handle_transaction(
	State(state): State<AppState>,
	Query(query): Query<TransactionQuery>,
) -> Result<Json<TransactionResponse>, ApiError> {
	match transaction::get_transaction(&state.storage, &query.source_tx_hash).await {
		Ok(response) => Ok(Json(response)),
		Err(e) => {
			tracing::warn!(error = %e, "Transaction lookup failed");
			Err(e)
		},
	}
}

/// Handles GET /api/batch?source_tx_hash= requests.
async fn handle_batch(
	State(state): State<AppState>,
	Query(query): Query<TransactionQuery>,
) -> Result<Json<BatchResponse>, ApiError> {
	match transaction::get_batch(&state.storage, &query.source_tx_hash, &state.destination_chain).await {
		Ok(response) => Ok(Json(response)),
		Err(e) => {
			tracing::warn!(error = %e, "Batch lookup failed");
			Err(e)
		},
	}
}

async fn handle_balance(State(state): State<AppState>) -> Result<Json<BalanceRecord>, ApiError> {
	status::get_balance(&state.storage, &state.destination_chain)
		.await
		.map(Json)
}

async fn handle_maintenance(State(state): State<AppState>) -> Json<MaintenanceResponse> {
	Json(MaintenanceResponse {
		maintenance: state.maintenance,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::{Request, StatusCode};
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{Address, Bundle, StatefulBundle, Transfer, B256};
	use serde_json::Value;
	use tower::ServiceExt;

	fn state(maintenance: bool) -> AppState {
		AppState {
			storage: Arc::new(StorageService::new(Box::new(MemoryStorage::new()))),
			source_chain: "ethereum".into(),
			destination_chain: "aion".into(),
			maintenance,
		}
	}

	async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
		let response = router(state)
			.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
			.await
			.unwrap();
		let status = response.status();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, serde_json::from_slice(&body).unwrap())
	}

	#[tokio::test]
	async fn test_maintenance_flag() {
		let (status, body) = get_json(state(true), "/api/maintenance").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["maintenance"], true);
	}

	#[tokio::test]
	async fn test_status_route() {
		let (status, body) = get_json(state(false), "/api/status").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["source"]["chain"], "ethereum");
		assert_eq!(body["destination"]["finalized_bundle_id"], 0);
	}

	#[tokio::test]
	async fn test_transaction_route_finds_indexed_deposit() {
		let state = state(false);
		let transfers = vec![Transfer::new(B256::repeat_byte(0x42), Address::repeat_byte(7), 5)];
		let mut bundle = StatefulBundle::new(1, Bundle::new(2, B256::repeat_byte(2), 0, transfers));
		bundle.set_stored().unwrap();
		state.storage.store_bundle(&bundle).await.unwrap();
		state.storage.index_transfers(&bundle).await.unwrap();

		let uri = format!("/api/transaction?source_tx_hash={}", B256::repeat_byte(0x42));
		let (status, body) = get_json(state, &uri).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["state"], "STORED");
		assert_eq!(body["bundle"]["bundle_id"], 1);
	}

	#[tokio::test]
	async fn test_bad_hash_is_unprocessable() {
		let (status, body) = get_json(state(false), "/api/batch?source_tx_hash=0x12").await;
		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		assert_eq!(body["error"], "INVALID_TX_HASH");
	}

	#[tokio::test]
	async fn test_balance_unavailable_before_first_read() {
		let (status, body) = get_json(state(false), "/api/balance").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(body["error"], "NOT_OBSERVED");
	}
}
