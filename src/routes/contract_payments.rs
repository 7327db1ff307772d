use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    schemas::{validate_input, ContractPath, UpdateContractPaymentsInput},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/functions/update-contract-payments",
            axum::routing::post(update_contract_payments),
        )
        .route(
            "/contracts/{contract_id}/payment-plan",
            axum::routing::get(get_payment_plan),
        )
        .route(
            "/internal/contracts/reconcile",
            axum::routing::post(reconcile_active_contracts),
        )
}

async fn update_contract_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<UpdateContractPaymentsInput>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let Json(input) =
        payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    validate_input(&input)?;
    let contract_id = input.require_contract_id()?;

    tracing::debug!(user_id = %user_id, contract_id = %contract_id, "Updating contract payments");
    let stats = state.reconciler.reconcile(&contract_id).await?;

    Ok(Json(json!({ "success": true, "stats": stats })))
}

async fn get_payment_plan(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let preview = state.reconciler.preview(path.contract_id.trim()).await?;
    Ok(Json(json!({ "data": preview })))
}

/// Cron-compatible trigger for the daily schedule refresh.
async fn reconcile_active_contracts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    validate_internal_api_key(
        state.config.is_production(),
        state.config.internal_api_key.as_deref(),
        api_key,
    )?;

    let stats = state.reconciler.refresh_active_contracts().await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

fn validate_internal_api_key(
    is_production: bool,
    expected_key: Option<&str>,
    provided_key: &str,
) -> AppResult<()> {
    let expected = expected_key.map(str::trim).unwrap_or_default();

    if is_production && expected.is_empty() {
        return Err(AppError::Dependency(
            "INTERNAL_API_KEY must be set in production to refresh contract schedules."
                .to_string(),
        ));
    }

    if !expected.is_empty() && provided_key != expected {
        return Err(AppError::Unauthorized(
            "Invalid or missing API key.".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use chrono::NaiveDate;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::validate_internal_api_key;
    use crate::{
        config::AppConfig, error::AppError, repository::memory_ledger::MemoryLedger,
        routes::v1_router, services::clock::FixedClock, state::AppState,
    };

    fn app(ledger: Arc<MemoryLedger>) -> Router {
        let state = AppState::from_parts(
            AppConfig::for_tests(),
            None,
            reqwest::Client::new(),
            ledger,
            Arc::new(FixedClock(NaiveDate::from_ymd_opt(2024, 1, 10).expect("date"))),
        );
        Router::new().nest("/v1", v1_router()).with_state(state)
    }

    fn seeded_ledger() -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.insert_contract(json!({
            "id": "c-1",
            "tenant_id": "t-1",
            "unit_id": "u-1",
            "start_date": "2024-01-01",
            "end_date": "2024-12-31",
            "base_rent": 900,
            "utilities": 80,
            "heating": 20,
            "rent_due_day": 1,
            "deposit": 2700,
            "deposit_installments": 3
        }));
        ledger
    }

    fn post(uri: &str, user: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn reconciles_and_reports_stats() {
        let ledger = seeded_ledger();
        let (status, body) = send(
            app(ledger.clone()),
            post(
                "/v1/functions/update-contract-payments",
                Some("u-1"),
                r#"{"contractId":"c-1"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "success": true, "stats": { "created": 15, "updated": 0, "deleted": 0 } })
        );
        assert_eq!(ledger.payments().len(), 15);
    }

    #[tokio::test]
    async fn authentication_is_checked_before_the_body() {
        let (status, body) = send(
            app(seeded_ledger()),
            post("/v1/functions/update-contract-payments", None, "not json"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn missing_contract_id_is_a_bad_request() {
        for raw in ["{}", r#"{"contractId":""}"#, "not json"] {
            let (status, body) = send(
                app(seeded_ledger()),
                post("/v1/functions/update-contract-payments", Some("u-1"), raw),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{raw}");
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn unknown_contract_is_not_found() {
        let ledger = seeded_ledger();
        let (status, body) = send(
            app(ledger.clone()),
            post(
                "/v1/functions/update-contract-payments",
                Some("u-1"),
                r#"{"contractId":"c-404"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "lease_contracts record not found.");
        assert_eq!(ledger.write_calls(), (0, 0, 0));
    }

    #[tokio::test]
    async fn preview_lists_the_plan_without_writing() {
        let ledger = seeded_ledger();
        let request = Request::builder()
            .uri("/v1/contracts/c-1/payment-plan")
            .header("x-user-id", "u-1")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app(ledger.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["schedule_end"], "2024-12");
        assert_eq!(body["data"]["plan"]["creates"].as_array().map(Vec::len), Some(15));
        assert_eq!(body["data"]["expected"][0]["key"], "rent-2024-01");
        assert_eq!(ledger.write_calls(), (0, 0, 0));
    }

    #[tokio::test]
    async fn internal_refresh_requires_the_api_key() {
        let ledger = seeded_ledger();
        let (status, _) = send(
            app(ledger.clone()),
            post("/v1/internal/contracts/reconcile", None, ""),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/v1/internal/contracts/reconcile")
            .header("x-api-key", "test-internal-key")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app(ledger), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["contracts"], 1);
        assert_eq!(body["stats"]["created"], 15);
    }

    #[test]
    fn production_requires_a_configured_key() {
        assert!(matches!(
            validate_internal_api_key(true, None, ""),
            Err(AppError::Dependency(_))
        ));
        assert!(validate_internal_api_key(false, None, "").is_ok());
        assert!(validate_internal_api_key(true, Some("k"), "k").is_ok());
    }
}
