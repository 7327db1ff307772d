use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

const DB_PING_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = match &state.db_pool {
        Some(pool) => {
            match tokio::time::timeout(DB_PING_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool))
                .await
            {
                Ok(Ok(_)) => true,
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "Health check DB query failed");
                    false
                }
                Err(_) => {
                    tracing::error!("Health check DB query timed out (3s)");
                    false
                }
            }
        }
        // Without a database there is nothing to ping.
        None => true,
    };

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "now": Utc::now().to_rfc3339(),
        "db": db_ok
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use chrono::NaiveDate;

    use super::health;
    use crate::{
        config::AppConfig, repository::memory_ledger::MemoryLedger,
        services::clock::FixedClock, state::AppState,
    };

    #[tokio::test]
    async fn reports_ok_without_a_database() {
        let state = AppState::from_parts(
            AppConfig::for_tests(),
            None,
            reqwest::Client::new(),
            Arc::new(MemoryLedger::new()),
            Arc::new(FixedClock(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"))),
        );
        let body = health(State(state)).await.0;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["db"], true);
        assert!(body["now"].is_string());
    }
}
