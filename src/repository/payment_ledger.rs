use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::{
    error::{AppError, AppResult},
    models::{
        decode_payment_rows, decode_row, LeaseContract, NewPayment, Payment, PaymentPatch,
        RentChange,
    },
    repository::table_service::{create_rows, delete_row, get_row, list_all_rows, update_row},
};

/// Listings page with OFFSET, so they must be ordered by a unique column.
const ROW_ORDER_COLUMN: &str = "id";

/// Storage the reconciler reads contracts from and writes payments to.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Fails with `AppError::NotFound` when the contract does not exist.
    async fn get_contract(&self, contract_id: &str) -> AppResult<LeaseContract>;

    /// Contracts that are open-ended or end on/after `today`.
    async fn list_active_contract_ids(&self, today: NaiveDate) -> AppResult<Vec<String>>;

    async fn list_rent_changes(&self, contract_id: &str) -> AppResult<Vec<RentChange>>;

    async fn list_payments(&self, contract_id: &str) -> AppResult<Vec<Payment>>;

    /// Returns how many rows were written; rows hitting a unique constraint
    /// are skipped rather than failing the batch.
    async fn create_payments(&self, payments: &[NewPayment]) -> AppResult<u64>;

    async fn update_payment(&self, payment_id: &str, patch: &PaymentPatch) -> AppResult<()>;

    async fn delete_payment(&self, payment_id: &str) -> AppResult<()>;
}

#[derive(Clone)]
pub struct PgPaymentLedger {
    pool: Option<PgPool>,
}

impl PgPaymentLedger {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> AppResult<&PgPool> {
        self.pool.as_ref().ok_or_else(|| {
            AppError::Dependency(
                "Database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
            )
        })
    }
}

#[async_trait]
impl PaymentLedger for PgPaymentLedger {
    async fn get_contract(&self, contract_id: &str) -> AppResult<LeaseContract> {
        let row = get_row(self.pool()?, "lease_contracts", contract_id, "id").await?;
        decode_row("lease_contracts", row)
    }

    async fn list_active_contract_ids(&self, today: NaiveDate) -> AppResult<Vec<String>> {
        let pool = self.pool()?;
        let open_ended = list_all_rows(
            pool,
            "lease_contracts",
            Some(&filter_map(&[("end_date__is_null", Value::Bool(true))])),
            ROW_ORDER_COLUMN,
            true,
        )
        .await?;
        let running = list_all_rows(
            pool,
            "lease_contracts",
            Some(&filter_map(&[(
                "end_date__gte",
                Value::String(today.format("%Y-%m-%d").to_string()),
            )])),
            ROW_ORDER_COLUMN,
            true,
        )
        .await?;

        let mut ids = Vec::with_capacity(open_ended.len() + running.len());
        for row in open_ended.iter().chain(running.iter()) {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                if !ids.iter().any(|existing: &String| existing == id) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn list_rent_changes(&self, contract_id: &str) -> AppResult<Vec<RentChange>> {
        let rows = list_all_rows(
            self.pool()?,
            "rent_changes",
            Some(&filter_map(&[(
                "contract_id",
                Value::String(contract_id.to_string()),
            )])),
            ROW_ORDER_COLUMN,
            true,
        )
        .await?;
        rows.into_iter()
            .map(|row| decode_row("rent_changes", row))
            .collect()
    }

    async fn list_payments(&self, contract_id: &str) -> AppResult<Vec<Payment>> {
        let rows = list_all_rows(
            self.pool()?,
            "payments",
            Some(&filter_map(&[(
                "contract_id",
                Value::String(contract_id.to_string()),
            )])),
            ROW_ORDER_COLUMN,
            true,
        )
        .await?;
        decode_payment_rows(rows)
    }

    async fn create_payments(&self, payments: &[NewPayment]) -> AppResult<u64> {
        let rows = payments
            .iter()
            .map(to_map)
            .collect::<AppResult<Vec<_>>>()?;
        let inserted = create_rows(self.pool()?, "payments", &rows).await?;
        Ok(inserted.len() as u64)
    }

    async fn update_payment(&self, payment_id: &str, patch: &PaymentPatch) -> AppResult<()> {
        update_row(self.pool()?, "payments", payment_id, &to_map(patch)?, "id").await?;
        Ok(())
    }

    async fn delete_payment(&self, payment_id: &str) -> AppResult<()> {
        delete_row(self.pool()?, "payments", payment_id, "id").await?;
        Ok(())
    }
}

fn filter_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn to_map<T: serde::Serialize>(value: &T) -> AppResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::Internal(
            "Payment payload did not serialize to an object.".to_string(),
        )),
        Err(error) => Err(AppError::Internal(format!(
            "Could not serialize payment payload: {error}"
        ))),
    }
}
