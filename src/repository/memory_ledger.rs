//! In-process ledger used by the reconciler and router tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::{
    error::{AppError, AppResult},
    models::{decode_row, LeaseContract, NewPayment, Payment, PaymentPatch, RentChange},
    repository::payment_ledger::PaymentLedger,
};

#[derive(Default)]
struct Tables {
    contracts: Vec<Value>,
    rent_changes: Vec<Value>,
    payments: Vec<Payment>,
    next_id: u64,
    create_batches: Vec<usize>,
    update_calls: usize,
    delete_calls: usize,
    fail_updates: bool,
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("memory ledger lock poisoned")
    }

    pub fn insert_contract(&self, row: Value) {
        self.tables().contracts.push(row);
    }

    pub fn replace_contract(&self, row: Value) {
        let mut tables = self.tables();
        let id = row.get("id").cloned();
        tables.contracts.retain(|existing| existing.get("id") != id.as_ref());
        tables.contracts.push(row);
    }

    pub fn insert_rent_change(&self, row: Value) {
        self.tables().rent_changes.push(row);
    }

    pub fn set_status(&self, payment_id: &str, status: &str) {
        let mut tables = self.tables();
        if let Some(payment) = tables.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.status = status.to_string().into();
        }
    }

    pub fn fail_updates(&self, fail: bool) {
        self.tables().fail_updates = fail;
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.tables().payments.clone()
    }

    pub fn create_batches(&self) -> Vec<usize> {
        self.tables().create_batches.clone()
    }

    pub fn write_calls(&self) -> (usize, usize, usize) {
        let tables = self.tables();
        (
            tables.create_batches.len(),
            tables.update_calls,
            tables.delete_calls,
        )
    }
}

#[async_trait]
impl PaymentLedger for MemoryLedger {
    async fn get_contract(&self, contract_id: &str) -> AppResult<LeaseContract> {
        let row = self
            .tables()
            .contracts
            .iter()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(contract_id))
            .cloned()
            .ok_or_else(|| AppError::NotFound("lease_contracts record not found.".to_string()))?;
        decode_row("lease_contracts", row)
    }

    async fn list_active_contract_ids(&self, today: NaiveDate) -> AppResult<Vec<String>> {
        let rows = self.tables().contracts.clone();
        let mut ids = Vec::new();
        for row in rows {
            let contract: LeaseContract = decode_row("lease_contracts", row)?;
            if contract.end_date.map_or(true, |end| end >= today) {
                ids.push(contract.id);
            }
        }
        Ok(ids)
    }

    async fn list_rent_changes(&self, contract_id: &str) -> AppResult<Vec<RentChange>> {
        let rows = self.tables().rent_changes.clone();
        rows.into_iter()
            .filter(|row| row.get("contract_id").and_then(Value::as_str) == Some(contract_id))
            .map(|row| decode_row("rent_changes", row))
            .collect()
    }

    async fn list_payments(&self, contract_id: &str) -> AppResult<Vec<Payment>> {
        Ok(self
            .tables()
            .payments
            .iter()
            .filter(|payment| payment.contract_id == contract_id)
            .cloned()
            .collect())
    }

    async fn create_payments(&self, payments: &[NewPayment]) -> AppResult<u64> {
        let mut tables = self.tables();
        tables.create_batches.push(payments.len());
        for payment in payments {
            tables.next_id += 1;
            let id = format!("p-{}", tables.next_id);
            tables.payments.push(Payment {
                id,
                contract_id: payment.contract_id.clone(),
                tenant_id: payment.tenant_id.clone(),
                unit_id: payment.unit_id.clone(),
                payment_month: payment.payment_month,
                payment_date: Some(payment.payment_date),
                expected_amount: payment.expected_amount,
                amount: payment.amount,
                payment_type: payment.payment_type.clone(),
                status: payment.status.clone(),
                reference: Some(payment.reference.clone()),
            });
        }
        Ok(payments.len() as u64)
    }

    async fn update_payment(&self, payment_id: &str, patch: &PaymentPatch) -> AppResult<()> {
        let mut tables = self.tables();
        if tables.fail_updates {
            return Err(AppError::Dependency("Database operation failed.".to_string()));
        }
        tables.update_calls += 1;
        let payment = tables
            .payments
            .iter_mut()
            .find(|payment| payment.id == payment_id)
            .ok_or_else(|| AppError::NotFound("payments record not found.".to_string()))?;
        payment.expected_amount = patch.expected_amount;
        payment.payment_date = Some(patch.payment_date);
        Ok(())
    }

    async fn delete_payment(&self, payment_id: &str) -> AppResult<()> {
        let mut tables = self.tables();
        tables.delete_calls += 1;
        let before = tables.payments.len();
        tables.payments.retain(|payment| payment.id != payment_id);
        if tables.payments.len() == before {
            return Err(AppError::NotFound("payments record not found.".to_string()));
        }
        Ok(())
    }
}
