use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::AppResult,
    models::{LeaseContract, NewPayment, YearMonth},
    repository::payment_ledger::PaymentLedger,
    services::{
        clock::Clock,
        contract_locks::ContractLocks,
        payment_schedule::{
            build_expected_schedule, plan_reconciliation, schedule_end_month, ExpectedPayment,
            PaymentPlan,
        },
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub horizon_months: u32,
    pub create_batch_size: usize,
}

impl ReconcileSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            horizon_months: config.schedule_horizon_months,
            create_batch_size: config.payment_create_batch_size.max(1),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            horizon_months: 24,
            create_batch_size: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentPlanPreview {
    pub contract_id: String,
    pub schedule_end: YearMonth,
    pub expected: Vec<ExpectedPayment>,
    pub plan: PaymentPlan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub contracts: u64,
    pub failed: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Computes and applies contract payment schedules against a ledger.
#[derive(Clone)]
pub struct PaymentReconciler {
    ledger: Arc<dyn PaymentLedger>,
    clock: Arc<dyn Clock>,
    locks: ContractLocks,
    settings: ReconcileSettings,
}

impl PaymentReconciler {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        clock: Arc<dyn Clock>,
        locks: ContractLocks,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            ledger,
            clock,
            locks,
            settings,
        }
    }

    /// The expected schedule and the operations a reconcile would issue now.
    pub async fn preview(&self, contract_id: &str) -> AppResult<PaymentPlanPreview> {
        let (_, preview) = self.load_plan(contract_id).await?;
        Ok(preview)
    }

    /// Converges the stored payments of one contract to its schedule.
    ///
    /// Runs are serialized per contract. A failed write aborts the run with
    /// the error; calling again resumes from whatever was persisted.
    pub async fn reconcile(&self, contract_id: &str) -> AppResult<ReconcileStats> {
        let _guard = self.locks.acquire(contract_id).await;
        let (contract, preview) = self.load_plan(contract_id).await?;
        if preview.plan.is_empty() {
            debug!(contract_id = %contract.id, "Contract payments already match the schedule");
            return Ok(ReconcileStats::default());
        }
        let stats = self.apply(&contract, &preview.plan).await?;

        info!(
            contract_id = %contract.id,
            schedule_end = %preview.schedule_end,
            expected = preview.expected.len(),
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            "Contract payments reconciled"
        );
        Ok(stats)
    }

    /// Reconciles every contract that still runs today. One contract failing
    /// is logged and counted; the rest still run.
    pub async fn refresh_active_contracts(&self) -> AppResult<RefreshStats> {
        let today = self.clock.today();
        let contract_ids = self.ledger.list_active_contract_ids(today).await?;

        let mut totals = RefreshStats::default();
        for contract_id in contract_ids {
            totals.contracts += 1;
            match self.reconcile(&contract_id).await {
                Ok(stats) => {
                    totals.created += stats.created;
                    totals.updated += stats.updated;
                    totals.deleted += stats.deleted;
                }
                Err(error) => {
                    totals.failed += 1;
                    warn!(contract_id = %contract_id, error = %error, "Contract refresh failed");
                }
            }
        }

        info!(
            contracts = totals.contracts,
            failed = totals.failed,
            created = totals.created,
            updated = totals.updated,
            deleted = totals.deleted,
            "Active contract refresh completed"
        );
        Ok(totals)
    }

    async fn load_plan(&self, contract_id: &str) -> AppResult<(LeaseContract, PaymentPlanPreview)> {
        let contract = self.ledger.get_contract(contract_id).await?;
        let (rent_changes, payments) = tokio::try_join!(
            self.ledger.list_rent_changes(&contract.id),
            self.ledger.list_payments(&contract.id),
        )?;

        let today = self.clock.today();
        let expected = build_expected_schedule(
            &contract,
            &rent_changes,
            today,
            self.settings.horizon_months,
        );
        let plan = plan_reconciliation(&expected, &payments);
        let preview = PaymentPlanPreview {
            contract_id: contract.id.clone(),
            schedule_end: schedule_end_month(&contract, today, self.settings.horizon_months),
            expected,
            plan,
        };
        Ok((contract, preview))
    }

    async fn apply(&self, contract: &LeaseContract, plan: &PaymentPlan) -> AppResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        for batch in plan.creates.chunks(self.settings.create_batch_size) {
            let rows = batch
                .iter()
                .map(|entry| entry.to_new_payment(contract))
                .collect::<Vec<NewPayment>>();
            let written = self.ledger.create_payments(&rows).await.inspect_err(|error| {
                warn!(contract_id = %contract.id, created = stats.created, error = %error, "Payment batch insert failed");
            })?;
            if written < rows.len() as u64 {
                debug!(
                    contract_id = %contract.id,
                    skipped = rows.len() as u64 - written,
                    "Skipped payments that already exist"
                );
            }
            stats.created += written;
        }

        for update in &plan.updates {
            self.ledger
                .update_payment(&update.id, &update.patch())
                .await
                .inspect_err(|error| {
                    warn!(contract_id = %contract.id, payment_id = %update.id, error = %error, "Payment update failed");
                })?;
            stats.updated += 1;
        }

        for payment_id in &plan.deletes {
            self.ledger
                .delete_payment(payment_id)
                .await
                .inspect_err(|error| {
                    warn!(contract_id = %contract.id, payment_id = %payment_id, error = %error, "Payment delete failed");
                })?;
            if plan.duplicates.contains(payment_id) {
                info!(contract_id = %contract.id, payment_id = %payment_id, "Deleted duplicate open payment");
            }
            stats.deleted += 1;
        }

        Ok(stats)
    }
}
