use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    db::create_pool,
    repository::payment_ledger::{PaymentLedger, PgPaymentLedger},
    services::{
        clock::{Clock, SystemClock},
        contract_locks::ContractLocks,
        contract_payments::{PaymentReconciler, ReconcileSettings},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: Client,
    pub reconciler: PaymentReconciler,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = create_pool(&config)?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let ledger: Arc<dyn PaymentLedger> = Arc::new(PgPaymentLedger::new(db_pool.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.schedule_timezone));

        Ok(Self::from_parts(config, db_pool, http_client, ledger, clock))
    }

    pub fn from_parts(
        config: AppConfig,
        db_pool: Option<PgPool>,
        http_client: Client,
        ledger: Arc<dyn PaymentLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = ContractLocks::new(config.contract_lock_max_entries);
        let reconciler =
            PaymentReconciler::new(ledger, clock, locks, ReconcileSettings::from_config(&config));

        Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            reconciler,
        }
    }
}
