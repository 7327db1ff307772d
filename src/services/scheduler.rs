use std::time::Duration;

use chrono::{NaiveDate, Timelike, Utc};
use tokio::time::sleep;

use crate::state::AppState;

/// Background loop that refreshes the payment schedules of all running
/// contracts once per day, at or after `SCHEDULE_REFRESH_HOUR_UTC`.
///
/// The refresh runs in its own `tokio::spawn` so a panic inside it never
/// takes the loop down.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!(
        hour_utc = state.config.schedule_refresh_hour_utc,
        "Background scheduler started"
    );

    if state.db_pool.is_none() {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    }

    let mut last_daily_run: Option<NaiveDate> = None;

    loop {
        sleep(Duration::from_secs(60)).await;

        let now_utc = Utc::now();
        let today = now_utc.date_naive();
        if !daily_refresh_due(last_daily_run, today, now_utc.hour(), state.config.schedule_refresh_hour_utc) {
            continue;
        }
        last_daily_run = Some(today);
        tracing::info!("Scheduler: refreshing contract payment schedules for {today}");

        let reconciler = state.reconciler.clone();
        tokio::spawn(async move {
            match reconciler.refresh_active_contracts().await {
                Ok(totals) => tracing::info!(
                    contracts = totals.contracts,
                    failed = totals.failed,
                    created = totals.created,
                    updated = totals.updated,
                    deleted = totals.deleted,
                    "Scheduler: contract payment refresh completed"
                ),
                Err(error) => {
                    tracing::error!(error = %error, "Scheduler: contract payment refresh failed")
                }
            }
        });
    }
}

fn daily_refresh_due(
    last_run: Option<NaiveDate>,
    today: NaiveDate,
    hour_utc: u32,
    refresh_hour_utc: u32,
) -> bool {
    last_run != Some(today) && hour_utc >= refresh_hour_utc
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::daily_refresh_due;

    #[test]
    fn runs_once_per_day_after_the_configured_hour() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");
        let yesterday = NaiveDate::from_ymd_opt(2024, 3, 3).expect("date");

        assert!(!daily_refresh_due(None, today, 2, 3));
        assert!(daily_refresh_due(None, today, 3, 3));
        assert!(daily_refresh_due(Some(yesterday), today, 23, 3));
        assert!(!daily_refresh_due(Some(today), today, 23, 3));
    }
}
