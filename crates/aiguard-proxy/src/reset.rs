//! Scheduled usage-counter rollover.
//!
//! Zeroes every project's `current_day` bucket at local midnight and the
//! `current_month` bucket at midnight on the 1st. Admission decisions trust
//! the counters and never compare against the clock, so this task is the
//! only thing that moves them backwards.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Utc};

use aiguard_store::ProjectRepo;

/// Next local midnight strictly after `after`.
pub fn next_midnight(after: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = after.date_naive() + ChronoDuration::days(1);
    // Midnight always exists in well-behaved offsets; fall back to the later
    // candidate around DST transitions.
    Local
        .from_local_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"))
        .latest()
        .unwrap_or(after + ChronoDuration::days(1))
}

/// Run the rollover loop until the task is aborted.
pub async fn run(projects: Arc<dyn ProjectRepo>) {
    loop {
        let now = Local::now();
        let wake_at = next_midnight(now);
        let sleep_for = (wake_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        tracing::debug!(wake_at = %wake_at, "Counter reset sleeping until next midnight");
        tokio::time::sleep(sleep_for).await;

        let today = Local::now();
        match projects.reset_daily_counters(Utc::now()).await {
            Ok(count) => tracing::info!(projects = count, "Reset daily usage counters"),
            Err(e) => tracing::error!(error = %e, "Daily counter reset failed"),
        }

        if today.day() == 1 {
            match projects.reset_monthly_counters(Utc::now()).await {
                Ok(count) => tracing::info!(projects = count, "Reset monthly usage counters"),
                Err(e) => tracing::error!(error = %e, "Monthly counter reset failed"),
            }
        }
    }
}

/// Spawn the rollover loop as a background task.
pub fn spawn(projects: Arc<dyn ProjectRepo>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(projects))
}
