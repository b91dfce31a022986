#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Bizpilot Background Worker
//!
//! Handles scheduled jobs including:
//! - Replay of failed Stripe webhook deliveries (every 15 minutes)
//! - Billing invariant checks (hourly)

use std::sync::Arc;
use std::time::Duration;

use bizpilot_billing::{
    InvariantCheckSummary, InvariantChecker, StripeConfig, WebhookHandler, WebhookReplayResult,
    DEFAULT_TOLERANCE_SECS,
};
use bizpilot_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_REPLAY_BATCH_SIZE: i64 = 25;
const WORKER_MAX_CONNECTIONS: u32 = 5;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    Ok(create_pool(&database_url, WORKER_MAX_CONNECTIONS).await?)
}

fn replay_batch_size(raw: Option<String>) -> i64 {
    match raw.map(|v| v.trim().parse::<i64>()) {
        None => DEFAULT_REPLAY_BATCH_SIZE,
        Some(Ok(size)) if size > 0 => size,
        Some(_) => {
            warn!(
                default = DEFAULT_REPLAY_BATCH_SIZE,
                "Invalid REPLAY_BATCH_SIZE, using default"
            );
            DEFAULT_REPLAY_BATCH_SIZE
        }
    }
}

/// Count (recovered, still failing)
fn tally_replays(results: &[WebhookReplayResult]) -> (usize, usize) {
    let recovered = results.iter().filter(|r| r.success).count();
    (recovered, results.len() - recovered)
}

/// Log results of a replay cycle
fn log_replay_results(results: &[WebhookReplayResult]) {
    let (recovered, still_failing) = tally_replays(results);

    info!(
        replayed = results.len(),
        recovered = recovered,
        still_failing = still_failing,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            stripe_event_id = %result.stripe_event_id,
            event_type = %result.event_type,
            status = %result.new_status,
            error = ?result.new_error,
            "Webhook event still failing after replay"
        );
    }
}

/// Log an invariant check summary, one line per violation
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariant checks passed"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            user_ids = ?violation.user_ids,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Bizpilot Worker");

    let pool = create_db_pool().await?;
    let batch_size = replay_batch_size(std::env::var("REPLAY_BATCH_SIZE").ok());

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Replay failed webhook deliveries every 15 minutes
    // Replay re-fetches checkout sessions, so it needs Stripe credentials
    match StripeConfig::from_env() {
        Ok(config) => {
            let handler: Arc<WebhookHandler> = Arc::new(bizpilot_billing::webhook_handler(
                config,
                pool.clone(),
                DEFAULT_TOLERANCE_SECS,
            ));
            scheduler
                .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                    let handler = handler.clone();
                    Box::pin(async move {
                        info!(batch_size = batch_size, "Running scheduled webhook replay");
                        match handler.replay_failed(batch_size).await {
                            Ok(results) => log_replay_results(&results),
                            Err(e) => error!(error = %e, "Webhook replay cycle failed"),
                        }
                    })
                })?)
                .await?;
            job_count += 1;
            info!("Scheduled: Failed webhook replay (every 15 minutes)");
        }
        Err(e) => {
            warn!(error = %e, "Stripe not configured - webhook replay disabled");
        }
    }

    // Job 2: Billing invariant checks (hourly)
    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running scheduled billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Bizpilot Worker started successfully with {} scheduled jobs",
        job_count
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> WebhookReplayResult {
        WebhookReplayResult {
            stripe_event_id: "evt_1".to_string(),
            event_type: "invoice.payment_succeeded".to_string(),
            previous_status: "error".to_string(),
            previous_error: Some("Database error: timeout".to_string()),
            new_status: if success { "success" } else { "error" }.to_string(),
            new_error: None,
            success,
        }
    }

    #[test]
    fn test_replay_batch_size() {
        assert_eq!(replay_batch_size(None), 25);
        assert_eq!(replay_batch_size(Some("100".to_string())), 100);
        assert_eq!(replay_batch_size(Some("0".to_string())), 25);
        assert_eq!(replay_batch_size(Some("many".to_string())), 25);
    }

    #[test]
    fn test_tally_replays() {
        let results = vec![result(true), result(false), result(true)];
        assert_eq!(tally_replays(&results), (2, 1));
        assert_eq!(tally_replays(&[]), (0, 0));
    }
}
