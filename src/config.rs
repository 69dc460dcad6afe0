//! Runtime configuration sourced from the environment.
//!
//! Tuning constants (auto-verify thresholds, award sizes, cashout bounds,
//! retry policy) live here rather than at call sites; the defaults match the
//! production values.

use std::env;

use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,

    // Submission intake
    pub daily_submission_limit: i64,
    pub capture_max_age_hours: i64,

    // Scoring and awards
    pub auto_verify_threshold: i32,
    pub bonus_score_threshold: i32,
    pub base_award_points: i64,
    pub bonus_award_points: i64,

    // Verification worker
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    pub job_timeout_secs: u64,
    pub max_job_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub requeue_scan_secs: u64,
    pub requeue_stale_secs: u64,

    // Cashouts
    pub cashout_rate: Decimal,
    pub cashout_min: Decimal,
    pub cashout_max: Decimal,
    pub payout_currency: String,
    pub gateway_max_attempts: u32,

    // Collaborators
    pub webhook_secret: Option<String>,
    pub storage_base_url: Option<String>,
    pub storage_token: Option<String>,
    pub paypal_base_url: Option<String>,
    pub paypal_client_id: Option<String>,
    pub paypal_secret: Option<String>,
    pub stripe_base_url: Option<String>,
    pub stripe_api_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/ecovault".to_string()),

            daily_submission_limit: parsed("DAILY_SUBMISSION_LIMIT", 10),
            capture_max_age_hours: parsed("CAPTURE_MAX_AGE_HOURS", 24),

            auto_verify_threshold: parsed("AUTO_VERIFY_THRESHOLD", 70),
            bonus_score_threshold: parsed("BONUS_SCORE_THRESHOLD", 80),
            base_award_points: parsed("BASE_AWARD_POINTS", 100),
            bonus_award_points: parsed("BONUS_AWARD_POINTS", 50),

            worker_concurrency: parsed("WORKER_CONCURRENCY", 4),
            queue_capacity: parsed("VERIFICATION_QUEUE_CAPACITY", 1024),
            job_timeout_secs: parsed("JOB_TIMEOUT_SECS", 300),
            max_job_attempts: parsed("MAX_JOB_ATTEMPTS", 3),
            retry_base_delay_ms: parsed("RETRY_BASE_DELAY_MS", 500),
            requeue_scan_secs: parsed("REQUEUE_SCAN_SECS", 60),
            requeue_stale_secs: parsed("REQUEUE_STALE_SECS", 600),

            cashout_rate: parsed_decimal("CASHOUT_RATE", Decimal::new(1, 2)),
            cashout_min: parsed_decimal("CASHOUT_MIN", Decimal::new(500, 2)),
            cashout_max: parsed_decimal("CASHOUT_MAX", Decimal::new(100_000, 2)),
            payout_currency: env::var("PAYOUT_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
            gateway_max_attempts: parsed("GATEWAY_MAX_ATTEMPTS", 3),

            webhook_secret: env::var("PAYOUT_WEBHOOK_SECRET").ok(),
            storage_base_url: env::var("STORAGE_BASE_URL").ok(),
            storage_token: env::var("STORAGE_TOKEN").ok(),
            paypal_base_url: env::var("PAYPAL_BASE_URL").ok(),
            paypal_client_id: env::var("PAYPAL_CLIENT_ID").ok(),
            paypal_secret: env::var("PAYPAL_SECRET").ok(),
            stripe_base_url: env::var("STRIPE_BASE_URL").ok(),
            stripe_api_key: env::var("STRIPE_API_KEY").ok(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parsed_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tuning() {
        let config = AppConfig::from_env();
        assert_eq!(config.daily_submission_limit, 10);
        assert_eq!(config.auto_verify_threshold, 70);
        assert_eq!(config.bonus_score_threshold, 80);
        assert_eq!(config.cashout_rate, Decimal::new(1, 2));
        assert_eq!(config.cashout_min, "5.00".parse::<Decimal>().unwrap());
        assert_eq!(config.cashout_max, "1000.00".parse::<Decimal>().unwrap());
    }
}
