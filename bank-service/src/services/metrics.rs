//! Prometheus metrics for bank-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Histogram, HistogramVec, TextEncoder,
};

/// Transfer counter by outcome (ok, insufficient_balance, invalid_payer, ...).
pub static TRANSFERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bank_transfers_total",
        "Total number of transfer attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register transfers_total")
});

/// End-to-end transfer latency, lock waits included.
pub static TRANSFER_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "bank_transfer_duration_seconds",
        "Transfer duration in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register transfer_duration")
});

pub static ACCOUNTS_CREATED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "bank_accounts_created_total",
        "Total number of accounts created"
    )
    .expect("Failed to register accounts_created")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bank_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bank_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&TRANSFERS_TOTAL);
    Lazy::force(&TRANSFER_DURATION);
    Lazy::force(&ACCOUNTS_CREATED);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
