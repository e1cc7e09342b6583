//! Prometheus metrics for the optx engine.
//!
//! Covers:
//! - Transaction admission (per type and outcome, rejection reasons)
//! - Rate controller state and exchange penalties
//! - Order registration / cancel latency
//! - Order slot anomalies
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge,
    TextEncoder,
};
use std::path::Path;

use crate::error::TelemetryResult;

/// Admission decisions.
/// Labels: tx_type (new_order/move/cancel), outcome (admitted/rejected)
pub static ADMISSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optx_admissions_total",
        "Total transaction admission decisions",
        &["tx_type", "outcome"]
    )
    .unwrap()
});

/// Admission rejections by reason.
pub static ADMISSION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optx_admission_rejected_total",
        "Total rejected admissions by reason",
        &["reason"]
    )
    .unwrap()
});

/// Rate controller current state (one-hot).
pub static CONTROLLER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "optx_controller_state",
        "Rate controller current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Exchange-confirmed rate violations.
pub static EXCHANGE_PENALTY_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "optx_exchange_penalty_total",
        "Total exchange-confirmed transaction rate violations"
    )
    .unwrap()
});

/// Portfolio-wide cancel-all requests issued.
pub static CANCEL_ALL_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "optx_cancel_all_total",
        "Total portfolio-wide cancel-all requests issued"
    )
    .unwrap()
});

/// Transactions currently inside the rolling window.
pub static RATE_WINDOW_USAGE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "optx_rate_window_usage",
        "Transactions admitted within the current rolling window"
    )
    .unwrap()
});

/// Send-to-registered latency in milliseconds.
pub static ORDER_REGISTER_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "optx_order_register_latency_ms",
        "Order send to exchange registration latency in milliseconds",
        &["instrument"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Cancel-sent-to-done latency in milliseconds.
pub static ORDER_CANCEL_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "optx_order_cancel_latency_ms",
        "Cancel request to terminal state latency in milliseconds",
        &["instrument"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Orders reaching a terminal state.
/// Labels: outcome (matched/canceled/failed)
pub static ORDER_DONE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optx_order_done_total",
        "Total orders reaching a terminal state",
        &["instrument", "outcome"]
    )
    .unwrap()
});

/// Slot anomalies.
/// Labels: kind (force_reset/stale_event/orphan/fatal/invalid_transition)
pub static SLOT_ANOMALY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optx_slot_anomaly_total",
        "Total order slot anomalies",
        &["instrument", "kind"]
    )
    .unwrap()
});

const CONTROLLER_STATES: [&str; 4] = [
    "normal_operation",
    "new_order_limit_exceeded",
    "mm_only",
    "limit_exceeded",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record an admitted transaction.
    pub fn admitted(tx_type: &str) {
        ADMISSIONS_TOTAL
            .with_label_values(&[tx_type, "admitted"])
            .inc();
    }

    /// Record a rejected transaction.
    pub fn rejected(tx_type: &str, reason: &str) {
        ADMISSIONS_TOTAL
            .with_label_values(&[tx_type, "rejected"])
            .inc();
        ADMISSION_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Set rate controller state.
    /// Only the active state is set to 1.
    pub fn controller_state_set(state: &str) {
        for s in CONTROLLER_STATES {
            CONTROLLER_STATE.with_label_values(&[s]).set(0.0);
        }
        CONTROLLER_STATE.with_label_values(&[state]).set(1.0);
    }

    pub fn exchange_penalty() {
        EXCHANGE_PENALTY_TOTAL.inc();
    }

    pub fn cancel_all_issued() {
        CANCEL_ALL_TOTAL.inc();
    }

    pub fn window_usage(count: usize) {
        RATE_WINDOW_USAGE.set(count as i64);
    }

    /// Record registration latency.
    pub fn register_latency(instrument: &str, latency_ms: f64) {
        ORDER_REGISTER_LATENCY_MS
            .with_label_values(&[instrument])
            .observe(latency_ms);
    }

    /// Record cancel latency.
    pub fn cancel_latency(instrument: &str, latency_ms: f64) {
        ORDER_CANCEL_LATENCY_MS
            .with_label_values(&[instrument])
            .observe(latency_ms);
    }

    pub fn order_done(instrument: &str, outcome: &str) {
        ORDER_DONE_TOTAL
            .with_label_values(&[instrument, outcome])
            .inc();
    }

    pub fn slot_anomaly(instrument: &str, kind: &str) {
        SLOT_ANOMALY_TOTAL
            .with_label_values(&[instrument, kind])
            .inc();
    }

    /// Render every registered metric in Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Write a text-format snapshot of all metrics to `path`.
    pub fn write_snapshot(path: &Path) -> TelemetryResult<()> {
        let text = Self::render()?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_state_is_one_hot() {
        Metrics::controller_state_set("mm_only");
        Metrics::controller_state_set("limit_exceeded");

        let active: Vec<_> = CONTROLLER_STATES
            .iter()
            .filter(|s| CONTROLLER_STATE.with_label_values(&[**s]).get() > 0.0)
            .collect();
        assert_eq!(active, vec![&"limit_exceeded"]);
    }

    #[test]
    fn test_rejection_counts_both_series() {
        let before = ADMISSION_REJECTED_TOTAL
            .with_label_values(&["test_reason"])
            .get();
        Metrics::rejected("cancel", "test_reason");

        let after = ADMISSION_REJECTED_TOTAL
            .with_label_values(&["test_reason"])
            .get();
        assert_eq!(after - before, 1.0);
        assert!(ADMISSIONS_TOTAL.with_label_values(&["cancel", "rejected"]).get() >= 1.0);
    }

    #[test]
    fn test_snapshot_written() {
        Metrics::slot_anomaly("TEST", "force_reset");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        Metrics::write_snapshot(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("optx_slot_anomaly_total"));
    }
}
