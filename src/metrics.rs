// Prometheus metrics definitions for the arena backend.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Backlog of the submission status recomputation queue.
    pub static ref DEDUP_QUEUE_DEPTH: IntGauge =
        IntGauge::new("arena_dedup_queue_depth", "Pending dedup queue entries").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Judge round callbacks received, by kind (start / complete).
    pub static ref ROUND_CALLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_round_callbacks_total", "Judge round callbacks received"),
        &["kind"],
    )
    .unwrap();

    /// Callbacks dropped as routine duplicates or stale tokens, by reason.
    pub static ref IGNORED_CALLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_ignored_callbacks_total", "Callbacks ignored"),
        &["reason"],
    )
    .unwrap();

    /// Matches created by the scheduler.
    pub static ref MATCHES_CREATED_TOTAL: IntCounter =
        IntCounter::new("arena_matches_created_total", "Matches created").unwrap();

    /// Matches that reached a terminal status, by status.
    pub static ref MATCHES_SETTLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_matches_settled_total", "Matches settled"),
        &["status"],
    )
    .unwrap();

    /// New submissions accepted.
    pub static ref SUBMISSIONS_CREATED_TOTAL: IntCounter =
        IntCounter::new("arena_submissions_created_total", "Submissions accepted").unwrap();

    /// Backlog entries discarded by per-id coalescing.
    pub static ref DEDUP_DISCARDED_TOTAL: IntCounter =
        IntCounter::new("arena_dedup_discarded_total", "Coalesced dedup queue entries").unwrap();

    /// Matchmaking cycles, by outcome (matched / idle).
    pub static ref SCHEDULER_CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_scheduler_cycles_total", "Matchmaking cycles"),
        &["outcome"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DEDUP_QUEUE_DEPTH.clone()),
        Box::new(ROUND_CALLBACKS_TOTAL.clone()),
        Box::new(IGNORED_CALLBACKS_TOTAL.clone()),
        Box::new(MATCHES_CREATED_TOTAL.clone()),
        Box::new(MATCHES_SETTLED_TOTAL.clone()),
        Box::new(SUBMISSIONS_CREATED_TOTAL.clone()),
        Box::new(DEDUP_DISCARDED_TOTAL.clone()),
        Box::new(SCHEDULER_CYCLES_TOTAL.clone()),
    ];

    for c in collectors {
        REGISTRY.register(c).expect("failed to register metric");
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_increments() {
        DEDUP_QUEUE_DEPTH.set(2);
        assert_eq!(DEDUP_QUEUE_DEPTH.get(), 2);
        DEDUP_QUEUE_DEPTH.set(0);

        ROUND_CALLBACKS_TOTAL.with_label_values(&["start"]).inc();
        IGNORED_CALLBACKS_TOTAL
            .with_label_values(&["task_token_mismatch"])
            .inc();
        MATCHES_CREATED_TOTAL.inc();
        MATCHES_SETTLED_TOTAL.with_label_values(&["u1win"]).inc();
        SUBMISSIONS_CREATED_TOTAL.inc();
        DEDUP_DISCARDED_TOTAL.inc();
        SCHEDULER_CYCLES_TOTAL.with_label_values(&["idle"]).inc();
    }

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("arena_"));
    }
}
