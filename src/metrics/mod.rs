//! Prometheus metrics for the coordinator and workers
//!
//! Call `init_metrics()` once at startup. If initialization fails or never
//! happens, every recording helper is a no-op.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

// ============================================================================
// Metrics Storage
// ============================================================================

/// Coordinator-side scheduling metrics, labelled by phase
struct SchedulerMetrics {
    tasks_accepted: CounterVec,
    duplicates_discarded: CounterVec,
    speculative_requeues: CounterVec,
    failure_requeues: CounterVec,
    workers_dead: CounterVec,
    tasks_remaining: GaugeVec,
    phase_duration: HistogramVec,
}

/// Worker-side execution metrics
struct WorkerMetrics {
    tasks_executed: CounterVec,
}

static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

/// Serializes registration so concurrent callers see a finished init
static INIT_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// Initialization
// ============================================================================

/// Register all metrics with the default Prometheus registry
///
/// Idempotent: later calls return `Ok(())` without registering again.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = INIT_LOCK
        .lock()
        .map_err(|_| "metrics init lock poisoned")?;
    if metrics_initialized() {
        return Ok(());
    }

    let scheduler = SchedulerMetrics {
        tasks_accepted: register_counter_vec!(
            "mapred_tasks_accepted_total",
            "Work items whose first successful result was accepted",
            &["phase"]
        )?,
        duplicates_discarded: register_counter_vec!(
            "mapred_duplicates_discarded_total",
            "Successful results discarded because the item was already accepted",
            &["phase"]
        )?,
        speculative_requeues: register_counter_vec!(
            "mapred_speculative_requeues_total",
            "Straggling items re-enqueued for speculative execution",
            &["phase"]
        )?,
        failure_requeues: register_counter_vec!(
            "mapred_failure_requeues_total",
            "Items re-enqueued after a failed attempt or a dead worker",
            &["phase"]
        )?,
        workers_dead: register_counter_vec!(
            "mapred_workers_dead_total",
            "Workers marked dead, by cause",
            &["phase", "reason"]
        )?,
        tasks_remaining: register_gauge_vec!(
            "mapred_tasks_remaining",
            "Work items not yet accepted in the running phase",
            &["phase"]
        )?,
        phase_duration: register_histogram_vec!(
            "mapred_phase_duration_seconds",
            "Wall time of completed phases",
            &["phase"],
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
        )?,
    };

    let worker = WorkerMetrics {
        tasks_executed: register_counter_vec!(
            "mapred_worker_tasks_total",
            "Tasks executed by this worker process",
            &["kind", "outcome"]
        )?,
    };

    SCHEDULER_METRICS
        .set(scheduler)
        .map_err(|_| "Scheduler metrics already initialized")?;
    WORKER_METRICS
        .set(worker)
        .map_err(|_| "Worker metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SCHEDULER_METRICS.get().is_some() && WORKER_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Recording Helpers
// ============================================================================

pub fn record_accepted(phase: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.tasks_accepted.with_label_values(&[phase]).inc();
    }
}

pub fn record_duplicate_discarded(phase: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.duplicates_discarded.with_label_values(&[phase]).inc();
    }
}

pub fn record_speculative_requeue(phase: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.speculative_requeues.with_label_values(&[phase]).inc();
    }
}

pub fn record_failure_requeue(phase: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.failure_requeues.with_label_values(&[phase]).inc();
    }
}

/// `reason` is one of `probe`, `transport`, `application`
pub fn record_worker_dead(phase: &str, reason: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.workers_dead.with_label_values(&[phase, reason]).inc();
    }
}

pub fn set_remaining(phase: &str, remaining: usize) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.tasks_remaining
            .with_label_values(&[phase])
            .set(remaining as f64);
    }
}

pub fn observe_phase_duration(phase: &str, secs: f64) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.phase_duration.with_label_values(&[phase]).observe(secs);
    }
}

pub fn record_worker_task(kind: &str, success: bool) {
    let Some(m) = WORKER_METRICS.get() else {
        return;
    };
    let outcome = if success { "success" } else { "failure" };
    m.tasks_executed.with_label_values(&[kind, outcome]).inc();
}

// ============================================================================
// Tests
// ============================================================================
