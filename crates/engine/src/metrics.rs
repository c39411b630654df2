//! Prometheus metrics for the update engine.
//!
//! Metrics carry no update ids, hashes or scope keys, only aggregate counts.
//! Hosts that export them call [`gather_text`] and ship the text exposition
//! format however they report telemetry.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Loader metrics
pub static MANIFEST_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "updraft_manifest_requests_total",
            "Total manifest requests by result",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static ASSETS_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_assets_downloaded_total",
        "Total number of assets downloaded",
    )
    .expect("metric creation failed")
});

pub static ASSETS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_assets_deduplicated_total",
        "Total number of assets skipped because they were already stored",
    )
    .expect("metric creation failed")
});

pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_bytes_downloaded_total",
        "Total asset bytes downloaded",
    )
    .expect("metric creation failed")
});

pub static ASSET_HASH_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_asset_hash_mismatches_total",
        "Total number of downloaded assets that failed verification",
    )
    .expect("metric creation failed")
});

pub static LOAD_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "updraft_load_failures_total",
            "Total failed loads by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

pub static LOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "updraft_load_duration_seconds",
            "Time taken by a remote load, manifest to commit",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Launch metrics
pub static LAUNCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "updraft_launches_total",
            "Total launches by the status of the launched update",
        ),
        &["status"],
    )
    .expect("metric creation failed")
});

pub static LAUNCH_FALLBACKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_launch_fallbacks_total",
        "Total launches that skipped an update with missing assets",
    )
    .expect("metric creation failed")
});

pub static RECOVERIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_recoveries_total",
        "Total number of crash-loop recoveries started",
    )
    .expect("metric creation failed")
});

// Reaper metrics
pub static REAPED_UPDATES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_reaped_updates_total",
        "Total number of updates deleted by the reaper",
    )
    .expect("metric creation failed")
});

pub static REAPED_BLOBS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "updraft_reaped_blobs_total",
        "Total number of asset blobs deleted by the reaper",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so every engine instance in a process may call it.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(MANIFEST_REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSETS_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSETS_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSET_HASH_MISMATCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOAD_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOAD_DURATION.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(LAUNCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LAUNCH_FALLBACKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RECOVERIES.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(REAPED_UPDATES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REAPED_BLOBS.clone()))
            .expect("metric registration failed");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record load failures by error code.
pub fn record_load_failure(code: &str) {
    LOAD_FAILURES.with_label_values(&[code]).inc();
}
