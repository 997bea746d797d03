//! Env-gated wire counters.
//!
//! Enabled with `TIDEPOOL_PERF=1`. Counters are cheap enough to leave in
//! the hot paths; when disabled every recording call is a single atomic
//! load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::info;

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var("TIDEPOOL_PERF")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
});

#[derive(Default)]
struct WireStats {
    frames: AtomicU64,
    frame_bytes: AtomicU64,
    decode_ns: AtomicU64,
    syncs: AtomicU64,
    sync_bytes: AtomicU64,
    uploads: AtomicU64,
    upload_bytes: AtomicU64,
}

static WIRE: Lazy<WireStats> = Lazy::new(WireStats::default);

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn frame_decoded(bytes: usize, took: Duration) {
    if !enabled() {
        return;
    }
    WIRE.frames.fetch_add(1, Ordering::Relaxed);
    WIRE.frame_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    WIRE.decode_ns
        .fetch_add(took.as_nanos() as u64, Ordering::Relaxed);
}

pub fn sync_sent(bytes: usize) {
    if !enabled() {
        return;
    }
    WIRE.syncs.fetch_add(1, Ordering::Relaxed);
    WIRE.sync_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub fn upload_sent(bytes: usize) {
    if !enabled() {
        return;
    }
    WIRE.uploads.fetch_add(1, Ordering::Relaxed);
    WIRE.upload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
}

/// Log the accumulated counters. Called once per client lifetime, on the
/// way out of the event loop.
pub fn log_summary() {
    if !enabled() {
        return;
    }
    let frames = WIRE.frames.load(Ordering::Relaxed);
    let avg_decode_us = if frames > 0 {
        WIRE.decode_ns.load(Ordering::Relaxed) as f64 / frames as f64 / 1_000.0
    } else {
        0.0
    };
    info!(
        target = "telemetry::wire",
        frames,
        frame_bytes = WIRE.frame_bytes.load(Ordering::Relaxed),
        avg_decode_us,
        syncs = WIRE.syncs.load(Ordering::Relaxed),
        sync_bytes = WIRE.sync_bytes.load(Ordering::Relaxed),
        uploads = WIRE.uploads.load(Ordering::Relaxed),
        upload_bytes = WIRE.upload_bytes.load(Ordering::Relaxed),
        "wire counters"
    );
}
