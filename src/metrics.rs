use crate::cache::FsCache;
use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    request_duration: HistogramVec,
    active_requests: IntGauge,
    active_connections: IntGauge,
    connections: IntCounterVec,
    throttled_requests: IntCounterVec,
    loader_duration: HistogramVec,
    loader_response_size: Histogram,
    cache_fs_size_bytes: IntGaugeVec,
    cache_fs_files_count: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "media_proxy_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["method", "path", "status_code"],
        )
        .expect("request_duration_seconds");
        let active_requests = IntGauge::new("media_proxy_active_requests", "Active requests")
            .expect("active_requests");
        let active_connections =
            IntGauge::new("media_proxy_active_conns", "Active connections").expect("active_conns");
        let connections = IntCounterVec::new(
            Opts::new(
                "media_proxy_network_conns_total",
                "Connection transitions by state",
            ),
            &["state"],
        )
        .expect("network_conns_total");
        let throttled_requests = IntCounterVec::new(
            Opts::new(
                "media_proxy_throttled_requests_total",
                "Requests shed by the throttle, by reason",
            ),
            &["reason"],
        )
        .expect("throttled_requests_total");
        let loader_duration = HistogramVec::new(
            HistogramOpts::new(
                "media_proxy_loader_duration_seconds",
                "Loader duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["status_code"],
        )
        .expect("loader_duration_seconds");
        let loader_response_size = Histogram::with_opts(
            HistogramOpts::new(
                "media_proxy_loader_response_size_bytes",
                "Loader response size in bytes",
            )
            .buckets(vec![
                100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0,
            ]),
        )
        .expect("loader_response_size_bytes");
        let cache_fs_size_bytes = IntGaugeVec::new(
            Opts::new(
                "media_proxy_cache_fs_size_bytes",
                "Filesystem cache size by tier directory",
            ),
            &["cache_path"],
        )
        .expect("cache_fs_size_bytes");
        let cache_fs_files_count = IntGaugeVec::new(
            Opts::new(
                "media_proxy_cache_fs_files_count",
                "Filesystem cache file count by tier directory",
            ),
            &["cache_path"],
        )
        .expect("cache_fs_files_count");

        registry
            .register(Box::new(request_duration.clone()))
            .expect("register request_duration");
        registry
            .register(Box::new(active_requests.clone()))
            .expect("register active_requests");
        registry
            .register(Box::new(active_connections.clone()))
            .expect("register active_connections");
        registry
            .register(Box::new(connections.clone()))
            .expect("register connections");
        registry
            .register(Box::new(throttled_requests.clone()))
            .expect("register throttled_requests");
        registry
            .register(Box::new(loader_duration.clone()))
            .expect("register loader_duration");
        registry
            .register(Box::new(loader_response_size.clone()))
            .expect("register loader_response_size");
        registry
            .register(Box::new(cache_fs_size_bytes.clone()))
            .expect("register cache_fs_size_bytes");
        registry
            .register(Box::new(cache_fs_files_count.clone()))
            .expect("register cache_fs_files_count");

        Self {
            registry,
            request_duration,
            active_requests,
            active_connections,
            connections,
            throttled_requests,
            loader_duration,
            loader_response_size,
            cache_fs_size_bytes,
            cache_fs_files_count,
        }
    }

    pub fn request_started(&self) {
        self.active_requests.inc();
    }

    pub fn request_finished(&self, method: &str, path: &str, status_code: u16, seconds: f64) {
        self.active_requests.dec();
        self.request_duration
            .with_label_values(&[method, path, &status_code.to_string()])
            .observe(seconds);
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
        self.connections.with_label_values(&["new"]).inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
        self.connections.with_label_values(&["closed"]).inc();
    }

    pub fn request_throttled(&self, reason: &str) {
        self.throttled_requests.with_label_values(&[reason]).inc();
    }

    /// Records one origin round-trip. `status_code` is 0 when no response
    /// was received.
    pub fn observe_loader(&self, status_code: u16, seconds: f64, response_size: Option<usize>) {
        self.loader_duration
            .with_label_values(&[&status_code.to_string()])
            .observe(seconds);
        if let Some(size) = response_size {
            self.loader_response_size.observe(size as f64);
        }
    }

    pub fn set_cache_fs_stats(&self, cache_path: &str, size_bytes: u64, files: u64) {
        self.cache_fs_size_bytes
            .with_label_values(&[cache_path])
            .set(size_bytes as i64);
        self.cache_fs_files_count
            .with_label_values(&[cache_path])
            .set(files as i64);
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Refreshes the filesystem gauges for every cache tier backed by disk.
/// Driven from a background loop at startup.
pub async fn refresh_cache_metrics(metrics: &Metrics, tiers: &[Arc<FsCache>]) {
    for tier in tiers {
        let label = tier.dir().to_string_lossy().into_owned();
        match tier.scan().await {
            Ok((size, files)) => metrics.set_cache_fs_stats(&label, size, files),
            Err(err) => warn!(error = ?err, cache_path = %label, "cache scan failed"),
        }
    }
}
