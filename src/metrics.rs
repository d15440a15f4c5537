//! Per-route request counters and latency histograms, exposed on the admin
//! listener as Prometheus text.  Keys are matched route patterns, never raw
//! paths, so the cardinality is fixed by the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

const LATENCY_BUCKETS_MS: [u64; 7] = [1, 5, 10, 25, 100, 500, 1000];

#[derive(Default)]
struct RouteStats {
    hits: AtomicU64,
    errors: AtomicU64,
    latency_sum_micros: AtomicU64,
    // One slot per bucket plus the overflow slot.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

#[derive(Default)]
pub struct Metrics {
    routes: DashMap<String, RouteStats>,
}

impl Metrics {
    pub fn record(&self, route: &str, status: u16, elapsed: Duration) {
        let stats = self.routes.entry(route.to_string()).or_default();
        stats.hits.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .latency_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let ms = elapsed.as_millis() as u64;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        stats.buckets[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP flagrelay_requests_total Requests served per route.\n");
        out.push_str("# TYPE flagrelay_requests_total counter\n");
        let mut entries: Vec<(String, u64, u64, u64, Vec<u64>)> = self
            .routes
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.hits.load(Ordering::Relaxed),
                    e.errors.load(Ordering::Relaxed),
                    e.latency_sum_micros.load(Ordering::Relaxed),
                    e.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (route, hits, _, _, _) in &entries {
            out.push_str(&format!(
                "flagrelay_requests_total{{route=\"{route}\"}} {hits}\n"
            ));
        }
        out.push_str("# HELP flagrelay_request_errors_total Responses with status >= 400.\n");
        out.push_str("# TYPE flagrelay_request_errors_total counter\n");
        for (route, _, errors, _, _) in &entries {
            out.push_str(&format!(
                "flagrelay_request_errors_total{{route=\"{route}\"}} {errors}\n"
            ));
        }
        out.push_str(
            "# HELP flagrelay_request_duration_milliseconds Request latency per route.\n",
        );
        out.push_str("# TYPE flagrelay_request_duration_milliseconds histogram\n");
        for (route, hits, _, sum_micros, buckets) in &entries {
            let mut cumulative = 0u64;
            for (i, le) in LATENCY_BUCKETS_MS.iter().enumerate() {
                cumulative += buckets[i];
                out.push_str(&format!(
                    "flagrelay_request_duration_milliseconds_bucket{{route=\"{route}\",le=\"{le}\"}} {cumulative}\n"
                ));
            }
            out.push_str(&format!(
                "flagrelay_request_duration_milliseconds_bucket{{route=\"{route}\",le=\"+Inf\"}} {hits}\n"
            ));
            out.push_str(&format!(
                "flagrelay_request_duration_milliseconds_sum{{route=\"{route}\"}} {}\n",
                *sum_micros as f64 / 1000.0
            ));
            out.push_str(&format!(
                "flagrelay_request_duration_milliseconds_count{{route=\"{route}\"}} {hits}\n"
            ));
        }
        out
    }
}
