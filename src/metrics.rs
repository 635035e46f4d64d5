//! Prometheus-compatible metrics exporter for gradebook
//!
//! Endpoint: GET /metrics (on the web port, default 8080)

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::grade::engine::GradeEngine;

/// Counters updated from the engine and the HTTP layer
pub struct MetricsCounters {
    /// Total corrections created or replaced
    pub corrections_recorded: AtomicU64,
    /// Total corrections removed (directly or by cascade)
    pub corrections_deleted: AtomicU64,
    /// Total "never submitted" shortcuts applied
    pub never_submitted: AtomicU64,
    /// Total corrections regraded by a recompute
    pub recomputed: AtomicU64,
    /// Total stateless preview calculations
    pub previews: AtomicU64,
    /// Total feedback mails queued
    pub notifications: AtomicU64,
    /// Total API requests answered with an error
    pub api_errors: AtomicU64,
    /// Total background snapshot writes that failed
    pub save_failures: AtomicU64,
    /// Server start time
    pub start_time: Instant,
}

impl MetricsCounters {
    pub fn new() -> Self {
        Self {
            corrections_recorded: AtomicU64::new(0),
            corrections_deleted: AtomicU64::new(0),
            never_submitted: AtomicU64::new(0),
            recomputed: AtomicU64::new(0),
            previews: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            api_errors: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl Default for MetricsCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate Prometheus-format metrics text
pub fn render_metrics(engine: &GradeEngine) -> String {
    let mut out = String::with_capacity(2048);
    let c = &engine.metrics;

    write_help_type(&mut out, "gradebook_up", "Whether the gradebook service is up.", "gauge");
    writeln!(out, "gradebook_up 1").ok();

    write_help_type(&mut out, "gradebook_time_up_seconds_total", "Uptime since service start in seconds.", "counter");
    writeln!(out, "gradebook_time_up_seconds_total {:.3}", c.start_time.elapsed().as_secs_f64()).ok();

    // ──────────────────────────────────────────────
    // Store size
    // ──────────────────────────────────────────────
    let stats = engine.get_stats();
    write_help_type(&mut out, "gradebook_entities", "Number of stored entities by kind.", "gauge");
    for kind in ["students", "activities", "corrections"] {
        let n = stats[kind].as_u64().unwrap_or(0);
        writeln!(out, "gradebook_entities{{kind=\"{}\"}} {}", kind, n).ok();
    }

    // ──────────────────────────────────────────────
    // Grading activity
    // ──────────────────────────────────────────────
    write_counter(&mut out, "gradebook_corrections_recorded_total", "Total corrections created or replaced.", c.corrections_recorded.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_corrections_deleted_total", "Total corrections removed.", c.corrections_deleted.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_never_submitted_total", "Total never-submitted shortcuts applied.", c.never_submitted.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_recomputed_total", "Total corrections regraded by a recompute.", c.recomputed.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_previews_total", "Total preview calculations.", c.previews.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_notifications_total", "Total feedback mails queued.", c.notifications.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_journal_entries_total", "Total grade changes journaled.", engine.journal.total_recorded());
    write_counter(&mut out, "gradebook_api_errors_total", "Total API requests answered with an error.", c.api_errors.load(Ordering::Relaxed));
    write_counter(&mut out, "gradebook_save_failures_total", "Total snapshot writes that failed.", c.save_failures.load(Ordering::Relaxed));

    // ──────────────────────────────────────────────
    // Policy
    // ──────────────────────────────────────────────
    write_help_type(&mut out, "gradebook_floor_threshold", "Default floor threshold of the grading policy.", "gauge");
    writeln!(out, "gradebook_floor_threshold {}", engine.calculator.floor_threshold()).ok();

    write_help_type(&mut out, "gradebook_build_info", "gradebook build information.", "gauge");
    writeln!(out, "gradebook_build_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")).ok();

    out
}

// ── helpers ─────────────────────────────────────────

fn write_help_type(out: &mut String, name: &str, help: &str, metric_type: &str) {
    writeln!(out, "# HELP {} {}", name, help).ok();
    writeln!(out, "# TYPE {} {}", name, metric_type).ok();
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    write_help_type(out, name, help, "counter");
    writeln!(out, "{} {}", name, value).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::Config;

    #[test]
    fn test_render_contains_core_series() {
        let engine = GradeEngine::new(Arc::new(Config::default())).unwrap();
        engine.metrics.previews.fetch_add(2, Ordering::Relaxed);
        let text = render_metrics(&engine);
        assert!(text.contains("gradebook_up 1"));
        assert!(text.contains("gradebook_entities{kind=\"students\"} 0"));
        assert!(text.contains("gradebook_previews_total 2"));
        assert!(text.contains("gradebook_floor_threshold 5"));
        assert!(text.contains("gradebook_save_failures_total 0"));
    }
}
