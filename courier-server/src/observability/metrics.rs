//! Metrics collection for courier
//!
//! Process-wide counters for the session layer, exported in Prometheus
//! text format.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::manager::ManagerSnapshot;

/// Connection lifecycle events reported by the client manager
///
/// Only the open/close pair is mandatory; the rest default to no-ops.
pub trait ConnectionStats: Send + Sync {
    fn on_connection_opened(&self);

    fn on_connection_closed(&self);

    /// A sign-in referenced a temporary id that is not registered
    fn on_sign_in_miss(&self) {}

    /// A sign-out referenced a slot that is not registered
    fn on_sign_out_miss(&self) {}

    /// A session was pushed out of its slot by a newer sign-in
    fn on_eviction(&self) {}

    /// An enqueue failed; `reason` is a stable label
    fn on_delivery_failure(&self, _reason: &str) {}
}

/// Point-in-time gauge values collected on each metrics request
#[derive(Debug, Default)]
pub struct GaugeSnapshot {
    /// User entries in the registry, temporary ones included
    pub registered_users: u64,
    /// Occupied device slots in the registry
    pub registered_clients: u64,
    /// Process resident set size in bytes (Linux only)
    pub process_memory_bytes: Option<u64>,
    /// Number of open file descriptors (Linux only)
    pub process_open_fds: Option<u64>,
}

impl GaugeSnapshot {
    /// Collect gauge values from /proc on Linux
    #[cfg(target_os = "linux")]
    pub fn collect_process_metrics(&mut self) {
        // Second field of statm is RSS in pages
        if let Ok(content) = std::fs::read_to_string("/proc/self/statm") {
            let parts: Vec<&str> = content.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(pages) = parts[1].parse::<u64>() {
                    self.process_memory_bytes = Some(pages * 4096);
                }
            }
        }

        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            self.process_open_fds = Some(entries.count() as u64);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn collect_process_metrics(&mut self) {}
}

/// Metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Connections accepted or directly registered
    pub connections_opened_total: AtomicU64,
    /// Sessions that left the registry for good
    pub connections_closed_total: AtomicU64,
    /// Sign-ins for an unknown temporary id
    pub sign_in_miss_total: AtomicU64,
    /// Sign-outs for an unknown slot
    pub sign_out_miss_total: AtomicU64,
    /// Sessions evicted by a sign-in on the same slot
    pub evictions_total: AtomicU64,
    /// Failed enqueues by reason
    pub delivery_failures_by_reason: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections currently accounted as open
    pub fn open_connections(&self) -> u64 {
        let opened = self.connections_opened_total.load(Ordering::Relaxed);
        let closed = self.connections_closed_total.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    /// Failures recorded for `reason`
    pub fn delivery_failures(&self, reason: &str) -> u64 {
        self.delivery_failures_by_reason
            .get(reason)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self, snapshot: &ManagerSnapshot, gauges: &GaugeSnapshot) -> String {
        use std::fmt::Write;

        let mut output = String::with_capacity(2048);

        macro_rules! counter {
            ($name:expr, $help:expr, $value:expr) => {
                let _ = writeln!(output, "# HELP {} {}", $name, $help);
                let _ = writeln!(output, "# TYPE {} counter", $name);
                let _ = writeln!(output, "{} {}", $name, $value);
            };
        }

        macro_rules! gauge {
            ($name:expr, $help:expr, $value:expr) => {
                let _ = writeln!(output, "# HELP {} {}", $name, $help);
                let _ = writeln!(output, "# TYPE {} gauge", $name);
                let _ = writeln!(output, "{} {}", $name, $value);
            };
        }

        // === Counters ===

        counter!(
            "courier_connections_opened_total",
            "Connections accepted or directly registered",
            self.connections_opened_total.load(Ordering::Relaxed)
        );
        counter!(
            "courier_connections_closed_total",
            "Sessions that left the registry",
            self.connections_closed_total.load(Ordering::Relaxed)
        );
        counter!(
            "courier_messages_sent_total",
            "Enqueue attempts, successful or not",
            snapshot.messages_sent
        );
        counter!(
            "courier_sign_in_miss_total",
            "Sign-ins for an unknown temporary id",
            self.sign_in_miss_total.load(Ordering::Relaxed)
        );
        counter!(
            "courier_sign_out_miss_total",
            "Sign-outs for an unregistered device",
            self.sign_out_miss_total.load(Ordering::Relaxed)
        );
        counter!(
            "courier_evictions_total",
            "Sessions evicted by a sign-in on the same device",
            self.evictions_total.load(Ordering::Relaxed)
        );

        if !self.delivery_failures_by_reason.is_empty() {
            let _ = writeln!(
                output,
                "# HELP courier_delivery_failures_total Failed enqueues by reason"
            );
            let _ = writeln!(output, "# TYPE courier_delivery_failures_total counter");
            for entry in self.delivery_failures_by_reason.iter() {
                let _ = writeln!(
                    output,
                    "courier_delivery_failures_total{{reason=\"{}\"}} {}",
                    entry.key(),
                    entry.value().load(Ordering::Relaxed)
                );
            }
        }

        // === Gauges ===

        gauge!(
            "courier_online",
            "Authenticated sessions currently registered",
            snapshot.online
        );
        gauge!(
            "courier_max_online",
            "High-watermark of courier_online",
            snapshot.max_online
        );
        gauge!(
            "courier_started_at_seconds",
            "Process start time in unix seconds",
            snapshot.started_at
        );
        gauge!(
            "courier_registered_users",
            "User entries in the registry",
            gauges.registered_users
        );
        gauge!(
            "courier_registered_clients",
            "Occupied device slots in the registry",
            gauges.registered_clients
        );

        if let Some(memory) = gauges.process_memory_bytes {
            gauge!(
                "courier_process_memory_bytes",
                "Process resident set size in bytes",
                memory
            );
        }
        if let Some(fds) = gauges.process_open_fds {
            gauge!(
                "courier_process_open_fds",
                "Number of open file descriptors",
                fds
            );
        }

        output
    }
}

impl ConnectionStats for Metrics {
    fn on_connection_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_closed(&self) {
        self.connections_closed_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_sign_in_miss(&self) {
        self.sign_in_miss_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_sign_out_miss(&self) {
        self.sign_out_miss_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_eviction(&self) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_delivery_failure(&self, reason: &str) {
        self.delivery_failures_by_reason
            .entry(reason.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}
