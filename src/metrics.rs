//! Prometheus metrics for the isolation layer
//!
//! All metrics live in the default registry and are registered lazily on
//! first use. `gather_text()` renders them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_histogram_vec,
    CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Environments currently tracked by the lifecycle manager, by backend type.
    pub static ref ENVIRONMENTS_ACTIVE: GaugeVec = register_gauge_vec!(
        "agentvisor_environments_active",
        "Isolated environments currently tracked",
        &["backend"]
    ).expect("failed to register ENVIRONMENTS_ACTIVE metric");

    /// Wall-clock time of successful `create` calls, by backend type.
    pub static ref CREATE_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_environment_create_duration_seconds",
        "Time to create an isolated environment",
        &["backend"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register CREATE_DURATION metric");

    /// Failed `create` calls, by backend type and error kind.
    pub static ref CREATE_FAILURES: CounterVec = register_counter_vec!(
        "agentvisor_environment_create_failures_total",
        "Failed isolated environment creations",
        &["backend", "kind"]
    ).expect("failed to register CREATE_FAILURES metric");

    /// Time from identity allocation until a VM reaches `running`.
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "agentvisor_vm_boot_duration_seconds",
        "Time to boot a VM including virtiofs and networking",
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0]
    ).expect("failed to register VM_BOOT_DURATION metric");

    /// Egress proxy decisions, by verdict ("allowed" / "denied").
    pub static ref PROXY_REQUESTS: CounterVec = register_counter_vec!(
        "agentvisor_proxy_requests_total",
        "Requests seen by the per-VM egress proxy",
        &["verdict"]
    ).expect("failed to register PROXY_REQUESTS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
