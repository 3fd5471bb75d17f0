use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
};

use crate::crd::KubernetesClusterStatus;
use crate::error::ErrorClass;

/// Process-wide registry; bound once onto the `/metrics` HTTP route in
/// `main`. All update functions below are idempotent and touch only
/// atomics owned by `prometheus`, matching spec §4.2's "lock-free".
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static RECONCILE_SUCCESS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_reconcile_success_total",
            "Total number of successful cluster reconciliations"
        ),
        &["namespace", "cluster"],
        REGISTRY
    )
    .expect("register nico_reconcile_success_total")
});

static RECONCILE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_reconcile_errors_total",
            "Total number of cluster reconciliation errors"
        ),
        &["namespace", "cluster", "error_type"],
        REGISTRY
    )
    .expect("register nico_reconcile_errors_total")
});

static RECONCILE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec_with_registry!(
        "nico_reconcile_duration_seconds",
        "Time spent reconciling a cluster",
        &["namespace", "cluster"],
        REGISTRY
    )
    .expect("register nico_reconcile_duration_seconds")
});

static NIXOS_CONFIGS_CREATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_nixos_configs_created_total",
            "Total number of NixosConfiguration resources created"
        ),
        &["namespace", "cluster", "role"],
        REGISTRY
    )
    .expect("register nico_nixos_configs_created_total")
});

static NIXOS_CONFIGS_DELETED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_nixos_configs_deleted_total",
            "Total number of NixosConfiguration resources deleted"
        ),
        &["namespace", "cluster"],
        REGISTRY
    )
    .expect("register nico_nixos_configs_deleted_total")
});

static MACHINE_SELECTION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec_with_registry!(
        "nico_machine_selection_duration_seconds",
        "Time spent selecting machines for a cluster role",
        &["namespace", "cluster", "role"],
        REGISTRY
    )
    .expect("register nico_machine_selection_duration_seconds")
});

static MACHINES_SELECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new("nico_machines_selected", "Number of machines selected for a cluster role"),
        &["namespace", "cluster", "role"],
        REGISTRY
    )
    .expect("register nico_machines_selected")
});

static KUBECONFIG_SUCCESS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_kubeconfig_generation_success_total",
            "Total number of successful kubeconfig generations"
        ),
        &["namespace", "cluster"],
        REGISTRY
    )
    .expect("register nico_kubeconfig_generation_success_total")
});

static KUBECONFIG_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new(
            "nico_kubeconfig_generation_errors_total",
            "Total number of kubeconfig generation errors"
        ),
        &["namespace", "cluster"],
        REGISTRY
    )
    .expect("register nico_kubeconfig_generation_errors_total")
});

static CLUSTER_PHASE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new("nico_cluster_phase", "One-hot indicator of a cluster's current phase"),
        &["namespace", "cluster", "phase"],
        REGISTRY
    )
    .expect("register nico_cluster_phase")
});

static CONTROL_PLANE_NODES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new("nico_cluster_control_plane_nodes", "Control plane node counts per cluster"),
        &["namespace", "cluster", "status"],
        REGISTRY
    )
    .expect("register nico_cluster_control_plane_nodes")
});

static WORKER_NODES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new("nico_cluster_worker_nodes", "Worker node counts per cluster"),
        &["namespace", "cluster", "status"],
        REGISTRY
    )
    .expect("register nico_cluster_worker_nodes")
});

const PHASES: [&str; 5] = ["Provisioning", "ControlPlaneReady", "Ready", "Deleting", "Failed"];

pub fn record_reconcile_success(namespace: &str, cluster: &str) {
    RECONCILE_SUCCESS_TOTAL.with_label_values(&[namespace, cluster]).inc();
}

pub fn record_reconcile_error(namespace: &str, cluster: &str, class: ErrorClass) {
    RECONCILE_ERRORS_TOTAL
        .with_label_values(&[namespace, cluster, class.as_label()])
        .inc();
}

pub fn observe_reconcile_duration(namespace: &str, cluster: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .with_label_values(&[namespace, cluster])
        .observe(seconds);
}

pub fn record_config_created(namespace: &str, cluster: &str, role: &str) {
    NIXOS_CONFIGS_CREATED_TOTAL
        .with_label_values(&[namespace, cluster, role])
        .inc();
}

pub fn record_config_deleted(namespace: &str, cluster: &str) {
    NIXOS_CONFIGS_DELETED_TOTAL.with_label_values(&[namespace, cluster]).inc();
}

pub fn observe_selection_duration(namespace: &str, cluster: &str, role: &str, seconds: f64) {
    MACHINE_SELECTION_DURATION_SECONDS
        .with_label_values(&[namespace, cluster, role])
        .observe(seconds);
}

pub fn record_machines_selected(namespace: &str, cluster: &str, role: &str, count: i64) {
    MACHINES_SELECTED.with_label_values(&[namespace, cluster, role]).set(count);
}

pub fn record_kubeconfig_generated(namespace: &str, cluster: &str, success: bool) {
    if success {
        KUBECONFIG_SUCCESS_TOTAL.with_label_values(&[namespace, cluster]).inc();
    } else {
        KUBECONFIG_ERRORS_TOTAL.with_label_values(&[namespace, cluster]).inc();
    }
}

/// Parses the `"R/T"` ready-counter strings defensively: a malformed
/// counter just skips that gauge update rather than panicking (mirrors
/// `original_source/metrics.py::update_cluster_metrics`'s try/except).
fn parse_ready_total(value: &str) -> Option<(i64, i64)> {
    let (ready, total) = value.split_once('/')?;
    Some((ready.trim().parse().ok()?, total.trim().parse().ok()?))
}

pub fn update_cluster_metrics(namespace: &str, cluster: &str, status: &KubernetesClusterStatus) {
    let phase = status.phase.as_deref().unwrap_or("Unknown");
    for p in PHASES {
        let value = if p == phase { 1 } else { 0 };
        CLUSTER_PHASE.with_label_values(&[namespace, cluster, p]).set(value);
    }

    if let Some((ready, total)) = status.control_plane_ready.as_deref().and_then(parse_ready_total) {
        CONTROL_PLANE_NODES.with_label_values(&[namespace, cluster, "ready"]).set(ready);
        CONTROL_PLANE_NODES.with_label_values(&[namespace, cluster, "total"]).set(total);
    }

    if let Some((ready, total)) = status.data_plane_ready.as_deref().and_then(parse_ready_total) {
        WORKER_NODES.with_label_values(&[namespace, cluster, "ready"]).set(ready);
        WORKER_NODES.with_label_values(&[namespace, cluster, "total"]).set(total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_ready_total() {
        assert_eq!(parse_ready_total("2/3"), Some((2, 3)));
    }

    #[test]
    fn rejects_malformed_ready_total() {
        assert_eq!(parse_ready_total("nope"), None);
        assert_eq!(parse_ready_total(""), None);
    }

    #[test]
    fn update_cluster_metrics_does_not_panic_on_missing_counters() {
        let status = KubernetesClusterStatus {
            phase: Some("Provisioning".into()),
            ..Default::default()
        };
        update_cluster_metrics("default", "demo", &status);
    }
}
