//! Readiness Monitor (spec §4.7): a cooperative timer that aggregates
//! child + machine status into cluster phase, independent of the event
//! reconciler (spec §5: the two never run concurrently for the same
//! cluster, since the timer here only ever touches the status
//! subresource through idempotent patches).

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::crd::{ClusterCondition, ClusterPhase, KubernetesClusterStatus, Role};
use crate::error::OperatorError;
use crate::gateway::ApiGateway;
use crate::harvester;
use crate::metrics;

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Runs forever, ticking every 30s across every `KubernetesCluster` found
/// in `namespace` (pass `None`/empty string upstream for all-namespaces
/// via `Api::all`-backed listing in `gateway`).
pub async fn run(gateway: ApiGateway, namespace: String) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        interval.tick().await;
        let clusters = match gateway.list_clusters(&namespace).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to list clusters for readiness monitor");
                continue;
            }
        };
        for cluster in clusters {
            let Some(name) = cluster.metadata.name.clone() else { continue };
            let ns = cluster.metadata.namespace.clone().unwrap_or_else(|| namespace.clone());
            if let Err(e) = monitor_once(&gateway, &ns, &name, &cluster.status.unwrap_or_default()).await {
                warn!(cluster = name, error = %e, "readiness monitor tick failed");
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReadinessCounts {
    pub control_plane_ready: usize,
    pub control_plane_total: usize,
    pub data_plane_ready: usize,
    pub data_plane_total: usize,
    pub ready_control_plane_names: Vec<String>,
}

/// Phase derivation (spec §4.7.3, P8): `Ready` iff the control plane is
/// fully ready and either there are no workers or they are fully ready
/// too; `ControlPlaneReady` iff the control plane alone is fully ready;
/// else `Provisioning`.
pub fn derive_phase(counts: &ReadinessCounts) -> ClusterPhase {
    let cp_fully_ready = counts.control_plane_ready == counts.control_plane_total && counts.control_plane_total > 0;
    let workers_fully_ready =
        counts.data_plane_total == 0 || counts.data_plane_ready == counts.data_plane_total;

    if cp_fully_ready && workers_fully_ready {
        ClusterPhase::Ready
    } else if cp_fully_ready {
        ClusterPhase::ControlPlaneReady
    } else {
        ClusterPhase::Provisioning
    }
}

/// One readiness aggregation pass for a single cluster (spec §4.7 steps
/// 1-5).
pub async fn monitor_once(
    gateway: &ApiGateway,
    namespace: &str,
    cluster_name: &str,
    status: &KubernetesClusterStatus,
) -> Result<(), OperatorError> {
    if status.applied_machines.is_empty() {
        return Ok(());
    }

    let mut counts = ReadinessCounts {
        control_plane_ready: 0,
        control_plane_total: 0,
        data_plane_ready: 0,
        data_plane_total: 0,
        ready_control_plane_names: Vec::new(),
    };

    for (machine_name, child_name) in &status.applied_machines {
        let outcome = async {
            let config = gateway.get_config(namespace, child_name).await?;
            let machine = gateway.get_machine(namespace, machine_name).await?;
            Ok::<_, OperatorError>((config, machine))
        }
        .await;

        let (config, machine) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                debug!(cluster = cluster_name, machine = machine_name, error = %e, "skipping machine in readiness tick");
                continue;
            }
        };

        let role = Role::from_label(config.metadata.labels.as_ref().and_then(|l| l.get(crate::crd::ROLE_LABEL)).map(|s| s.as_str()));
        let is_ready = config
            .status
            .as_ref()
            .and_then(|s| s.applied_commit.as_deref())
            .is_some_and(|c| !c.is_empty())
            && machine.status.as_ref().and_then(|s| s.has_configuration).unwrap_or(false);

        match role {
            Role::ControlPlane => {
                counts.control_plane_total += 1;
                if is_ready {
                    counts.control_plane_ready += 1;
                    counts.ready_control_plane_names.push(machine_name.clone());
                }
            }
            Role::Worker => {
                counts.data_plane_total += 1;
                if is_ready {
                    counts.data_plane_ready += 1;
                }
            }
        }
    }

    let phase = derive_phase(&counts);
    let kubeconfig_secret_name = format!("{cluster_name}-kubeconfig");

    if phase != ClusterPhase::Provisioning && !counts.ready_control_plane_names.is_empty() {
        maybe_harvest_kubeconfig(gateway, namespace, cluster_name, &kubeconfig_secret_name, &counts.ready_control_plane_names)
            .await;
    }

    let new_status = KubernetesClusterStatus {
        phase: Some(phase.to_string()),
        control_plane_ready: Some(format!("{}/{}", counts.control_plane_ready, counts.control_plane_total)),
        data_plane_ready: Some(format!("{}/{}", counts.data_plane_ready, counts.data_plane_total)),
        kubeconfig_secret: Some(kubeconfig_secret_name),
        applied_machines: status.applied_machines.clone(),
        selected_control_plane_machines: status.selected_control_plane_machines.clone(),
        selected_data_plane_machines: status.selected_data_plane_machines.clone(),
        conditions: vec![ClusterCondition {
            type_: "Ready".to_string(),
            status: if phase == ClusterPhase::Ready { "True".to_string() } else { "False".to_string() },
            reason: Some(phase.to_string()),
            message: Some(format!(
                "control plane {}/{}, workers {}/{}",
                counts.control_plane_ready, counts.control_plane_total, counts.data_plane_ready, counts.data_plane_total
            )),
            last_transition_time: None,
        }],
    };

    gateway.patch_cluster_status(namespace, cluster_name, &new_status).await?;
    metrics::update_cluster_metrics(namespace, cluster_name, &new_status);

    Ok(())
}

/// Kubeconfig harvest precondition (spec I4, P9): only attempted once the
/// control plane is fully ready, and only if the secret does not exist
/// yet. Failure here is logged, never fatal (spec §4.7.4, §7).
async fn maybe_harvest_kubeconfig(
    gateway: &ApiGateway,
    namespace: &str,
    cluster_name: &str,
    secret_name: &str,
    ready_control_plane_names: &[String],
) {
    if gateway.get_secret(namespace, secret_name).await.is_ok() {
        return;
    }

    match harvester::harvest(gateway, namespace, ready_control_plane_names).await {
        Some(kubeconfig) => {
            let mut data = std::collections::BTreeMap::new();
            data.insert("kubeconfig".to_string(), kubeconfig);
            match gateway.create_secret(namespace, secret_name, data).await {
                Ok(()) => metrics::record_kubeconfig_generated(namespace, cluster_name, true),
                Err(e) => {
                    warn!(cluster = cluster_name, error = %e, "failed to persist kubeconfig secret");
                    metrics::record_kubeconfig_generated(namespace, cluster_name, false);
                }
            }
        }
        None => {
            warn!(cluster = cluster_name, "kubeconfig harvest produced no result");
            metrics::record_kubeconfig_generated(namespace, cluster_name, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counts(cp_ready: usize, cp_total: usize, dp_ready: usize, dp_total: usize) -> ReadinessCounts {
        ReadinessCounts {
            control_plane_ready: cp_ready,
            control_plane_total: cp_total,
            data_plane_ready: dp_ready,
            data_plane_total: dp_total,
            ready_control_plane_names: vec![],
        }
    }

    #[rstest]
    #[case::everything_ready_p8(2, 2, 1, 1, ClusterPhase::Ready)]
    #[case::no_workers_exist_p8(1, 1, 0, 0, ClusterPhase::Ready)]
    #[case::workers_lag_s5(2, 2, 0, 1, ClusterPhase::ControlPlaneReady)]
    #[case::control_plane_incomplete(1, 2, 0, 0, ClusterPhase::Provisioning)]
    #[case::control_plane_total_is_zero(0, 0, 0, 0, ClusterPhase::Provisioning)]
    #[case::control_plane_ready_workers_incomplete(3, 3, 2, 5, ClusterPhase::ControlPlaneReady)]
    fn derive_phase_matches_readiness_counts(
        #[case] cp_ready: usize,
        #[case] cp_total: usize,
        #[case] dp_ready: usize,
        #[case] dp_total: usize,
        #[case] expected: ClusterPhase,
    ) {
        assert_eq!(derive_phase(&counts(cp_ready, cp_total, dp_ready, dp_total)), expected);
    }
}
