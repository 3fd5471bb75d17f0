//! Machine Selector (spec §4.3): deterministic selection of machines for a
//! role, with status-persisted stability (spec I2, P1–P4, S1–S2).

use std::time::Instant;

use crate::crd::{Machine, RoleSpec};
use crate::error::OperatorError;
use crate::gateway::ApiGateway;
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    ControlPlane,
    DataPlane,
}

impl RoleKind {
    fn metric_label(&self) -> &'static str {
        match self {
            RoleKind::ControlPlane => "controlPlane",
            RoleKind::DataPlane => "dataPlane",
        }
    }
}

/// Selects the machine names for a cluster role. Strict precedence (spec
/// §4.3):
///
/// 1. Explicit `role_spec.machines`, returned verbatim.
/// 2. The persisted selection from status, returned verbatim.
/// 3. A fresh selection: label-match + availability filter, sorted
///    lexicographically, truncated to `count`.
///
/// Does not write status; the caller persists the returned list.
pub async fn select_machines(
    gateway: &ApiGateway,
    namespace: &str,
    cluster_name: &str,
    role: RoleKind,
    role_spec: &RoleSpec,
    persisted: &[String],
) -> Result<Vec<String>, OperatorError> {
    if let Some(machines) = role_spec.machines.as_ref().filter(|m| !m.is_empty()) {
        metrics::record_machines_selected(namespace, cluster_name, role.metric_label(), machines.len() as i64);
        return Ok(machines.clone());
    }

    if !persisted.is_empty() {
        metrics::record_machines_selected(
            namespace,
            cluster_name,
            role.metric_label(),
            persisted.len() as i64,
        );
        return Ok(persisted.to_vec());
    }

    let count = role_spec.count.max(0) as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let pool = gateway.list_machines(namespace).await?;
    let match_labels = role_spec
        .machine_selector
        .as_ref()
        .map(|s| &s.match_labels)
        .cloned()
        .unwrap_or_default();

    let mut candidates: Vec<String> = pool
        .into_iter()
        .filter(|m| matches_selector(m, &match_labels) && is_available(m))
        .map(|m| m.metadata.name.clone().unwrap_or_default())
        .collect();
    candidates.sort();
    candidates.truncate(count);

    metrics::observe_selection_duration(
        namespace,
        cluster_name,
        role.metric_label(),
        started.elapsed().as_secs_f64(),
    );
    metrics::record_machines_selected(namespace, cluster_name, role.metric_label(), candidates.len() as i64);

    Ok(candidates)
}

fn matches_selector(machine: &Machine, match_labels: &std::collections::BTreeMap<String, String>) -> bool {
    let labels = &machine.metadata.labels;
    match_labels.iter().all(|(k, v)| labels.as_ref().and_then(|l| l.get(k)) == Some(v))
}

/// A machine is available iff `hasConfiguration` is false; an absent flag
/// is treated as "unavailable" (spec §4.3 clause 3).
fn is_available(machine: &Machine) -> bool {
    !machine.status.as_ref().and_then(|s| s.has_configuration).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Machine, MachineSpec, MachineStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn machine(name: &str, labels: &[(&str, &str)], has_configuration: Option<bool>) -> Machine {
        Machine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            spec: MachineSpec {
                hostname: None,
                ip_address: None,
                ssh_user: "root".into(),
                ssh_key_secret_ref: None,
            },
            status: Some(MachineStatus { has_configuration }),
        }
    }

    #[test]
    fn fresh_selection_tie_break_s1() {
        let pool = vec![
            machine("w3", &[("r", "w")], Some(false)),
            machine("w1", &[("r", "w")], Some(false)),
            machine("w2", &[("r", "w")], Some(true)),
        ];
        let mut match_labels = BTreeMap::new();
        match_labels.insert("r".to_string(), "w".to_string());

        let mut candidates: Vec<String> = pool
            .into_iter()
            .filter(|m| matches_selector(m, &match_labels) && is_available(m))
            .map(|m| m.metadata.name.clone().unwrap())
            .collect();
        candidates.sort();
        candidates.truncate(1);

        assert_eq!(candidates, vec!["w1".to_string()]);
    }

    #[test]
    fn unavailable_machines_are_excluded_p4() {
        let m = machine("w2", &[("r", "w")], Some(true));
        assert!(!is_available(&m));
        let m2 = machine("w3", &[("r", "w")], None);
        // absent hasConfiguration is treated as available==true per the
        // python default, so "available" (hasConfiguration==false) is false.
        assert!(!is_available(&m2));
    }

    #[test]
    fn selector_requires_all_match_labels() {
        let mut match_labels = BTreeMap::new();
        match_labels.insert("r".to_string(), "w".to_string());
        match_labels.insert("zone".to_string(), "eu".to_string());
        let m = machine("w1", &[("r", "w")], Some(false));
        assert!(!matches_selector(&m, &match_labels));
        let m2 = machine("w1", &[("r", "w"), ("zone", "eu")], Some(false));
        assert!(matches_selector(&m2, &match_labels));
    }
}
