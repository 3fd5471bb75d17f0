use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation that marks a [`Machine`] as already fully installed; its mere
/// presence (value is ignored) suppresses `fullInstall` on the next child
/// this core creates for that machine.
pub const FULL_INSTALLATION_APPLIED_ANNOTATION: &str = "nico.homystack.com/fullInstallationApplied";

pub const CLUSTER_LABEL: &str = "nico.homystack.com/cluster";
pub const ROLE_LABEL: &str = "nico.homystack.com/role";
pub const FINALIZER: &str = "nico.homystack.com/finalizer";

/// Either "control-plane" or "worker", as carried on the `role` label of a
/// child [`NixosConfiguration`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "control-plane")]
    ControlPlane,
    #[serde(rename = "worker")]
    Worker,
}

impl Role {
    pub fn as_label_value(&self) -> &'static str {
        match self {
            Role::ControlPlane => "control-plane",
            Role::Worker => "worker",
        }
    }

    /// Absent or unrecognized role labels default to worker (spec §4.7).
    pub fn from_label(value: Option<&str>) -> Role {
        match value {
            Some("control-plane") => Role::ControlPlane,
            _ => Role::Worker,
        }
    }
}

/// `phase` values a [`KubernetesCluster`] can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterPhase {
    Provisioning,
    ControlPlaneReady,
    Ready,
    Deleting,
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::ControlPlaneReady => "ControlPlaneReady",
            ClusterPhase::Ready => "Ready",
            ClusterPhase::Deleting => "Deleting",
            ClusterPhase::Failed => "Failed",
        })
    }
}

/// A bare-metal/VM Kubernetes cluster assembled out of [`Machine`] resources.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nico.homystack.com",
    version = "v1alpha1",
    kind = "KubernetesCluster",
    plural = "kubernetesclusters",
    namespaced
)]
#[kube(status = "KubernetesClusterStatus")]
pub struct KubernetesClusterSpec {
    pub git_repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretReference>,
    pub control_plane: RoleSpec,
    pub data_plane: RoleSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct RoleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_selector: Option<MachineSelector>,
    #[serde(default)]
    pub count: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MachineSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct KubernetesClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ready: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_ready: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<String>,
    #[serde(default)]
    pub applied_machines: BTreeMap<String, String>,
    #[serde(default)]
    pub selected_control_plane_machines: Vec<String>,
    #[serde(default)]
    pub selected_data_plane_machines: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// A node available to be claimed into a cluster. Owned and written by a
/// separate controller; this core only ever reads it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nico.homystack.com",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    namespaced
)]
#[kube(status = "MachineStatus")]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_secret_ref: Option<SecretReference>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_configuration: Option<bool>,
}

/// The per-machine declarative input consumed by the downstream NixOS
/// configuration controller.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nico.homystack.com",
    version = "v1alpha1",
    kind = "NixosConfiguration",
    plural = "nixosconfigurations",
    namespaced
)]
#[kube(status = "NixosConfigurationStatus")]
pub struct NixosConfigurationSpec {
    pub git_repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretReference>,
    pub flake: String,
    pub on_remove_flake: String,
    pub machine_ref: MachineRef,
    pub full_install: bool,
    #[serde(default)]
    pub additional_files: Vec<AdditionalFile>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct MachineRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ValueType {
    Inline,
    SecretRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct AdditionalFile {
    pub path: String,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct NixosConfigurationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_commit: Option<String>,
}

/// Emits all three CRDs as YAML, with schemars' `format` annotations
/// stripped (some validating admission setups choke on unsupported
/// `format` values in structural schemas).
pub fn print_crds_without_formats() -> anyhow::Result<()> {
    for crd in [
        serde_json::to_value(&KubernetesCluster::crd())?,
        serde_json::to_value(&Machine::crd())?,
        serde_json::to_value(&NixosConfiguration::crd())?,
    ] {
        let mut v = crd;
        strip_format_keys(&mut v);
        println!("---");
        println!("{}", serde_yaml::to_string(&v)?);
    }
    Ok(())
}

fn strip_format_keys(v: &mut serde_json::Value) {
    use serde_json::Value::*;
    match v {
        Object(map) => {
            map.remove("format");
            for val in map.values_mut() {
                strip_format_keys(val);
            }
        }
        Array(arr) => {
            for val in arr {
                strip_format_keys(val);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_label_defaults_to_worker() {
        assert_eq!(Role::from_label(None), Role::Worker);
        assert_eq!(Role::from_label(Some("bogus")), Role::Worker);
        assert_eq!(Role::from_label(Some("control-plane")), Role::ControlPlane);
    }

    #[test]
    fn phase_display_matches_status_strings() {
        assert_eq!(ClusterPhase::ControlPlaneReady.to_string(), "ControlPlaneReady");
        assert_eq!(ClusterPhase::Ready.to_string(), "Ready");
    }
}
