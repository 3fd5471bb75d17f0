//! Child Manager (spec §4.5): idempotent ensure/update of the per-machine
//! `NixosConfiguration` children, drift detection limited to the four
//! configurable fields, and owner-reference wiring.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::crd::{
    AdditionalFile, KubernetesCluster, Machine, NixosConfiguration, NixosConfigurationSpec, MachineRef,
    Role, SecretReference, ValueType, CLUSTER_LABEL, FULL_INSTALLATION_APPLIED_ANNOTATION, ROLE_LABEL,
};
use crate::error::OperatorError;
use crate::gateway::ApiGateway;
use crate::metrics;

pub fn child_name(cluster: &str, machine: &str) -> String {
    format!("{cluster}-{machine}")
}

/// A placeholder-today, pluggable-tomorrow join token generator (spec §9
/// "Join tokens (open)"). The default simply mirrors the string the
/// upstream Python emits; real token material swaps the implementation
/// without touching any call site.
pub trait TokenProvider: Send + Sync {
    fn token_for(&self, cluster_name: &str) -> String;
}

pub struct PlaceholderTokenProvider;

impl TokenProvider for PlaceholderTokenProvider {
    fn token_for(&self, cluster_name: &str) -> String {
        format!("join-token-for-{cluster_name}")
    }
}

/// Ensures `<cluster>-join-token` exists with a single `token` key.
/// Creation is conditional on [`OperatorError::NotFound`]; reuse is the
/// expected path (spec §4.5 "Join-token secret").
pub async fn ensure_join_token_secret(
    gateway: &ApiGateway,
    namespace: &str,
    cluster_name: &str,
    provider: &dyn TokenProvider,
) -> Result<String, OperatorError> {
    let secret_name = format!("{cluster_name}-join-token");
    match gateway.get_secret(namespace, &secret_name).await {
        Ok(_) => Ok(secret_name),
        Err(OperatorError::NotFound) => {
            let mut data = BTreeMap::new();
            data.insert("token".to_string(), provider.token_for(cluster_name));
            gateway.create_secret(namespace, &secret_name, data).await?;
            Ok(secret_name)
        }
        Err(other) => Err(other),
    }
}

pub struct ChildInputs<'a> {
    pub cluster: &'a KubernetesCluster,
    pub machine_name: &'a str,
    pub role: Role,
    pub join_token_secret: &'a str,
    pub topology_doc: &'a str,
}

/// Builds the desired [`NixosConfigurationSpec`] per spec §4.5 "Creation".
/// `fullInstall` is decided once here, from whether the machine currently
/// carries the full-installation annotation (spec §9 "Full-install
/// annotation": never re-evaluated after creation).
pub fn build_spec(inputs: &ChildInputs<'_>, machine: &Machine) -> NixosConfigurationSpec {
    let has_full_install = machine
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(FULL_INSTALLATION_APPLIED_ANNOTATION));

    let mut additional_files = vec![
        AdditionalFile {
            path: "cluster.nix".to_string(),
            value_type: ValueType::Inline,
            inline: Some(inputs.topology_doc.to_string()),
            secret_ref: None,
        },
        AdditionalFile {
            path: "join-token".to_string(),
            value_type: ValueType::SecretRef,
            inline: None,
            secret_ref: Some(SecretReference { name: inputs.join_token_secret.to_string() }),
        },
    ];
    if let Some(ssh_key) = machine.spec.ssh_key_secret_ref.clone() {
        additional_files.push(AdditionalFile {
            path: "machine-ssh-key".to_string(),
            value_type: ValueType::SecretRef,
            inline: None,
            secret_ref: Some(ssh_key),
        });
    }

    NixosConfigurationSpec {
        git_repo: inputs.cluster.spec.git_repo.clone(),
        ref_: inputs.cluster.spec.ref_.clone(),
        configuration_subdir: Some(inputs.cluster.spec.configuration_subdir.clone().unwrap_or_default()),
        credentials_ref: inputs.cluster.spec.credentials_ref.clone(),
        flake: format!("#{}", inputs.machine_name),
        on_remove_flake: "#minimal".to_string(),
        machine_ref: MachineRef { name: inputs.machine_name.to_string() },
        full_install: !has_full_install,
        additional_files,
    }
}

pub fn owner_reference(cluster: &KubernetesCluster) -> Result<OwnerReference, OperatorError> {
    let uid = cluster
        .metadata
        .uid
        .clone()
        .ok_or_else(|| OperatorError::MissingUid(cluster.metadata.name.clone().unwrap_or_default()))?;
    Ok(OwnerReference {
        api_version: "nico.homystack.com/v1alpha1".to_string(),
        kind: "KubernetesCluster".to_string(),
        name: cluster.metadata.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    })
}

/// The three-state merge-patch DSL from spec §9: a field is either left
/// alone, set to a new value, or explicitly removed (serialized as JSON
/// `null`). This is what lets drift repair emit a merge-patch body whose
/// keys are exactly the changed subset (spec P7, S3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldPatch<T> {
    Unchanged,
    Set(T),
    Remove,
}

fn diff_field<T: PartialEq + Clone>(parent: Option<&T>, existing: Option<&T>) -> FieldPatch<T> {
    match (parent, existing) {
        (None, None) => FieldPatch::Unchanged,
        (Some(p), Some(e)) if p == e => FieldPatch::Unchanged,
        (Some(p), _) => FieldPatch::Set(p.clone()),
        (None, Some(_)) => FieldPatch::Remove,
    }
}

fn diff_required<T: PartialEq + Clone>(parent: &T, existing: &T) -> FieldPatch<T> {
    if parent == existing {
        FieldPatch::Unchanged
    } else {
        FieldPatch::Set(parent.clone())
    }
}

/// Computes the drift-repair patch for the four configurable fields
/// (spec §4.5 "Drift repair"). `flake`, `machineRef`, `additionalFiles`,
/// `fullInstall` are deliberately excluded — they are write-once.
pub fn compute_spec_patch(
    cluster: &KubernetesCluster,
    existing: &NixosConfigurationSpec,
) -> serde_json::Map<String, serde_json::Value> {
    let git_repo = diff_required(&cluster.spec.git_repo, &existing.git_repo);
    let ref_ = diff_field(cluster.spec.ref_.as_ref(), existing.ref_.as_ref());
    // configurationSubdir always defaults to "" rather than being absent
    // (spec §4.5 "default `\"\"`"), so unlike ref/credentialsRef it is
    // never removed — only ever set to its (possibly empty) new value.
    let parent_subdir = cluster.spec.configuration_subdir.clone().unwrap_or_default();
    let existing_subdir = existing.configuration_subdir.clone().unwrap_or_default();
    let subdir = diff_required(&parent_subdir, &existing_subdir);
    let creds = diff_field(cluster.spec.credentials_ref.as_ref(), existing.credentials_ref.as_ref());

    let mut patch = serde_json::Map::new();
    insert_patch(&mut patch, "gitRepo", git_repo);
    insert_patch(&mut patch, "ref", ref_);
    insert_patch(&mut patch, "configurationSubdir", subdir);
    insert_patch(&mut patch, "credentialsRef", creds);
    patch
}

fn insert_patch<T: serde::Serialize>(
    patch: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    field: FieldPatch<T>,
) {
    match field {
        FieldPatch::Unchanged => {}
        FieldPatch::Set(v) => {
            patch.insert(key.to_string(), serde_json::to_value(v).expect("serialize patch field"));
        }
        FieldPatch::Remove => {
            patch.insert(key.to_string(), serde_json::Value::Null);
        }
    }
}

/// Get-or-create plus drift-repair for a single machine's child (spec
/// §4.5). Returns the child's name on success.
pub async fn ensure_child(
    gateway: &ApiGateway,
    namespace: &str,
    inputs: &ChildInputs<'_>,
) -> Result<(String, bool), OperatorError> {
    let cluster_name = inputs.cluster.metadata.name.clone().unwrap_or_default();
    let name = child_name(&cluster_name, inputs.machine_name);

    match gateway.get_config(namespace, &name).await {
        Ok(existing) => {
            let patch = compute_spec_patch(inputs.cluster, &existing.spec);
            if !patch.is_empty() {
                gateway
                    .patch_config_spec(namespace, &name, serde_json::Value::Object(patch))
                    .await?;
            }
            Ok((name, false))
        }
        Err(OperatorError::NotFound) => {
            let machine = gateway.get_machine(namespace, inputs.machine_name).await?;
            let spec = build_spec(inputs, &machine);
            let owner = owner_reference(inputs.cluster)?;

            let mut labels = BTreeMap::new();
            labels.insert(CLUSTER_LABEL.to_string(), cluster_name.clone());
            labels.insert(ROLE_LABEL.to_string(), inputs.role.as_label_value().to_string());

            let config = NixosConfiguration {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels),
                    owner_references: Some(vec![owner]),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            gateway.create_config(namespace, &config).await?;
            metrics::record_config_created(namespace, &cluster_name, inputs.role.as_label_value());
            Ok((name, true))
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KubernetesClusterSpec, RoleSpec, SecretReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as K8sObjectMeta;

    fn base_cluster(ref_: Option<&str>, subdir: Option<&str>, creds: Option<&str>) -> KubernetesCluster {
        KubernetesCluster {
            metadata: K8sObjectMeta {
                name: Some("demo".into()),
                uid: Some("abc-123".into()),
                ..Default::default()
            },
            spec: KubernetesClusterSpec {
                git_repo: "git@example.com/repo.git".into(),
                ref_: ref_.map(String::from),
                configuration_subdir: subdir.map(String::from),
                credentials_ref: creds.map(|n| SecretReference { name: n.to_string() }),
                control_plane: RoleSpec::default(),
                data_plane: RoleSpec::default(),
            },
            status: None,
        }
    }

    fn base_existing_spec(ref_: Option<&str>, subdir: Option<&str>) -> NixosConfigurationSpec {
        NixosConfigurationSpec {
            git_repo: "git@example.com/repo.git".into(),
            ref_: ref_.map(String::from),
            configuration_subdir: subdir.map(String::from),
            credentials_ref: None,
            flake: "#cp-1".into(),
            on_remove_flake: "#minimal".into(),
            machine_ref: MachineRef { name: "cp-1".into() },
            full_install: true,
            additional_files: vec![],
        }
    }

    #[test]
    fn no_changes_yields_empty_patch_p6() {
        let cluster = base_cluster(Some("v1"), Some("clusters/demo"), None);
        let existing = base_existing_spec(Some("v1"), Some("clusters/demo"));
        let patch = compute_spec_patch(&cluster, &existing);
        assert!(patch.is_empty());
    }

    #[test]
    fn ref_removal_emits_only_ref_null_s3() {
        let cluster = base_cluster(None, Some("clusters/demo"), None);
        let existing = base_existing_spec(Some("v1"), Some("clusters/demo"));
        let patch = compute_spec_patch(&cluster, &existing);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("ref"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn patch_scope_is_exactly_the_four_fields_p7() {
        let cluster = base_cluster(Some("v2"), Some("new-subdir"), Some("creds-secret"));
        let existing = base_existing_spec(Some("v1"), Some("clusters/demo"));
        let patch = compute_spec_patch(&cluster, &existing);
        let mut keys: Vec<&String> = patch.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["configurationSubdir", "credentialsRef", "ref"]);
        // gitRepo unchanged between cluster and existing in this case.
        assert!(!patch.contains_key("gitRepo"));
    }

    #[test]
    fn absent_parent_subdir_against_defaulted_existing_is_not_a_removal() {
        let cluster = base_cluster(Some("v1"), None, None);
        let existing = base_existing_spec(Some("v1"), Some(""));
        let patch = compute_spec_patch(&cluster, &existing);
        assert!(patch.is_empty());
    }

    #[test]
    fn git_repo_change_is_detected() {
        let mut cluster = base_cluster(Some("v1"), Some("clusters/demo"), None);
        cluster.spec.git_repo = "git@example.com/other.git".into();
        let existing = base_existing_spec(Some("v1"), Some("clusters/demo"));
        let patch = compute_spec_patch(&cluster, &existing);
        assert_eq!(patch.get("gitRepo"), Some(&serde_json::Value::String("git@example.com/other.git".into())));
    }
}
