use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};

use crate::crd::{KubernetesCluster, KubernetesClusterStatus, Machine, NixosConfiguration};
use crate::error::OperatorError;

/// Typed wrapper over the handful of cluster-API operations the core
/// needs (spec §4.1). Every method maps 404 to [`OperatorError::NotFound`]
/// and propagates anything else with its `kube::Error` intact.
#[derive(Clone)]
pub struct ApiGateway {
    client: Client,
}

impl ApiGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn configs(&self, namespace: &str) -> Api<NixosConfiguration> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn clusters(&self, namespace: &str) -> Api<KubernetesCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get_machine(&self, namespace: &str, name: &str) -> Result<Machine, OperatorError> {
        self.machines(namespace)
            .get(name)
            .await
            .map_err(OperatorError::from_kube)
    }

    pub async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, OperatorError> {
        let list = self
            .machines(namespace)
            .list(&Default::default())
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(list.items)
    }

    pub async fn get_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<NixosConfiguration, OperatorError> {
        self.configs(namespace)
            .get(name)
            .await
            .map_err(OperatorError::from_kube)
    }

    /// Creates the child with its owner reference already attached to the
    /// spec object passed in (spec §3 I3: no child is created without one).
    pub async fn create_config(
        &self,
        namespace: &str,
        config: &NixosConfiguration,
    ) -> Result<NixosConfiguration, OperatorError> {
        self.configs(namespace)
            .create(&PostParams::default(), config)
            .await
            .map_err(OperatorError::from_kube)
    }

    /// Applies `merge_patch` as a JSON Merge Patch (`application/merge-patch+json`).
    /// Strategic-merge or server-side-apply semantics are insufficient here
    /// because setting a field to explicit `null` must remove it (spec
    /// §4.1, §9).
    pub async fn patch_config_spec(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: serde_json::Value,
    ) -> Result<(), OperatorError> {
        let body = serde_json::json!({ "spec": merge_patch });
        self.configs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    pub async fn delete_config(&self, namespace: &str, name: &str) -> Result<(), OperatorError> {
        self.configs(namespace)
            .delete(name, &Default::default())
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, OperatorError> {
        self.secrets(namespace)
            .get(name)
            .await
            .map_err(OperatorError::from_kube)
    }

    /// Returns the decoded string values of a secret's `data` map.
    pub async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, OperatorError> {
        let secret = self.get_secret(namespace, name).await?;
        let Some(data) = secret.data else {
            return Ok(BTreeMap::new());
        };
        Ok(data
            .into_iter()
            .map(|(k, ByteString(bytes))| (k, String::from_utf8_lossy(&bytes).into_owned()))
            .collect())
    }

    pub async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), OperatorError> {
        let secret = Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            string_data: Some(data),
            ..Default::default()
        };
        self.secrets(namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OperatorError> {
        self.secrets(namespace)
            .delete(name, &Default::default())
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    pub async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KubernetesClusterStatus,
    ) -> Result<(), OperatorError> {
        let body = serde_json::json!({ "status": status });
        self.clusters(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    pub async fn patch_cluster_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), OperatorError> {
        let body = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.clusters(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(OperatorError::from_kube)?;
        Ok(())
    }

    /// Lists clusters in `namespace`, or across every namespace when it is
    /// empty (used by the readiness monitor, which may be configured to
    /// watch cluster-wide).
    pub async fn list_clusters(&self, namespace: &str) -> Result<Vec<KubernetesCluster>, OperatorError> {
        let api: Api<KubernetesCluster> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            self.clusters(namespace)
        };
        let list = api.list(&Default::default()).await.map_err(OperatorError::from_kube)?;
        Ok(list.items)
    }
}
