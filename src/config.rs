//! Operator process boundary (spec §6.4): CLI flags and kubeconfig
//! discovery. `kube::Client::try_default()` already implements the
//! documented KUBECONFIG-then-in-cluster resolution order; this module is
//! a thin, testable seam around it with the startup diagnostics the
//! original implementation logs.

use clap::Parser;
use kube::Client;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nico-operator", about = "Provisions and maintains bare-metal/VM Kubernetes clusters")]
pub struct Cli {
    /// Print the KubernetesCluster/Machine/NixosConfiguration CRDs as YAML and exit.
    #[arg(long, env = "PRINT_CRD")]
    pub print_crds: bool,

    /// Address the Prometheus metrics endpoint binds to.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// Namespace the readiness monitor enumerates clusters in; empty means all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,
}

/// Resolves a `kube::Client`, logging which discovery path was attempted
/// so a misconfigured operator fails loudly (spec §6.4: "Exits non-zero
/// if neither path yields a usable client").
pub async fn load_client() -> anyhow::Result<Client> {
    let kubeconfig = std::env::var("KUBECONFIG").unwrap_or_else(|_| "~/.kube/config".to_string());
    let in_cluster = std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
        && std::env::var("KUBERNETES_SERVICE_PORT").is_ok();

    info!(kubeconfig = %kubeconfig, in_cluster_env_present = in_cluster, "resolving kubernetes client");

    Client::try_default().await.map_err(|e| {
        warn!(error = %e, "failed to resolve kubernetes client via kubeconfig or in-cluster credentials");
        anyhow::anyhow!("no usable kubernetes client: neither {kubeconfig} nor in-cluster credentials worked: {e}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_are_sane() {
        let cli = Cli::parse_from(["nico-operator"]);
        assert!(!cli.print_crds);
        assert_eq!(cli.metrics_addr, "0.0.0.0:8080");
        assert_eq!(cli.watch_namespace, "");
    }

    #[test]
    fn print_crds_flag_parses() {
        let cli = Cli::parse_from(["nico-operator", "--print-crds"]);
        assert!(cli.print_crds);
    }
}
