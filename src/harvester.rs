//! Kubeconfig Harvester (spec §4.8): SSH into the first ready
//! control-plane node and pull a kubeconfig out of one of the standard
//! locations, falling back to `kubectl config view --raw`.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use openssh::{KnownHosts, SessionBuilder};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::gateway::ApiGateway;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Standard kubeconfig locations across distributions, tried in order
/// (spec §4.8.3).
const KUBECONFIG_PATHS: &[&str] = &[
    "/etc/rancher/k3s/k3s.yaml",
    "/var/lib/k0s/pki/admin.conf",
    "/etc/kubernetes/admin.conf",
    "/root/.kube/config",
    "/etc/kubernetes/kubeconfig",
];

/// Attempts to extract a kubeconfig from the first entry of
/// `ready_control_plane_names`. Returns `None` on any exhaustion or
/// unrecoverable condition; callers treat that as non-fatal (spec §7).
pub async fn harvest(
    gateway: &ApiGateway,
    namespace: &str,
    ready_control_plane_names: &[String],
) -> Option<String> {
    let first = ready_control_plane_names.first()?;
    let machine = gateway.get_machine(namespace, first).await.ok()?;

    let host = machine
        .spec
        .ip_address
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| machine.spec.hostname.clone().filter(|s| !s.is_empty()))?;
    let ssh_user = machine.spec.ssh_user.clone();

    let key_file = match &machine.spec.ssh_key_secret_ref {
        Some(secret_ref) => match materialize_ssh_key(gateway, namespace, &secret_ref.name).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(machine = first, error = %e, "failed to materialize ssh key, continuing without it");
                None
            }
        },
        None => None,
    };

    let destination = format!("{ssh_user}@{host}");
    let mut builder = SessionBuilder::default();
    // Host-key verification is disabled for bootstrap (spec §9, known limitation).
    builder.known_hosts_check(KnownHosts::Accept).connect_timeout(SSH_CONNECT_TIMEOUT);
    if let Some(key_file) = &key_file {
        builder.keyfile(key_file.path());
    }

    let session = match builder.connect(&destination).await {
        Ok(s) => s,
        Err(e) => {
            warn!(machine = first, error = %e, "ssh connect failed during kubeconfig harvest");
            return None;
        }
    };

    for path in KUBECONFIG_PATHS {
        if let Some(content) = try_cat(&session, path).await {
            return Some(normalize(content));
        }
    }

    if let Some(content) = try_kubectl_view(&session).await {
        return Some(normalize(content));
    }

    debug!(machine = first, "exhausted all kubeconfig locations");
    None
}

async fn try_cat(session: &openssh::Session, path: &str) -> Option<String> {
    let attempt = tokio::time::timeout(SSH_STEP_TIMEOUT, session.command("cat").arg(path).output());
    match attempt.await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            (!stdout.trim().is_empty()).then_some(stdout)
        }
        _ => None,
    }
}

async fn try_kubectl_view(session: &openssh::Session) -> Option<String> {
    let attempt = tokio::time::timeout(
        SSH_STEP_TIMEOUT,
        session.command("kubectl").args(["config", "view", "--raw"]).output(),
    );
    match attempt.await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            (!stdout.trim().is_empty()).then_some(stdout)
        }
        _ => None,
    }
}

/// Best-effort normalization via a structured round-trip, in preparation
/// for future VIP substitution (spec §4.8.5). Falls back to the raw text
/// on any parse failure.
fn normalize(raw: String) -> String {
    match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
        Ok(value) => serde_yaml::to_string(&value).unwrap_or(raw),
        Err(_) => raw,
    }
}

async fn materialize_ssh_key(
    gateway: &ApiGateway,
    namespace: &str,
    secret_name: &str,
) -> anyhow::Result<NamedTempFile> {
    let data = gateway.get_secret_data(namespace, secret_name).await?;
    let key = data
        .get("ssh-privatekey")
        .ok_or_else(|| anyhow::anyhow!("secret {secret_name} has no ssh-privatekey entry"))?;

    let mut file = NamedTempFile::new()?;
    {
        use std::io::Write;
        file.write_all(key.as_bytes())?;
    }
    file.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_passes_through_unparseable_text() {
        let raw = "not: [valid: yaml".to_string();
        assert_eq!(normalize(raw.clone()), raw);
    }

    #[test]
    fn normalize_round_trips_valid_yaml() {
        let raw = "apiVersion: v1\nkind: Config\n".to_string();
        let normalized = normalize(raw);
        assert!(normalized.contains("apiVersion"));
    }
}
