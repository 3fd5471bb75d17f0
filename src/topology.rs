//! Config Renderer (spec §4.4): produces the textual cluster topology
//! document embedded into every child configuration as `cluster.nix`.

/// A node's resolved name/IP pair, ready for rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub ip: String,
}

impl NodeInfo {
    /// IP resolution order: `ipAddress` if non-empty, else `hostname`, else
    /// the literal `"unknown"` (spec §4.4).
    pub fn resolve(name: &str, ip_address: Option<&str>, hostname: Option<&str>) -> Self {
        let ip = ip_address
            .filter(|s| !s.is_empty())
            .or(hostname.filter(|s| !s.is_empty()))
            .unwrap_or("unknown")
            .to_string();
        NodeInfo { name: name.to_string(), ip }
    }
}

fn render_node_list(nodes: &[NodeInfo]) -> String {
    if nodes.is_empty() {
        return "[\n  ]".to_string();
    }
    let entries = nodes
        .iter()
        .map(|n| format!("    {{ name = \"{}\"; ip = \"{}\"; }}", n.name, n.ip))
        .collect::<Vec<_>>()
        .join("\n");
    format!("[\n{entries}\n  ]")
}

/// Renders the deterministic Nix attribute-set document described in spec
/// §4.4/§6.3. Pure: identical inputs always produce byte-identical output.
pub fn render_topology(cluster_name: &str, control_plane: &[NodeInfo], workers: &[NodeInfo]) -> String {
    let control_plane_nix = render_node_list(control_plane);
    let workers_nix = render_node_list(workers);
    format!(
        "\n{{ config, pkgs, ... }}:\n{{\n  # Cluster configuration generated by nico-operator\n  # Includes IP addresses for HAProxy configuration at build time\n  cluster = {{\n    name = \"{cluster_name}\";\n    controlPlane = {control_plane_nix};\n    workers = {workers_nix};\n  }};\n}}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_ip_address_first() {
        let n = NodeInfo::resolve("cp-1", Some("10.0.0.1"), Some("cp-1.local"));
        assert_eq!(n.ip, "10.0.0.1");
    }

    #[test]
    fn falls_back_to_hostname() {
        let n = NodeInfo::resolve("cp-1", None, Some("cp-1.local"));
        assert_eq!(n.ip, "cp-1.local");
    }

    #[test]
    fn falls_back_to_unknown_when_both_empty() {
        let n = NodeInfo::resolve("cp-1", Some(""), None);
        assert_eq!(n.ip, "unknown");
    }

    #[test]
    fn render_is_deterministic() {
        let cp = vec![NodeInfo { name: "cp-1".into(), ip: "10.0.0.1".into() }];
        let workers = vec![NodeInfo { name: "w-1".into(), ip: "10.0.0.2".into() }];
        let a = render_topology("demo", &cp, &workers);
        let b = render_topology("demo", &cp, &workers);
        assert_eq!(a, b);
        assert!(a.contains("name = \"demo\""));
        assert!(a.contains("name = \"cp-1\"; ip = \"10.0.0.1\""));
        assert!(a.contains("name = \"w-1\"; ip = \"10.0.0.2\""));
    }

    #[test]
    fn render_handles_empty_worker_list() {
        let cp = vec![NodeInfo { name: "cp-1".into(), ip: "10.0.0.1".into() }];
        let doc = render_topology("demo", &cp, &[]);
        assert!(doc.contains("workers = [\n  ]"));
    }
}
