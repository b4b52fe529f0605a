//! Machine records reported by the datacenter APIs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One machine (zone or VM) as listed by a datacenter.
///
/// The identifier is unique across every datacenter; two datacenters
/// reporting the same id is treated as a conflict by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub metadata: MachineMetadata,
}

/// Customer metadata attached to a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineMetadata {
    /// SSH public key the machine signs its requests with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    /// Alias the machine registers itself under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Any other metadata keys, preserved as-is.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl Machine {
    /// The machine's public key, if it has published one.
    pub fn pubkey(&self) -> Option<&str> {
        self.metadata.pubkey.as_deref().filter(|k| !k.is_empty())
    }

    /// Whether the machine lists `ip` among its addresses.
    pub fn has_ip(&self, ip: &str) -> bool {
        self.ips.iter().any(|candidate| candidate == ip)
    }
}

/// Additional static `/etc/hosts` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraHost {
    pub ipaddr: String,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_deserialize_ignores_unknown_fields() {
        let json = r#"{
            "id": "b6f1c2aa-1111-2222-3333-444455556666",
            "name": "web0",
            "state": "running",
            "memory": 1024,
            "ips": ["10.1.2.3", "165.225.1.2"],
            "metadata": {"pubkey": "ssh-ed25519 AAAA", "alias": "web0", "role": "web"}
        }"#;
        let machine: Machine = serde_json::from_str(json).unwrap();
        assert_eq!(machine.name, "web0");
        assert_eq!(machine.pubkey(), Some("ssh-ed25519 AAAA"));
        assert_eq!(machine.metadata.alias.as_deref(), Some("web0"));
        assert_eq!(
            machine.metadata.other.get("role"),
            Some(&serde_json::json!("web"))
        );
        assert!(machine.has_ip("165.225.1.2"));
        assert!(!machine.has_ip("10.1.2.4"));
    }

    #[test]
    fn test_machine_without_metadata() {
        let json = r#"{"id": "x", "name": "bare"}"#;
        let machine: Machine = serde_json::from_str(json).unwrap();
        assert!(machine.ips.is_empty());
        assert_eq!(machine.pubkey(), None);
    }

    #[test]
    fn test_empty_pubkey_is_absent() {
        let machine = Machine {
            id: "x".to_string(),
            name: "x".to_string(),
            ips: vec![],
            metadata: MachineMetadata {
                pubkey: Some(String::new()),
                ..Default::default()
            },
        };
        assert_eq!(machine.pubkey(), None);
    }
}
