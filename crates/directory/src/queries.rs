//! Lookups built on the directory cache.

use crate::cache::DirectoryCache;
use crate::error::{DirectoryError, DirectoryResult};
use provis_core::config::HostsConfig;
use provis_core::{ExtraHost, Machine};
use serde::Serialize;

/// A machine's published SSH public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicKey {
    pub id: String,
    pub name: String,
    pub pubkey: String,
}

impl DirectoryCache {
    /// Public key of one machine.
    ///
    /// Falls back to asking every datacenter when the snapshot lacks the
    /// machine or its key. `Ok(None)` means the machine exists but has not
    /// published a key.
    pub async fn pubkey_for(&self, zone: &str) -> DirectoryResult<Option<String>> {
        let snapshot = self.get_snapshot().await?;
        if let Some(key) = snapshot.get(zone).and_then(Machine::pubkey) {
            return Ok(Some(key.to_string()));
        }

        tracing::info!(zone, "cache miss for public key");
        match self.point_lookup(zone).await? {
            Some(machine) => Ok(machine.pubkey().map(str::to_string)),
            None => Err(DirectoryError::NotFound(zone.to_string())),
        }
    }

    /// Every machine that has published a key, in id order.
    pub async fn public_keys(&self) -> DirectoryResult<Vec<PublicKey>> {
        let snapshot = self.get_snapshot().await?;
        Ok(snapshot
            .machines()
            .filter_map(|m| {
                m.pubkey().map(|key| PublicKey {
                    id: m.id.clone(),
                    name: m.name.clone(),
                    pubkey: key.to_string(),
                })
            })
            .collect())
    }

    /// The machine listing `ip` among its addresses.
    pub async fn machine_by_ip(&self, ip: &str) -> DirectoryResult<Option<Machine>> {
        let snapshot = self.get_snapshot().await?;
        let found = snapshot.machines().find(|m| m.has_ip(ip)).cloned();
        match &found {
            Some(machine) => tracing::info!(machine = %machine.id, ip, "found machine by IP"),
            None => tracing::info!(ip, "no machine with IP"),
        }
        Ok(found)
    }

    /// `/etc/hosts` lines for `extra` plus every known machine.
    pub async fn render_hosts(
        &self,
        extra: &[ExtraHost],
        config: &HostsConfig,
    ) -> DirectoryResult<Vec<String>> {
        let snapshot = self.get_snapshot().await?;
        Ok(hosts_lines(snapshot.machines(), extra, config))
    }
}

fn hosts_line(ip: &str, names: &str) -> String {
    format!("{ip:<16} {names}")
}

fn is_internal(ip: &str) -> bool {
    ip.starts_with("10.") || ip.starts_with("192.168.")
}

/// Render `/etc/hosts` content, one line per address.
///
/// Private addresses resolve to `name + internal_suffix`; every other
/// address resolves to `name + external_suffix` with the bare name as an
/// alias.
pub fn hosts_lines<'a>(
    machines: impl IntoIterator<Item = &'a Machine>,
    extra: &[ExtraHost],
    config: &HostsConfig,
) -> Vec<String> {
    let mut lines = vec![
        hosts_line("127.0.0.1", "localhost loghost"),
        hosts_line("::1", "localhost"),
        String::new(),
    ];

    if !extra.is_empty() {
        lines.extend(extra.iter().map(|h| hosts_line(&h.ipaddr, &h.hostname)));
        lines.push(String::new());
    }

    for machine in machines {
        for ip in &machine.ips {
            let names = if is_internal(ip) {
                format!("{}{}", machine.name, config.internal_suffix)
            } else {
                format!(
                    "{}{} {}",
                    machine.name, config.external_suffix, machine.name
                )
            };
            lines.push(hosts_line(ip, &names));
        }
    }

    lines
}
