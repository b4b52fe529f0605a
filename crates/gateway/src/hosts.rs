//! `/etc/hosts` content and the extra host entries behind it.

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use provis_core::ExtraHost;
use provis_store::models::EtcHostRow;
use provis_store::repos::HostRepo;
use std::net::IpAddr;

/// Full `/etc/hosts` file: static entries, stored extra hosts, then every
/// machine in the directory.
pub async fn hosts_file(state: &AppState) -> GatewayResult<String> {
    let extra: Vec<ExtraHost> = state
        .store
        .etchosts()
        .await?
        .into_iter()
        .map(ExtraHost::from)
        .collect();
    let lines = state
        .directory
        .render_hosts(&extra, &state.config.hosts)
        .await?;
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// Add or replace the extra host entry for `ipaddr`.
pub async fn add_host(
    state: &AppState,
    ipaddr: &str,
    hostname: &str,
    environ: &str,
) -> GatewayResult<()> {
    if ipaddr.parse::<IpAddr>().is_err() {
        return Err(GatewayError::BadRequest(format!(
            "invalid address: {ipaddr}"
        )));
    }
    if hostname.trim().is_empty() || hostname.contains(char::is_whitespace) {
        return Err(GatewayError::BadRequest(format!(
            "invalid hostname: {hostname:?}"
        )));
    }

    state
        .store
        .upsert_etchost(&EtcHostRow {
            ipaddr: ipaddr.to_string(),
            hostname: hostname.to_string(),
            environ: environ.to_string(),
        })
        .await?;
    tracing::info!(ipaddr, hostname, environ, "extra host stored");
    Ok(())
}
