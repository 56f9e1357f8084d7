use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    /// How long a resolved schema snapshot stays fresh.
    pub schema_ttl: Duration,
    /// Ceiling on enabled rules per tenant (quota guardrail).
    pub tenant_rule_quota: usize,
    /// Ceiling on create+update+disable entries in a single plan.
    pub blast_radius_max: usize,
    /// Traffic percentages used when an apply opts into a canary rollout.
    pub canary_stages: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    ruleforge_listen_addr: Option<String>,
    #[serde(default)]
    ruleforge_listen_host: Option<String>,
    #[serde(default)]
    ruleforge_listen_port: Option<u16>,
    #[serde(default)]
    ruleforge_api_key: Option<String>,
    #[serde(default = "default_schema_ttl_secs")]
    ruleforge_schema_ttl_secs: u64,
    #[serde(default = "default_tenant_rule_quota")]
    ruleforge_tenant_rule_quota: usize,
    #[serde(default = "default_blast_radius_max")]
    ruleforge_blast_radius_max: usize,
    #[serde(default)]
    ruleforge_canary_stages: Option<String>,
}

const fn default_schema_ttl_secs() -> u64 {
    60
}

const fn default_tenant_rule_quota() -> usize {
    500
}

const fn default_blast_radius_max() -> usize {
    50
}

fn default_canary_stages() -> Vec<u8> {
    vec![5, 25, 50, 100]
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse RULEFORGE_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.ruleforge_listen_addr,
            raw.ruleforge_listen_host,
            raw.ruleforge_listen_port,
        )?;

        let canary_stages = match raw.ruleforge_canary_stages {
            Some(csv) => parse_stages(&csv)?,
            None => default_canary_stages(),
        };

        Ok(Self {
            listen_addr,
            api_key: raw.ruleforge_api_key,
            schema_ttl: Duration::from_secs(raw.ruleforge_schema_ttl_secs.max(1)),
            tenant_rule_quota: raw.ruleforge_tenant_rule_quota.max(1),
            blast_radius_max: raw.ruleforge_blast_radius_max.max(1),
            canary_stages,
        })
    }

    /// A config suitable for embedding in tests, no environment required.
    pub fn embedded() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key: None,
            schema_ttl: Duration::from_secs(default_schema_ttl_secs()),
            tenant_rule_quota: default_tenant_rule_quota(),
            blast_radius_max: default_blast_radius_max(),
            canary_stages: default_canary_stages(),
        }
    }
}

fn parse_stages(csv: &str) -> Result<Vec<u8>> {
    let stages = csv
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u8>()
                .with_context(|| format!("invalid canary stage '{part}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    if stages.is_empty() {
        anyhow::bail!("RULEFORGE_CANARY_STAGES must name at least one stage");
    }
    if stages.windows(2).any(|pair| pair[0] >= pair[1]) || stages.iter().any(|stage| *stage > 100) {
        anyhow::bail!("canary stages must be strictly increasing percentages up to 100");
    }

    Ok(stages)
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid RULEFORGE_LISTEN_ADDR value")?
            .next()
            .context("RULEFORGE_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid RULEFORGE listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
