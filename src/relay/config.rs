use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::security::vault_client::VaultSettings;

const DEFAULT_API_BASE_URL: &str = "https://api.pagerduty.com";
const DEFAULT_IDENTITY_URL: &str = "https://identity.pagerduty.com/oauth/token";
const DEFAULT_OAUTH_SCOPE: &str = "as_account-us.railing-ai incidents.read incidents.write";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_VAULT_PREFIX: &str = "secret/data";

const REQUIRED: [&str; 5] = [
    "SECRET_NAME",
    "PD_SERVICE_ID",
    "PD_FROM_EMAIL",
    "PD_ESCALATION_POLICY_ID",
    "AUDIT_TABLE_NAME",
];

/// Relay configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub secret_name: String,
    pub service_id: String,
    pub from_email: String,
    pub escalation_policy_id: String,
    pub audit_table_name: String,
    pub audit_log_dir: PathBuf,
    pub api_base_url: String,
    pub identity_url: String,
    pub oauth_scope: String,
    pub http_timeout: Duration,
    /// Present only when both `VAULT_ADDRESS` and `VAULT_TOKEN` are set.
    pub vault: Option<VaultSettings>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<&str> = REQUIRED.iter().copied().filter(|k| get(*k).is_none()).collect();
        if !missing.is_empty() {
            bail!("missing required configuration: {}", missing.join(", "));
        }
        let required = |key: &str| get(key).unwrap_or_default();

        let http_timeout = match get("HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .with_context(|| format!("parsing HTTP_TIMEOUT_SECS={raw}"))?;
                if secs == 0 {
                    bail!("HTTP_TIMEOUT_SECS must be greater than zero");
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let vault = match (get("VAULT_ADDRESS"), get("VAULT_TOKEN")) {
            (Some(base_url), Some(token)) => Some(VaultSettings {
                base_url,
                token,
                prefix: get("VAULT_SECRET_PREFIX").unwrap_or_else(|| DEFAULT_VAULT_PREFIX.to_string()),
            }),
            (None, None) => None,
            _ => bail!("VAULT_ADDRESS and VAULT_TOKEN must be set together"),
        };

        Ok(Config {
            secret_name: required("SECRET_NAME"),
            service_id: required("PD_SERVICE_ID"),
            from_email: required("PD_FROM_EMAIL"),
            escalation_policy_id: required("PD_ESCALATION_POLICY_ID"),
            audit_table_name: required("AUDIT_TABLE_NAME"),
            audit_log_dir: get("AUDIT_LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            api_base_url: get("PD_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            identity_url: get("PD_IDENTITY_URL").unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string()),
            oauth_scope: get("PD_OAUTH_SCOPE").unwrap_or_else(|| DEFAULT_OAUTH_SCOPE.to_string()),
            http_timeout,
            vault,
        })
    }
}
