//! Configuration
//!
//! YAML configuration file with CLI and `LABELGATE_*` environment overrides.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cloudflare::CLOUDFLARE_API;

const DEFAULT_CONFIG_FILE: &str = "labelgate.yaml";

/// labelgate - reconcile container declarations with Cloudflare
#[derive(Parser, Debug, Default)]
#[command(name = "labelgate", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "LABELGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Default Cloudflare API token
    #[arg(long, env = "LABELGATE_CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Account ID of the default tunnel
    #[arg(long, env = "LABELGATE_CLOUDFLARE_ACCOUNT_ID")]
    pub account_id: Option<String>,

    /// ID of the default tunnel
    #[arg(long, env = "LABELGATE_CLOUDFLARE_TUNNEL_ID")]
    pub tunnel_id: Option<String>,

    /// Full resync interval in seconds
    #[arg(long, env = "LABELGATE_SYNC_INTERVAL")]
    pub sync_interval: Option<u64>,

    /// Seconds before an orphaned, cleanup-enabled resource is deleted
    #[arg(long, env = "LABELGATE_REMOVE_DELAY")]
    pub remove_delay: Option<u64>,

    /// Seconds before an orphaned, preserved resource leaves the ledger (0 = never)
    #[arg(long, env = "LABELGATE_ORPHAN_TTL")]
    pub orphan_ttl: Option<u64>,

    /// Container declaration file
    #[arg(long, env = "LABELGATE_SOURCE")]
    pub source: Option<PathBuf>,

    /// Ledger snapshot file
    #[arg(long, env = "LABELGATE_LEDGER")]
    pub ledger: Option<PathBuf>,

    /// Health API listen address
    #[arg(long, env = "LABELGATE_API_ADDRESS")]
    pub api_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LABELGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, env = "LABELGATE_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Skip token verification at startup
    #[arg(long, default_value = "false")]
    pub skip_credential_validation: bool,
}

// ============================================================
// File Configuration
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cloudflare: CloudflareConfig,
    pub sync: SyncConfig,
    pub source: SourceConfig,
    pub ledger: LedgerConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
    pub public_ip: PublicIpConfig,
    pub skip_credential_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    /// Token of the `default` credential
    pub api_token: Option<String>,
    /// Account and tunnel of the `default` tunnel
    pub account_id: Option<String>,
    pub tunnel_id: Option<String>,
    pub credentials: BTreeMap<String, CredentialConfig>,
    pub tunnels: BTreeMap<String, TunnelConfig>,
    pub api_base_url: String,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            account_id: None,
            tunnel_id: None,
            credentials: BTreeMap::new(),
            tunnels: BTreeMap::new(),
            api_base_url: CLOUDFLARE_API.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub api_token: String,
    /// Zones this credential manages; `*.example.com` matches the base too
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub account_id: String,
    pub tunnel_id: String,
    /// Credential used for this tunnel's API calls, default when unset
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub remove_delay_secs: u64,
    /// 0 disables the orphan TTL
    pub orphan_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            remove_delay_secs: 1800,
            orphan_ttl_secs: 0,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn remove_delay(&self) -> Duration {
        Duration::from_secs(self.remove_delay_secs)
    }

    pub fn orphan_ttl(&self) -> Option<Duration> {
        (self.orphan_ttl_secs > 0).then(|| Duration::from_secs(self.orphan_ttl_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub poll_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("containers.yaml"),
            poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON snapshot file; memory only when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicIpConfig {
    /// Tried in order; the first response that parses as an IP wins
    pub endpoints: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PublicIpConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://api.ipify.org".to_string(),
                "https://ifconfig.me/ip".to_string(),
                "https://icanhazip.com".to_string(),
            ],
            timeout_secs: 5,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl Config {
    /// Load the file named on the command line (or `labelgate.yaml` if it
    /// exists), then apply CLI/env overrides and validate
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("Failed to parse YAML configuration")
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        let cf = &mut self.cloudflare;
        if let Some(token) = &cli.api_token {
            cf.api_token = Some(token.clone());
        }
        if let Some(account) = &cli.account_id {
            cf.account_id = Some(account.clone());
        }
        if let Some(tunnel) = &cli.tunnel_id {
            cf.tunnel_id = Some(tunnel.clone());
        }
        if let Some(secs) = cli.sync_interval {
            self.sync.interval_secs = secs;
        }
        if let Some(secs) = cli.remove_delay {
            self.sync.remove_delay_secs = secs;
        }
        if let Some(secs) = cli.orphan_ttl {
            self.sync.orphan_ttl_secs = secs;
        }
        if let Some(path) = &cli.source {
            self.source.path = path.clone();
        }
        if let Some(path) = &cli.ledger {
            self.ledger.path = Some(path.clone());
        }
        if let Some(address) = &cli.api_address {
            self.api.address = address.clone();
        }
        if let Some(level) = &cli.log_level {
            self.log.level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            self.log.format = format.clone();
        }
        if cli.skip_credential_validation {
            self.skip_credential_validation = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cf = &self.cloudflare;
        let has_root = cf.api_token.as_deref().is_some_and(|t| !t.is_empty());
        if !has_root && cf.credentials.is_empty() {
            bail!(
                "No Cloudflare credentials configured \
                 (set cloudflare.api_token or cloudflare.credentials)"
            );
        }

        for (name, cred) in &cf.credentials {
            if cred.api_token.is_empty() {
                bail!("Credential {} has an empty api_token", name);
            }
        }

        if cf.account_id.is_some() != cf.tunnel_id.is_some() {
            bail!("cloudflare.account_id and cloudflare.tunnel_id must be set together");
        }

        for (name, tunnel) in &cf.tunnels {
            if tunnel.account_id.is_empty() || tunnel.tunnel_id.is_empty() {
                bail!("Tunnel {} needs both account_id and tunnel_id", name);
            }
            if let Some(cred) = &tunnel.credential {
                let known = cf.credentials.contains_key(cred) || (cred == "default" && has_root);
                if !known {
                    bail!("Tunnel {} references unknown credential {}", name, cred);
                }
            }
        }

        if self.sync.interval_secs == 0 {
            bail!("sync.interval_secs must be greater than zero");
        }
        if self.source.poll_secs == 0 {
            bail!("source.poll_secs must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.interval(), Duration::from_secs(3600));
        assert_eq!(config.sync.remove_delay(), Duration::from_secs(1800));
        assert_eq!(config.sync.orphan_ttl(), None);
        assert_eq!(config.api.address, "0.0.0.0:8080");
        assert_eq!(config.cloudflare.api_base_url, CLOUDFLARE_API);
    }

    #[test]
    fn test_parse_yaml_with_named_credentials() {
        let config = Config::from_yaml(
            r#"
cloudflare:
  api_token: root-token
  account_id: acc-1
  tunnel_id: tun-1
  credentials:
    other:
      api_token: other-token
      zones: ["*.other.org"]
  tunnels:
    edge:
      account_id: acc-2
      tunnel_id: tun-2
      credential: other
sync:
  remove_delay_secs: 60
  orphan_ttl_secs: 86400
"#,
        )
        .unwrap();

        assert_eq!(config.cloudflare.credentials["other"].zones, vec!["*.other.org"]);
        assert_eq!(config.cloudflare.tunnels["edge"].credential.as_deref(), Some("other"));
        assert_eq!(config.sync.interval_secs, 3600);
        assert_eq!(config.sync.orphan_ttl(), Some(Duration::from_secs(86400)));
        config.validate().unwrap();
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::from_yaml("sync:\n  interval_secs: 60\n").unwrap();
        let cli = Cli {
            api_token: Some("cli-token".to_string()),
            sync_interval: Some(120),
            log_format: Some("json".to_string()),
            ..Default::default()
        };
        config.apply_cli(&cli);

        assert_eq!(config.cloudflare.api_token.as_deref(), Some("cli-token"));
        assert_eq!(config.sync.interval_secs, 120);
        assert_eq!(config.log.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        assert!(Config::default().validate().is_err());

        let mut config = Config::default();
        config.cloudflare.api_token = Some("t".to_string());
        config.cloudflare.account_id = Some("acc".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cloudflare.api_token = Some("t".to_string());
        config.cloudflare.tunnels.insert(
            "edge".to_string(),
            TunnelConfig {
                account_id: "acc".to_string(),
                tunnel_id: "tun".to_string(),
                credential: Some("missing".to_string()),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "sync: [not, a, map]").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.yaml"));
    }
}
