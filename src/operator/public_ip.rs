//! Public IP discovery for `auto` record targets

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PublicIpConfig;

#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    async fn public_ip(&self) -> Result<IpAddr>;
}

/// Asks plain-text "what is my IP" endpoints in order
pub struct HttpIpResolver {
    http: Client,
    endpoints: Vec<String>,
}

impl HttpIpResolver {
    pub fn new(config: &PublicIpConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
        })
    }

    async fn query(&self, endpoint: &str) -> Result<IpAddr> {
        let body = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("bad status")?
            .text()
            .await
            .context("failed to read body")?;

        body.trim()
            .parse()
            .with_context(|| format!("not an IP address: {:?}", body.trim()))
    }
}

#[async_trait]
impl PublicIpResolver for HttpIpResolver {
    async fn public_ip(&self) -> Result<IpAddr> {
        for endpoint in &self.endpoints {
            match self.query(endpoint).await {
                Ok(ip) => {
                    debug!(endpoint = %endpoint, ip = %ip, "Discovered public IP");
                    return Ok(ip);
                }
                Err(e) => warn!(
                    endpoint = %endpoint,
                    error = %format!("{:#}", e),
                    "Public IP endpoint failed"
                ),
            }
        }
        bail!("Failed to discover public IP from any endpoint")
    }
}
