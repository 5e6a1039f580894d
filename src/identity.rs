//! Proxy and user-agent supply
//!
//! An [`IdentitySource`] hands out the outbound proxy and user-agent for one
//! attempt. Obtaining an identity can itself fail (a proxy API being down), so
//! [`acquire_identity`] retries it on its own small budget with a fixed delay,
//! independent of the fetch retry budget.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::IdentityConfig;
use crate::error::{Error, Result};
use crate::types::Identity;

/// Supplies one identity per attempt
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Produce the identity for the next attempt
    async fn acquire(&self) -> Result<Identity>;
}

/// Fixed (or no) proxy with a rotating user-agent
///
/// Fits tunnel-style proxies where the provider rotates the exit address behind
/// a single endpoint.
#[derive(Clone, Debug)]
pub struct RotatingIdentity {
    proxy: Option<String>,
    user_agents: Vec<String>,
}

impl RotatingIdentity {
    /// Create a source; `proxy = None` means direct connections
    pub fn new(proxy: Option<String>, user_agents: Vec<String>) -> Self {
        Self { proxy, user_agents }
    }
}

#[async_trait]
impl IdentitySource for RotatingIdentity {
    async fn acquire(&self) -> Result<Identity> {
        Ok(Identity {
            proxy: self.proxy.clone(),
            user_agent: pick_user_agent(&self.user_agents)?,
        })
    }
}

/// Asks an HTTP endpoint for a fresh proxy on every acquisition
#[derive(Clone, Debug)]
pub struct ProxyApiIdentity {
    client: reqwest::Client,
    api_url: String,
    user_agents: Vec<String>,
}

impl ProxyApiIdentity {
    /// Create a source backed by `api_url`
    pub fn new(api_url: impl Into<String>, user_agents: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            user_agents,
        })
    }
}

#[async_trait]
impl IdentitySource for ProxyApiIdentity {
    async fn acquire(&self) -> Result<Identity> {
        let response = self
            .client
            .get(&self.api_url)
            .send()
            .await
            .map_err(|e| Error::Identity(format!("proxy API unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Identity(format!(
                "proxy API returned status {}",
                response.status()
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::Identity(format!("proxy API body unreadable: {e}")))?;
        let proxy = normalize_proxy(&text).ok_or_else(|| {
            Error::Identity(format!("proxy API returned no usable proxy: {:?}", text.trim()))
        })?;
        Ok(Identity {
            proxy: Some(proxy),
            user_agent: pick_user_agent(&self.user_agents)?,
        })
    }
}

/// Build the identity source described by the configuration
///
/// A proxy API takes precedence over a fixed proxy.
pub fn from_config(config: &IdentityConfig) -> Result<Arc<dyn IdentitySource>> {
    if let Some(api_url) = &config.proxy_api_url {
        return Ok(Arc::new(ProxyApiIdentity::new(
            api_url.clone(),
            config.user_agents.clone(),
        )?));
    }
    Ok(Arc::new(RotatingIdentity::new(
        config.proxy.clone(),
        config.user_agents.clone(),
    )))
}

/// Obtain an identity, retrying the source up to `attempts` times
///
/// The delay is fixed and only applied between tries. Cancellation stops the
/// loop with [`Error::ShuttingDown`].
pub async fn acquire_identity(
    source: &dyn IdentitySource,
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<Identity> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match source.acquire().await {
            Ok(identity) => return Ok(identity),
            Err(e) => {
                tracing::warn!(attempt, max_attempts = attempts, error = %e, "identity acquisition failed");
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    Err(Error::Identity(format!(
        "no identity after {attempts} attempts: {last_error}"
    )))
}

fn pick_user_agent(pool: &[String]) -> Result<String> {
    pool.choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| Error::Identity("user-agent pool is empty".to_string()))
}

/// First non-blank line as a proxy URL; bare `host:port` gets `http://`
fn normalize_proxy(raw: &str) -> Option<String> {
    let candidate = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let proxy = if candidate.contains("://") {
        candidate.to_string()
    } else {
        format!("http://{candidate}")
    };
    url::Url::parse(&proxy).ok().map(|_| proxy)
}
