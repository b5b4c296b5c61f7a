//! HTTP liveness probing with bounded timeouts.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::HealthProbe;

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn get_status(&self, url: &str, timeout: Duration) -> Result<u16> {
        debug!(url = url, "Probing endpoint");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("probe of {url} failed"))?;
        Ok(response.status().as_u16())
    }
}
