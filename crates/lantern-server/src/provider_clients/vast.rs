use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{env_u64, optional_non_empty_env, required_non_empty_env};

const DEFAULT_VAST_API_BASE_URL: &str = "https://console.vast.ai";
const DEFAULT_VAST_IMAGE: &str = "vllm/vllm-openai:latest";
const DEFAULT_VAST_DISK_GB: u64 = 40;
const DEFAULT_VAST_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_VAST_RUNTYPE: &str = "ssh";
const READY_STATUS: &str = "running";

pub struct VastClient {
    client: reqwest::Client,
    api_key: String,
    api_base_url: String,
    offer_id: String,
    image: String,
    disk_gb: u64,
    runtype: String,
    poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest {
    client_id: String,
    image: String,
    disk: u64,
    label: String,
    runtype: String,
}

#[derive(Debug, Deserialize)]
struct CreatedInstance {
    #[serde(default)]
    success: bool,
    new_contract: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InstanceEnvelope {
    instances: Option<VastInstance>,
}

#[derive(Debug, Deserialize)]
pub struct VastInstance {
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub status_msg: Option<String>,
}

impl VastInstance {
    pub fn is_running(&self) -> bool {
        self.actual_status.as_deref() == Some(READY_STATUS)
    }
}

impl VastClient {
    pub fn new(
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
        offer_id: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_base_url: api_base_url.into(),
            offer_id: offer_id.into(),
            image: DEFAULT_VAST_IMAGE.to_string(),
            disk_gb: DEFAULT_VAST_DISK_GB,
            runtype: DEFAULT_VAST_RUNTYPE.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_VAST_POLL_INTERVAL_SECS),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = required_non_empty_env("VAST_API_KEY")
            .context("VAST_API_KEY must be set (for example in .env)")?;
        let offer_id = required_non_empty_env("VAST_OFFER_ID")
            .context("VAST_OFFER_ID must be set to the ask the server should rent")?;
        let api_base_url = optional_non_empty_env("VAST_API_BASE_URL", DEFAULT_VAST_API_BASE_URL);

        let mut client = Self::new(api_base_url, api_key, offer_id);
        client.image = optional_non_empty_env("VAST_IMAGE", DEFAULT_VAST_IMAGE);
        client.disk_gb = env_u64("VAST_DISK_GB").unwrap_or(DEFAULT_VAST_DISK_GB);
        client.runtype = optional_non_empty_env("VAST_RUNTYPE", DEFAULT_VAST_RUNTYPE);
        if let Some(secs) = env_u64("VAST_POLL_INTERVAL_SECS") {
            client.poll_interval = Duration::from_secs(secs.max(1));
        }
        Ok(client)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v0{path}", self.api_base_url.trim_end_matches('/'))
    }

    /// Rent the configured offer. Returns the new instance id.
    pub async fn create_instance(&self, label: &str) -> anyhow::Result<u64> {
        let url = self.api_url(&format!("/asks/{}/", self.offer_id));
        let body = CreateInstanceRequest {
            client_id: "me".to_string(),
            image: self.image.clone(),
            disk: self.disk_gb,
            label: label.to_string(),
            runtype: self.runtype.clone(),
        };
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("send create instance request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("failed to create instance: {status} {text}");
        }
        let created: CreatedInstance = resp
            .json()
            .await
            .context("decode create instance response")?;
        match created.new_contract {
            Some(id) if created.success => Ok(id),
            _ => anyhow::bail!(
                "failed to create instance: offer {} was not accepted",
                self.offer_id
            ),
        }
    }

    pub async fn get_instance(&self, instance_id: u64) -> anyhow::Result<VastInstance> {
        let url = self.api_url(&format!("/instances/{instance_id}/"));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("send get instance request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("failed to get instance: {status} {text}");
        }
        let envelope: InstanceEnvelope = resp.json().await.context("decode get instance response")?;
        envelope
            .instances
            .with_context(|| format!("instance {instance_id} missing from response"))
    }

    /// Poll until the instance reports `running`. Gives up after `budget`.
    pub async fn wait_until_running(
        &self,
        instance_id: u64,
        budget: Duration,
    ) -> anyhow::Result<VastInstance> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let instance = self.get_instance(instance_id).await?;
            if instance.is_running() {
                return Ok(instance);
            }
            debug!(
                instance_id,
                actual_status = instance.actual_status.as_deref().unwrap_or("unknown"),
                "waiting for vast instance"
            );
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                anyhow::bail!(
                    "instance {instance_id} not running after {}s (last status: {})",
                    budget.as_secs(),
                    instance
                        .status_msg
                        .or(instance.actual_status)
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Release an instance. An instance the API no longer knows counts as
    /// released, so this is safe to retry.
    pub async fn destroy_instance(&self, instance_id: u64) -> anyhow::Result<()> {
        let url = self.api_url(&format!("/instances/{instance_id}/"));
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("send destroy instance request")?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            warn!(instance_id, "vast instance already gone");
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("failed to destroy instance: {status} {text}");
        }
        info!(instance_id, "vast instance destroyed");
        Ok(())
    }
}
