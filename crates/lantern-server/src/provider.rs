use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{env_bool, env_u64, LifecycleConfig};
use crate::instance::InstanceHandle;
use crate::provider_clients::vast::VastClient;

const DEFAULT_SIMULATED_PROVISION_DELAY_MS: u64 = 2_000;

/// Rents and releases compute for a device. Both calls may take minutes and
/// always run off the request path.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Safe to call again only after a definitive failure.
    async fn start(&self, device_id: &str) -> anyhow::Result<InstanceHandle>;

    /// Must tolerate being retried for a handle that is already released.
    async fn stop(&self, handle: &InstanceHandle) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    Vast,
    Simulated,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vast" | "vastai" => Ok(Self::Vast),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => anyhow::bail!("unknown PROVISIONING_PROVIDER {other:?} (expected vast or simulated)"),
        }
    }
}

pub fn adapter_from_env(lifecycle: &LifecycleConfig) -> anyhow::Result<Arc<dyn ProviderAdapter>> {
    let kind = match std::env::var("PROVISIONING_PROVIDER") {
        Ok(raw) if !raw.trim().is_empty() => raw.parse::<ProviderKind>()?,
        _ if std::env::var("VAST_API_KEY").is_ok_and(|v| !v.trim().is_empty()) => {
            ProviderKind::Vast
        }
        _ => ProviderKind::Simulated,
    };
    let adapter: Arc<dyn ProviderAdapter> = match kind {
        ProviderKind::Vast => Arc::new(VastAdapter::new(
            VastClient::from_env()?,
            lifecycle.provision_timeout,
        )),
        ProviderKind::Simulated => {
            warn!("using simulated provisioning provider; no compute will be rented");
            Arc::new(SimulatedAdapter::from_env())
        }
    };
    info!(provider = adapter.name(), "provisioning provider selected");
    Ok(adapter)
}

pub struct VastAdapter {
    client: VastClient,
    ready_budget: Duration,
}

impl VastAdapter {
    /// `ready_budget` starts counting once the rental is accepted.
    pub fn new(client: VastClient, ready_budget: Duration) -> Self {
        Self {
            client,
            ready_budget,
        }
    }
}

#[async_trait]
impl ProviderAdapter for VastAdapter {
    fn name(&self) -> &'static str {
        "vast"
    }

    async fn start(&self, device_id: &str) -> anyhow::Result<InstanceHandle> {
        let instance_id = self
            .client
            .create_instance(&format!("lantern-{device_id}"))
            .await?;
        info!(device_id, instance_id, "vast instance rented; waiting for it to boot");

        if let Err(err) = self
            .client
            .wait_until_running(instance_id, self.ready_budget)
            .await
        {
            if let Err(destroy_err) = self.client.destroy_instance(instance_id).await {
                warn!(
                    device_id,
                    instance_id,
                    error = %destroy_err,
                    "failed to release instance that never became ready"
                );
            }
            return Err(err);
        }
        Ok(InstanceHandle::new(instance_id.to_string()))
    }

    async fn stop(&self, handle: &InstanceHandle) -> anyhow::Result<()> {
        let instance_id = handle
            .as_str()
            .parse::<u64>()
            .with_context(|| format!("vast handle {handle} is not an instance id"))?;
        self.client.destroy_instance(instance_id).await
    }
}

/// Pretends to rent compute after a fixed delay. For local development.
pub struct SimulatedAdapter {
    delay: Duration,
    fail_start: bool,
}

impl SimulatedAdapter {
    pub fn from_env() -> Self {
        Self {
            delay: Duration::from_millis(
                env_u64("SIMULATED_PROVISION_DELAY_MS")
                    .unwrap_or(DEFAULT_SIMULATED_PROVISION_DELAY_MS),
            ),
            fail_start: env_bool("SIMULATED_FAIL_START").unwrap_or(false),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedAdapter {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn start(&self, device_id: &str) -> anyhow::Result<InstanceHandle> {
        tokio::time::sleep(self.delay).await;
        if self.fail_start {
            anyhow::bail!("simulated provisioning failure for {device_id}");
        }
        Ok(InstanceHandle::new(format!("sim-{}", uuid::Uuid::new_v4())))
    }

    async fn stop(&self, _handle: &InstanceHandle) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay / 4).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_test_utils::{spawn_scripted_server, MockResponse};

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!("vast".parse::<ProviderKind>().unwrap(), ProviderKind::Vast);
        assert_eq!(
            " Simulated ".parse::<ProviderKind>().unwrap(),
            ProviderKind::Simulated
        );
        assert!("aws".parse::<ProviderKind>().is_err());
    }

    #[tokio::test]
    async fn simulated_adapter_returns_fresh_handles() {
        let adapter = SimulatedAdapter {
            delay: Duration::ZERO,
            fail_start: false,
        };
        let first = adapter.start("dev1").await.expect("start");
        let second = adapter.start("dev1").await.expect("start");
        assert!(first.as_str().starts_with("sim-"));
        assert_ne!(first, second);
        adapter.stop(&first).await.expect("stop");
    }

    #[tokio::test]
    async fn simulated_adapter_can_be_told_to_fail() {
        let adapter = SimulatedAdapter {
            delay: Duration::ZERO,
            fail_start: true,
        };
        let err = adapter.start("dev1").await.expect_err("configured failure");
        assert!(err.to_string().contains("dev1"));
    }

    #[tokio::test]
    async fn vast_start_destroys_instance_that_never_boots() {
        let (base_url, rx) = spawn_scripted_server(vec![
            MockResponse::ok(r#"{"success":true,"new_contract":31}"#),
            MockResponse::ok(r#"{"instances":{"id":31,"actual_status":"loading"}}"#),
            MockResponse::ok(r#"{"success":true}"#),
        ]);
        let client =
            VastClient::new(base_url, "vast-key", "12").with_poll_interval(Duration::from_millis(10));

        let adapter = VastAdapter {
            client,
            ready_budget: Duration::ZERO,
        };
        let err = adapter.start("dev1").await.expect_err("never ready");
        assert!(err.to_string().contains("not running"));

        let methods: Vec<String> = (0..3)
            .map(|_| {
                rx.recv_timeout(Duration::from_secs(2))
                    .expect("captured request")
                    .method
            })
            .collect();
        assert_eq!(methods, ["PUT", "GET", "DELETE"]);
    }

    #[tokio::test]
    async fn vast_stop_rejects_foreign_handles() {
        let client = VastClient::new("http://127.0.0.1:9", "vast-key", "12");

        let adapter = VastAdapter {
            client,
            ready_budget: Duration::from_secs(1),
        };
        let err = adapter
            .stop(&InstanceHandle::new("sim-abc"))
            .await
            .expect_err("non-numeric handle");
        assert!(err.to_string().contains("not an instance id"));
    }
}
