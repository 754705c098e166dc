use std::sync::Arc;
use std::time::Duration;

use lantern_control_plane::Phase;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::LifecycleConfig;
use crate::error::ControlError;
use crate::instance::{IdleVerdict, InstanceHandle, InstanceRegistry, Transition};
use crate::provider::ProviderAdapter;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drives accepted transitions to completion in background tasks. Requests
/// return as soon as the registry has admitted the transition.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    registry: Arc<InstanceRegistry>,
    provider: Arc<dyn ProviderAdapter>,
    config: LifecycleConfig,
}

impl LifecycleOrchestrator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        provider: Arc<dyn ProviderAdapter>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn request(&self, device_id: &str, run: bool) -> Result<Transition, ControlError> {
        let transition = self.registry.request_transition(device_id, run)?;
        info!(
            device_id,
            from = %transition.from,
            to = %transition.to,
            provider = self.provider.name(),
            "transition accepted"
        );
        match transition.to {
            Phase::Starting => self.spawn_provision(device_id.to_string()),
            Phase::Stopping => self.spawn_teardown(&transition),
            _ => {}
        }
        Ok(transition)
    }

    /// Relaunch teardown for a `Stopping` record that exhausted its retries.
    pub fn retry_teardown(&self, device_id: &str) -> Result<Transition, ControlError> {
        let handle = self.registry.begin_teardown_retry(device_id)?;
        info!(device_id, handle = %handle, "operator retry of degraded teardown");
        let transition = Transition {
            device_id: device_id.to_string(),
            from: Phase::Stopping,
            to: Phase::Stopping,
            instance_handle: Some(handle),
        };
        self.spawn_teardown(&transition);
        Ok(transition)
    }

    /// Activity signal; postpones the idle timeout of a running instance.
    pub fn record_activity(&self, device_id: &str) -> Option<Phase> {
        self.registry.touch(device_id)
    }

    fn spawn_provision(&self, device_id: String) {
        let this = self.clone();
        tokio::spawn(async move { this.provision(device_id).await });
    }

    async fn provision(self, device_id: String) {
        let provider = self.provider.clone();
        let target = device_id.clone();
        let mut attempt = tokio::spawn(async move { provider.start(&target).await });

        let joined = match tokio::time::timeout(self.config.provision_timeout, &mut attempt).await
        {
            Ok(joined) => joined,
            Err(_) => {
                let err = ControlError::ProvisionFailed(format!(
                    "provider did not answer within {}s",
                    self.config.provision_timeout.as_secs()
                ));
                error!(device_id, error = %err, "provisioning timed out; reverting to idle");
                self.registry.fail_start(&device_id, &err.to_string());
                // The provider may still be renting; whatever it hands back
                // belongs to nobody and must be released.
                self.settle_abandoned_start(&device_id, attempt).await;
                return;
            }
        };

        let outcome = match joined {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(ControlError::ProvisionFailed(format!("{err:#}"))),
            Err(join_err) => Err(ControlError::ProvisionFailed(format!(
                "provider task failed: {join_err}"
            ))),
        };

        match outcome {
            Ok(handle) => match self.registry.complete_start(&device_id, handle.clone()) {
                Some(epoch) => {
                    info!(device_id, handle = %handle, "instance running");
                    self.spawn_idle_monitor(device_id, epoch);
                }
                None => {
                    warn!(
                        device_id,
                        handle = %handle,
                        "record left starting before provider answered; releasing instance"
                    );
                    self.release_orphan(&device_id, handle).await;
                }
            },
            Err(err) => {
                error!(device_id, error = %err, "provisioning failed; reverting to idle");
                self.registry.fail_start(&device_id, &err.to_string());
            }
        }
    }

    async fn settle_abandoned_start(
        &self,
        device_id: &str,
        attempt: JoinHandle<anyhow::Result<InstanceHandle>>,
    ) {
        match attempt.await {
            Ok(Ok(handle)) => {
                warn!(
                    device_id,
                    handle = %handle,
                    "provider answered after the timeout; releasing instance"
                );
                self.release_orphan(device_id, handle).await;
            }
            Ok(Err(err)) => {
                info!(
                    device_id,
                    error = %format!("{err:#}"),
                    "timed-out start ended without an instance"
                );
            }
            Err(join_err) => {
                warn!(device_id, error = %join_err, "timed-out start task failed");
            }
        }
    }

    /// Release an instance no record points at.
    async fn release_orphan(&self, device_id: &str, handle: InstanceHandle) {
        let released = self
            .stop_with_retries(&handle, |attempt, max_attempts, delay, err| {
                warn!(
                    device_id,
                    handle = %handle,
                    attempt,
                    max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "orphan release attempt failed"
                );
            })
            .await;
        match released {
            Ok(attempt) => info!(device_id, handle = %handle, attempt, "orphaned instance released"),
            Err(err) => error!(
                device_id,
                handle = %handle,
                error = %err,
                "failed to release orphaned instance; it may still be billed"
            ),
        }
    }

    fn spawn_teardown(&self, transition: &Transition) {
        let device_id = transition.device_id.clone();
        let Some(handle) = transition.instance_handle.clone() else {
            error!(device_id, "stopping record has no instance handle");
            self.registry.complete_stop(&device_id);
            return;
        };
        let this = self.clone();
        tokio::spawn(async move { this.teardown(device_id, handle).await });
    }

    async fn teardown(self, device_id: String, handle: InstanceHandle) {
        let released = self
            .stop_with_retries(&handle, |attempt, max_attempts, delay, err| {
                warn!(
                    device_id,
                    handle = %handle,
                    attempt,
                    max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "teardown attempt failed"
                );
                self.registry.report_teardown_failure(
                    &device_id,
                    &format!("teardown attempt {attempt}/{max_attempts} failed: {err}"),
                );
            })
            .await;

        match released {
            Ok(attempt) => {
                if self.registry.complete_stop(&device_id) {
                    info!(device_id, handle = %handle, attempt, "instance released");
                }
            }
            Err(err) => {
                error!(device_id, handle = %handle, error = %err, "instance left degraded");
                self.registry.mark_degraded(&device_id, &err.to_string());
            }
        }
    }

    /// Call `stop` until it succeeds or the attempt budget is spent, sleeping
    /// with backoff in between. `on_retry` sees every failure that is followed
    /// by another attempt. Returns the attempt that succeeded.
    async fn stop_with_retries(
        &self,
        handle: &InstanceHandle,
        mut on_retry: impl FnMut(u32, u32, Duration, &str),
    ) -> Result<u32, ControlError> {
        let max_attempts = self.config.teardown_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let provider = self.provider.clone();
            let target = handle.clone();
            let result = match tokio::spawn(async move { provider.stop(&target).await }).await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("provider task failed: {join_err}")),
            };

            match result {
                Ok(()) => return Ok(attempt),
                Err(err) => {
                    last_error = format!("{err:#}");
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.backoff(attempt);
                    on_retry(attempt, max_attempts, delay, &last_error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(ControlError::TeardownFailed(format!(
            "gave up after {max_attempts} attempts: {last_error}"
        )))
    }

    /// Exponential backoff after failed attempt `attempt` (1-based), capped,
    /// plus up to 10% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.teardown_backoff_base;
        let cap = self.config.teardown_backoff_max.max(base);
        let exp = base
            .checked_mul(1u32 << (attempt - 1).min(20))
            .unwrap_or(cap)
            .min(cap);
        let jitter_ms = (exp.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn spawn_idle_monitor(&self, device_id: String, epoch: u64) {
        let Some(idle_after) = self.config.idle_after else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.idle_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match this.registry.stop_if_idle(&device_id, epoch, idle_after) {
                    IdleVerdict::Active => {}
                    IdleVerdict::Finished => return,
                    IdleVerdict::Expired(transition) => {
                        info!(
                            device_id,
                            idle_after_secs = idle_after.as_secs(),
                            "no activity; stopping idle instance"
                        );
                        this.spawn_teardown(&transition);
                        return;
                    }
                }
            }
        });
    }

    /// Best-effort release of every held instance before exit. `Starting`
    /// records are stopped once they settle. Returns the number of devices
    /// still holding compute when `grace` ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            let mut pending = 0;
            for device_id in self.registry.device_ids() {
                let Some(snapshot) = self.registry.snapshot(&device_id) else {
                    continue;
                };
                match snapshot.phase {
                    Phase::Running => {
                        if self.request(&device_id, false).is_ok() {
                            info!(device_id, "stopping instance for shutdown");
                        }
                        pending += 1;
                    }
                    Phase::Starting => pending += 1,
                    Phase::Stopping if snapshot.degraded.is_none() => pending += 1,
                    Phase::Stopping | Phase::Idle => {}
                }
            }
            if pending == 0 {
                info!("all instances released");
                return 0;
            }
            if Instant::now() >= deadline {
                warn!(pending, "shutdown grace period elapsed with instances still held");
                return pending;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}
