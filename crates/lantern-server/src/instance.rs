use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lantern_control_plane::{Phase, StatusEvent};
use parking_lot::Mutex;

use crate::broadcaster::{StatusBroadcaster, Subscription};
use crate::error::ControlError;

const PENDING_HANDLE_PREFIX: &str = "pending:";

/// Opaque identifier the provisioning provider hands back for a live instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Placeholder held while `Starting`, before the provider has answered.
    fn pending(device_id: &str) -> Self {
        Self(format!("{PENDING_HANDLE_PREFIX}{device_id}"))
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_HANDLE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct InstanceRecord {
    device_id: String,
    phase: Phase,
    last_active: DateTime<Utc>,
    instance_handle: Option<InstanceHandle>,
    degraded: Option<String>,
    run_epoch: u64,
}

impl InstanceRecord {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            phase: Phase::Idle,
            last_active: Utc::now(),
            instance_handle: None,
            degraded: None,
            run_epoch: 0,
        }
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            device_id: self.device_id.clone(),
            phase: self.phase,
            last_active: self.last_active,
            instance_handle: self.instance_handle.clone(),
            degraded: self.degraded.clone(),
            run_epoch: self.run_epoch,
        }
    }

    fn enter(&mut self, phase: Phase) -> StatusEvent {
        self.phase = phase;
        self.last_active = Utc::now();
        StatusEvent::new(self.device_id.clone(), phase)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceSnapshot {
    pub device_id: String,
    pub phase: Phase,
    pub last_active: DateTime<Utc>,
    pub instance_handle: Option<InstanceHandle>,
    pub degraded: Option<String>,
    pub run_epoch: u64,
}

/// Handle as reported to clients; empty until the provider has answered.
fn reported_handle(handle: Option<&InstanceHandle>) -> String {
    handle
        .filter(|handle| !handle.is_pending())
        .map(ToString::to_string)
        .unwrap_or_default()
}

impl InstanceSnapshot {
    pub fn compute_instance(&self) -> String {
        reported_handle(self.instance_handle.as_ref())
    }

    pub fn status_event(&self) -> StatusEvent {
        let mut event = StatusEvent::new(self.device_id.clone(), self.phase);
        event.timestamp = self.last_active;
        event.error_detail = self.degraded.clone();
        event
    }
}

/// An accepted `RequestTransition`.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub device_id: String,
    pub from: Phase,
    pub to: Phase,
    pub instance_handle: Option<InstanceHandle>,
}

impl Transition {
    pub fn compute_instance(&self) -> String {
        reported_handle(self.instance_handle.as_ref())
    }
}

#[derive(Debug, PartialEq)]
pub enum IdleVerdict {
    Active,
    /// The run this monitor was watching is over.
    Finished,
    Expired(Transition),
}

/// The device other than `device_id` whose record is not `Idle`, as the
/// conflict a start request for `device_id` runs into.
fn active_holder(
    records: &HashMap<String, Arc<Mutex<InstanceRecord>>>,
    device_id: &str,
) -> Option<ControlError> {
    records
        .iter()
        .filter(|(id, _)| id.as_str() != device_id)
        .find_map(|(id, record)| {
            let phase = record.lock().phase;
            (phase != Phase::Idle).then(|| ControlError::Conflict {
                device_id: id.clone(),
                phase,
            })
        })
}

/// Per-device instance records. Every read or write of a record goes through
/// that record's mutex, and every transition publishes its status event while
/// the mutex is still held so observers see events in commit order.
///
/// At most one record is away from `Idle` at a time: the server holds a
/// single compute instance. Locks are always taken map first, then record.
pub struct InstanceRegistry {
    records: Mutex<HashMap<String, Arc<Mutex<InstanceRecord>>>>,
    broadcaster: Arc<StatusBroadcaster>,
}

impl InstanceRegistry {
    pub fn new(broadcaster: Arc<StatusBroadcaster>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    fn existing(&self, device_id: &str) -> Option<Arc<Mutex<InstanceRecord>>> {
        self.records.lock().get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Atomic check-and-set of the run intent for `device_id`. Creates the
    /// record on first use. A start is refused while any other device holds
    /// the instance; the conflict then names that device and its phase.
    pub fn request_transition(
        &self,
        device_id: &str,
        desired_run: bool,
    ) -> Result<Transition, ControlError> {
        // The map lock stays held so no other start can slip in between the
        // exclusivity check and the commit.
        let mut records = self.records.lock();
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(InstanceRecord::new(device_id))))
            .clone();
        let mut guard = record.lock();
        let from = guard.phase;
        if from == Phase::Idle && desired_run {
            if let Some(holder) = active_holder(&records, device_id) {
                return Err(holder);
            }
        }
        drop(records);
        let event = match (from, desired_run) {
            (Phase::Idle, true) => {
                guard.instance_handle = Some(InstanceHandle::pending(device_id));
                guard.degraded = None;
                guard.enter(Phase::Starting)
            }
            (Phase::Running, false) => guard.enter(Phase::Stopping),
            _ => {
                return Err(ControlError::Conflict {
                    device_id: device_id.to_string(),
                    phase: from,
                })
            }
        };
        self.broadcaster.publish(&event);
        Ok(Transition {
            device_id: device_id.to_string(),
            from,
            to: guard.phase,
            instance_handle: guard.instance_handle.clone(),
        })
    }

    pub fn snapshot(&self, device_id: &str) -> Option<InstanceSnapshot> {
        self.existing(device_id).map(|record| record.lock().snapshot())
    }

    /// Record an activity signal. Returns the phase the record is in, or
    /// `None` for a device that never issued a control request.
    pub fn touch(&self, device_id: &str) -> Option<Phase> {
        let record = self.existing(device_id)?;
        let mut guard = record.lock();
        guard.last_active = Utc::now();
        Some(guard.phase)
    }

    /// Subscribe to `device_id` and capture its current state in one step, so
    /// the subscription receives exactly the transitions after the snapshot.
    /// Does not create a record.
    pub fn subscribe(&self, device_id: &str) -> (Subscription, Option<InstanceSnapshot>) {
        let records = self.records.lock();
        let Some(record) = records.get(device_id).cloned() else {
            // Holding the map lock keeps a concurrent first request from
            // creating the record and publishing before we are registered.
            let subscription = self.broadcaster.subscribe(device_id);
            return (subscription, None);
        };
        drop(records);
        let guard = record.lock();
        let subscription = self.broadcaster.subscribe(device_id);
        (subscription, Some(guard.snapshot()))
    }

    /// `Starting -> Running`. Returns the new run epoch, or `None` when the
    /// record was not `Starting`.
    pub(crate) fn complete_start(&self, device_id: &str, handle: InstanceHandle) -> Option<u64> {
        let record = self.existing(device_id)?;
        let mut guard = record.lock();
        if guard.phase != Phase::Starting {
            return None;
        }
        guard.instance_handle = Some(handle);
        guard.run_epoch += 1;
        let event = guard.enter(Phase::Running);
        self.broadcaster.publish(&event);
        Some(guard.run_epoch)
    }

    /// `Starting -> Idle` after a provider failure.
    pub(crate) fn fail_start(&self, device_id: &str, detail: &str) -> bool {
        let Some(record) = self.existing(device_id) else {
            return false;
        };
        let mut guard = record.lock();
        if guard.phase != Phase::Starting {
            return false;
        }
        guard.instance_handle = None;
        let event = guard.enter(Phase::Idle).with_error(detail);
        self.broadcaster.publish(&event);
        true
    }

    /// `Stopping -> Idle` once the provider released the instance.
    pub(crate) fn complete_stop(&self, device_id: &str) -> bool {
        let Some(record) = self.existing(device_id) else {
            return false;
        };
        let mut guard = record.lock();
        if guard.phase != Phase::Stopping {
            return false;
        }
        guard.instance_handle = None;
        guard.degraded = None;
        let event = guard.enter(Phase::Idle);
        self.broadcaster.publish(&event);
        true
    }

    /// Publish a failed teardown attempt. The record stays `Stopping`.
    pub(crate) fn report_teardown_failure(&self, device_id: &str, detail: &str) {
        let Some(record) = self.existing(device_id) else {
            return;
        };
        let mut guard = record.lock();
        if guard.phase != Phase::Stopping {
            return;
        }
        guard.last_active = Utc::now();
        let event = StatusEvent::new(guard.device_id.clone(), Phase::Stopping).with_error(detail);
        self.broadcaster.publish(&event);
    }

    /// Teardown gave up. The record stays `Stopping` and is flagged for an
    /// operator; it is never reported as `Idle`.
    pub(crate) fn mark_degraded(&self, device_id: &str, detail: &str) -> bool {
        let Some(record) = self.existing(device_id) else {
            return false;
        };
        let mut guard = record.lock();
        if guard.phase != Phase::Stopping {
            return false;
        }
        guard.degraded = Some(detail.to_string());
        guard.last_active = Utc::now();
        let event = StatusEvent::new(guard.device_id.clone(), Phase::Stopping).with_error(detail);
        self.broadcaster.publish(&event);
        true
    }

    /// Clear the degraded flag of a `Stopping` record so teardown can be
    /// attempted again. Returns the handle that still needs releasing.
    pub(crate) fn begin_teardown_retry(
        &self,
        device_id: &str,
    ) -> Result<InstanceHandle, ControlError> {
        let record = self
            .existing(device_id)
            .ok_or_else(|| ControlError::NotFound(device_id.to_string()))?;
        let mut guard = record.lock();
        let phase = guard.phase;
        let conflict = || ControlError::Conflict {
            device_id: device_id.to_string(),
            phase,
        };
        if guard.phase != Phase::Stopping || guard.degraded.is_none() {
            return Err(conflict());
        }
        let Some(handle) = guard.instance_handle.clone() else {
            return Err(conflict());
        };
        guard.degraded = None;
        let event = guard.enter(Phase::Stopping);
        self.broadcaster.publish(&event);
        Ok(handle)
    }

    /// Idle-timeout check for run `epoch`. An expired run is moved to
    /// `Stopping` through the same edge an explicit stop request takes.
    pub(crate) fn stop_if_idle(
        &self,
        device_id: &str,
        epoch: u64,
        idle_after: Duration,
    ) -> IdleVerdict {
        let Some(record) = self.existing(device_id) else {
            return IdleVerdict::Finished;
        };
        let mut guard = record.lock();
        if guard.phase != Phase::Running || guard.run_epoch != epoch {
            return IdleVerdict::Finished;
        }
        let idle_for = Utc::now()
            .signed_duration_since(guard.last_active)
            .to_std()
            .unwrap_or_default();
        if idle_for < idle_after {
            return IdleVerdict::Active;
        }
        let event = guard.enter(Phase::Stopping);
        self.broadcaster.publish(&event);
        IdleVerdict::Expired(Transition {
            device_id: device_id.to_string(),
            from: Phase::Running,
            to: Phase::Stopping,
            instance_handle: guard.instance_handle.clone(),
        })
    }
}
