//! Device registry
//!
//! Owns the record of every known controller. Acquisition is a single
//! check-and-set under the device's own lock, so two concurrent run requests
//! for the same device can never both succeed; devices never contend with
//! each other.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::DeviceConfig;
use super::error::{Result, RuntimeError};

/// Snapshot of one device's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id; the network address.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Network address.
    pub address: String,
    /// Whether a run may start.
    pub available: bool,
    /// Cooperative stop flag observed by the active run.
    pub stop_requested: bool,
    /// Active run, if any.
    pub current_run: Option<Uuid>,
    /// When the most recent run started.
    pub last_started: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            name: name.into(),
            address,
            available: true,
            stop_requested: false,
            current_run: None,
            last_started: None,
        }
    }
}

#[derive(Debug)]
struct DeviceSlot {
    record: Mutex<DeviceRecord>,
    stop: Notify,
}

impl DeviceSlot {
    fn new(record: DeviceRecord) -> Self {
        Self {
            record: Mutex::new(record),
            stop: Notify::new(),
        }
    }

    fn try_acquire(&self, run: Uuid) -> bool {
        let mut record = self.record.lock();
        if !record.available {
            return false;
        }
        record.available = false;
        record.stop_requested = false;
        record.current_run = Some(run);
        record.last_started = Some(Utc::now());
        true
    }

    fn release(&self) {
        let mut record = self.record.lock();
        record.available = true;
        record.stop_requested = false;
        record.current_run = None;
    }

    /// Release only while `run` still holds the device.
    fn release_run(&self, run: Uuid) -> bool {
        let mut record = self.record.lock();
        if record.current_run != Some(run) {
            return false;
        }
        record.available = true;
        record.stop_requested = false;
        record.current_run = None;
        true
    }

    fn stop_requested(&self) -> bool {
        self.record.lock().stop_requested
    }

    async fn stopped(&self) {
        loop {
            let notified = self.stop.notified();
            tokio::pin!(notified);
            // Register before checking so a stop between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// In-memory catalog of devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    slots: RwLock<HashMap<String, Arc<DeviceSlot>>>,
    order: RwLock<Vec<String>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded from configured devices.
    pub fn from_devices(devices: &[DeviceConfig]) -> Self {
        let registry = Self::new();
        for device in devices {
            registry.register(&device.name, &device.address);
        }
        registry
    }

    /// Register a device; re-registering an address keeps the existing record.
    pub fn register(&self, name: &str, address: &str) -> DeviceRecord {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(address) {
            return slot.record.lock().clone();
        }
        let record = DeviceRecord::new(name, address);
        slots.insert(address.to_string(), Arc::new(DeviceSlot::new(record.clone())));
        self.order.write().push(address.to_string());
        debug!(device = %address, name, "registered device");
        record
    }

    /// Every device, in registration order.
    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        let slots = self.slots.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| slots.get(id))
            .map(|slot| slot.record.lock().clone())
            .collect()
    }

    /// Current record of one device.
    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.slot(id).map(|slot| slot.record.lock().clone())
    }

    fn slot(&self, id: &str) -> Option<Arc<DeviceSlot>> {
        self.slots.read().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<DeviceSlot>> {
        self.slot(id)
            .ok_or_else(|| RuntimeError::UnknownDevice(id.to_string()))
    }

    /// Mark the device unavailable if it is available. Unknown devices are
    /// never acquired.
    pub fn try_acquire(&self, id: &str) -> bool {
        self.slot(id)
            .map(|slot| slot.try_acquire(Uuid::new_v4()))
            .unwrap_or(false)
    }

    /// Acquire the device for a run, returning a lease that releases it on drop.
    pub fn acquire(&self, id: &str) -> Result<DeviceLease> {
        let slot = self.require(id)?;
        let run_id = Uuid::new_v4();
        if !slot.try_acquire(run_id) {
            return Err(RuntimeError::DeviceBusy(id.to_string()));
        }
        let address = slot.record.lock().address.clone();
        info!(device = %id, run_id = %run_id, "device acquired");
        Ok(DeviceLease {
            slot,
            id: id.to_string(),
            address,
            run_id,
        })
    }

    /// Mark the device available and clear its stop flag.
    pub fn release(&self, id: &str) -> Result<()> {
        self.require(id)?.release();
        Ok(())
    }

    /// Ask the active run on the device to stop at its next cancellation point.
    ///
    /// Idle devices accept the request without recording it, so a stale flag
    /// cannot cancel a later run.
    pub fn request_stop(&self, id: &str) -> Result<()> {
        let slot = self.require(id)?;
        {
            let mut record = slot.record.lock();
            if record.available {
                debug!(device = %id, "stop requested on idle device");
                return Ok(());
            }
            record.stop_requested = true;
        }
        info!(device = %id, "stop requested");
        slot.stop.notify_waiters();
        Ok(())
    }

    /// Whether a stop was requested for the device.
    pub fn is_stop_requested(&self, id: &str) -> bool {
        self.slot(id).map(|slot| slot.stop_requested()).unwrap_or(false)
    }

    /// Resolve once a stop is requested for the device.
    pub async fn wait_for_stop(&self, id: &str) -> Result<()> {
        let slot = self.require(id)?;
        slot.stopped().await;
        Ok(())
    }
}

/// Exclusive use of one device for one run. Dropping the lease releases the
/// device on every exit path.
#[derive(Debug)]
pub struct DeviceLease {
    slot: Arc<DeviceSlot>,
    id: String,
    address: String,
    run_id: Uuid,
}

impl DeviceLease {
    /// Device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device network address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run holding the lease.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.slot.stop_requested()
    }

    /// Resolve once a stop is requested.
    pub async fn stopped(&self) {
        self.slot.stopped().await
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if self.slot.release_run(self.run_id) {
            debug!(device = %self.id, run_id = %self.run_id, "device released");
        } else {
            debug!(device = %self.id, run_id = %self.run_id, "lease outlived its run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.register("PLC_5", "192.168.0.42");
        registry
    }

    #[test]
    fn try_acquire_is_exclusive() {
        let registry = registry();
        assert!(registry.try_acquire("192.168.0.42"));
        assert!(!registry.try_acquire("192.168.0.42"));
        registry.release("192.168.0.42").unwrap();
        assert!(registry.try_acquire("192.168.0.42"));
        assert!(!registry.try_acquire("10.0.0.1"));
    }

    #[test]
    fn lease_releases_on_drop() {
        let registry = registry();
        let lease = registry.acquire("192.168.0.42").unwrap();
        let record = registry.get("192.168.0.42").unwrap();
        assert!(!record.available);
        assert_eq!(record.current_run, Some(lease.run_id()));
        assert!(record.last_started.is_some());
        assert!(matches!(
            registry.acquire("192.168.0.42"),
            Err(RuntimeError::DeviceBusy(_))
        ));
        drop(lease);
        assert!(registry.get("192.168.0.42").unwrap().available);
    }

    #[test]
    fn unknown_device_is_reported() {
        let registry = registry();
        assert!(matches!(
            registry.acquire("nope"),
            Err(RuntimeError::UnknownDevice(_))
        ));
        assert!(registry.request_stop("nope").is_err());
    }

    #[test]
    fn stop_on_idle_device_is_not_recorded() {
        let registry = registry();
        registry.request_stop("192.168.0.42").unwrap();
        assert!(!registry.is_stop_requested("192.168.0.42"));
    }

    #[test]
    fn release_clears_stop_flag() {
        let registry = registry();
        let lease = registry.acquire("192.168.0.42").unwrap();
        registry.request_stop("192.168.0.42").unwrap();
        assert!(lease.stop_requested());
        drop(lease);
        assert!(!registry.is_stop_requested("192.168.0.42"));
    }

    #[test]
    fn list_keeps_registration_order() {
        let registry = registry();
        registry.register("PLC_6", "192.168.0.43");
        registry.register("duplicate", "192.168.0.42");
        let names: Vec<String> = registry.list_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["PLC_5", "PLC_6"]);
    }

    #[test]
    fn stale_lease_leaves_newer_run_alone() {
        let registry = registry();
        let stale = registry.acquire("192.168.0.42").unwrap();
        registry.release("192.168.0.42").unwrap();
        let current = registry.acquire("192.168.0.42").unwrap();
        drop(stale);

        let record = registry.get("192.168.0.42").unwrap();
        assert!(!record.available);
        assert_eq!(record.current_run, Some(current.run_id()));
        assert!(!registry.try_acquire("192.168.0.42"));
        drop(current);
        assert!(registry.get("192.168.0.42").unwrap().available);
    }

    #[tokio::test]
    async fn wait_for_stop_resolves_on_request() {
        let registry = Arc::new(registry());
        let _lease = registry.acquire("192.168.0.42").unwrap();
        let waiting = Arc::clone(&registry);
        let waiter = tokio::spawn(async move { waiting.wait_for_stop("192.168.0.42").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        registry.request_stop("192.168.0.42").unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap()
            .unwrap();
        assert!(registry.wait_for_stop("nope").await.is_err());
    }

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let registry = Arc::new(registry());
        let lease = registry.acquire("192.168.0.42").unwrap();
        let waiter = tokio::spawn(async move { lease.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.request_stop("192.168.0.42").unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
