//! A set of simulated devices driven together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::engine::{DeviceHandle, DeviceServices, DeviceSnapshot};
use crate::error::{DevSimError, Result};
use crate::model::{Device, DeviceKind};

#[derive(Clone)]
struct FleetEntry {
    handle: DeviceHandle,
    kind: DeviceKind,
    /// Hub identity; for modules, the id of the hosting edge device.
    device_id: String,
}

/// Owns the device tasks of one simulation.
#[derive(Clone)]
pub struct Fleet {
    services: DeviceServices,
    devices: Arc<RwLock<HashMap<String, FleetEntry>>>,
    order: Arc<RwLock<Vec<String>>>,
}

impl Fleet {
    pub fn new(services: DeviceServices) -> Self {
        Self {
            services,
            devices: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Spawn a device. An existing device with the same id is shut down first.
    pub async fn add(&self, device: Device) -> DeviceHandle {
        let id = device.id.clone();
        let entry = FleetEntry {
            kind: device.kind(),
            device_id: device.configuration.device_id.clone(),
            handle: DeviceHandle::spawn(device, self.services.clone()),
        };
        let handle = entry.handle.clone();

        let previous = self.devices.write().await.insert(id.clone(), entry);
        match previous {
            Some(old) => {
                let _ = old.handle.shutdown().await;
            }
            None => self.order.write().await.push(id),
        }
        handle
    }

    /// Shut a device down and forget it.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self
            .devices
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DevSimError::Configuration(format!("unknown device {}", id)))?;
        self.order.write().await.retain(|d| d != id);
        entry.handle.shutdown().await
    }

    pub async fn get(&self, id: &str) -> Option<DeviceHandle> {
        self.devices.read().await.get(id).map(|e| e.handle.clone())
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Hub host of the edge device hosting `edge_device_id`, if it is connected.
    async fn parent_hub(&self, edge_device_id: &str) -> Option<String> {
        let parent = self
            .devices
            .read()
            .await
            .values()
            .find(|e| e.kind == DeviceKind::Edge && e.device_id == edge_device_id)
            .map(|e| e.handle.clone())?;
        parent.snapshot().await.ok()?.hub_name
    }

    /// Start one device. Modules are handed their parent edge's hub.
    pub async fn start(&self, id: &str, delay: Option<Duration>) -> Result<()> {
        let entry = self
            .devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DevSimError::Configuration(format!("unknown device {}", id)))?;

        let hub = match entry.kind {
            DeviceKind::Module => self.parent_hub(&entry.device_id).await,
            _ => None,
        };
        entry.handle.start(delay, hub)
    }

    /// Start every device in insertion order, `stagger` apart. Modules start
    /// after all other devices.
    pub async fn start_all(&self, stagger: Duration) -> Result<()> {
        let order = self.order.read().await.clone();
        let (modules, devices): (Vec<_>, Vec<_>) = {
            let entries = self.devices.read().await;
            order
                .into_iter()
                .filter(|id| entries.contains_key(id))
                .partition(|id| entries.get(id).is_some_and(|e| e.kind == DeviceKind::Module))
        };

        info!(devices = devices.len(), modules = modules.len(), "Starting fleet");
        for (i, id) in devices.iter().chain(modules.iter()).enumerate() {
            let delay = stagger * i as u32;
            if let Err(e) = self.start(id, Some(delay)).await {
                warn!(device_id = %id, "Failed to start device: {}", e);
            }
        }
        Ok(())
    }

    /// Stop every device and wait for all of them.
    pub async fn stop_all(&self) {
        let handles: Vec<DeviceHandle> = self.devices.read().await.values().map(|e| e.handle.clone()).collect();
        let results = join_all(handles.iter().map(|h| h.stop())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!(device_id = %handle.id(), "Failed to stop device: {}", e);
            }
        }
    }

    /// Stop every device and end their tasks.
    pub async fn shutdown(&self) {
        let entries: Vec<FleetEntry> = self.devices.write().await.drain().map(|(_, e)| e).collect();
        self.order.write().await.clear();
        join_all(entries.iter().map(|e| e.handle.shutdown())).await;
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let order = self.order.read().await.clone();
        let mut out = Vec::with_capacity(order.len());
        for id in order {
            if let Some(handle) = self.get(&id).await {
                if let Ok(snapshot) = handle.snapshot().await {
                    out.push(snapshot);
                }
            }
        }
        out
    }
}
