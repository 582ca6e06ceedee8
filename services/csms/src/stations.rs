//! In-memory registry of charging stations known to this CSMS.

use chrono::{DateTime, Utc};
use ocpp_protocol::{BootReason, ChargingStationInfo, NodeId, RegistrationStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargingStation {
    pub id: NodeId,
    pub vendor_name: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub registration_status: RegistrationStatus,
    pub last_boot_reason: Option<BootReason>,
    pub last_boot_at: Option<DateTime<Utc>>,
}

impl ChargingStation {
    pub fn from_boot(
        id: NodeId,
        info: &ChargingStationInfo,
        reason: BootReason,
        status: RegistrationStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            vendor_name: info.vendor_name.clone(),
            model: info.model.clone(),
            serial_number: info.serial_number.clone(),
            firmware_version: info.firmware_version.clone(),
            registration_status: status,
            last_boot_reason: Some(reason),
            last_boot_at: Some(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StationsError {
    #[error("charging station registry lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("charging station '{0}' already exists")]
    AlreadyExists(NodeId),
    #[error("charging station '{0}' not found")]
    NotFound(NodeId),
    #[error("charging station registry is closed")]
    Closed,
}

/// Reads go straight to the map; structural mutations additionally hold a
/// single permit acquired with a bounded wait.
pub struct ChargingStations {
    stations: RwLock<HashMap<NodeId, ChargingStation>>,
    lock: Semaphore,
    lock_timeout: Duration,
}

impl ChargingStations {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            stations: RwLock::new(HashMap::new()),
            lock: Semaphore::new(1),
            lock_timeout,
        }
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, StationsError> {
        tokio::time::timeout(self.lock_timeout, self.lock.acquire())
            .await
            .map_err(|_| StationsError::LockTimeout(self.lock_timeout))?
            .map_err(|_| StationsError::Closed)
    }

    pub async fn add(&self, station: ChargingStation) -> Result<(), StationsError> {
        let _permit = self.acquire().await?;
        let mut stations = self.stations.write().await;
        if stations.contains_key(&station.id) {
            return Err(StationsError::AlreadyExists(station.id));
        }
        stations.insert(station.id.clone(), station);
        Ok(())
    }

    pub async fn update(&self, station: ChargingStation) -> Result<ChargingStation, StationsError> {
        let _permit = self.acquire().await?;
        let mut stations = self.stations.write().await;
        match stations.get_mut(&station.id) {
            Some(existing) => Ok(std::mem::replace(existing, station)),
            None => Err(StationsError::NotFound(station.id)),
        }
    }

    /// Returns `true` if the station was newly added.
    pub async fn add_or_update(&self, station: ChargingStation) -> Result<bool, StationsError> {
        let _permit = self.acquire().await?;
        let previous = self
            .stations
            .write()
            .await
            .insert(station.id.clone(), station);
        Ok(previous.is_none())
    }

    pub async fn delete(&self, id: &NodeId) -> Result<ChargingStation, StationsError> {
        let _permit = self.acquire().await?;
        self.stations
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StationsError::NotFound(id.clone()))
    }

    pub async fn get(&self, id: &NodeId) -> Option<ChargingStation> {
        self.stations.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<ChargingStation> {
        let mut all: Vec<ChargingStation> = self.stations.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.stations.read().await.len()
    }
}

impl Default for ChargingStations {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}
