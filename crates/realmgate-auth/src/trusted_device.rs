//! Trusted devices.
//!
//! A trusted device bypasses MFA challenges until its record expires. The
//! fingerprint is the shared SHA-256 of IP + normalized user agent, so the
//! same browser keeps its trust across version upgrades.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use realmgate_core::clock::SharedClock;
use realmgate_core::device;
use realmgate_core::error::Result;
use realmgate_core::id::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A trusted device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaTrustedDevice {
    pub id: DeviceId,
    pub user_id: UserId,
    pub device_fingerprint: String,
    pub device_name: Option<String>,
    pub trusted_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MfaTrustedDevice {
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires) => at < expires,
        }
    }
}

/// Storage contract for trusted devices
#[async_trait]
pub trait TrustedDeviceStore: Send + Sync {
    async fn insert(&self, device: &MfaTrustedDevice) -> Result<()>;

    async fn find(&self, user_id: UserId, fingerprint: &str) -> Result<Option<MfaTrustedDevice>>;

    async fn touch(&self, id: DeviceId, at: DateTime<Utc>) -> Result<()>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<MfaTrustedDevice>>;

    async fn delete(&self, id: DeviceId) -> Result<()>;

    async fn delete_all_for_user(&self, user_id: UserId) -> Result<u64>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Trusted-device bookkeeping for one realm
pub struct TrustedDeviceManager<S: TrustedDeviceStore + ?Sized> {
    store: Arc<S>,
    clock: SharedClock,
}

impl<S: TrustedDeviceStore + ?Sized> TrustedDeviceManager<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Record trust for the device behind `(ip, user_agent)`
    pub async fn trust_device(
        &self,
        user_id: UserId,
        ip: &str,
        user_agent: &str,
        name: Option<&str>,
        expires_in_days: Option<i64>,
    ) -> Result<MfaTrustedDevice> {
        let now = self.clock.now();
        let fingerprint = device::fingerprint(ip, user_agent);

        // Re-trusting an already-known device refreshes it in place.
        if let Some(existing) = self.store.find(user_id, &fingerprint).await? {
            self.store.delete(existing.id).await?;
        }

        let record = MfaTrustedDevice {
            id: DeviceId::new(),
            user_id,
            device_fingerprint: fingerprint,
            device_name: name
                .map(String::from)
                .or_else(|| Some(device::device_name(user_agent))),
            trusted_at: now,
            last_used_at: None,
            expires_at: expires_in_days.map(|days| now + Duration::days(days)),
        };

        self.store.insert(&record).await?;
        Ok(record)
    }

    /// Whether `(ip, user_agent)` maps to a live trusted device; a hit
    /// refreshes `last_used_at`.
    pub async fn is_device_trusted(
        &self,
        user_id: UserId,
        ip: &str,
        user_agent: &str,
    ) -> Result<bool> {
        let now = self.clock.now();
        let fingerprint = device::fingerprint(ip, user_agent);

        match self.store.find(user_id, &fingerprint).await? {
            Some(record) if record.is_active(now) => {
                self.store.touch(record.id, now).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn list_devices(&self, user_id: UserId) -> Result<Vec<MfaTrustedDevice>> {
        self.store.list_for_user(user_id).await
    }

    pub async fn remove_device(&self, id: DeviceId) -> Result<()> {
        self.store.delete(id).await
    }

    pub async fn remove_all_devices(&self, user_id: UserId) -> Result<u64> {
        self.store.delete_all_for_user(user_id).await
    }

    pub async fn prune_expired(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }
}

/// In-memory trusted-device store
pub struct InMemoryTrustedDeviceStore {
    devices: RwLock<Vec<MfaTrustedDevice>>,
}

impl InMemoryTrustedDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryTrustedDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrustedDeviceStore for InMemoryTrustedDeviceStore {
    async fn insert(&self, device: &MfaTrustedDevice) -> Result<()> {
        self.devices.write().push(device.clone());
        Ok(())
    }

    async fn find(&self, user_id: UserId, fingerprint: &str) -> Result<Option<MfaTrustedDevice>> {
        Ok(self
            .devices
            .read()
            .iter()
            .find(|d| d.user_id == user_id && d.device_fingerprint == fingerprint)
            .cloned())
    }

    async fn touch(&self, id: DeviceId, at: DateTime<Utc>) -> Result<()> {
        let mut devices = self.devices.write();
        if let Some(device) = devices.iter_mut().find(|d| d.id == id) {
            device.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<MfaTrustedDevice>> {
        Ok(self
            .devices
            .read()
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: DeviceId) -> Result<()> {
        self.devices.write().retain(|d| d.id != id);
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| d.user_id != user_id);
        Ok((before - devices.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| d.is_active(now));
        Ok((before - devices.len()) as u64)
    }
}
