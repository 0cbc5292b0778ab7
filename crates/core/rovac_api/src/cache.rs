use crate::capabilities::CapabilityOverride;
use crate::descriptors::Duid;
use crate::errors::RovacError;
use crate::inventory::InventorySnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// The persistence collaborator.
///
/// Callers may implement this over whatever storage they have. A corrupt or
/// unavailable store must degrade to `Ok(None)` or `CacheUnavailable`; the
/// core treats both as "absent" and falls back to cloud-only operation.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn load_inventory(&self) -> Result<Option<InventorySnapshot>, RovacError>;

    async fn store_inventory(&self, snapshot: &InventorySnapshot) -> Result<(), RovacError>;

    async fn load_override(&self, duid: &Duid) -> Result<Option<CapabilityOverride>, RovacError>;

    async fn store_override(
        &self,
        duid: &Duid,
        probed: &CapabilityOverride,
    ) -> Result<(), RovacError>;
}

/// In-memory cache implementation.
#[derive(Default)]
pub struct InMemoryCache {
    inventory: Mutex<Option<InventorySnapshot>>,
    overrides: Mutex<HashMap<Duid, CapabilityOverride>>,
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn load_inventory(&self) -> Result<Option<InventorySnapshot>, RovacError> {
        Ok(self.inventory.lock().unwrap().clone())
    }

    async fn store_inventory(&self, snapshot: &InventorySnapshot) -> Result<(), RovacError> {
        *self.inventory.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn load_override(&self, duid: &Duid) -> Result<Option<CapabilityOverride>, RovacError> {
        Ok(self.overrides.lock().unwrap().get(duid).cloned())
    }

    async fn store_override(
        &self,
        duid: &Duid,
        probed: &CapabilityOverride,
    ) -> Result<(), RovacError> {
        let _ = self
            .overrides
            .lock()
            .unwrap()
            .insert(duid.clone(), probed.clone());
        Ok(())
    }
}

/// No-op cache implementation.
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn load_inventory(&self) -> Result<Option<InventorySnapshot>, RovacError> {
        Ok(None)
    }

    async fn store_inventory(&self, _snapshot: &InventorySnapshot) -> Result<(), RovacError> {
        Ok(())
    }

    async fn load_override(&self, _duid: &Duid) -> Result<Option<CapabilityOverride>, RovacError> {
        Ok(None)
    }

    async fn store_override(
        &self,
        _duid: &Duid,
        _probed: &CapabilityOverride,
    ) -> Result<(), RovacError> {
        Ok(())
    }
}
