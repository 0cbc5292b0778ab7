use crate::descriptors::DeviceDescriptor;
use crate::descriptors::Duid;
use clock::Timestamp;
use serde::Deserialize;
use serde::Serialize;

/// An immutable, timestamped collection of device descriptors.
///
/// Produced by the account collaborator or loaded from the cache. Replacing
/// the snapshot never mutates device identity: descriptors are matched
/// across snapshots by DUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    fetched_at: Timestamp,
    devices: Vec<DeviceDescriptor>,
}

impl InventorySnapshot {
    /// Build a snapshot, keeping the first descriptor of any duplicated DUID.
    pub fn new(fetched_at: Timestamp, devices: Vec<DeviceDescriptor>) -> InventorySnapshot {
        let mut deduplicated: Vec<DeviceDescriptor> = Vec::with_capacity(devices.len());
        for descriptor in devices {
            if !deduplicated.iter().any(|seen| seen.duid == descriptor.duid) {
                deduplicated.push(descriptor);
            }
        }
        InventorySnapshot {
            fetched_at,
            devices: deduplicated,
        }
    }

    pub fn empty(fetched_at: Timestamp) -> InventorySnapshot {
        InventorySnapshot {
            fetched_at,
            devices: Vec::new(),
        }
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn device(&self, duid: &Duid) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|descriptor| &descriptor.duid == duid)
    }

    pub fn contains(&self, duid: &Duid) -> bool {
        self.device(duid).is_some()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
