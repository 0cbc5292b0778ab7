use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// The stable unique identifier of a physical device.
///
/// Descriptors are matched across inventory refreshes by DUID only; every
/// other descriptor field may change under a firmware or account update.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Duid(String);

impl Duid {
    pub fn new(duid: impl Into<String>) -> Duid {
        Duid(duid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Duid {
    fn from(duid: &str) -> Duid {
        Duid::new(duid)
    }
}

/// Identity plus the static capability-relevant fields of one device,
/// as reported by the account inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub duid: Duid,

    /// Display name, e.g. "Roborock S7 MaxV"
    pub name: String,

    /// Vendor model string, e.g. "roborock.vacuum.a27"
    pub model: String,

    pub firmware_version: String,

    /// Protocol generation reported by the account, e.g. "1.0" or "A01"
    #[serde(default)]
    pub protocol_version: String,

    /// 64-bit feature bitfield
    #[serde(default)]
    pub feature_flags: u64,

    /// Variable-length hexadecimal feature string, rightmost character least
    /// significant
    #[serde(default)]
    pub feature_flags_hex: String,

    /// Integer feature-id list
    #[serde(default)]
    pub feature_ids: Vec<u32>,

    /// Hardware product-feature tags
    #[serde(default)]
    pub product_tags: BTreeSet<String>,

    /// Base MQTT topic addressing this device on the cloud bus
    pub topic: String,

    /// Local addressing info, when the device was seen on the local network
    #[serde(default)]
    pub local_network: Option<NetworkInfo>,
}

impl DeviceDescriptor {
    /// The protocol generation of this device.
    ///
    /// An unrecognized protocol version degrades to [`DeviceVersion::Unknown`]
    /// rather than failing: such a device is still listed, mapped and
    /// reachable over the generic command surface.
    pub fn device_version(&self) -> DeviceVersion {
        match self.protocol_version.as_str() {
            "1.0" => DeviceVersion::V1,
            "A01" => DeviceVersion::A01,
            other => {
                log::warn!(
                    "Unknown protocol version {other:?} for device {}, using unknown",
                    self.duid
                );
                DeviceVersion::Unknown
            }
        }
    }
}

/// Protocol generation of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceVersion {
    V1,
    A01,
    Unknown,
}

/// Local-network addressing info for a device, as discovered by a live probe
/// and persisted alongside the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip: String,

    #[serde(default)]
    pub ssid: Option<String>,

    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default)]
    pub rssi: Option<i32>,
}
