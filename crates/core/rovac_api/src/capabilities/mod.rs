//! The capability engine.
//!
//! Vendors encode what a device can do across several overlapping schemes: a
//! 64-bit feature integer, a variable-length hexadecimal feature string, an
//! integer feature-id list, the model string and hardware product tags. This
//! module normalizes all of them into a single [`CapabilitySet`] through a
//! data-driven rule table: each [`Capability`] is bound to one declarative
//! [`CapabilityRule`], and [`compute`] is the only interpreter.
//!
//! [`compute`] is pure, total and deterministic. Unknown or missing fields
//! default every dependent capability to false; there is no failure mode.

mod rules;

pub use rules::CapabilityRule;

use crate::descriptors::DeviceDescriptor;
use log::debug;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use strum_macros::EnumIter;

/// The closed enumeration of normalized device capabilities.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    AnyStateTransitGoto,
    AutoEmptyDock,
    AvoidCollision,
    BackChargeClean,
    CameraBasedAvoidance,
    CarpetDeepClean,
    CleanFinishReason,
    CornerCleanMode,
    CustomMode,
    CustomizedClean,
    DustCollection,
    EggMode,
    FlowLedSetting,
    HotWashTowel,
    MapCarpetShow,
    Matter,
    MultiMap,
    RecordAllowed,
    RoomTag,
    SmartDoorSill,
    SmartScene,
    SwitchMapMode,
    VideoMonitor,
    WashThenCharge,
    WashTowelDock,
}

/// The normalized feature set of one device.
///
/// Immutable once computed: a new descriptor (say, after a firmware upgrade)
/// requires recomputation, never in-place mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    enabled: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn supports(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn enabled(&self) -> impl Iterator<Item = Capability> + '_ {
        self.enabled.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(capabilities: I) -> Self {
        CapabilitySet {
            enabled: capabilities.into_iter().collect(),
        }
    }
}

/// A persisted correction to a device's statically computed capabilities,
/// discovered by a live probe and scoped to one firmware version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverride {
    /// The firmware the probe ran against. A firmware change invalidates the
    /// whole override.
    pub firmware_version: String,

    /// Capabilities observed live that the static encoding misses.
    pub enabled: BTreeSet<Capability>,
}

impl CapabilityOverride {
    pub fn new(firmware_version: impl Into<String>) -> CapabilityOverride {
        CapabilityOverride {
            firmware_version: firmware_version.into(),
            enabled: BTreeSet::new(),
        }
    }

    pub fn with_enabled(mut self, capability: Capability) -> Self {
        let _ = self.enabled.insert(capability);
        self
    }

    pub fn applies_to(&self, descriptor: &DeviceDescriptor) -> bool {
        self.firmware_version == descriptor.firmware_version
    }
}

/// Compute the capability set of a device.
///
/// Overrides are merged OR-only: a capability persisted as enabled is added
/// to the statically computed set, but an override can never force a
/// statically-enabled capability off. An override whose firmware version no
/// longer matches the descriptor is ignored entirely.
pub fn compute(
    descriptor: &DeviceDescriptor,
    override_set: Option<&CapabilityOverride>,
) -> CapabilitySet {
    let mut enabled = BTreeSet::new();
    for (capability, rule) in rules::RULES {
        if rule.evaluate(descriptor) {
            let _ = enabled.insert(*capability);
        }
    }

    if let Some(probed) = override_set {
        if probed.applies_to(descriptor) {
            enabled.extend(probed.enabled.iter().copied());
        } else {
            debug!(
                "Discarding capability override for {}: probed on firmware {}, device now runs {}",
                descriptor.duid, probed.firmware_version, descriptor.firmware_version
            );
        }
    }

    CapabilitySet { enabled }
}
