use serde::Deserialize;
use serde::Serialize;

/// The lifecycle of one device as tracked by the device manager.
///
/// Transitions are monotonic except for the `Connected ⇄ Disconnected`
/// cycle: a device never goes back to `Discovered`, and `Removed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLifecycleState {
    /// Present in the inventory; capabilities not yet computed
    Discovered,

    /// Capabilities are known; the device is usable by consumers whether or
    /// not a connection ever succeeds
    Mapped,

    /// The underlying transport reports live connectivity
    Connected,

    /// Connectivity lost; the device connection keeps retrying
    Disconnected,

    /// Absent from two consecutive inventory refreshes; terminal
    Removed,
}

impl DeviceLifecycleState {
    pub fn is_terminal(self) -> bool {
        self == DeviceLifecycleState::Removed
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: DeviceLifecycleState) -> bool {
        use DeviceLifecycleState::*;
        match (self, next) {
            // Any non-terminal state may be removed
            (state, Removed) => !state.is_terminal(),
            (Discovered, Mapped) => true,
            (Mapped, Connected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }
}
