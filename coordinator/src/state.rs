//! Gateway state definitions.

/// Operational state of the client gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Opening the first broker session.
    Starting,
    /// Consuming client requests.
    Running,
    /// Session lost, waiting to open a new one.
    Reconnecting,
    /// No longer taking requests, finishing those in flight.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

impl CoordinatorState {
    /// Check if the gateway is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }

    /// Check if the gateway is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }
}
