//! Worker state definitions.

/// Lifecycle of a [`WorkerServer`](crate::WorkerServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Opening the first broker session.
    Starting,
    /// Consuming its queue.
    Running,
    /// Session lost, waiting to open a new one.
    Reconnecting,
    /// Loop finished, either on shutdown or after a fatal startup error.
    Stopped,
}

impl WorkerState {
    /// Whether requests are being served.
    pub fn is_serving(&self) -> bool {
        matches!(self, WorkerState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped)
    }
}
