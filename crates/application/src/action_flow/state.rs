use crate::queue_ports::ConnectionStatus;

/// Health of an action flow, derived from its connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowState {
    /// Not connected yet.
    #[default]
    Idle,
    /// Connected and usable.
    Active,
    /// The connection is lost or being re-established.
    Failed,
    /// The connection was closed on request.
    Stopped,
}

impl FlowState {
    /// Returns stable label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl From<ConnectionStatus> for FlowState {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => Self::Active,
            ConnectionStatus::Connecting
            | ConnectionStatus::ConnectionDropped
            | ConnectionStatus::ConnectionFailed => Self::Failed,
            ConnectionStatus::Idle | ConnectionStatus::ConnectionClosed => Self::Stopped,
        }
    }
}

/// Flow state together with the depth of the primary queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStatus {
    /// Current flow state.
    pub state: FlowState,
    /// Ready messages in the primary queue.
    pub messages_waiting: u32,
    /// Consumers attached to the primary queue.
    pub consumer_count: u32,
}

impl FlowStatus {
    /// Returns true while the flow is active.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state == FlowState::Active
    }
}
