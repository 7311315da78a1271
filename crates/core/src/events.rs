//! Provider-agnostic events and commands exchanged with the remote agent.

use serde::{Deserialize, Serialize};

/// Who produced a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    User,
    Agent,
}

/// Whether the agent is currently producing audio or waiting for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Listening,
    Speaking,
}

/// Events emitted by an open session, consumed in order by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The channel finished its handshake.
    Connected { conversation_id: String },
    /// The channel closed, by either side.
    Disconnected { reason: Option<String> },
    /// A non-fatal error reported by the remote side.
    Error(String),
    /// A finished transcript line.
    Message { source: MessageSource, text: String },
    /// The agent started or stopped speaking.
    ModeChanged(Mode),
    /// The agent asked the client to run one of its tools.
    ToolInvoked {
        call_id: String,
        name: String,
        parameters: serde_json::Value,
    },
}

/// Outbound operations on an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// Text injected as if the user had said it.
    UserMessage(String),
    /// One-way context the agent should know about but not answer.
    ContextualUpdate(String),
    /// Completion of a previously received `ToolInvoked`.
    ToolResult {
        call_id: String,
        result: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Audio diagnostics for visualisation. Volumes are RMS in `0.0..=1.0`,
/// spectra are byte magnitudes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioLevels {
    pub input_volume: f32,
    pub output_volume: f32,
    pub input_frequency: Vec<u8>,
    pub output_frequency: Vec<u8>,
}
