//! Seams between the conversation controller and the outside world.
//!
//! The controller never talks to a concrete provider or audio device. It is
//! handed an [`AgentConnector`] that opens sessions and a [`Microphone`] that
//! gates them, which keeps the state machine testable without a network.

use crate::{
    error::ConversationError,
    events::{AgentCommand, AgentEvent, AudioLevels},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport used for the session. Only persistent websocket sessions exist
/// today, but providers receive it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    WebSocket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub agent_id: String,
    pub connection: ConnectionType,
}

/// An open session: its identifier, the inbound event stream, and the
/// outbound link.
pub struct AgentSession {
    pub conversation_id: String,
    pub events: mpsc::Receiver<AgentEvent>,
    pub link: Arc<dyn AgentLink>,
}

/// Gatekeeper for microphone access, asked before every session start.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn request_access(&self) -> Result<(), ConversationError>;
}

/// Opens sessions against a remote conversational agent.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, request: SessionRequest) -> Result<AgentSession, ConversationError>;
}

/// Outbound half of an open session.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn send(&self, command: AgentCommand) -> Result<(), ConversationError>;

    /// Closes the channel. Resolves once the provider has released it.
    async fn close(&self) -> Result<(), ConversationError>;

    fn levels(&self) -> AudioLevels {
        AudioLevels::default()
    }

    /// Playback gain in `0.0..=1.0`.
    fn set_volume(&self, _volume: f32) {}
}
