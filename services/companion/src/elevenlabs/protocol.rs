//! Wire messages of the ElevenLabs conversational agent WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client to the agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a new connection.
    ConversationInitiationClientData {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_config_override: Option<Value>,
    },
    UserMessage {
        text: String,
    },
    ContextualUpdate {
        text: String,
    },
    ClientToolResult {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    Pong {
        event_id: u64,
    },
}

/// Microphone audio. This one is not tagged with a `type`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UserAudioChunk {
    /// Base64 PCM16 at 16 kHz.
    pub user_audio_chunk: String,
}

/// Messages sent from the agent to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    UserTranscript {
        user_transcription_event: UserTranscription,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    Audio {
        audio_event: AudioEvent,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Option<Value>,
    },
    Ping {
        ping_event: PingEvent,
    },
    ClientToolCall {
        client_tool_call: ClientToolCall,
    },
    /// Corrections, VAD scores, tentative responses and anything newer.
    #[serde(other)]
    Unknown,
}

fn default_audio_format() -> String {
    "pcm_16000".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    #[serde(default = "default_audio_format")]
    pub agent_output_audio_format: String,
    #[serde(default = "default_audio_format")]
    pub user_input_audio_format: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UserTranscription {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientToolCall {
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub parameters: Value,
}
