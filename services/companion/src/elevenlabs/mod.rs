//! Remote voice agent over the ElevenLabs conversational WebSocket.
//!
//! [`ElevenLabsConnector`] performs the handshake and then hands the socket to
//! a connection task, which translates wire messages into [`AgentEvent`]s and
//! [`AgentCommand`]s back into wire messages. When an [`AudioBackend`] is
//! configured the same task streams microphone audio up and plays the agent's
//! audio locally.

pub mod protocol;

use crate::{
    audio::{AudioBackend, AudioPorts},
    audio_utils::{
        AGENT_INPUT_SAMPLE_RATE, DEFAULT_AGENT_OUTPUT_SAMPLE_RATE, FREQUENCY_BIN_COUNT,
        StreamResampler, byte_frequency_data, decode_f32_from_base64_i16,
        encode_f32_to_base64_i16, pcm_sample_rate, rms,
    },
    config::ElevenLabsConfig,
};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use companion_core::{
    AgentCommand, AgentConnector, AgentEvent, AgentLink, AgentSession, AudioLevels,
    ConversationError, MessageSource, Mode, SessionRequest,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use protocol::{ClientMessage, InitiationMetadata, ServerMessage, UserAudioChunk};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage,
    },
};
use tracing::{Instrument, debug, error, info, instrument, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens sessions against an ElevenLabs agent.
pub struct ElevenLabsConnector {
    config: ElevenLabsConfig,
    audio: Option<Arc<dyn AudioBackend>>,
}

impl ElevenLabsConnector {
    pub fn new(config: ElevenLabsConfig, audio: Option<Arc<dyn AudioBackend>>) -> Self {
        Self { config, audio }
    }

    pub fn endpoint(&self, agent_id: &str) -> String {
        format!(
            "{}/v1/convai/conversation?agent_id={}",
            self.config.base_url.trim_end_matches('/'),
            agent_id
        )
    }

    async fn open(&self, agent_id: &str) -> Result<AgentSession> {
        let mut ws_request = self.endpoint(agent_id).into_client_request()?;
        if let Some(api_key) = &self.config.api_key {
            ws_request
                .headers_mut()
                .insert("xi-api-key", HeaderValue::from_str(api_key)?);
        }

        let ports = match &self.audio {
            Some(backend) => {
                let backend = backend.clone();
                Some(tokio::task::spawn_blocking(move || backend.open()).await??)
            }
            None => None,
        };

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .context("Failed to connect to agent")?;
        info!("Connected to ElevenLabs WebSocket.");
        let (mut sink, mut stream) = ws_stream.split();

        let init = ClientMessage::ConversationInitiationClientData {
            conversation_config_override: None,
        };
        sink.send(WsMessage::Text(serde_json::to_string(&init)?.into()))
            .await?;

        let metadata = tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_for_metadata(&mut stream))
            .await
            .map_err(|_| anyhow!("Timed out waiting for conversation metadata"))??;
        let conversation_id = metadata.conversation_id.clone();

        let output_rate = pcm_sample_rate(&metadata.agent_output_audio_format).unwrap_or_else(|| {
            warn!(
                format = %metadata.agent_output_audio_format,
                "Unsupported agent audio format, assuming 16 kHz PCM"
            );
            DEFAULT_AGENT_OUTPUT_SAMPLE_RATE
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let meters = Arc::new(Meters::default());

        let (capture, connection) = Connection::new(sink, events_tx.clone(), meters.clone(), output_rate, ports)?;
        events_tx
            .send(AgentEvent::Connected {
                conversation_id: conversation_id.clone(),
            })
            .await
            .map_err(|_| anyhow!("Event receiver dropped during setup"))?;

        let span = tracing::info_span!("elevenlabs", %conversation_id);
        tokio::spawn(connection.run(stream, outbound_rx, capture).instrument(span));

        Ok(AgentSession {
            conversation_id,
            events: events_rx,
            link: Arc::new(ElevenLabsLink {
                outbound: outbound_tx,
                meters,
            }),
        })
    }
}

#[async_trait]
impl AgentConnector for ElevenLabsConnector {
    #[instrument(skip(self, request), fields(agent_id = %request.agent_id))]
    async fn connect(&self, request: SessionRequest) -> Result<AgentSession, ConversationError> {
        self.open(&request.agent_id).await.map_err(|e| {
            error!(error = ?e, "Agent connection failed");
            ConversationError::SessionStart(format!("{e:#}"))
        })
    }
}

async fn wait_for_metadata(stream: &mut SplitStream<WsStream>) -> Result<InitiationMetadata> {
    while let Some(message) = stream.next().await {
        match message? {
            WsMessage::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::ConversationInitiationMetadata {
                    conversation_initiation_metadata_event,
                }) => return Ok(conversation_initiation_metadata_event),
                Ok(other) => debug!(?other, "Ignoring message before conversation metadata"),
                Err(e) => warn!(error = %e, "Failed to parse message during setup"),
            },
            WsMessage::Close(frame) => bail!("Agent closed the connection during setup: {:?}", frame),
            _ => {}
        }
    }
    bail!("Agent connection ended during setup")
}

/// Levels and volume shared between the connection task and the link.
struct Meters {
    levels: Mutex<AudioLevels>,
    volume: Mutex<f32>,
}

impl Default for Meters {
    fn default() -> Self {
        Self {
            levels: Mutex::new(AudioLevels::default()),
            volume: Mutex::new(1.0),
        }
    }
}

enum Outbound {
    Command(AgentCommand),
    Close,
}

pub struct ElevenLabsLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    meters: Arc<Meters>,
}

#[async_trait]
impl AgentLink for ElevenLabsLink {
    async fn send(&self, command: AgentCommand) -> Result<(), ConversationError> {
        self.outbound
            .send(Outbound::Command(command))
            .map_err(|_| ConversationError::Session("connection closed".to_string()))
    }

    async fn close(&self) -> Result<(), ConversationError> {
        // Already closed is fine.
        let _ = self.outbound.send(Outbound::Close);
        Ok(())
    }

    fn levels(&self) -> AudioLevels {
        self.meters.levels.lock().clone()
    }

    fn set_volume(&self, volume: f32) {
        *self.meters.volume.lock() = volume;
    }
}

/// Tracks when queued agent audio will have finished playing.
#[derive(Debug, Default)]
struct PlaybackClock {
    horizon: Option<Instant>,
}

impl PlaybackClock {
    /// Extends the horizon by `duration`. Returns `true` when this starts a
    /// new turn.
    fn push(&mut self, duration: Duration, now: Instant) -> bool {
        let started = self.horizon.is_none();
        let base = self.horizon.map_or(now, |h| h.max(now));
        self.horizon = Some(base + duration);
        started
    }

    fn deadline(&self) -> Option<Instant> {
        self.horizon
    }

    /// Ends the turn early. Returns `true` if a turn was in progress.
    fn interrupt(&mut self) -> bool {
        self.horizon.take().is_some()
    }
}

struct Playback {
    tx: mpsc::UnboundedSender<Vec<f32>>,
    resampler: StreamResampler,
}

struct Connection {
    sink: SplitSink<WsStream, WsMessage>,
    events: mpsc::Sender<AgentEvent>,
    meters: Arc<Meters>,
    output_rate: u32,
    clock: PlaybackClock,
    playback: Option<Playback>,
    input_resampler: Option<StreamResampler>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_capture(capture: &mut Option<mpsc::UnboundedReceiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match capture {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Connection {
    fn new(
        sink: SplitSink<WsStream, WsMessage>,
        events: mpsc::Sender<AgentEvent>,
        meters: Arc<Meters>,
        output_rate: u32,
        ports: Option<AudioPorts>,
    ) -> Result<(Option<mpsc::UnboundedReceiver<Vec<f32>>>, Self)> {
        let mut connection = Self {
            sink,
            events,
            meters,
            output_rate,
            clock: PlaybackClock::default(),
            playback: None,
            input_resampler: None,
        };
        let Some(ports) = ports else {
            return Ok((None, connection));
        };

        connection.playback = Some(Playback {
            tx: ports.playback,
            resampler: StreamResampler::new(output_rate, ports.playback_rate, (output_rate / 100) as usize)?,
        });
        connection.input_resampler = Some(StreamResampler::new(
            ports.capture_rate,
            AGENT_INPUT_SAMPLE_RATE,
            (ports.capture_rate / 100) as usize,
        )?);
        Ok((Some(ports.capture), connection))
    }

    async fn run(
        mut self,
        mut stream: SplitStream<WsStream>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut capture: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    ) {
        let watcher = self.events.clone();
        let reason = loop {
            let horizon = self.clock.deadline();
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = self.on_server_text(&text).await {
                            error!(error = ?e, "Failed to handle agent message");
                            break Some(e.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        info!(?close_frame, "Agent closed the connection");
                        break close_frame.map(|f| f.reason.as_str().to_string()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error reading from agent WebSocket: {}", e);
                        break Some(e.to_string());
                    }
                    None => break None,
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Command(command)) => {
                        if let Err(e) = self.send_command(command).await {
                            error!(error = ?e, "Failed to send command to agent");
                            break Some(e.to_string());
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = self.sink.send(WsMessage::Close(None)).await;
                        info!("Closed agent connection");
                        break None;
                    }
                },
                Some(chunk) = next_capture(&mut capture) => {
                    if let Err(e) = self.send_audio(&chunk).await {
                        error!(error = ?e, "Failed to stream microphone audio");
                        break Some(e.to_string());
                    }
                }
                _ = wait_until(horizon) => {
                    self.clock.interrupt();
                    self.end_turn().await;
                }
                _ = watcher.closed() => {
                    debug!("Session dropped, closing agent connection");
                    let _ = self.sink.send(WsMessage::Close(None)).await;
                    break None;
                }
            }
        };

        drop(outbound);
        self.emit(AgentEvent::Disconnected { reason }).await;
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Agent event receiver dropped");
        }
    }

    async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.sink.send(WsMessage::Text(payload.into())).await?;
        Ok(())
    }

    async fn send_command(&mut self, command: AgentCommand) -> Result<()> {
        let message = match command {
            AgentCommand::UserMessage(text) => ClientMessage::UserMessage { text },
            AgentCommand::ContextualUpdate(text) => ClientMessage::ContextualUpdate { text },
            AgentCommand::ToolResult {
                call_id,
                result,
                is_error,
            } => ClientMessage::ClientToolResult {
                tool_call_id: call_id,
                result,
                is_error,
            },
        };
        self.send_json(&message).await
    }

    async fn send_audio(&mut self, chunk: &[f32]) -> Result<()> {
        let resampled = match self.input_resampler.as_mut() {
            Some(resampler) => resampler.process(chunk),
            None => chunk.to_vec(),
        };
        if resampled.is_empty() {
            return Ok(());
        }
        {
            let mut levels = self.meters.levels.lock();
            levels.input_volume = rms(&resampled);
            levels.input_frequency = byte_frequency_data(&resampled, FREQUENCY_BIN_COUNT);
        }
        self.send_json(&UserAudioChunk {
            user_audio_chunk: encode_f32_to_base64_i16(&resampled),
        })
        .await
    }

    async fn on_server_text(&mut self, text: &str) -> Result<()> {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse agent message");
                return Ok(());
            }
        };

        match message {
            ServerMessage::ConversationInitiationMetadata { .. } => {
                debug!("Ignoring repeated conversation metadata");
            }
            ServerMessage::UserTranscript {
                user_transcription_event,
            } => {
                self.emit(AgentEvent::Message {
                    source: MessageSource::User,
                    text: user_transcription_event.user_transcript,
                })
                .await;
            }
            ServerMessage::AgentResponse {
                agent_response_event,
            } => {
                self.emit(AgentEvent::Message {
                    source: MessageSource::Agent,
                    text: agent_response_event.agent_response,
                })
                .await;
            }
            ServerMessage::Audio { audio_event } => self.on_audio(&audio_event.audio_base_64).await,
            ServerMessage::Interruption { .. } => {
                if self.clock.interrupt() {
                    self.end_turn().await;
                }
            }
            ServerMessage::Ping { ping_event } => {
                self.send_json(&ClientMessage::Pong {
                    event_id: ping_event.event_id,
                })
                .await?;
            }
            ServerMessage::ClientToolCall { client_tool_call } => {
                info!(tool = %client_tool_call.tool_name, "Agent invoked client tool");
                self.emit(AgentEvent::ToolInvoked {
                    call_id: client_tool_call.tool_call_id,
                    name: client_tool_call.tool_name,
                    parameters: client_tool_call.parameters,
                })
                .await;
            }
            ServerMessage::Unknown => {}
        }
        Ok(())
    }

    async fn on_audio(&mut self, audio_base_64: &str) {
        let samples = decode_f32_from_base64_i16(audio_base_64);
        if samples.is_empty() {
            return;
        }
        {
            let mut levels = self.meters.levels.lock();
            levels.output_volume = rms(&samples);
            levels.output_frequency = byte_frequency_data(&samples, FREQUENCY_BIN_COUNT);
        }

        let duration = Duration::from_secs_f64(samples.len() as f64 / self.output_rate as f64);
        if self.clock.push(duration, Instant::now()) {
            self.emit(AgentEvent::ModeChanged(Mode::Speaking)).await;
        }

        let volume = *self.meters.volume.lock();
        if let Some(playback) = self.playback.as_mut() {
            let scaled: Vec<f32> = samples.iter().map(|s| s * volume).collect();
            let resampled = playback.resampler.process(&scaled);
            if !resampled.is_empty() && playback.tx.send(resampled).is_err() {
                warn!("Playback device closed, dropping agent audio");
                self.playback = None;
            }
        }
    }

    async fn end_turn(&mut self) {
        {
            let mut levels = self.meters.levels.lock();
            levels.output_volume = 0.0;
            levels.output_frequency.clear();
        }
        self.emit(AgentEvent::ModeChanged(Mode::Listening)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_utils::encode_f32_to_base64_i16;
    use companion_core::ConnectionType;
    use serde_json::{Value, json};
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, accept_hdr_async, tungstenite::handshake::server};

    type ServerWs = WebSocketStream<TcpStream>;

    async fn serve_one<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    async fn next_json(ws: &mut ServerWs) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Close(_) => return json!({"type": "closed"}),
                _ => {}
            }
        }
    }

    async fn send_json(ws: &mut ServerWs, value: Value) {
        ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
    }

    async fn handshake(ws: &mut ServerWs, conversation_id: &str) {
        let init = next_json(ws).await;
        assert_eq!(init["type"], "conversation_initiation_client_data");
        send_json(
            ws,
            json!({
                "type": "conversation_initiation_metadata",
                "conversation_initiation_metadata_event": {
                    "conversation_id": conversation_id,
                    "agent_output_audio_format": "pcm_16000",
                    "user_input_audio_format": "pcm_16000"
                }
            }),
        )
        .await;
    }

    fn connector(base_url: String) -> ElevenLabsConnector {
        ElevenLabsConnector::new(
            ElevenLabsConfig {
                base_url,
                api_key: None,
            },
            None,
        )
    }

    fn request() -> SessionRequest {
        SessionRequest {
            agent_id: "agent_test".to_string(),
            connection: ConnectionType::WebSocket,
        }
    }

    async fn next_event(session: &mut AgentSession) -> AgentEvent {
        tokio::time::timeout(Duration::from_secs(5), session.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    #[test]
    fn test_endpoint() {
        let connector = connector("wss://api.elevenlabs.io/".to_string());
        assert_eq!(
            connector.endpoint("agent_1"),
            "wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent_1"
        );
    }

    #[test]
    fn test_playback_clock_turns() {
        let start = Instant::now();
        let mut clock = PlaybackClock::default();

        assert!(clock.push(Duration::from_millis(100), start));
        assert!(!clock.push(Duration::from_millis(50), start));
        assert_eq!(clock.deadline(), Some(start + Duration::from_millis(150)));

        // A chunk arriving after the horizon starts counting from now.
        let later = start + Duration::from_millis(400);
        assert!(!clock.push(Duration::from_millis(10), later));
        assert_eq!(clock.deadline(), Some(later + Duration::from_millis(10)));

        assert!(clock.interrupt());
        assert!(!clock.interrupt());
        assert_eq!(clock.deadline(), None);
    }

    #[tokio::test]
    async fn test_handshake_yields_conversation_id() {
        let base = serve_one(|mut ws| async move {
            handshake(&mut ws, "conv_abc").await;
            let _ = next_json(&mut ws).await;
        })
        .await;

        let mut session = connector(base).connect(request()).await.unwrap();
        assert_eq!(session.conversation_id, "conv_abc");
        assert_eq!(
            next_event(&mut session).await,
            AgentEvent::Connected {
                conversation_id: "conv_abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_api_key_and_agent_id_sent_on_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &server::Request,
                            resp: server::Response|
             -> Result<server::Response, server::ErrorResponse> {
                let key = req
                    .headers()
                    .get("xi-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = seen_tx.send((req.uri().to_string(), key));
                Ok(resp)
            };
            let mut ws = accept_hdr_async(tcp, callback).await.unwrap();
            handshake(&mut ws, "conv_key").await;
            let _ = next_json(&mut ws).await;
        });

        let connector = ElevenLabsConnector::new(
            ElevenLabsConfig {
                base_url: format!("ws://{addr}"),
                api_key: Some("xi-secret".to_string()),
            },
            None,
        );
        connector.connect(request()).await.unwrap();

        let (uri, key) = seen_rx.recv().await.unwrap();
        assert_eq!(uri, "/v1/convai/conversation?agent_id=agent_test");
        assert_eq!(key.as_deref(), Some("xi-secret"));
    }

    #[tokio::test]
    async fn test_close_during_setup_fails_start() {
        let base = serve_one(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let err = connector(base).connect(request()).await.err().unwrap();
        assert!(matches!(err, ConversationError::SessionStart(_)));
    }

    #[tokio::test]
    async fn test_server_messages_become_events() {
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
        let base = serve_one(move |mut ws| async move {
            handshake(&mut ws, "conv_1").await;
            send_json(&mut ws, json!({"type": "user_transcript", "user_transcription_event": {"user_transcript": "I'm tired"}})).await;
            send_json(&mut ws, json!({"type": "agent_response", "agent_response_event": {"agent_response": "Rest a bit"}})).await;
            send_json(&mut ws, json!({"type": "vad_score", "vad_score_event": {"vad_score": 0.2}})).await;
            send_json(&mut ws, json!({
                "type": "client_tool_call",
                "client_tool_call": {"tool_name": "sleep", "tool_call_id": "call_1", "parameters": {}}
            })).await;
            send_json(&mut ws, json!({"type": "ping", "ping_event": {"event_id": 42}})).await;
            let _ = pong_tx.send(next_json(&mut ws).await);
            let _ = next_json(&mut ws).await;
        })
        .await;

        let mut session = connector(base).connect(request()).await.unwrap();
        assert!(matches!(next_event(&mut session).await, AgentEvent::Connected { .. }));
        assert_eq!(
            next_event(&mut session).await,
            AgentEvent::Message {
                source: MessageSource::User,
                text: "I'm tired".to_string()
            }
        );
        assert_eq!(
            next_event(&mut session).await,
            AgentEvent::Message {
                source: MessageSource::Agent,
                text: "Rest a bit".to_string()
            }
        );
        assert_eq!(
            next_event(&mut session).await,
            AgentEvent::ToolInvoked {
                call_id: "call_1".to_string(),
                name: "sleep".to_string(),
                parameters: json!({}),
            }
        );
        assert_eq!(
            pong_rx.recv().await.unwrap(),
            json!({"type": "pong", "event_id": 42})
        );
    }

    #[tokio::test]
    async fn test_commands_are_sent_as_wire_messages() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let base = serve_one(move |mut ws| async move {
            handshake(&mut ws, "conv_1").await;
            for _ in 0..4 {
                let _ = seen_tx.send(next_json(&mut ws).await);
            }
        })
        .await;

        let session = connector(base).connect(request()).await.unwrap();
        session
            .link
            .send(AgentCommand::UserMessage("hello".to_string()))
            .await
            .unwrap();
        session
            .link
            .send(AgentCommand::ContextualUpdate("a cup".to_string()))
            .await
            .unwrap();
        session
            .link
            .send(AgentCommand::ToolResult {
                call_id: "call_1".to_string(),
                result: "Sleep completed".to_string(),
                is_error: false,
            })
            .await
            .unwrap();
        session.link.close().await.unwrap();

        assert_eq!(
            seen_rx.recv().await.unwrap(),
            json!({"type": "user_message", "text": "hello"})
        );
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            json!({"type": "contextual_update", "text": "a cup"})
        );
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            json!({"type": "client_tool_result", "tool_call_id": "call_1", "result": "Sleep completed", "is_error": false})
        );
        assert_eq!(seen_rx.recv().await.unwrap(), json!({"type": "closed"}));
    }

    #[tokio::test]
    async fn test_audio_drives_speaking_then_listening() {
        // 10 ms of audio at 16 kHz.
        let chunk = encode_f32_to_base64_i16(&[0.25; 160]);
        let base = serve_one(move |mut ws| async move {
            handshake(&mut ws, "conv_1").await;
            send_json(&mut ws, json!({"type": "audio", "audio_event": {"audio_base_64": chunk, "event_id": 1}})).await;
            let _ = next_json(&mut ws).await;
        })
        .await;

        let mut session = connector(base).connect(request()).await.unwrap();
        assert!(matches!(next_event(&mut session).await, AgentEvent::Connected { .. }));
        assert_eq!(next_event(&mut session).await, AgentEvent::ModeChanged(Mode::Speaking));
        assert!(session.link.levels().output_volume > 0.2);
        assert_eq!(next_event(&mut session).await, AgentEvent::ModeChanged(Mode::Listening));
        assert_eq!(session.link.levels().output_volume, 0.0);
    }

    #[tokio::test]
    async fn test_interruption_ends_turn() {
        // One second of audio, cut short by an interruption.
        let chunk = encode_f32_to_base64_i16(&vec![0.25; 16_000]);
        let base = serve_one(move |mut ws| async move {
            handshake(&mut ws, "conv_1").await;
            send_json(&mut ws, json!({"type": "audio", "audio_event": {"audio_base_64": chunk}})).await;
            send_json(&mut ws, json!({"type": "interruption", "interruption_event": {"event_id": 2}})).await;
            let _ = next_json(&mut ws).await;
        })
        .await;

        let mut session = connector(base).connect(request()).await.unwrap();
        assert!(matches!(next_event(&mut session).await, AgentEvent::Connected { .. }));
        assert_eq!(next_event(&mut session).await, AgentEvent::ModeChanged(Mode::Speaking));

        let started = std::time::Instant::now();
        assert_eq!(next_event(&mut session).await, AgentEvent::ModeChanged(Mode::Listening));
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_remote_close_emits_disconnected() {
        let base = serve_one(|mut ws| async move {
            handshake(&mut ws, "conv_1").await;
            let _ = ws.close(None).await;
        })
        .await;

        let mut session = connector(base).connect(request()).await.unwrap();
        assert!(matches!(next_event(&mut session).await, AgentEvent::Connected { .. }));
        assert!(matches!(
            next_event(&mut session).await,
            AgentEvent::Disconnected { reason: None }
        ));
        assert!(session
            .link
            .send(AgentCommand::UserMessage("anyone?".to_string()))
            .await
            .is_err());
    }
}
