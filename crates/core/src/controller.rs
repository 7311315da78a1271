//! Conversation lifecycle controller.
//!
//! Wraps one remote agent session at a time and drives the silence timer and
//! sleep mode from the session's event stream. All timer state for a session
//! lives in a single task ([`SessionRuntime`]), so there is never more than one
//! pending silence deadline and a deadline is always checked against the live
//! sleep flag when it fires.

use crate::{
    error::{ConversationError, LifecyclePhase},
    events::{AgentCommand, AgentEvent, ConnectionStatus, MessageSource, Mode},
    session::{AgentConnector, AgentLink, AgentSession, ConnectionType, Microphone, SessionRequest},
};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::{collections::VecDeque, ops::ControlFlow, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{Instrument, debug, error, info, instrument, warn};

pub const DEFAULT_AGENT_ID: &str = "agent_2401kc5n6szxf4cr9dfz1j7mfydt";
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_SLEEP_DURATION: Duration = Duration::from_millis(60_000);

/// Name of the client tool the agent calls to go quiet for a while.
pub const SLEEP_TOOL: &str = "sleep";
pub const SLEEP_COMPLETED: &str = "Sleep completed";

pub const CONVERSATION_STARTERS: [&str; 4] = [
    "What did your father do when you were little?",
    "What was your favorite job back then?",
    "What do you want to cook for dinner today?",
    "What kind of clothing did you used to make as a tailor?",
];

/// Fixed parameters of the conversation behaviour.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub agent_id: String,
    pub silence_timeout: Duration,
    pub sleep_duration: Duration,
    pub starters: Vec<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            sleep_duration: DEFAULT_SLEEP_DURATION,
            starters: CONVERSATION_STARTERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ConversationSettings {
    /// Builds the system-style nudge sent after a silence, using a starter
    /// drawn uniformly at random. `None` when no starters are configured.
    pub fn silence_prompt(&self) -> Option<String> {
        if self.starters.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.starters.len());
        Some(format!(
            "[System: The patient has been silent for a while. Please ask them this question to keep the conversation going: \"{}\"]",
            self.starters[index]
        ))
    }
}

/// Snapshot of everything a UI needs to render the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationState {
    pub status: ConnectionStatus,
    pub is_speaking: bool,
    pub is_sleeping: bool,
    pub silence_timer_armed: bool,
    pub conversation_id: Option<String>,
}

enum Lifecycle {
    Idle,
    Starting,
    Active(ActiveSession),
}

struct ActiveSession {
    link: Arc<dyn AgentLink>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    fn is_open(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Resets the lifecycle to idle if a start is abandoned half-way.
struct StartGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.lifecycle.lock() = Lifecycle::Idle;
        }
    }
}

pub struct ConversationController {
    connector: Arc<dyn AgentConnector>,
    microphone: Arc<dyn Microphone>,
    settings: Arc<ConversationSettings>,
    state: Arc<watch::Sender<ConversationState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ConversationController {
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        microphone: Arc<dyn Microphone>,
        settings: ConversationSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConversationState::default());
        Self {
            connector,
            microphone,
            settings: Arc::new(settings),
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    /// Asks for microphone access, then opens a session against the configured
    /// agent. Returns the conversation identifier.
    ///
    /// Fails with [`ConversationError::Busy`] while another start is in flight
    /// or a session is already open.
    #[instrument(skip(self), fields(agent_id = %self.settings.agent_id))]
    pub async fn start_conversation(&self) -> Result<String, ConversationError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match &*lifecycle {
                Lifecycle::Starting => {
                    return Err(ConversationError::Busy(LifecyclePhase::Starting));
                }
                Lifecycle::Active(active) if active.is_open() => {
                    return Err(ConversationError::Busy(LifecyclePhase::Connected));
                }
                _ => {}
            }
            *lifecycle = Lifecycle::Starting;
        }
        let mut guard = StartGuard {
            lifecycle: &self.lifecycle,
            armed: true,
        };

        self.state.send_modify(|s| {
            *s = ConversationState {
                status: ConnectionStatus::Connecting,
                ..Default::default()
            }
        });

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to start conversation");
                self.state
                    .send_modify(|s| s.status = ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let AgentSession {
            conversation_id,
            events,
            link,
        } = session;
        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Connected;
            s.conversation_id = Some(conversation_id.clone());
        });

        let runtime = SessionRuntime::new(link.clone(), self.settings.clone(), self.state.clone());
        let span = tracing::info_span!("conversation", %conversation_id);
        let task = tokio::spawn(runtime.run(events).instrument(span));

        guard.armed = false;
        *self.lifecycle.lock() = Lifecycle::Active(ActiveSession { link, task });
        info!(%conversation_id, "Conversation started");
        Ok(conversation_id)
    }

    async fn open_session(&self) -> Result<AgentSession, ConversationError> {
        self.microphone.request_access().await?;
        self.connector
            .connect(SessionRequest {
                agent_id: self.settings.agent_id.clone(),
                connection: ConnectionType::WebSocket,
            })
            .await
    }

    /// Closes the open session and discards its timers. A no-op when no
    /// session is open.
    #[instrument(skip(self))]
    pub async fn end_conversation(&self) -> Result<(), ConversationError> {
        let active = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Starting => {
                    *lifecycle = Lifecycle::Starting;
                    return Err(ConversationError::Busy(LifecyclePhase::Starting));
                }
                Lifecycle::Idle => {
                    debug!("No conversation to end");
                    return Ok(());
                }
                Lifecycle::Active(active) => active,
            }
        };

        active.task.abort();
        let result = active.link.close().await;
        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.is_speaking = false;
            s.is_sleeping = false;
            s.silence_timer_armed = false;
        });
        info!("Conversation ended");
        result
    }

    /// Sends one-way context into the open session. Dropped when no session is
    /// open.
    pub async fn send_contextual_update(
        &self,
        text: impl Into<String>,
    ) -> Result<(), ConversationError> {
        self.send(AgentCommand::ContextualUpdate(text.into())).await
    }

    /// Injects text as if the user had said it. Dropped when no session is open.
    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<(), ConversationError> {
        self.send(AgentCommand::UserMessage(text.into())).await
    }

    async fn send(&self, command: AgentCommand) -> Result<(), ConversationError> {
        match self.active_link() {
            Some(link) => link.send(command).await,
            None => {
                debug!(?command, "No open session; dropping command");
                Ok(())
            }
        }
    }

    fn active_link(&self) -> Option<Arc<dyn AgentLink>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Active(active) if active.is_open() => Some(active.link.clone()),
            _ => None,
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if let Some(link) = self.active_link() {
            link.set_volume(volume.clamp(0.0, 1.0));
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn is_speaking(&self) -> bool {
        self.state.borrow().is_speaking
    }

    pub fn input_volume(&self) -> f32 {
        self.active_link().map_or(0.0, |l| l.levels().input_volume)
    }

    pub fn output_volume(&self) -> f32 {
        self.active_link().map_or(0.0, |l| l.levels().output_volume)
    }

    pub fn input_byte_frequency_data(&self) -> Vec<u8> {
        self.active_link()
            .map(|l| l.levels().input_frequency)
            .unwrap_or_default()
    }

    pub fn output_byte_frequency_data(&self) -> Vec<u8> {
        self.active_link()
            .map(|l| l.levels().output_frequency)
            .unwrap_or_default()
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        if let Lifecycle::Active(active) = &*self.lifecycle.lock() {
            active.task.abort();
        }
    }
}

/// A pending `sleep` tool call, answered when its dormancy period ends.
struct Dormancy {
    call_id: String,
    until: Instant,
}

#[derive(Default)]
struct SleepMode {
    asleep: bool,
    /// Set on entering sleep: the next user transcript is the utterance that
    /// made the agent call the tool, not a wake signal.
    discard_next_user_message: bool,
    dormancies: VecDeque<Dormancy>,
}

/// Per-session state machine. Owns the silence deadline and sleep mode.
struct SessionRuntime {
    link: Arc<dyn AgentLink>,
    settings: Arc<ConversationSettings>,
    state: Arc<watch::Sender<ConversationState>>,
    silence_deadline: Option<Instant>,
    sleep: SleepMode,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionRuntime {
    fn new(
        link: Arc<dyn AgentLink>,
        settings: Arc<ConversationSettings>,
        state: Arc<watch::Sender<ConversationState>>,
    ) -> Self {
        Self {
            link,
            settings,
            state,
            silence_deadline: None,
            sleep: SleepMode::default(),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<AgentEvent>) {
        loop {
            let wake_at = self.sleep.dormancies.front().map(|d| d.until);
            let silence_at = self.silence_deadline;
            tokio::select! {
                // Queued events win over timers that are due at the same instant.
                biased;
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Agent event stream closed");
                        break;
                    };
                    if self.handle_event(event).await.is_break() {
                        break;
                    }
                }
                _ = wait_until(wake_at) => self.finish_dormancy().await,
                _ = wait_until(silence_at) => self.on_silence().await,
            }
        }

        self.sleep.dormancies.clear();
        self.silence_deadline = None;
        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.is_speaking = false;
            s.is_sleeping = false;
            s.silence_timer_armed = false;
        });
    }

    async fn handle_event(&mut self, event: AgentEvent) -> ControlFlow<()> {
        match event {
            AgentEvent::Connected { conversation_id } => {
                info!(%conversation_id, "Connected to agent");
                self.state
                    .send_modify(|s| s.status = ConnectionStatus::Connected);
            }
            AgentEvent::Disconnected { reason } => {
                info!(?reason, "Disconnected from agent");
                self.disarm_silence();
                return ControlFlow::Break(());
            }
            AgentEvent::Error(message) => error!(%message, "Agent error"),
            AgentEvent::Message {
                source: MessageSource::User,
                text,
            } => {
                debug!(%text, "User message");
                self.on_user_message();
            }
            AgentEvent::Message {
                source: MessageSource::Agent,
                text,
            } => debug!(%text, "Agent message"),
            AgentEvent::ModeChanged(mode) => self.on_mode_change(mode),
            AgentEvent::ToolInvoked { call_id, name, .. } => {
                self.on_tool_invoked(call_id, name).await
            }
        }
        ControlFlow::Continue(())
    }

    fn on_user_message(&mut self) {
        if self.sleep.discard_next_user_message {
            self.sleep.discard_next_user_message = false;
            info!("Ignoring the user message that triggered sleep mode");
            return;
        }
        if self.sleep.asleep {
            info!("User speech detected, leaving sleep mode");
            self.set_asleep(false);
        }
        self.arm_silence();
    }

    fn on_mode_change(&mut self, mode: Mode) {
        debug!(?mode, "Mode changed");
        match mode {
            Mode::Listening => {
                self.state.send_modify(|s| s.is_speaking = false);
                if self.sleep.asleep {
                    debug!("Agent listening during sleep mode; silence timer stays off");
                } else {
                    self.arm_silence();
                }
            }
            Mode::Speaking => {
                self.state.send_modify(|s| s.is_speaking = true);
                self.disarm_silence();
            }
        }
    }

    async fn on_tool_invoked(&mut self, call_id: String, name: String) {
        if name == SLEEP_TOOL {
            self.enter_sleep(call_id);
            return;
        }

        warn!(tool = %name, "Agent called an unknown client tool");
        let result = AgentCommand::ToolResult {
            call_id,
            result: format!("Unknown client tool: {name}"),
            is_error: true,
        };
        if let Err(e) = self.link.send(result).await {
            error!(error = %e, "Failed to answer unknown tool call");
        }
    }

    fn enter_sleep(&mut self, call_id: String) {
        info!(%call_id, "Sleep tool called");
        self.sleep.discard_next_user_message = true;
        self.set_asleep(true);
        self.disarm_silence();
        self.sleep.dormancies.push_back(Dormancy {
            call_id,
            until: Instant::now() + self.settings.sleep_duration,
        });
    }

    async fn finish_dormancy(&mut self) {
        let Some(dormancy) = self.sleep.dormancies.pop_front() else {
            return;
        };
        self.set_asleep(false);
        info!(call_id = %dormancy.call_id, "Sleep completed");

        let result = AgentCommand::ToolResult {
            call_id: dormancy.call_id,
            result: SLEEP_COMPLETED.to_string(),
            is_error: false,
        };
        if let Err(e) = self.link.send(result).await {
            error!(error = %e, "Failed to report sleep completion");
        }
    }

    async fn on_silence(&mut self) {
        self.set_silence_deadline(None);
        if self.sleep.asleep {
            info!("Silence timer fired during sleep mode; ignoring");
            return;
        }
        let Some(prompt) = self.settings.silence_prompt() else {
            return;
        };
        info!(%prompt, "Sending prompt due to silence");
        if let Err(e) = self.link.send(AgentCommand::UserMessage(prompt)).await {
            error!(error = %e, "Failed to send silence prompt");
        }
    }

    /// Cancels any pending deadline and starts a fresh one.
    fn arm_silence(&mut self) {
        if self.sleep.asleep {
            debug!("Not starting silence timer - in sleep mode");
            return;
        }
        debug!("Starting silence timer");
        self.set_silence_deadline(Some(Instant::now() + self.settings.silence_timeout));
    }

    fn disarm_silence(&mut self) {
        if self.silence_deadline.is_some() {
            debug!("Clearing silence timer");
            self.set_silence_deadline(None);
        }
    }

    fn set_silence_deadline(&mut self, deadline: Option<Instant>) {
        self.silence_deadline = deadline;
        self.state
            .send_modify(|s| s.silence_timer_armed = deadline.is_some());
    }

    fn set_asleep(&mut self, asleep: bool) {
        self.sleep.asleep = asleep;
        self.state.send_modify(|s| s.is_sleeping = asleep);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Records every outbound command instead of sending it anywhere.
    #[derive(Default)]
    pub struct RecordingLink {
        pub commands: Mutex<Vec<AgentCommand>>,
        pub closed: AtomicBool,
    }

    impl RecordingLink {
        pub fn commands(&self) -> Vec<AgentCommand> {
            self.commands.lock().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentLink for RecordingLink {
        async fn send(&self, command: AgentCommand) -> Result<(), ConversationError> {
            self.commands.lock().push(command);
            Ok(())
        }

        async fn close(&self) -> Result<(), ConversationError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out pre-built sessions in order, optionally waiting on a gate.
    #[derive(Default)]
    pub struct ScriptedConnector {
        pub sessions: Mutex<VecDeque<AgentSession>>,
        pub requests: Mutex<Vec<SessionRequest>>,
        pub gate: Option<Arc<Notify>>,
    }

    impl ScriptedConnector {
        /// Queues a session and returns the handles a test drives it with.
        pub fn push_session(
            &self,
            conversation_id: &str,
        ) -> (mpsc::Sender<AgentEvent>, Arc<RecordingLink>) {
            let (tx, rx) = mpsc::channel(16);
            let link = Arc::new(RecordingLink::default());
            self.sessions.lock().push_back(AgentSession {
                conversation_id: conversation_id.to_string(),
                events: rx,
                link: link.clone(),
            });
            (tx, link)
        }
    }

    #[async_trait]
    impl AgentConnector for ScriptedConnector {
        async fn connect(&self, request: SessionRequest) -> Result<AgentSession, ConversationError> {
            self.requests.lock().push(request);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.sessions
                .lock()
                .pop_front()
                .ok_or_else(|| ConversationError::SessionStart("connection refused".to_string()))
        }
    }
}
