//! Core logic of the companion: the conversation lifecycle controller, the
//! periodic webcam capture service, and the relay that connects the two.
//!
//! Everything that touches hardware or the network sits behind the traits in
//! [`session`] and [`capture`], so the runtime binary decides which concrete
//! agent, microphone, and camera to plug in.

pub mod capture;
pub mod controller;
pub mod error;
pub mod events;
pub mod relay;
pub mod session;

pub use capture::{CaptureObserver, CaptureService, CaptureSettings};
pub use controller::{ConversationController, ConversationSettings, ConversationState};
pub use error::{CaptureError, ConversationError, LifecyclePhase, ParseError, UploadError};
pub use events::{AgentCommand, AgentEvent, AudioLevels, ConnectionStatus, MessageSource, Mode};
pub use relay::ContextRelay;
pub use session::{AgentConnector, AgentLink, AgentSession, ConnectionType, Microphone, SessionRequest};
