//! Feeds webhook descriptions of the camera image back into the conversation.

use crate::{
    capture::{CaptureObserver, CaptureResult, UploadResponse},
    controller::ConversationController,
    error::CaptureError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What the webhook is expected to answer with. Other fields are ignored.
#[derive(Debug, Deserialize)]
struct VisionDescription {
    #[serde(default)]
    text: Value,
}

impl VisionDescription {
    /// Non-string values are passed on in their JSON form.
    fn into_text(self) -> String {
        match self.text {
            Value::Null => String::new(),
            Value::String(text) => text,
            other => other.to_string(),
        }
    }
}

pub fn visual_context_message(description: &str) -> String {
    format!(
        "Here's what's visible of the patient's camera: {description}. \nUse it to get visual context during the conversation."
    )
}

/// Capture observer that forwards each described frame as a contextual
/// update and keeps a one-line status of the latest cycle.
pub struct ContextRelay {
    controller: Arc<ConversationController>,
    status: watch::Sender<String>,
}

impl ContextRelay {
    pub fn new(controller: Arc<ConversationController>) -> Self {
        let (status, _) = watch::channel(String::new());
        Self { controller, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    async fn forward(&self, response: &UploadResponse) {
        let description = match response.json::<VisionDescription>() {
            Ok(body) => body.into_text(),
            Err(e) => {
                error!(error = %e, "Failed to parse webhook response");
                return;
            }
        };
        if description.is_empty() {
            debug!("Webhook response carried no description");
            return;
        }

        match self
            .controller
            .send_contextual_update(visual_context_message(&description))
            .await
        {
            Ok(()) => info!(%description, "Sent visual context to agent"),
            Err(e) => error!(error = %e, "Failed to send contextual update"),
        }
    }
}

#[async_trait]
impl CaptureObserver for ContextRelay {
    async fn on_success(&self, _capture: &CaptureResult, response: UploadResponse) {
        self.forward(&response).await;
        let line = format!(
            "Auto-capture sent at {}",
            chrono::Local::now().format("%H:%M:%S")
        );
        self.status.send_replace(line);
    }

    async fn on_error(&self, error: CaptureError) {
        warn!(%error, "Auto-capture failed");
        self.status.send_replace(format!("Auto-capture error: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::FrameFormat,
        controller::{ConversationSettings, test_support::ScriptedConnector},
        error::UploadError,
        events::AgentCommand,
        session::MockMicrophone,
    };
    use bytes::Bytes;

    fn capture() -> CaptureResult {
        CaptureResult {
            blob: Bytes::from_static(b"img"),
            base64: "data:image/jpeg;base64,aW1n".to_string(),
            width: 2,
            height: 2,
            format: FrameFormat::Jpeg,
        }
    }

    fn response(body: &'static str) -> UploadResponse {
        UploadResponse {
            status: 200,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn controller(connector: Arc<ScriptedConnector>) -> Arc<ConversationController> {
        let mut mic = MockMicrophone::new();
        mic.expect_request_access().returning(|| Ok(()));
        Arc::new(ConversationController::new(
            connector,
            Arc::new(mic),
            ConversationSettings::default(),
        ))
    }

    #[test]
    fn test_visual_context_message() {
        assert_eq!(
            visual_context_message("an elderly man reading"),
            "Here's what's visible of the patient's camera: an elderly man reading. \nUse it to get visual context during the conversation."
        );
    }

    #[tokio::test]
    async fn test_description_forwarded_as_contextual_update() {
        let connector = Arc::new(ScriptedConnector::default());
        let (_events, link) = connector.push_session("conv_1");
        let controller = controller(connector);
        controller.start_conversation().await.unwrap();

        let relay = ContextRelay::new(controller.clone());
        relay
            .on_success(&capture(), response(r#"{"text":"a cup of tea","id":3}"#))
            .await;

        assert_eq!(
            link.commands(),
            vec![AgentCommand::ContextualUpdate(visual_context_message("a cup of tea"))]
        );
        assert!(relay.status().starts_with("Auto-capture sent at "));
    }

    #[tokio::test]
    async fn test_missing_or_invalid_description_sends_nothing() {
        let connector = Arc::new(ScriptedConnector::default());
        let (_events, link) = connector.push_session("conv_1");
        let controller = controller(connector);
        controller.start_conversation().await.unwrap();

        let relay = ContextRelay::new(controller.clone());
        relay.on_success(&capture(), response(r#"{"text":""}"#)).await;
        relay.on_success(&capture(), response(r#"{"other":1}"#)).await;
        relay.on_success(&capture(), response("<html>")).await;

        assert!(link.commands().is_empty());
        assert!(relay.status().starts_with("Auto-capture sent at "));
    }

    #[tokio::test]
    async fn test_non_string_description_is_stringified() {
        let connector = Arc::new(ScriptedConnector::default());
        let (_events, link) = connector.push_session("conv_1");
        let controller = controller(connector);
        controller.start_conversation().await.unwrap();

        let relay = ContextRelay::new(controller.clone());
        relay.on_success(&capture(), response(r#"{"text":42}"#)).await;
        relay
            .on_success(&capture(), response(r#"{"text":{"people":1}}"#))
            .await;

        assert_eq!(
            link.commands(),
            vec![
                AgentCommand::ContextualUpdate(visual_context_message("42")),
                AgentCommand::ContextualUpdate(visual_context_message(r#"{"people":1}"#)),
            ]
        );
    }

    #[tokio::test]
    async fn test_description_without_session_is_dropped() {
        let connector = Arc::new(ScriptedConnector::default());
        let relay = ContextRelay::new(controller(connector));
        relay
            .on_success(&capture(), response(r#"{"text":"a cup of tea"}"#))
            .await;
        assert!(relay.status().starts_with("Auto-capture sent at "));
    }

    #[tokio::test]
    async fn test_error_published_as_status() {
        let relay = ContextRelay::new(controller(Arc::new(ScriptedConnector::default())));
        let mut status = relay.subscribe();

        relay
            .on_error(CaptureError::from(UploadError::Status { status: 500 }))
            .await;

        assert!(status.has_changed().unwrap());
        assert_eq!(
            *status.borrow_and_update(),
            "Auto-capture error: Upload failed with status 500"
        );
    }
}
