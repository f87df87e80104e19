use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

const MAX_MESSAGE_CHARS: usize = 8_000;

/// One inbound chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub channel: Option<String>,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            message: message.into(),
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Rejects requests that must not reach the pipeline.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.message.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(PipelineError::InvalidRequest(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "user_id must not be empty".to_string(),
            ));
        }
        if self.session_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "session_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_message_is_rejected() {
        for message in ["", "   ", "\n\t"] {
            let err = ChatRequest::new("u1", "s1", message).validate().unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)));
        }
    }

    #[test]
    fn test_ids_are_required() {
        assert!(ChatRequest::new("", "s1", "hi").validate().is_err());
        assert!(ChatRequest::new("u1", " ", "hi").validate().is_err());
        assert!(ChatRequest::new("u1", "s1", "hi").validate().is_ok());
    }

    #[test]
    fn test_overlong_message_is_rejected() {
        let message = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(ChatRequest::new("u1", "s1", message).validate().is_err());
    }

    #[test]
    fn test_channel_is_optional_on_the_wire() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"user_id":"u1","session_id":"s1","message":"hi"}"#,
        )
        .unwrap();
        assert_eq!(request.channel, None);
        assert_eq!(
            request.with_channel("whatsapp").channel.as_deref(),
            Some("whatsapp")
        );
    }
}
