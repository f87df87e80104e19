use super::bridge::EventSink;
use super::event::StreamEvent;
use super::upstream;
use crate::api::UpstreamSource;
use crate::error::PipelineResult;
use crate::types::{ContentBlock, UpstreamEvent, UpstreamRequest};

/// Plain completion path: upstream text deltas map one-to-one onto `TextDelta`.
#[derive(Debug, Default)]
pub struct TextStreamer {
    in_text_block: bool,
    text: String,
}

impl TextStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, event: &UpstreamEvent) -> Option<StreamEvent> {
        match event {
            UpstreamEvent::ContentBlockStart { content_block, .. } => {
                self.in_text_block = matches!(content_block, ContentBlock::Text { .. });
                None
            }
            UpstreamEvent::ContentBlockDelta { delta, .. } if self.in_text_block => {
                let text = delta.text.as_deref().filter(|t| !t.is_empty())?;
                self.text.push_str(text);
                Some(StreamEvent::TextDelta {
                    text: text.to_string(),
                })
            }
            UpstreamEvent::ContentBlockStop { .. } => {
                self.in_text_block = false;
                None
            }
            other => {
                tracing::trace!(?other, "text streamer ignoring event");
                None
            }
        }
    }

    /// Everything streamed so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Runs one plain completion for `prompt`, pushing `TextDelta`s to `sink`,
    /// and returns the full text.
    pub async fn stream<S>(
        source: &S,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        sink: &EventSink,
    ) -> PipelineResult<String>
    where
        S: UpstreamSource + ?Sized,
    {
        let request = UpstreamRequest::text(prompt, temperature, max_tokens);
        let outcome = upstream::drive(source, &request, |event| sink.emit(event)).await?;
        Ok(outcome.text)
    }
}
