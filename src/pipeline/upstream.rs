use super::accumulator::{CompletedToolCall, ToolStreamAccumulator};
use super::event::StreamEvent;
use super::text::TextStreamer;
use crate::api::stream::StreamParser;
use crate::api::UpstreamSource;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{UpstreamEvent, UpstreamRequest};
use futures::StreamExt;

/// What one upstream call produced once its stream is exhausted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamOutcome {
    pub message_id: Option<String>,
    pub stop_reason: Option<String>,
    pub text: String,
    pub tool_calls: Vec<CompletedToolCall>,
    /// The stream ended without `message_stop`.
    pub truncated: bool,
}

impl UpstreamOutcome {
    pub fn first_tool_call(&self) -> Option<&CompletedToolCall> {
        self.tool_calls.first()
    }
}

/// Opens one streaming call and routes every upstream event through the
/// tool accumulator and the text streamer, handing what they produce to `emit`.
///
/// A tool block left open by a failure is still completed before the error
/// is returned, so the client always sees its `ToolComplete`. An `Err` from
/// `emit` stops the call.
pub async fn drive<S, F>(
    source: &S,
    request: &UpstreamRequest,
    mut emit: F,
) -> PipelineResult<UpstreamOutcome>
where
    S: UpstreamSource + ?Sized,
    F: FnMut(StreamEvent) -> PipelineResult<()>,
{
    let mut stream = source.open_stream(request).await?;
    let mut parser = StreamParser::new();
    let mut accumulator = ToolStreamAccumulator::new();
    let mut text = TextStreamer::new();
    let mut outcome = UpstreamOutcome::default();
    let mut saw_message_stop = false;

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(error) => {
                close_open_block(&mut accumulator, &mut emit)?;
                return Err(error);
            }
        };

        for event in parser.process(&bytes) {
            tracing::debug!(event = event_kind(&event), "upstream event");
            match &event {
                UpstreamEvent::MessageStart { message } => {
                    outcome.message_id = Some(message.id.clone());
                }
                UpstreamEvent::MessageDelta { delta } => {
                    outcome.stop_reason.clone_from(&delta.stop_reason);
                }
                UpstreamEvent::MessageStop => saw_message_stop = true,
                UpstreamEvent::Error { error } => {
                    close_open_block(&mut accumulator, &mut emit)?;
                    return Err(PipelineError::upstream(format!(
                        "{}: {}",
                        error.error_type, error.message
                    )));
                }
                _ => {}
            }

            if let UpstreamEvent::ContentBlockStop { index } = &event {
                if accumulator.open_block() == Some(*index) {
                    if let Some(flushed) = accumulator.flush() {
                        emit(flushed)?;
                    }
                }
            }
            if let Some(emitted) = accumulator.process(&event) {
                emit(emitted)?;
            }
            if let Some(emitted) = text.process(&event) {
                emit(emitted)?;
            }
        }
    }

    let rest = parser.flush();
    if !rest.trim().is_empty() {
        tracing::warn!(bytes = rest.len(), "upstream ended mid-event; dropping partial frame");
    }
    close_open_block(&mut accumulator, &mut emit)?;

    outcome.truncated = !saw_message_stop;
    if outcome.truncated {
        tracing::warn!("upstream stream ended without message_stop");
    }
    tracing::debug!(
        message_id = ?outcome.message_id,
        stop_reason = ?outcome.stop_reason,
        "upstream stream finished"
    );
    outcome.text = text.into_text();
    outcome.tool_calls = accumulator.completed().to_vec();
    Ok(outcome)
}

fn close_open_block<F>(accumulator: &mut ToolStreamAccumulator, emit: &mut F) -> PipelineResult<()>
where
    F: FnMut(StreamEvent) -> PipelineResult<()>,
{
    for event in [accumulator.flush(), accumulator.finish()].into_iter().flatten() {
        emit(event)?;
    }
    Ok(())
}

fn event_kind(event: &UpstreamEvent) -> &'static str {
    match event {
        UpstreamEvent::MessageStart { .. } => "message_start",
        UpstreamEvent::ContentBlockStart { .. } => "content_block_start",
        UpstreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        UpstreamEvent::ContentBlockStop { .. } => "content_block_stop",
        UpstreamEvent::MessageDelta { .. } => "message_delta",
        UpstreamEvent::MessageStop => "message_stop",
        UpstreamEvent::Ping => "ping",
        UpstreamEvent::Error { .. } => "error",
        UpstreamEvent::Unknown => "unknown",
    }
}
