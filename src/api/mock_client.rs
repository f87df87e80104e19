use super::client::{ByteStream, UpstreamSource};
use crate::error::PipelineError;
use crate::types::UpstreamRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted piece of a mocked upstream response.
#[derive(Debug, Clone)]
pub enum MockChunk {
    /// An SSE event; a trailing blank line is appended when missing.
    Sse(String),
    /// Bytes delivered exactly as given.
    Raw(String),
    /// A transport failure at this point in the stream.
    Fail(String),
    /// The stream stops producing without ending.
    Hang,
}

/// Scripted [`UpstreamSource`]: each `open_stream` call consumes the next response.
#[derive(Clone, Default)]
pub struct MockApiClient {
    responses: Arc<Mutex<VecDeque<Vec<MockChunk>>>>,
    requests: Arc<Mutex<Vec<UpstreamRequest>>>,
}

impl MockApiClient {
    pub fn new(responses: Vec<Vec<String>>) -> Self {
        Self::with_script(
            responses
                .into_iter()
                .map(|chunks| chunks.into_iter().map(MockChunk::Sse).collect())
                .collect(),
        )
    }

    pub fn with_script(responses: Vec<Vec<MockChunk>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpstreamSource for MockApiClient {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, PipelineError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let script = self
            .responses
            .lock()
            .map_err(|_| PipelineError::upstream("MockApiClient: response script poisoned"))?
            .pop_front()
            .ok_or_else(|| PipelineError::upstream("MockApiClient: No more responses configured"))?;

        let hangs = matches!(script.last(), Some(MockChunk::Hang));
        let items: Vec<Result<Bytes, PipelineError>> = script
            .into_iter()
            .filter_map(|chunk| match chunk {
                MockChunk::Sse(s) => {
                    let framed = if s.ends_with("\n\n") {
                        s
                    } else {
                        format!("{s}\n\n")
                    };
                    Some(Ok(Bytes::from(framed)))
                }
                MockChunk::Raw(s) => Some(Ok(Bytes::from(s))),
                MockChunk::Fail(message) => Some(Err(PipelineError::upstream(message))),
                MockChunk::Hang => None,
            })
            .collect();

        let scripted = stream::iter(items);
        if hangs {
            Ok(Box::pin(scripted.chain(stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }
}

/// SSE builders for scripting Messages API responses.
pub mod sse {
    use serde_json::json;

    pub fn message_start(id: &str) -> String {
        let data = json!({
            "type": "message_start",
            "message": {"id": id, "type": "message", "role": "assistant", "model": "mock-model", "content": []}
        });
        format!("event: message_start\ndata: {data}")
    }

    pub fn tool_use_start(index: usize, id: &str, name: &str) -> String {
        let data = json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
        });
        format!("event: content_block_start\ndata: {data}")
    }

    pub fn text_start(index: usize) -> String {
        let data = json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "text", "text": ""}
        });
        format!("event: content_block_start\ndata: {data}")
    }

    pub fn input_json_delta(index: usize, partial_json: &str) -> String {
        let data = json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": partial_json}
        });
        format!("event: content_block_delta\ndata: {data}")
    }

    pub fn text_delta(index: usize, text: &str) -> String {
        let data = json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text}
        });
        format!("event: content_block_delta\ndata: {data}")
    }

    pub fn block_stop(index: usize) -> String {
        let data = json!({"type": "content_block_stop", "index": index});
        format!("event: content_block_stop\ndata: {data}")
    }

    pub fn message_delta(stop_reason: &str) -> String {
        let data = json!({"type": "message_delta", "delta": {"stop_reason": stop_reason}});
        format!("event: message_delta\ndata: {data}")
    }

    pub fn message_stop() -> String {
        "event: message_stop\ndata: {\"type\":\"message_stop\"}".to_string()
    }

    pub fn error(error_type: &str, message: &str) -> String {
        let data = json!({"type": "error", "error": {"type": error_type, "message": message}});
        format!("event: error\ndata: {data}")
    }

    /// A complete tool-use response whose input arrives as `fragments`.
    pub fn tool_round(tool_name: &str, fragments: &[&str]) -> Vec<String> {
        let mut events = vec![
            message_start("msg_mock"),
            tool_use_start(0, "toolu_mock", tool_name),
        ];
        events.extend(fragments.iter().map(|f| input_json_delta(0, f)));
        events.push(block_stop(0));
        events.push(message_delta("tool_use"));
        events.push(message_stop());
        events
    }

    /// A complete plain-text response whose text arrives as `fragments`.
    pub fn text_round(fragments: &[&str]) -> Vec<String> {
        let mut events = vec![message_start("msg_mock"), text_start(0)];
        events.extend(fragments.iter().map(|f| text_delta(0, f)));
        events.push(block_stop(0));
        events.push(message_delta("end_turn"));
        events.push(message_stop());
        events
    }
}
