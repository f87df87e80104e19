use super::request::ChatRequest;
use super::store::{SessionState, SessionStore};
use crate::api::UpstreamSource;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{
    frame, upstream, AskSlot, Completion, EventSink, Frame, RelayConsumer, StreamBridge,
    StreamEvent, TextStreamer,
};
use crate::types::{ApiMessage, ToolChoice, ToolDefinition, UpstreamRequest};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const ASSESS_TOOL_NAME: &str = "assess_request";

const ASSESS_SYSTEM_PROMPT: &str = "You are a shopping assistant. Call assess_request exactly once. \
If you need more information, fill ask_slots with at most three short questions, each with up to three options. \
Otherwise answer directly in simple_response.";

/// The forced tool the assessment turn asks the model to call.
pub fn assess_tool() -> ToolDefinition {
    ToolDefinition {
        name: ASSESS_TOOL_NAME.to_string(),
        description: "Decide whether the request needs clarifying questions or can be answered now."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "ask_slots": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "slot_name": {"type": "string"},
                            "order": {"type": "integer"},
                            "message": {"type": "string"},
                            "options": {"type": "array", "items": {"type": "string"}, "maxItems": 3}
                        },
                        "required": ["slot_name", "message"]
                    }
                },
                "simple_response": {
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"},
                        "response_type": {"type": "string"}
                    },
                    "required": ["message"]
                }
            }
        }),
    }
}

/// Per-turn generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub heartbeat: Option<Duration>,
}

impl From<&Config> for TurnSettings {
    fn from(config: &Config) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            heartbeat: config.heartbeat_interval(),
        }
    }
}

/// Runs chat turns: loads the session, streams one turn through the bridge,
/// and saves the session once the stream has ended.
pub struct ConversationPipeline {
    source: Arc<dyn UpstreamSource>,
    store: Arc<dyn SessionStore>,
    settings: TurnSettings,
}

impl ConversationPipeline {
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        store: Arc<dyn SessionStore>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
        }
    }

    /// Assessment turn: either asks clarifying questions or answers directly.
    pub fn respond(&self, request: ChatRequest) -> PipelineResult<ResponseStream> {
        request.validate()?;
        let session = self.store.get(&request.user_id, &request.session_id)?;
        tracing::info!(
            user_id = %request.user_id,
            session_id = %request.session_id,
            channel = request.channel.as_deref().unwrap_or("default"),
            turn = session.turn_count,
            "assessment turn started"
        );

        let upstream_request = self.assessment_request(&session, &request.message);
        let source = self.source.clone();
        let session_id = request.session_id.clone();
        let consumer = self.bridge().spawn(move |sink| async move {
            sink.emit(StreamEvent::Ack { session_id })?;
            sink.emit(StreamEvent::Status {
                message: "Understanding your request".to_string(),
            })?;
            run_assessment(source.as_ref(), &upstream_request, &sink).await
        });

        Ok(ResponseStream::new(
            consumer,
            self.store.clone(),
            session,
            request.message,
        ))
    }

    /// Plain streamed answer without the assessment tool.
    pub fn respond_text(&self, request: ChatRequest) -> PipelineResult<ResponseStream> {
        request.validate()?;
        let session = self.store.get(&request.user_id, &request.session_id)?;
        tracing::info!(
            user_id = %request.user_id,
            session_id = %request.session_id,
            "text turn started"
        );

        let source = self.source.clone();
        let session_id = request.session_id.clone();
        let prompt = request.message.clone();
        let settings = self.settings.clone();
        let consumer = self.bridge().spawn(move |sink| async move {
            sink.emit(StreamEvent::Ack { session_id })?;
            let text = TextStreamer::stream(
                source.as_ref(),
                &prompt,
                settings.temperature,
                settings.max_tokens,
                &sink,
            )
            .await?;
            sink.emit(StreamEvent::FinalAnswerComplete {
                message: text.clone(),
                response_type: None,
            })?;
            Ok(Completion::Success {
                result: json!({ "reply": text }),
            })
        });

        Ok(ResponseStream::new(
            consumer,
            self.store.clone(),
            session,
            request.message,
        ))
    }

    fn bridge(&self) -> StreamBridge {
        StreamBridge::new().with_heartbeat(self.settings.heartbeat)
    }

    fn assessment_request(&self, session: &SessionState, message: &str) -> UpstreamRequest {
        let mut messages = session.messages.clone();
        messages.push(ApiMessage::user(message));
        UpstreamRequest {
            system: Some(ASSESS_SYSTEM_PROMPT.to_string()),
            messages,
            tools: vec![assess_tool()],
            tool_choice: Some(ToolChoice::Tool {
                name: ASSESS_TOOL_NAME.to_string(),
            }),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }
}

/// What already reached the client during the assessment call. A payload
/// that fails to parse falls back to this so the closing events agree with
/// what was streamed.
#[derive(Debug, Default)]
struct StreamedTurn {
    answer: String,
    questions: Vec<(String, String)>,
    options: BTreeMap<String, Vec<String>>,
}

impl StreamedTurn {
    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::SimpleResponseDelta { text, .. } => self.answer.push_str(text),
            StreamEvent::AskMessageDelta {
                slot_name: Some(slot_name),
                text,
            } => self.questions.push((slot_name.clone(), text.clone())),
            StreamEvent::AskOptionsDelta { slot_name, options } => {
                self.options.insert(slot_name.clone(), options.clone());
            }
            _ => {}
        }
    }

    /// Slots whose question went out, in the order they streamed.
    fn slots(&self) -> Vec<AskSlot> {
        self.questions
            .iter()
            .zip(1..)
            .map(|((slot_name, message), order)| AskSlot {
                slot_name: slot_name.clone(),
                order,
                message: message.clone(),
                options: self.options.get(slot_name).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

/// Streams the assessment call and turns its finished payload into the
/// ask-phase or final-answer events.
async fn run_assessment(
    source: &dyn UpstreamSource,
    request: &UpstreamRequest,
    sink: &EventSink,
) -> PipelineResult<Completion> {
    let mut pending_options = BTreeMap::new();
    let mut streamed = StreamedTurn::default();
    let outcome = upstream::drive(source, request, |event| {
        if sink.is_cancelled() {
            return Err(PipelineError::ChannelClosedPrematurely);
        }
        streamed.observe(&event);
        if let StreamEvent::ToolComplete {
            pending_options: pending,
            ..
        } = &event
        {
            pending_options.clone_from(pending);
        }
        match event {
            StreamEvent::ToolStart { tool_name, .. } => {
                sink.emit(StreamEvent::ClassificationStart { tool_name })
            }
            other => sink.emit(other),
        }
    })
    .await?;

    let Some(call) = outcome.first_tool_call() else {
        if outcome.text.trim().is_empty() {
            return Err(PipelineError::upstream(
                "assessment returned neither a tool call nor text",
            ));
        }
        sink.emit(StreamEvent::FinalAnswerComplete {
            message: outcome.text.clone(),
            response_type: None,
        })?;
        return Ok(Completion::Degraded {
            result: json!({ "reply": outcome.text }),
            reason: "model answered without calling the assessment tool".to_string(),
        });
    };

    let (input, reply) = match &call.parse_error {
        None => {
            let slots = AskSlot::from_payload(&call.input);
            let reply = if slots.is_empty() {
                emit_final_answer(&call.input, sink)?
            } else {
                emit_ask_phase(&slots, pending_options, sink)?
            };
            (call.input.clone(), reply)
        }
        Some(error) => {
            tracing::warn!(%error, "assessment payload lost; closing with streamed content");
            let slots = streamed.slots();
            if !slots.is_empty() {
                let reply = emit_ask_phase(&slots, BTreeMap::new(), sink)?;
                (json!({ "ask_slots": slots }), reply)
            } else if !streamed.answer.is_empty() {
                sink.emit(StreamEvent::FinalAnswerComplete {
                    message: streamed.answer.clone(),
                    response_type: None,
                })?;
                (call.input.clone(), streamed.answer.clone())
            } else {
                (call.input.clone(), String::new())
            }
        }
    };

    let result = json!({ "input": input, "reply": reply });
    match (&call.parse_error, outcome.truncated) {
        (Some(error), _) => Ok(Completion::Degraded {
            result,
            reason: error.to_string(),
        }),
        (None, true) => Ok(Completion::Degraded {
            result,
            reason: "upstream stream ended early".to_string(),
        }),
        (None, false) => Ok(Completion::Success { result }),
    }
}

fn emit_ask_phase(
    slots: &[AskSlot],
    pending_options: BTreeMap<String, Vec<String>>,
    sink: &EventSink,
) -> PipelineResult<String> {
    for (slot_name, options) in pending_options {
        sink.emit(StreamEvent::AskOptionsDelta { slot_name, options })?;
    }
    sink.emit(StreamEvent::AskPlan {
        slots: slots.to_vec(),
    })?;
    sink.emit(StreamEvent::AskPhaseStart {
        total_slots: slots.len(),
    })?;

    let mut reply = String::new();
    if let Some(first) = slots.first() {
        sink.emit(StreamEvent::AskNext {
            slot_name: first.slot_name.clone(),
            message: first.message.clone(),
            options: first.options.clone(),
        })?;
        reply.clone_from(&first.message);
    }
    sink.emit(StreamEvent::AskComplete {
        slot_count: slots.len(),
    })?;
    Ok(reply)
}

fn emit_final_answer(input: &Value, sink: &EventSink) -> PipelineResult<String> {
    let simple = input.get("simple_response");
    let message = simple
        .and_then(|s| s.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let response_type = simple
        .and_then(|s| s.get("response_type"))
        .and_then(Value::as_str)
        .map(str::to_string);

    sink.emit(StreamEvent::FinalAnswerComplete {
        message: message.clone(),
        response_type,
    })?;
    Ok(message)
}

/// Client-facing side of one turn.
///
/// Yields events in order; once `End` has been yielded the session is
/// written back, unless the turn failed.
pub struct ResponseStream {
    consumer: RelayConsumer,
    store: Arc<dyn SessionStore>,
    session: Option<SessionState>,
    user_message: String,
}

impl ResponseStream {
    fn new(
        consumer: RelayConsumer,
        store: Arc<dyn SessionStore>,
        session: SessionState,
        user_message: String,
    ) -> Self {
        Self {
            consumer,
            store,
            session: Some(session),
            user_message,
        }
    }

    pub fn frames(self) -> impl Iterator<Item = Frame> {
        self.map(|event| frame(&event))
    }

    fn persist(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let Some(Ok(completion)) = self.consumer.outcome() else {
            tracing::debug!(
                session_id = %session.session_id,
                "turn failed; session left unchanged"
            );
            return;
        };

        let result = completion.result();
        let reply = result
            .get("reply")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let slots = result
            .get("input")
            .map(AskSlot::from_payload)
            .unwrap_or_default();
        session.record_turn(&self.user_message, &reply, slots);

        let session_id = session.session_id.clone();
        if let Err(error) = self.store.save(session) {
            tracing::warn!(%session_id, %error, "session save failed");
        }
    }
}

impl Iterator for ResponseStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        let event = self.consumer.next()?;
        if event.is_end() {
            self.persist();
        }
        Some(event)
    }
}
