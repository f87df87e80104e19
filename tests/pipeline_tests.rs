use std::sync::Arc;

use askstream::api::mock_client::{sse, MockApiClient, MockChunk};
use askstream::pipeline::StreamEvent;
use askstream::session::{
    ChatRequest, ConversationPipeline, InMemorySessionStore, SessionStore, TurnSettings,
    ASSESS_TOOL_NAME,
};
use askstream::types::ToolChoice;
use askstream::PipelineError;
use serde_json::json;

fn settings() -> TurnSettings {
    TurnSettings {
        temperature: 0.0,
        max_tokens: 512,
        heartbeat: None,
    }
}

fn pipeline_with(
    mock: MockApiClient,
) -> (ConversationPipeline, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    let pipeline = ConversationPipeline::new(Arc::new(mock), store.clone(), settings());
    (pipeline, store)
}

fn wire_names(stream: impl Iterator<Item = StreamEvent>) -> (Vec<&'static str>, Vec<serde_json::Value>) {
    stream
        .map(|event| askstream::pipeline::frame(&event))
        .map(|frame| (frame.event, frame.data))
        .unzip()
}

#[test]
fn test_slot_questions_stream_then_ask_phase() {
    let mock = MockApiClient::new(vec![sse::tool_round(
        ASSESS_TOOL_NAME,
        &[
            r#"{"ask_slots":[{"slot_name":"budget","order":1,"#,
            r#""message":"What's your budget?","opt"#,
            r#"ions":["Under 500","500-1000""#,
            r#","Above 1000"]}]}"#,
        ],
    )]);
    let (pipeline, store) = pipeline_with(mock.clone());

    let stream = pipeline
        .respond(ChatRequest::new("u1", "s1", "I need a laptop"))
        .expect("valid request");
    let (names, data) = wire_names(stream);

    assert_eq!(
        names,
        vec![
            "ack",
            "status",
            "classification_start",
            "ask_message_delta",
            "ask_options_delta",
            "ask_options_delta",
            "tool_complete",
            "ask_plan",
            "ask_phase_start",
            "ask_next",
            "ask_complete",
            "end",
        ]
    );
    assert_eq!(data[0], json!({"session_id": "s1"}));
    assert_eq!(
        data[3],
        json!({"slot_name": "budget", "text": "What's your budget?"})
    );
    assert_eq!(
        data[5]["options"],
        json!(["Under 500", "500-1000", "Above 1000"])
    );
    assert_eq!(data[9]["slot_name"], "budget");
    assert_eq!(data[11], json!({"ok": true}));

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].tool_choice,
        Some(ToolChoice::Tool {
            name: ASSESS_TOOL_NAME.to_string()
        })
    );

    let session = store.get("u1", "s1").unwrap();
    assert_eq!(session.turn_count, 1);
    assert_eq!(session.pending_slots.len(), 1);
    assert_eq!(session.pending_slots[0].slot_name, "budget");
}

#[test]
fn test_simple_response_streams_final_answer() {
    let mock = MockApiClient::new(vec![sse::tool_round(
        ASSESS_TOOL_NAME,
        &[
            r#"{"simple_response":{"message":"H"#,
            r#"i","response_ty"#,
            r#"pe":"final_answer"}}"#,
        ],
    )]);
    let (pipeline, store) = pipeline_with(mock);

    let events: Vec<StreamEvent> = pipeline
        .respond(ChatRequest::new("u1", "s1", "hello"))
        .expect("valid request")
        .collect();

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SimpleResponseDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hi");
    assert!(events.contains(&StreamEvent::FinalAnswerComplete {
        message: "Hi".to_string(),
        response_type: Some("final_answer".to_string()),
    }));
    assert_eq!(events.last(), Some(&StreamEvent::End { ok: true }));

    let session = store.get("u1", "s1").unwrap();
    assert_eq!(session.messages.len(), 2);
    assert!(session.pending_slots.is_empty());
}

#[test]
fn test_connection_drop_mid_payload_completes_tool_then_fails() {
    let mut script: Vec<MockChunk> = vec![
        MockChunk::Sse(sse::message_start("msg_1")),
        MockChunk::Sse(sse::tool_use_start(0, "toolu_1", ASSESS_TOOL_NAME)),
        MockChunk::Sse(sse::input_json_delta(0, r#"{"ask_slots":[{"slot_na"#)),
    ];
    script.push(MockChunk::Fail("connection reset by peer".to_string()));
    let (pipeline, store) = pipeline_with(MockApiClient::with_script(vec![script]));

    let events: Vec<StreamEvent> = pipeline
        .respond(ChatRequest::new("u1", "s1", "laptop"))
        .expect("valid request")
        .collect();

    let complete = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolComplete { input, .. } => Some(input.clone()),
            _ => None,
        })
        .expect("tool_complete is still emitted");
    assert_eq!(complete, json!({}));
    assert!(matches!(&events[events.len() - 2], StreamEvent::Error { message } if message.contains("connection reset")));
    assert_eq!(events.last(), Some(&StreamEvent::End { ok: false }));
    assert_eq!(events.iter().filter(|e| e.is_end()).count(), 1);

    assert_eq!(store.get("u1", "s1").unwrap().turn_count, 0);
}

#[test]
fn test_clean_eof_mid_payload_is_degraded_not_failed() {
    let script = vec![
        sse::message_start("msg_1"),
        sse::tool_use_start(0, "toolu_1", ASSESS_TOOL_NAME),
        sse::input_json_delta(0, r#"{"simple_response":{"message":"Sure, here"#),
    ];
    let (pipeline, store) = pipeline_with(MockApiClient::new(vec![script]));

    let (names, data) = wire_names(
        pipeline
            .respond(ChatRequest::new("u1", "s1", "laptop"))
            .expect("valid request"),
    );

    assert_eq!(
        names,
        vec![
            "ack",
            "status",
            "classification_start",
            "final_answer.delta",
            "tool_complete",
            "final_answer.complete",
            "end"
        ]
    );
    assert_eq!(data[3]["delta"], "Sure, here");
    assert_eq!(data[4]["input"], json!({}));
    assert_eq!(data[5]["message"], "Sure, here");
    assert_eq!(data[6], json!({"ok": true}));

    let session = store.get("u1", "s1").unwrap();
    assert_eq!(session.turn_count, 1);
    assert_eq!(session.messages.len(), 2);
}

#[test]
fn test_clean_eof_mid_slots_closes_ask_phase_with_streamed_questions() {
    let script = vec![
        sse::message_start("msg_1"),
        sse::tool_use_start(0, "toolu_1", ASSESS_TOOL_NAME),
        sse::input_json_delta(
            0,
            r#"{"ask_slots":[{"slot_name":"budget","message":"What's your budget?","#,
        ),
        sse::input_json_delta(0, r#""options":["Under 500","500-1000""#),
    ];
    let (pipeline, store) = pipeline_with(MockApiClient::new(vec![script]));

    let (names, data) = wire_names(
        pipeline
            .respond(ChatRequest::new("u1", "s1", "laptop"))
            .expect("valid request"),
    );

    assert_eq!(
        names,
        vec![
            "ack",
            "status",
            "classification_start",
            "ask_message_delta",
            "ask_options_delta",
            "tool_complete",
            "ask_plan",
            "ask_phase_start",
            "ask_next",
            "ask_complete",
            "end"
        ]
    );
    assert_eq!(data[8]["slot_name"], "budget");
    assert_eq!(data[8]["message"], "What's your budget?");
    assert_eq!(data[8]["options"], json!(["Under 500", "500-1000"]));
    assert_eq!(data[10], json!({"ok": true}));

    let session = store.get("u1", "s1").unwrap();
    assert_eq!(session.pending_slots.len(), 1);
    assert_eq!(session.pending_slots[0].message, "What's your budget?");
}

#[test]
fn test_simple_response_tail_reaches_client_after_slot_events() {
    let mock = MockApiClient::new(vec![sse::tool_round(
        ASSESS_TOOL_NAME,
        &[
            r#"{"simple_response":{"message":"Hel"#,
            r#"lo there"},"ask_slots":[{"slot_name":"a","message":"Which one?"}]}"#,
        ],
    )]);
    let (pipeline, _) = pipeline_with(mock);

    let events: Vec<StreamEvent> = pipeline
        .respond(ChatRequest::new("u1", "s1", "hello"))
        .expect("valid request")
        .collect();

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SimpleResponseDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello there");
    let tail = events
        .iter()
        .position(|e| matches!(e, StreamEvent::SimpleResponseDelta { text, .. } if text == "lo there"))
        .expect("tail delta");
    let complete = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolComplete { .. }))
        .expect("tool_complete");
    assert!(tail < complete);
}

#[test]
fn test_text_turn_relays_deltas() {
    let mock = MockApiClient::new(vec![sse::text_round(&["Good ", "morning"])]);
    let (pipeline, store) = pipeline_with(mock);

    let (names, data) = wire_names(
        pipeline
            .respond_text(ChatRequest::new("u1", "s1", "greet me"))
            .expect("valid request"),
    );
    assert_eq!(
        names,
        vec![
            "ack",
            "final_answer.delta",
            "final_answer.delta",
            "final_answer.complete",
            "end"
        ]
    );
    assert_eq!(data[1], json!({"delta": "Good "}));
    assert_eq!(data[3]["message"], "Good morning");
    assert_eq!(store.get("u1", "s1").unwrap().turn_count, 1);
}

#[test]
fn test_invalid_request_never_starts_a_stream() {
    let mock = MockApiClient::new(vec![]);
    let (pipeline, _) = pipeline_with(mock.clone());

    let err = pipeline
        .respond(ChatRequest::new("u1", "s1", "   "))
        .err()
        .expect("blank message is rejected");
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert!(mock.requests().is_empty());
}

#[test]
fn test_history_is_sent_on_the_next_turn() {
    let mock = MockApiClient::new(vec![
        sse::tool_round(
            ASSESS_TOOL_NAME,
            &[r#"{"simple_response":{"message":"Hello!","response_type":"greeting"}}"#],
        ),
        sse::tool_round(
            ASSESS_TOOL_NAME,
            &[r#"{"simple_response":{"message":"Bye!","response_type":"greeting"}}"#],
        ),
    ]);
    let (pipeline, _) = pipeline_with(mock.clone());

    for message in ["hi", "bye"] {
        let ended = pipeline
            .respond(ChatRequest::new("u1", "s1", message))
            .expect("valid request")
            .last();
        assert_eq!(ended, Some(StreamEvent::End { ok: true }));
    }

    let requests = mock.requests();
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[1].messages.len(), 3);
}
