use super::event::StreamEvent;
use serde_json::{json, Value};
use std::io::{self, Write};

/// One server-sent event ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: &'static str,
    pub data: Value,
}

impl Frame {
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Maps each [`StreamEvent`] onto its wire name and payload.
pub fn frame(event: &StreamEvent) -> Frame {
    let (name, data) = match event {
        StreamEvent::Ack { session_id } => ("ack", json!({ "session_id": session_id })),
        StreamEvent::Status { message } => ("status", json!({ "message": message })),
        StreamEvent::ClassificationStart { tool_name } => {
            ("classification_start", json!({ "tool_name": tool_name }))
        }
        StreamEvent::ToolStart { tool_name, tool_id } => (
            "tool_start",
            json!({ "tool_name": tool_name, "tool_id": tool_id }),
        ),
        StreamEvent::AskMessageDelta { slot_name, text } => (
            "ask_message_delta",
            json!({ "slot_name": slot_name, "text": text }),
        ),
        StreamEvent::AskOptionsDelta { slot_name, options } => (
            "ask_options_delta",
            json!({ "slot_name": slot_name, "options": options }),
        ),
        StreamEvent::AskPlan { slots } => ("ask_plan", json!({ "slots": slots })),
        StreamEvent::AskPhaseStart { total_slots } => {
            ("ask_phase_start", json!({ "total_slots": total_slots }))
        }
        StreamEvent::AskNext {
            slot_name,
            message,
            options,
        } => (
            "ask_next",
            json!({ "slot_name": slot_name, "message": message, "options": options }),
        ),
        StreamEvent::AskComplete { slot_count } => {
            ("ask_complete", json!({ "slot_count": slot_count }))
        }
        StreamEvent::SimpleResponseDelta { text, total_length } => (
            "final_answer.delta",
            json!({ "delta": text, "total_length": total_length }),
        ),
        StreamEvent::TextDelta { text } => ("final_answer.delta", json!({ "delta": text })),
        StreamEvent::ToolComplete {
            tool_name,
            tool_id,
            input,
            pending_options,
        } => (
            "tool_complete",
            json!({
                "tool_name": tool_name,
                "tool_id": tool_id,
                "input": input,
                "pending_options": pending_options,
            }),
        ),
        StreamEvent::FinalAnswerComplete {
            message,
            response_type,
        } => (
            "final_answer.complete",
            json!({ "message": message, "response_type": response_type }),
        ),
        StreamEvent::Heartbeat { ts } => ("heartbeat", json!({ "ts": ts })),
        StreamEvent::Error { message } => ("error", json!({ "message": message })),
        StreamEvent::End { ok } => ("end", json!({ "ok": ok })),
    };
    Frame { event: name, data }
}

/// Writes every frame, flushing after each so clients see it live.
/// Returns the number of frames written.
pub fn write_frames<W, I>(writer: &mut W, frames: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Frame>,
{
    let mut written = 0;
    for frame in frames {
        writer.write_all(frame.to_wire().as_bytes())?;
        writer.flush()?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_wire_format() {
        let wire = frame(&StreamEvent::End { ok: true }).to_wire();
        assert_eq!(wire, "event: end\ndata: {\"ok\":true}\n\n");
    }

    #[test]
    fn test_both_delta_kinds_share_final_answer_delta() {
        let simple = frame(&StreamEvent::SimpleResponseDelta {
            text: "Hi".to_string(),
            total_length: 2,
        });
        let text = frame(&StreamEvent::TextDelta {
            text: "Hi".to_string(),
        });
        assert_eq!(simple.event, "final_answer.delta");
        assert_eq!(text.event, "final_answer.delta");
        assert_eq!(simple.data["delta"], "Hi");
        assert_eq!(text.data, json!({"delta": "Hi"}));
    }

    #[test]
    fn test_ask_payload_shapes() {
        let message = frame(&StreamEvent::AskMessageDelta {
            slot_name: Some("budget".to_string()),
            text: "What's your budget?".to_string(),
        });
        assert_eq!(message.event, "ask_message_delta");
        assert_eq!(
            message.data,
            json!({"slot_name": "budget", "text": "What's your budget?"})
        );

        let fallback = frame(&StreamEvent::AskMessageDelta {
            slot_name: None,
            text: "Let me check that".to_string(),
        });
        assert_eq!(fallback.data["slot_name"], Value::Null);

        let options = frame(&StreamEvent::AskOptionsDelta {
            slot_name: "budget".to_string(),
            options: vec!["Under 500".to_string()],
        });
        assert_eq!(options.event, "ask_options_delta");
        assert_eq!(options.data["options"], json!(["Under 500"]));
    }

    #[test]
    fn test_tool_complete_carries_pending_options() {
        let mut pending = BTreeMap::new();
        pending.insert("color".to_string(), vec!["Red".to_string()]);
        let tool = frame(&StreamEvent::ToolComplete {
            tool_name: "assess_request".to_string(),
            tool_id: None,
            input: json!({}),
            pending_options: pending,
        });
        assert_eq!(tool.event, "tool_complete");
        assert_eq!(tool.data["pending_options"], json!({"color": ["Red"]}));
        assert_eq!(tool.data["tool_id"], Value::Null);
    }

    #[test]
    fn test_write_frames_writes_in_order() {
        let mut out = Vec::new();
        let written = write_frames(
            &mut out,
            [
                StreamEvent::Status {
                    message: "thinking".to_string(),
                },
                StreamEvent::End { ok: false },
            ]
            .iter()
            .map(frame),
        )
        .unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "event: status\ndata: {\"message\":\"thinking\"}\n\nevent: end\ndata: {\"ok\":false}\n\n"
        );
    }
}
