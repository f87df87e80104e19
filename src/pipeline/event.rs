use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Most choices a single slot question may carry.
pub const MAX_SLOT_OPTIONS: usize = 3;

/// One question the assessment step wants answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskSlot {
    pub slot_name: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl AskSlot {
    /// Reads `ask_slots` out of a parsed assessment payload, sorted by `order`.
    ///
    /// Entries without a `slot_name` are dropped; options beyond
    /// [`MAX_SLOT_OPTIONS`] are cut.
    pub fn from_payload(input: &Value) -> Vec<AskSlot> {
        let Some(entries) = input.get("ask_slots").and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut slots: Vec<AskSlot> = entries
            .iter()
            .filter_map(|entry| serde_json::from_value::<AskSlot>(entry.clone()).ok())
            .filter(|slot| !slot.slot_name.trim().is_empty())
            .map(|mut slot| {
                slot.options.truncate(MAX_SLOT_OPTIONS);
                slot
            })
            .collect();
        slots.sort_by_key(|slot| slot.order);
        slots
    }
}

/// Everything the pipeline can surface to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ack {
        session_id: String,
    },
    Status {
        message: String,
    },
    ClassificationStart {
        tool_name: String,
    },
    ToolStart {
        tool_name: String,
        tool_id: Option<String>,
    },
    /// `slot_name` is `None` for messages found without slot structure.
    AskMessageDelta {
        slot_name: Option<String>,
        text: String,
    },
    /// Always the full list seen so far, never just the new entries.
    AskOptionsDelta {
        slot_name: String,
        options: Vec<String>,
    },
    AskPlan {
        slots: Vec<AskSlot>,
    },
    AskPhaseStart {
        total_slots: usize,
    },
    AskNext {
        slot_name: String,
        message: String,
        options: Vec<String>,
    },
    AskComplete {
        slot_count: usize,
    },
    /// Only the newly generated suffix of `simple_response.message`.
    SimpleResponseDelta {
        text: String,
        total_length: usize,
    },
    ToolComplete {
        tool_name: String,
        tool_id: Option<String>,
        input: Value,
        pending_options: BTreeMap<String, Vec<String>>,
    },
    TextDelta {
        text: String,
    },
    FinalAnswerComplete {
        message: String,
        response_type: Option<String>,
    },
    Heartbeat {
        ts: i64,
    },
    Error {
        message: String,
    },
    End {
        ok: bool,
    },
}

impl StreamEvent {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamEvent::End { .. })
    }
}
