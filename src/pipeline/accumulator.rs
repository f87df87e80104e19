use super::event::{AskSlot, StreamEvent, MAX_SLOT_OPTIONS};
use super::scan::{self, MemberIndex};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{ContentBlock, UpstreamEvent};
use crate::util::floor_char_boundary;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

/// Bytes re-scanned behind the cursor so a key split across deltas is still found.
const KEY_LOOKBACK: usize = 32;
/// Shortest bare `message` value worth surfacing without slot structure.
const FALLBACK_MIN_CHARS: usize = 10;
/// Decoded length an unterminated simple response must reach before it streams.
const SIMPLE_RESPONSE_MIN_CHARS: usize = 3;

static SLOT_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:slot_name|ask_slots)"\s*:"#).expect("slot key pattern is valid")
});
static MESSAGE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""message"\s*:\s*""#).expect("message key pattern is valid"));

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotEmitState {
    pub message_emitted: bool,
    pub options_emitted: bool,
}

/// Everything known about the tool call currently streaming in.
#[derive(Debug, Default)]
pub struct AccumulatorState {
    tool_name: String,
    tool_id: Option<String>,
    block_index: usize,
    input_buffer: String,
    complete_input: Option<Value>,
    parse_error: Option<PipelineError>,
    emitted_texts: HashSet<String>,
    last_scan_position: usize,
    slot_emit_state: HashMap<String, SlotEmitState>,
    slot_seen_options: HashMap<String, Vec<String>>,
    simple_response_emitted_length: usize,

    root: MemberIndex,
    saw_slot_structure: bool,
    slots_resume: Option<usize>,
    fallback_resume: Option<usize>,
    simple_response: Option<SimpleResponseCursor>,
}

/// Decode progress through `simple_response.message`.
#[derive(Debug)]
struct SimpleResponseCursor {
    quote: usize,
    raw_position: usize,
    decoded: String,
    decoded_chars: usize,
    closed: bool,
}

impl AccumulatorState {
    fn new(tool_name: String, tool_id: Option<String>, block_index: usize) -> Self {
        Self {
            tool_name,
            tool_id,
            block_index,
            ..Self::default()
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn input_buffer(&self) -> &str {
        &self.input_buffer
    }

    /// The parsed payload; `None` until the block has ended.
    pub fn complete_input(&self) -> Option<&Value> {
        self.complete_input.as_ref()
    }

    /// Set when the finished buffer did not parse and `{}` was substituted.
    pub fn parse_error(&self) -> Option<&PipelineError> {
        self.parse_error.as_ref()
    }

    pub fn slot_state(&self, slot_name: &str) -> SlotEmitState {
        self.slot_emit_state
            .get(slot_name)
            .copied()
            .unwrap_or_default()
    }

    fn append(&mut self, fragment: &str) -> PipelineResult<Option<StreamEvent>> {
        self.input_buffer.push_str(fragment);

        let buffer = std::mem::take(&mut self.input_buffer);
        self.fallback_resume = None;
        let outcome = self.extract(&buffer);
        self.last_scan_position = self.fallback_resume.unwrap_or(buffer.len());
        self.input_buffer = buffer;
        outcome
    }

    fn extract(&mut self, buf: &str) -> PipelineResult<Option<StreamEvent>> {
        let window_start =
            floor_char_boundary(buf, self.last_scan_position.saturating_sub(KEY_LOOKBACK));
        if !self.saw_slot_structure && SLOT_KEY_RE.is_match(&buf[window_start..]) {
            self.saw_slot_structure = true;
        }

        let root = scan::skip_ws(buf.as_bytes(), 0);
        match buf.as_bytes().get(root) {
            None => return Ok(None),
            Some(b'{') => self.root.update(buf, root)?,
            Some(other) => {
                return Err(PipelineError::extraction(format!(
                    "tool input starts with '{}' instead of an object",
                    *other as char
                )))
            }
        }

        if let Some(event) = self.extract_slots(buf)? {
            return Ok(Some(event));
        }
        self.locate_simple_response(buf)?;
        if !self.saw_slot_structure {
            if let Some(event) = self.extract_fallback_message(buf, window_start)? {
                return Ok(Some(event));
            }
        }
        self.extract_simple_response(buf, false)
    }

    fn extract_slots(&mut self, buf: &str) -> PipelineResult<Option<StreamEvent>> {
        let Some(array_start) = self.root.get("ask_slots") else {
            return Ok(None);
        };
        self.saw_slot_structure = true;
        if buf.as_bytes()[array_start] != b'[' {
            return Err(PipelineError::extraction("ask_slots is not an array"));
        }

        let from = self.slots_resume.unwrap_or(array_start + 1);
        let mut prefix_resolved = true;
        for element in scan::array_elements(buf, from)?.elements {
            if buf.as_bytes()[element.start] != b'{' {
                if prefix_resolved && element.end.is_some() {
                    self.slots_resume = element.end;
                }
                continue;
            }

            let Some(slot_name) = scan::find_member(buf, element.start, "slot_name")?
                .filter(|at| buf.as_bytes()[*at] == b'"')
                .map(|at| scan::read_string(buf, at))
                .transpose()?
                .filter(|name| name.closed)
                .map(|name| name.text)
            else {
                prefix_resolved = false;
                continue;
            };

            let emit_state = self.slot_emit_state.entry(slot_name.clone()).or_default();

            if !emit_state.message_emitted {
                let message = match scan::find_member(buf, element.start, "message")? {
                    Some(at) if buf.as_bytes()[at] == b'"' => Some(scan::read_string(buf, at)?),
                    _ => None,
                };
                if let Some(message) = message.filter(|m| m.closed) {
                    emit_state.message_emitted = true;
                    return Ok(Some(StreamEvent::AskMessageDelta {
                        slot_name: Some(slot_name),
                        text: message.text,
                    }));
                }
            }

            if !emit_state.options_emitted {
                let options = match scan::find_member(buf, element.start, "options")? {
                    Some(at) if buf.as_bytes()[at] == b'[' => {
                        Some(scan::read_string_array(buf, at)?)
                    }
                    _ => None,
                };
                if let Some((mut options, closed)) = options {
                    options.truncate(MAX_SLOT_OPTIONS);
                    if closed {
                        emit_state.options_emitted = true;
                    }
                    let seen = self.slot_seen_options.entry(slot_name.clone()).or_default();
                    if options.len() > seen.len() {
                        seen.clone_from(&options);
                        return Ok(Some(StreamEvent::AskOptionsDelta { slot_name, options }));
                    }
                }
            }

            let resolved = emit_state.message_emitted && emit_state.options_emitted;
            if prefix_resolved && resolved && element.end.is_some() {
                self.slots_resume = element.end;
            } else {
                prefix_resolved = false;
            }
        }
        Ok(None)
    }

    fn locate_simple_response(&mut self, buf: &str) -> PipelineResult<()> {
        if self.simple_response.is_some() {
            return Ok(());
        }
        let Some(object) = self.root.get("simple_response") else {
            return Ok(());
        };
        if buf.as_bytes()[object] != b'{' {
            return Ok(());
        }
        if let Some(quote) = scan::find_member(buf, object, "message")? {
            if buf.as_bytes()[quote] == b'"' {
                self.simple_response = Some(SimpleResponseCursor {
                    quote,
                    raw_position: quote + 1,
                    decoded: String::new(),
                    decoded_chars: 0,
                    closed: false,
                });
            }
        }
        Ok(())
    }

    fn extract_fallback_message(
        &mut self,
        buf: &str,
        window_start: usize,
    ) -> PipelineResult<Option<StreamEvent>> {
        let simple_quote = self.simple_response.as_ref().map(|cursor| cursor.quote);
        for found in MESSAGE_KEY_RE.find_iter(&buf[window_start..]) {
            let quote = window_start + found.end() - 1;
            if Some(quote) == simple_quote {
                continue;
            }
            let value = scan::read_string(buf, quote)?;
            if !value.closed {
                self.fallback_resume = Some(window_start + found.start());
                break;
            }
            if value.text.chars().count() >= FALLBACK_MIN_CHARS
                && self.emitted_texts.insert(value.text.clone())
            {
                self.fallback_resume = Some(value.end);
                return Ok(Some(StreamEvent::AskMessageDelta {
                    slot_name: None,
                    text: value.text,
                }));
            }
        }
        Ok(None)
    }

    /// With `flush` set, whatever is decoded goes out regardless of length.
    fn extract_simple_response(
        &mut self,
        buf: &str,
        flush: bool,
    ) -> PipelineResult<Option<StreamEvent>> {
        let Some(cursor) = self.simple_response.as_mut() else {
            return Ok(None);
        };
        if !cursor.closed {
            let tail = scan::decode_from(buf, cursor.raw_position)?;
            cursor.decoded_chars += tail.text.chars().count();
            cursor.decoded.push_str(&tail.text);
            cursor.raw_position = tail.end;
            cursor.closed = tail.closed;
        }

        let emitted = self.simple_response_emitted_length;
        if cursor.decoded.len() <= emitted {
            return Ok(None);
        }
        if !flush && !cursor.closed && cursor.decoded_chars < SIMPLE_RESPONSE_MIN_CHARS {
            return Ok(None);
        }

        self.simple_response_emitted_length = cursor.decoded.len();
        Ok(Some(StreamEvent::SimpleResponseDelta {
            text: cursor.decoded[emitted..].to_string(),
            total_length: cursor.decoded_chars,
        }))
    }

    /// Simple-response text still held back when the block ends, either
    /// because a slot event took the last delta or the string never reached
    /// the streaming threshold.
    fn flush_simple_response(&mut self) -> Option<StreamEvent> {
        let buffer = std::mem::take(&mut self.input_buffer);
        let outcome = self
            .locate_simple_response(&buffer)
            .and_then(|()| self.extract_simple_response(&buffer, true));
        self.input_buffer = buffer;
        match outcome {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(
                    tool_name = %self.tool_name,
                    %error,
                    "simple response flush failed"
                );
                None
            }
        }
    }

    /// Parses the finished buffer and builds the block's `ToolComplete`.
    fn complete(&mut self) -> StreamEvent {
        let input = if self.input_buffer.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<Value>(&self.input_buffer) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(
                        tool_name = %self.tool_name,
                        buffer_len = self.input_buffer.len(),
                        error = %error,
                        "tool input did not parse; continuing with an empty object"
                    );
                    self.parse_error = Some(PipelineError::PayloadParse(error.to_string()));
                    Value::Object(serde_json::Map::new())
                }
            }
        };

        let pending_options = self.pending_options(&input);
        self.complete_input = Some(input.clone());
        StreamEvent::ToolComplete {
            tool_name: self.tool_name.clone(),
            tool_id: self.tool_id.clone(),
            input,
            pending_options,
        }
    }

    /// Slots whose option lists were never fully streamed.
    fn pending_options(&self, input: &Value) -> BTreeMap<String, Vec<String>> {
        AskSlot::from_payload(input)
            .into_iter()
            .filter(|slot| {
                !slot.options.is_empty() && !self.slot_state(&slot.slot_name).options_emitted
            })
            .map(|slot| (slot.slot_name, slot.options))
            .collect()
    }
}

/// A tool block that has ended, as the upstream driver reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub tool_name: String,
    pub tool_id: Option<String>,
    pub input: Value,
    pub parse_error: Option<PipelineError>,
}

/// Turns raw upstream events for tool-use blocks into client-facing events.
///
/// One instance serves one request. At most one event comes out per upstream
/// event; malformed input is logged and yields nothing. Simple-response text
/// still held back when a block ends comes out of [`flush`](Self::flush),
/// which the caller runs right before the block's stop.
#[derive(Debug, Default)]
pub struct ToolStreamAccumulator {
    state: Option<AccumulatorState>,
    in_tool_block: bool,
    completed: Vec<CompletedToolCall>,
}

impl ToolStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<&AccumulatorState> {
        self.state.as_ref()
    }

    pub fn in_tool_block(&self) -> bool {
        self.in_tool_block
    }

    /// Index of the tool block currently streaming, if any.
    pub fn open_block(&self) -> Option<usize> {
        self.state
            .as_ref()
            .filter(|_| self.in_tool_block)
            .map(|state| state.block_index)
    }

    pub fn completed(&self) -> &[CompletedToolCall] {
        &self.completed
    }

    pub fn process(&mut self, event: &UpstreamEvent) -> Option<StreamEvent> {
        match event {
            UpstreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, .. },
            } => {
                if self.in_tool_block {
                    tracing::warn!(index, "tool block started before the previous one stopped");
                    self.complete_current();
                }
                let tool_id = Some(id.clone()).filter(|id| !id.is_empty());
                self.state = Some(AccumulatorState::new(name.clone(), tool_id.clone(), *index));
                self.in_tool_block = true;
                Some(StreamEvent::ToolStart {
                    tool_name: name.clone(),
                    tool_id,
                })
            }
            UpstreamEvent::ContentBlockStart { .. } => {
                self.in_tool_block = false;
                None
            }
            UpstreamEvent::ContentBlockDelta { index, delta } if self.in_tool_block => {
                let state = self.state.as_mut()?;
                if *index != state.block_index {
                    return None;
                }
                let fragment = delta.partial_json.as_deref().filter(|f| !f.is_empty())?;
                match state.append(fragment) {
                    Ok(event) => event,
                    Err(error) => {
                        tracing::warn!(
                            tool_name = %state.tool_name,
                            buffer_len = state.input_buffer.len(),
                            %error,
                            "extraction step failed"
                        );
                        None
                    }
                }
            }
            UpstreamEvent::ContentBlockStop { index } if self.in_tool_block => {
                if self.open_block() != Some(*index) {
                    return None;
                }
                self.complete_current()
            }
            _ => None,
        }
    }

    /// Decoded `simple_response.message` text of the open block that has not
    /// gone out yet, regardless of the streaming threshold.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        if !self.in_tool_block {
            return None;
        }
        self.state.as_mut()?.flush_simple_response()
    }

    /// Closes a tool block the upstream never stopped, as when the stream is cut.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if !self.in_tool_block {
            return None;
        }
        if let Some(state) = &self.state {
            tracing::warn!(
                tool_name = %state.tool_name,
                buffer_len = state.input_buffer.len(),
                "upstream ended inside a tool block"
            );
        }
        self.complete_current()
    }

    fn complete_current(&mut self) -> Option<StreamEvent> {
        self.in_tool_block = false;
        let state = self.state.as_mut()?;
        let event = state.complete();
        self.completed.push(CompletedToolCall {
            tool_name: state.tool_name.clone(),
            tool_id: state.tool_id.clone(),
            input: state.complete_input.clone().unwrap_or_default(),
            parse_error: state.parse_error.clone(),
        });
        Some(event)
    }
}
