//! Streaming response pipeline: upstream events in, client events out.

pub mod accumulator;
pub mod bridge;
pub mod event;
pub mod framer;
mod scan;
pub mod text;
pub mod upstream;

pub use accumulator::{AccumulatorState, CompletedToolCall, SlotEmitState, ToolStreamAccumulator};
pub use bridge::{Completion, EventSink, RelayConsumer, RelayItem, RelayKind, StreamBridge};
pub use event::{AskSlot, StreamEvent, MAX_SLOT_OPTIONS};
pub use framer::{frame, write_frames, Frame};
pub use text::TextStreamer;
pub use upstream::{drive, UpstreamOutcome};
