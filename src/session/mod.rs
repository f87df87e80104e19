//! Request boundary: validation, session memory, and the turns that drive the pipeline.

pub mod request;
pub mod store;
pub mod turn;

pub use request::ChatRequest;
pub use store::{InMemorySessionStore, SessionState, SessionStore};
pub use turn::{assess_tool, ConversationPipeline, ResponseStream, TurnSettings, ASSESS_TOOL_NAME};
