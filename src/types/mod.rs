pub mod api;

pub use api::{
    ApiErrorBody, ApiMessage, Content, ContentBlock, Delta, MessageDelta, MessageStartData,
    ToolChoice, ToolDefinition, UpstreamEvent, UpstreamRequest,
};
