//! Language model plumbing

mod client;
pub mod types;

pub use client::OpenAiCompatClient;
pub use types::{
    AiTool, AiToolCall, ChatModel, FinishReason, ModelMessage, ModelRequest, Role, StreamPart,
};
