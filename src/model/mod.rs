//! Model gateway: OpenAI-compatible client, message format and response parsing.

mod client;
mod messages;
pub mod response;
mod stream;

pub use client::{Completion, ModelClient, ModelConfig, ModelError, ModelGateway};
pub use messages::{ChatMessage, ContentPart, ImageUrl, MessageRole};
pub use response::{parse_decision, Decision, ResponseParseError};
pub use stream::{sse_chunks, ChunkStream, SseParser};
