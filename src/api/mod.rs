//! HTTP layer: request/response models, handlers, and SSE streaming.

pub mod handlers;
pub mod models;
pub mod streaming;

pub use handlers::{
    build_router, chat_completions, health_handler, metrics_handler, responses, AppState,
};
pub use models::{
    flatten_content, normalize_messages, ChatCompletionRequest, ChatMessage, IncomingMessage,
    ResponsesRequest, Role, RouterHeaderOptions, Usage,
};
pub use streaming::{buffered_sse_response, passthrough_sse_response, split_chunks};
