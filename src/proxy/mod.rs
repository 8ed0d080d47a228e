//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts
//! requests and relays them to the selected upstream provider.

mod handlers;
pub mod recorder;
mod server;
pub mod stream;
pub mod types;

pub use recorder::TrafficRecorder;
pub use server::{create_router, run_server, AppState};
pub use types::{normalize_for_copilot, ChatCompletionRequest, Message, MessageContent};
