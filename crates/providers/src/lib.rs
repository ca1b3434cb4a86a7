//! LLM provider adapters. The rest of the workspace sees one uniform
//! contract: [`LlmProvider::chat_stream`] yields a stream of
//! [`dg_domain::stream::StreamEvent`]s; [`LlmProvider::chat`] collects a
//! full response (used by background title generation).

pub mod openai_compat;
pub mod registry;
mod sse;
pub mod traits;
mod util;

pub use openai_compat::OpenAiCompatProvider;
pub use registry::{ModelEndpoint, ProviderRegistry};
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
