//! LLM 层：推理协作方的客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod json;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use json::{extract_json, JsonExtract};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{render_prompt, LlmClient, TokenStream};
