//! Mock LLM 客户端（用于测试与无 API Key 运行）
//!
//! - MockLlmClient：固定返回不含 JSON 的文本，所有调用方都会走规则降级路径
//! - ScriptedLlmClient：按顺序返回预置回复，便于测试各组件对 LLM 输出的处理

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, Message, Role, TokenStream, TokenUsage};

/// Mock 客户端：不做推理，流式接口直接报错
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        Ok("MOCK: reasoning service not configured".to_string())
    }

    async fn complete_stream(&self, _messages: &[Message]) -> Result<TokenStream, String> {
        Err("mock client does not stream".to_string())
    }
}

/// 脚本化客户端：每次调用弹出一条预置回复，脚本耗尽后返回错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    cost: (u64, u64),
    usage: TokenUsage,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
            cost: (0, 0),
            usage: TokenUsage::new(),
        }
    }

    /// 每次成功调用计入固定的 (prompt, completion) token 数
    pub fn with_token_cost(mut self, prompt: u64, completion: u64) -> Self {
        self.cost = (prompt, completion);
        self
    }

    /// 追加一次失败的调用
    pub fn push_error(&self, error: impl Into<String>) {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(error.into()));
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner).push_back(Ok(reply.into()));
    }

    /// 已收到的 user 消息内容（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, String> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).push(prompt);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()));
        if reply.is_ok() {
            self.usage.add(self.cost.0, self.cost.1);
        }
        reply
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.next_reply(messages)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let reply = self.next_reply(messages)?;
        let tokens: Vec<Result<String, String>> = reply
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let llm = ScriptedLlmClient::new(["first", "second"]);
        assert_eq!(llm.complete(&[Message::user("a")]).await.unwrap(), "first");
        assert_eq!(llm.complete(&[Message::user("b")]).await.unwrap(), "second");
        assert!(llm.complete(&[Message::user("c")]).await.is_err());
        assert_eq!(llm.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_scripted_stream_tokens() {
        let llm = ScriptedLlmClient::new(["hello pipeline world"]);
        let stream = llm.complete_stream(&[Message::user("x")]).await.unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["hello ", "pipeline ", "world"]);
    }
}
