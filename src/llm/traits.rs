//! LLM 客户端抽象
//!
//! 生成式模型服务被视为黑盒，LlmClient 只暴露三种调用：
//! exchange（编排回合：system + 工具 schema + 对话 → 推理文本 / 工具调用 / 续接令牌）、
//! complete（工具内部的文本或多模态补全）、generate_image（图像生成）。
//! 每个请求都携带显式超时，不依赖远端默认值。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::RetryHint;
use crate::memory::Message;
use crate::tools::ToolSpec;

/// 远端模型服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// 网络 / 超时 / 429 / 5xx 视为瞬时故障，可退避重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::Transport(_)
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
        )
    }
}

impl RetryHint for LlmError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// 模型发出的一次工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// 模型的一个回合：可选推理文本 + 零到多个工具调用 + 可选续接令牌
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// 不透明令牌，必须原样保留在收到它的那条消息上
    pub continuation: Option<String>,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn call(name: impl Into<String>, args: Value) -> Self {
        Self::default().with_call(name, args)
    }

    pub fn with_call(mut self, name: impl Into<String>, args: Value) -> Self {
        self.tool_calls.push(ToolCallRequest::new(name, args));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }
}

/// 编排回合请求
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<Message>,
    pub timeout: Duration,
}

/// 工具内部补全的用途（后端可据此选择输出格式，Mock 据此返回固定内容）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionPurpose {
    StyleExtraction,
    Validation,
    Refinement,
    Search,
}

/// 随补全请求发送的图片（借用输入素材或当前产物，不复制）
#[derive(Debug, Clone, Copy)]
pub struct ImageInput<'a> {
    pub mime_type: &'a str,
    pub data: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub purpose: CompletionPurpose,
    pub prompt: String,
    pub images: Vec<ImageInput<'a>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ImageRequest<'a> {
    pub prompt: String,
    pub references: Vec<ImageInput<'a>>,
    pub timeout: Duration,
}

/// 生成的图片
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 编排回合交换
    async fn exchange(&self, request: &TurnRequest) -> Result<ModelTurn, LlmError>;

    /// 文本 / 多模态补全，返回原始文本（结构化输出由调用方归一化）
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError>;

    /// 图像生成
    async fn generate_image(&self, request: &ImageRequest<'_>) -> Result<GeneratedImage, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
