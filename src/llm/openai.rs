//! OpenAI 兼容 API 客户端
//!
//! 通过 reqwest 直接调用任意 OpenAI 兼容端点（可配置 base_url）：chat/completions（带 tools）与 images/generations。
//! 续接令牌（extra_content.google.thought_signature）可能挂在 assistant 消息本身或某个 tool_call 上。
//! 收到时连同位置一起记入 ModelTurn.continuation，重发时放回原来的位置，不移动。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::{
    CompletionPurpose, CompletionRequest, GeneratedImage, ImageInput, ImageRequest, LlmClient,
    LlmError, ModelTurn, ToolCallRequest, TurnRequest,
};
use crate::memory::{Message, Part, Role};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    image_model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, image_model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());
        Self {
            http: Client::new(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            image_model: image_model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    async fn post(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value, LlmError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let message = response.text().await.unwrap_or_default();
            return Err(map_status(status, message, retry_after_ms));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if let Some(usage) = value.get("usage") {
            let read = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0);
            self.usage.add(read("prompt_tokens"), read("completion_tokens"));
        }
        Ok(value)
    }
}

fn map_transport(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(e.to_string())
    }
}

fn map_status(status: StatusCode, message: String, retry_after_ms: Option<u64>) -> LlmError {
    let message: String = message.chars().take(500).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited { retry_after_ms }
    } else if status.is_server_error() {
        LlmError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        LlmError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn thought_signature(token: &str) -> Value {
    json!({ "google": { "thought_signature": token } })
}

/// 一条 assistant 消息上的全部签名及其位置；序列化后作为不透明的续接令牌
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PlacedSignatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    /// (tool_call 下标, 签名)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    calls: Vec<(usize, String)>,
}

impl PlacedSignatures {
    fn is_empty(&self) -> bool {
        self.message.is_none() && self.calls.is_empty()
    }

    fn encode(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        serde_json::to_string(self).ok()
    }

    /// 无法识别的令牌（例如其它客户端记录的历史）放在第一个 tool_call 上，没有调用时放在消息上
    fn decode(token: &str, has_calls: bool) -> Self {
        match serde_json::from_str::<PlacedSignatures>(token) {
            Ok(placed) if !placed.is_empty() => placed,
            _ if has_calls => Self {
                message: None,
                calls: vec![(0, token.to_string())],
            },
            _ => Self {
                message: Some(token.to_string()),
                calls: Vec::new(),
            },
        }
    }
}

/// 对话 → chat/completions messages
fn to_wire_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = vec![json!({ "role": "system", "content": system })];
    for msg in messages {
        match msg.role {
            Role::User => out.push(json!({ "role": "user", "content": msg.text() })),
            Role::Model => {
                let text = msg.text();
                let mut calls: Vec<Value> = msg
                    .tool_calls()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.args.to_string() }
                        })
                    })
                    .collect();
                let content = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                let mut wire = json!({ "role": "assistant", "content": content });
                if let Some(token) = &msg.continuation {
                    let placed = PlacedSignatures::decode(token, !calls.is_empty());
                    if let Some(sig) = &placed.message {
                        wire["extra_content"] = thought_signature(sig);
                    }
                    for (index, sig) in &placed.calls {
                        match calls.get_mut(*index) {
                            Some(call) => call["extra_content"] = thought_signature(sig),
                            None => tracing::warn!(index, "continuation token refers to a missing tool call"),
                        }
                    }
                }
                if !calls.is_empty() {
                    wire["tool_calls"] = Value::Array(calls);
                }
                out.push(wire);
            }
            Role::Tool => {
                for part in &msg.parts {
                    if let Part::ToolResult { call_id, content, .. } = part {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": content.to_string(),
                        }));
                    }
                }
            }
        }
    }
    out
}

fn signature_of(v: &Value) -> Option<String> {
    v.pointer("/extra_content/google/thought_signature")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// chat/completions 响应 → ModelTurn
fn parse_turn(response: &Value) -> Result<ModelTurn, LlmError> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

    let text = ["reasoning_content", "content"]
        .iter()
        .filter_map(|k| message.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let raw_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut placed = PlacedSignatures {
        message: signature_of(message),
        calls: Vec::new(),
    };
    let mut tool_calls = Vec::with_capacity(raw_calls.len());
    for call in &raw_calls {
        let Some(name) = call.pointer("/function/name").and_then(Value::as_str) else {
            continue;
        };
        if let Some(sig) = signature_of(call) {
            placed.calls.push((tool_calls.len(), sig));
        }
        let raw_args = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        // 无法解析的参数原样交给 schema 校验，由模型自行修正
        let args = serde_json::from_str(raw_args).unwrap_or_else(|_| Value::String(raw_args.to_string()));
        let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
        tool_calls.push(ToolCallRequest::new(name, args).with_id(id));
    }

    Ok(ModelTurn {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        continuation: placed.encode(),
    })
}

fn data_url(image: &ImageInput<'_>) -> String {
    format!("data:{};base64,{}", image.mime_type, STANDARD.encode(image.data))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn exchange(&self, request: &TurnRequest) -> Result<ModelTurn, LlmError> {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        let body = json!({
            "model": self.model,
            "messages": to_wire_messages(&request.system, &request.messages),
            "tools": tools,
            "parallel_tool_calls": true,
        });
        let response = self.post("chat/completions", &body, request.timeout).await?;
        parse_turn(&response)
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        content.extend(
            request
                .images
                .iter()
                .map(|img| json!({ "type": "image_url", "image_url": { "url": data_url(img) } })),
        );
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
        });
        if matches!(
            request.purpose,
            CompletionPurpose::StyleExtraction | CompletionPurpose::Validation
        ) {
            body["response_format"] = json!({ "type": "json_object" });
        }
        let response = self.post("chat/completions", &body, request.timeout).await?;
        response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("completion has no content".to_string()))
    }

    async fn generate_image(&self, request: &ImageRequest<'_>) -> Result<GeneratedImage, LlmError> {
        if !request.references.is_empty() {
            tracing::debug!(
                references = request.references.len(),
                "images/generations does not take reference images; sending prompt only"
            );
        }
        let body = json!({
            "model": self.image_model,
            "prompt": request.prompt,
            "n": 1,
        });
        let response = self.post("images/generations", &body, request.timeout).await?;
        let encoded = response
            .pointer("/data/0/b64_json")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::InvalidResponse("image response has no b64_json".to_string()))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| LlmError::InvalidResponse(format!("invalid base64 image: {e}")))?;
        Ok(GeneratedImage {
            mime_type: "image/png".to_string(),
            data,
        })
    }
}
