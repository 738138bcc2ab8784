//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 回合交换的优先级：自定义回合闭包 → 预置脚本队列 → 自动驾驶。
//! 自动驾驶沿着工具结果里的 next_step（或开场消息里的建议步骤）走完
//! extract → generate → validate → (refine → generate)* → complete。
//! 所有回合请求都会被记录，便于测试检查对话结构。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{
    CompletionPurpose, CompletionRequest, GeneratedImage, ImageRequest, LlmClient, LlmError,
    ModelTurn, TurnRequest,
};
use crate::memory::{goal_of, suggested_step, Message, Part, Role};
use crate::tools::names;

type TurnFn = dyn Fn(&TurnRequest, u32) -> Result<ModelTurn, LlmError> + Send + Sync;
type CompletionFn = dyn Fn(&CompletionRequest<'_>) -> Result<String, LlmError> + Send + Sync;
type ImageFn = dyn Fn(&ImageRequest<'_>) -> Result<GeneratedImage, LlmError> + Send + Sync;
type LatencyFn = dyn Fn(&CompletionRequest<'_>) -> Duration + Send + Sync;

/// 1x1 透明 PNG
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    turn_handler: Option<Box<TurnFn>>,
    script: Mutex<VecDeque<Result<ModelTurn, LlmError>>>,
    completion_handler: Option<Box<CompletionFn>>,
    image_handler: Option<Box<ImageFn>>,
    completion_latency: Option<Box<LatencyFn>>,
    requests: Mutex<Vec<TurnRequest>>,
    finished: Mutex<Vec<String>>,
    turns: AtomicU32,
    images: AtomicU32,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自定义回合：闭包收到请求与回合序号（1 起）
    pub fn with_turns<F>(mut self, f: F) -> Self
    where
        F: Fn(&TurnRequest, u32) -> Result<ModelTurn, LlmError> + Send + Sync + 'static,
    {
        self.turn_handler = Some(Box::new(f));
        self
    }

    /// 预置回合脚本；脚本用完后回到自动驾驶
    pub fn with_script(self, turns: impl IntoIterator<Item = ModelTurn>) -> Self {
        {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script.extend(turns.into_iter().map(Ok));
        }
        self
    }

    pub fn push_error(&self, err: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(err));
    }

    pub fn with_completion<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest<'_>) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        self.completion_handler = Some(Box::new(f));
        self
    }

    pub fn with_image<F>(mut self, f: F) -> Self
    where
        F: Fn(&ImageRequest<'_>) -> Result<GeneratedImage, LlmError> + Send + Sync + 'static,
    {
        self.image_handler = Some(Box::new(f));
        self
    }

    /// 为每次补全注入人工延迟（测试并发完成顺序）
    pub fn with_completion_latency<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest<'_>) -> Duration + Send + Sync + 'static,
    {
        self.completion_latency = Some(Box::new(f));
        self
    }

    /// 已收到的全部回合请求
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn turn_count(&self) -> u32 {
        self.turns.load(Ordering::SeqCst)
    }

    pub fn image_count(&self) -> u32 {
        self.images.load(Ordering::SeqCst)
    }

    /// 补全请求的 prompt，按完成顺序
    pub fn finished_completions(&self) -> Vec<String> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// 自动驾驶：根据最后一条消息决定下一步
fn autopilot(request: &TurnRequest, turn: u32) -> ModelTurn {
    let messages = &request.messages;
    let step = match messages.last() {
        Some(last) if last.role == Role::Tool => latest_next_step(last),
        Some(last) => suggested_step(&last.text()),
        None => None,
    };
    let Some(step) = step else {
        return ModelTurn::text("Nothing left to do.").with_continuation(format!("mock-{turn}"));
    };

    let args = match step.as_str() {
        names::GENERATE_IMAGE => {
            let prompt = latest_result_field(messages, "revised_prompt")
                .and_then(|v| v.as_str().map(str::to_string))
                .or_else(|| goal_of(messages))
                .unwrap_or_else(|| "An on-brand marketing image".to_string());
            json!({ "prompt": prompt })
        }
        names::COMPLETE => {
            let passed = latest_result_field(messages, "passed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let message = if passed {
                "Generated an on-style image that passed validation."
            } else {
                "Stopping without a passing image."
            };
            json!({ "success": passed, "message": message, "artifact": "[generated image]" })
        }
        names::EXTRACT_STYLE | names::VALIDATE_COMPLIANCE | names::REFINE_PROMPT => json!({}),
        _ => return ModelTurn::text(format!("Unsure how to {step}.")),
    };
    ModelTurn::call(step.clone(), args)
        .with_text(format!("Next: {step}"))
        .with_continuation(format!("mock-{turn}"))
}

fn result_of(part: &Part) -> Option<&Value> {
    match part {
        Part::ToolResult { content, .. } => content.get("result"),
        _ => None,
    }
}

/// 最后一批工具结果中给出的 next_step；结果失败时先重试生成或结束
fn latest_next_step(msg: &Message) -> Option<String> {
    let hinted = msg
        .parts
        .iter()
        .rev()
        .filter_map(result_of)
        .find_map(|r| r.get("next_step").and_then(Value::as_str));
    if let Some(step) = hinted {
        return Some(step.to_string());
    }
    let failed = msg.parts.iter().any(|p| {
        matches!(p, Part::ToolResult { content, .. } if content.get("ok") == Some(&Value::Bool(false)))
    });
    failed.then(|| names::COMPLETE.to_string())
}

/// 全对话中最近一个工具结果里的某个字段
fn latest_result_field<'a>(messages: &'a [Message], field: &str) -> Option<&'a Value> {
    messages
        .iter()
        .rev()
        .flat_map(|m| m.parts.iter().rev())
        .filter_map(result_of)
        .find_map(|r| r.get(field))
}

fn canned_completion(purpose: CompletionPurpose) -> String {
    match purpose {
        CompletionPurpose::StyleExtraction => json!({
            "palette": ["#0F172A", "#F97316", "#FFFFFF"],
            "style_description": "Flat illustration with bold shapes and high contrast",
            "voice": "Upbeat and direct",
            "forbidden_elements": ["stock photography", "drop shadows"],
            "risk_thresholds": { "palette_deviation": 0.15, "forbidden_elements": 0.0 }
        })
        .to_string(),
        CompletionPurpose::Validation => json!({
            "score": 93,
            "pass": true,
            "issues": [],
            "fix_instructions": []
        })
        .to_string(),
        CompletionPurpose::Refinement => {
            "An on-brand image that follows the palette and removes forbidden elements".to_string()
        }
        CompletionPurpose::Search => "No additional context available.".to_string(),
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn exchange(&self, request: &TurnRequest) -> Result<ModelTurn, LlmError> {
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(handler) = &self.turn_handler {
            return handler(request, turn);
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(autopilot(request, turn)),
        }
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        if let Some(latency) = &self.completion_latency {
            tokio::time::sleep(latency(request)).await;
        }
        let result = match &self.completion_handler {
            Some(handler) => handler(request),
            None => Ok(canned_completion(request.purpose)),
        };
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());
        result
    }

    async fn generate_image(&self, request: &ImageRequest<'_>) -> Result<GeneratedImage, LlmError> {
        self.images.fetch_add(1, Ordering::SeqCst);
        match &self.image_handler {
            Some(handler) => handler(request),
            None => Ok(GeneratedImage {
                mime_type: "image/png".to_string(),
                data: TINY_PNG.to_vec(),
            }),
        }
    }
}
