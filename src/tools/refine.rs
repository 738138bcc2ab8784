//! 提示词改写：原提示词 + 校验反馈 → 新提示词
//!
//! 纯文本变换，除阶段与 current_prompt 外不改状态。模型调用失败时退回确定性的拼接改写。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{AgentPhase, AgentState, BackoffPolicy, StateChange, StateDelta, ToolResult};
use crate::llm::{CompletionPurpose, CompletionRequest, LlmClient, LlmError};
use crate::tools::{names, parse_args, schema_value, StateField, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RefineArgs {
    /// 要改写的提示词（省略时使用上一次生成的提示词）
    pub prompt: Option<String>,
    /// 校验反馈（省略时使用上一次校验的修改建议）
    pub feedback: Option<String>,
}

pub struct RefinePromptTool {
    llm: Arc<dyn LlmClient>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl RefinePromptTool {
    pub fn new(llm: Arc<dyn LlmClient>, backoff: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            llm,
            backoff,
            timeout,
        }
    }
}

fn fallback_prompt(prompt: &str, feedback: &[String]) -> String {
    format!("{}. Adjustments: {}", prompt.trim_end_matches('.'), feedback.join("; "))
}

fn clean(text: &str) -> String {
    text.trim().trim_matches('"').trim().to_string()
}

#[async_trait]
impl Tool for RefinePromptTool {
    fn name(&self) -> &str {
        names::REFINE_PROMPT
    }

    fn description(&self) -> &str {
        "Rewrite the image prompt using the latest validation feedback. Call generate_image with the revised prompt afterwards."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<RefineArgs>()
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::CurrentPrompt, StateField::ValidationScore]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Phase, StateField::CurrentPrompt]
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.backoff.total_budget(self.timeout))
    }

    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput {
        let args: RefineArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        if state.validation_passed() == Some(true) {
            return ToolOutput::failure(ToolResult::soft(
                "The latest image already passed validation; call complete instead",
            ));
        }
        let Some(prompt) = args
            .prompt
            .filter(|p| !p.trim().is_empty())
            .or_else(|| state.current_prompt().map(str::to_string))
        else {
            return ToolOutput::failure(ToolResult::soft(
                "No prompt to refine; call generate_image first",
            ));
        };
        let feedback: Vec<String> = match args.feedback.filter(|f| !f.trim().is_empty()) {
            Some(f) => vec![f],
            None if !state.validation_feedback().is_empty() => state.validation_feedback().to_vec(),
            None => vec!["Follow the style profile more closely".to_string()],
        };

        let request = CompletionRequest {
            purpose: CompletionPurpose::Refinement,
            prompt: format!(
                "Rewrite this image prompt so the result addresses the feedback. Reply with the prompt only.\n\
                 Prompt: {prompt}\nFeedback:\n- {}",
                feedback.join("\n- ")
            ),
            images: Vec::new(),
            timeout: self.timeout,
        };
        let llm = &self.llm;
        let req = &request;
        let (revised, fallback) = match self
            .backoff
            .retry("refine_prompt", None, LlmError::is_transient, |_| async move {
                llm.complete(req).await
            })
            .await
        {
            Ok(text) if !clean(&text).is_empty() => (clean(&text), false),
            Ok(_) => (fallback_prompt(&prompt, &feedback), true),
            Err(e) => {
                tracing::warn!(error = %e, "prompt refinement unavailable, using fallback rewrite");
                (fallback_prompt(&prompt, &feedback), true)
            }
        };

        let payload = json!({
            "revised_prompt": revised,
            "fallback": fallback,
            "next_step": names::GENERATE_IMAGE,
        });
        ToolOutput::new(
            ToolResult::success(payload),
            StateDelta::new()
                .with(StateChange::Phase(AgentPhase::Refining))
                .with(StateChange::Prompt(revised)),
        )
    }
}
