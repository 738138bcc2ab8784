//! 合规校验：当前产物 + 风格档案 → 分数、通过与否、带位置的问题列表、修改建议
//!
//! 通过与否只看分数是否达到阈值；模型自带的 pass 布尔值仅在与分数矛盾时记一条日志。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{
    AgentPhase, AgentState, BackoffPolicy, StateChange, StateDelta, StyleProfile, ToolResult,
};
use crate::llm::{CompletionPurpose, CompletionRequest, ImageInput, LlmClient, LlmError};
use crate::tools::normalize::{extract_json, normalize_validation};
use crate::tools::{names, parse_args, schema_value, StateField, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateArgs {
    /// 额外检查项（可选）
    pub focus: Option<String>,
}

pub struct ValidationTool {
    llm: Arc<dyn LlmClient>,
    backoff: BackoffPolicy,
    timeout: Duration,
    pass_threshold: f64,
}

impl ValidationTool {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        backoff: BackoffPolicy,
        timeout: Duration,
        pass_threshold: f64,
    ) -> Self {
        Self {
            llm,
            backoff,
            timeout,
            pass_threshold: pass_threshold.clamp(0.0, 100.0),
        }
    }

    fn prompt(&self, profile: &StyleProfile, focus: Option<&str>) -> String {
        let mut prompt = format!(
            "Score how well the attached image complies with this style profile, 0-100.\n{}\n\
             Respond with JSON: {{\"score\": number, \"pass\": bool, \
             \"issues\": [{{\"description\": string, \"location\": string}}], \"fix_instructions\": [string]}}.",
            profile.to_prompt_block()
        );
        if let Some(focus) = focus {
            prompt.push_str("\nAlso check: ");
            prompt.push_str(focus);
        }
        prompt
    }
}

#[async_trait]
impl Tool for ValidationTool {
    fn name(&self) -> &str {
        names::VALIDATE_COMPLIANCE
    }

    fn description(&self) -> &str {
        "Score the most recently generated image against the style profile. \
         Returns score (0-100), passed, located issues and fix instructions."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ValidateArgs>()
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::CurrentArtifact, StateField::StyleProfile, StateField::Attempts]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Phase, StateField::ValidationScore]
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.backoff.total_budget(self.timeout))
    }

    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput {
        let args: ValidateArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        let Some(artifact) = state.current_artifact() else {
            return ToolOutput::failure(ToolResult::soft(
                "No image to validate; call generate_image first",
            ));
        };
        let default_profile;
        let profile = match state.style_profile() {
            Some(p) => p,
            None => {
                default_profile = StyleProfile::default_profile();
                &default_profile
            }
        };

        let request = CompletionRequest {
            purpose: CompletionPurpose::Validation,
            prompt: self.prompt(profile, args.focus.as_deref()),
            images: vec![ImageInput {
                mime_type: &artifact.mime_type,
                data: &artifact.data,
            }],
            timeout: self.timeout,
        };
        let llm = &self.llm;
        let req = &request;
        let raw = match self
            .backoff
            .retry("validate_compliance", None, LlmError::is_transient, |_| async move {
                llm.complete(req).await
            })
            .await
        {
            Ok(text) => text,
            Err(e) => {
                return ToolOutput::failure(ToolResult::soft_retry(format!(
                    "Validation failed: {e}"
                )))
            }
        };

        let Some(report) = extract_json(&raw).and_then(|v| normalize_validation(&v)) else {
            return ToolOutput::failure(ToolResult::soft_retry(
                "Validation response contained no recognizable score",
            ));
        };

        let passed = report.score >= self.pass_threshold;
        if let Some(model_pass) = report.model_pass.filter(|p| *p != passed) {
            tracing::info!(
                score = report.score,
                threshold = self.pass_threshold,
                model_pass,
                "model pass flag disagrees with score; using score"
            );
        }
        let remaining = state.attempts_remaining();
        let next_step = if passed || remaining == 0 {
            names::COMPLETE
        } else {
            names::REFINE_PROMPT
        };
        let feedback = if report.fix_instructions.is_empty() {
            report.issues.iter().map(|i| i.description.clone()).collect()
        } else {
            report.fix_instructions.clone()
        };

        let payload = json!({
            "artifact_id": artifact.id,
            "score": report.score,
            "passed": passed,
            "threshold": self.pass_threshold,
            "issues": report.issues,
            "fix_instructions": feedback,
            "attempts_used": state.attempts(),
            "attempts_remaining": remaining,
            "next_step": next_step,
        });
        ToolOutput::new(
            ToolResult::success(payload),
            StateDelta::new()
                .with(StateChange::Phase(AgentPhase::Auditing))
                .with(StateChange::Validation {
                    artifact_id: artifact.id.clone(),
                    score: report.score,
                    passed,
                    feedback,
                }),
        )
    }
}
