//! 图像生成：提示词 + 风格约束 → 二进制产物
//!
//! 模型未给出 style_constraints 时回退到 state 中的风格档案。瞬时故障按 BackoffPolicy 退避重试，
//! 重试耗尽返回带 retry_suggested 的软失败，由循环决定是否继续。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{
    AgentPhase, AgentState, Artifact, BackoffPolicy, StateChange, StateDelta, ToolResult,
};
use crate::llm::{ImageRequest, LlmClient, LlmError};
use crate::tools::{names, parse_args, reference_images, schema_value, StateField, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateImageArgs {
    /// 图像描述
    pub prompt: String,
    /// 风格约束（省略时使用已提取的风格档案）
    pub style_constraints: Option<String>,
    /// 画幅比例，例如 "1:1"、"16:9"
    pub aspect_ratio: Option<String>,
}

pub struct ImageGenerationTool {
    llm: Arc<dyn LlmClient>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl ImageGenerationTool {
    pub fn new(llm: Arc<dyn LlmClient>, backoff: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            llm,
            backoff,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for ImageGenerationTool {
    fn name(&self) -> &str {
        names::GENERATE_IMAGE
    }

    fn description(&self) -> &str {
        "Generate an image from a prompt. Style constraints default to the extracted style profile. \
         Each call uses one generation attempt."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<GenerateImageArgs>()
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::StyleProfile, StateField::InputArtifacts, StateField::Attempts]
    }

    fn writes(&self) -> &'static [StateField] {
        &[
            StateField::Phase,
            StateField::CurrentArtifact,
            StateField::ValidationScore,
            StateField::CurrentPrompt,
        ]
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.backoff.total_budget(self.timeout))
    }

    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput {
        let args: GenerateImageArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        if args.prompt.trim().is_empty() {
            return ToolOutput::failure(ToolResult::hard("prompt must not be empty"));
        }

        let constraints = args
            .style_constraints
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| state.style_profile().map(|p| p.to_prompt_block()));
        let mut prompt = args.prompt.trim().to_string();
        if let Some(constraints) = &constraints {
            prompt.push_str("\n\nStyle constraints:\n");
            prompt.push_str(constraints);
        }
        if let Some(ratio) = args.aspect_ratio.as_deref().filter(|r| !r.is_empty()) {
            prompt.push_str("\nAspect ratio: ");
            prompt.push_str(ratio);
        }

        let request = ImageRequest {
            prompt,
            references: reference_images(state.input_artifacts()),
            timeout: self.timeout,
        };
        let llm = &self.llm;
        let req = &request;
        let image = match self
            .backoff
            .retry("generate_image", None, LlmError::is_transient, |_| async move {
                llm.generate_image(req).await
            })
            .await
        {
            Ok(image) if !image.data.is_empty() => image,
            Ok(_) => {
                return ToolOutput::failure(ToolResult::soft_retry(
                    "Image service returned an empty image",
                ))
            }
            Err(e) if e.is_transient() => {
                return ToolOutput::failure(ToolResult::soft_retry(format!(
                    "Image generation failed after {} attempt(s): {e}",
                    self.backoff.max_attempts
                )))
            }
            Err(e) => {
                return ToolOutput::failure(ToolResult::soft(format!(
                    "Image generation rejected: {e}"
                )))
            }
        };

        let artifact = Arc::new(Artifact::new(image.mime_type, image.data));
        tracing::info!(artifact_id = %artifact.id, bytes = artifact.data.len(), "image generated");
        let payload = json!({
            "artifact_id": artifact.id,
            "mime_type": artifact.mime_type,
            "bytes": artifact.data.len(),
            "attempts_used": state.attempts(),
            "max_attempts": state.max_attempts(),
            "used_profile_constraints": args.style_constraints.is_none() && constraints.is_some(),
            "next_step": names::VALIDATE_COMPLIANCE,
        });
        ToolOutput::new(
            ToolResult::success(payload),
            StateDelta::new()
                .with(StateChange::Phase(AgentPhase::Generating))
                .with(StateChange::Artifact(artifact))
                .with(StateChange::ClearValidation)
                .with(StateChange::Prompt(args.prompt)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StyleProfile;
    use crate::llm::{GeneratedImage, MockLlmClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(3, Duration::from_millis(1)).without_jitter()
    }

    #[tokio::test]
    async fn test_constraints_fall_back_to_profile() {
        let mock = MockLlmClient::new().with_image(|req| {
            assert!(req.prompt.contains("Palette: #1A1A1A"));
            Ok(GeneratedImage {
                mime_type: "image/png".into(),
                data: vec![9; 4],
            })
        });
        let state = AgentState::hydrate(Vec::new(), 3, Some(StyleProfile::default_profile()), Vec::new()).unwrap();
        let tool = ImageGenerationTool::new(Arc::new(mock), fast_backoff(), Duration::from_secs(5));
        let out = tool.execute(json!({"prompt": "a poster"}), &state).await;
        assert!(out.result.is_success());
        assert_eq!(out.delta.artifact().unwrap().data, vec![9; 4]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_soft() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mock = MockLlmClient::new().with_image(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Server {
                status: 503,
                message: "busy".into(),
            })
        });
        let state = AgentState::new(Vec::new(), 3);
        let tool = ImageGenerationTool::new(Arc::new(mock), fast_backoff(), Duration::from_secs(5));
        let out = tool.execute(json!({"prompt": "x"}), &state).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(out.result, ToolResult::SoftFailure { retry_suggested: true, .. }));
        assert!(out.delta.is_empty());
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mock = MockLlmClient::new().with_image(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LlmError::Timeout)
            } else {
                Ok(GeneratedImage {
                    mime_type: "image/png".into(),
                    data: vec![1],
                })
            }
        });
        let tool = ImageGenerationTool::new(Arc::new(mock), fast_backoff(), Duration::from_secs(5));
        let out = tool.execute(json!({"prompt": "x"}), &AgentState::new(Vec::new(), 3)).await;
        assert!(out.result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
