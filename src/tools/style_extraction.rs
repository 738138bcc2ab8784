//! 风格提取：从输入图片与文字笔记得到风格档案
//!
//! 没有有效图片时直接返回默认档案并标记 is_default；模型输出经 normalize 归一化，
//! 色块素材并入色板。无效图片（空数据或非 image/* MIME）计入 images_skipped，不会被静默丢弃。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{
    AgentPhase, AgentState, ArtifactKind, BackoffPolicy, InputArtifact, StateChange, StateDelta,
    StyleProfile, ToolResult,
};
use crate::llm::{CompletionPurpose, CompletionRequest, LlmClient, LlmError};
use crate::tools::normalize::{extract_json, normalize_color, normalize_profile};
use crate::tools::{names, parse_args, reference_images, schema_value, StateField, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractStyleArgs {
    /// 额外关注点（可选），例如 "typography" 或 "color usage"
    pub focus: Option<String>,
}

pub struct StyleExtractionTool {
    llm: Arc<dyn LlmClient>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl StyleExtractionTool {
    pub fn new(llm: Arc<dyn LlmClient>, backoff: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            llm,
            backoff,
            timeout,
        }
    }

    fn prompt(inputs: &[InputArtifact], focus: Option<&str>) -> String {
        let mut prompt = String::from(
            "Analyze the attached reference images and notes and describe the brand style. \
             Respond with JSON: {\"palette\": [hex colors], \"style_description\": string, \"voice\": string, \
             \"forbidden_elements\": [string], \"risk_thresholds\": {name: number}}.",
        );
        for input in inputs {
            if let InputArtifact::Text { content } = input {
                prompt.push_str("\nNote: ");
                prompt.push_str(content);
            }
        }
        if let Some(focus) = focus {
            prompt.push_str("\nFocus on: ");
            prompt.push_str(focus);
        }
        prompt
    }
}

/// 色块素材追加到色板末尾（去重）
fn merge_swatches(profile: &mut StyleProfile, inputs: &[InputArtifact]) {
    for input in inputs {
        if let InputArtifact::Swatch { color } = input {
            if let Some(color) = normalize_color(color) {
                if !profile.palette.contains(&color) {
                    profile.palette.push(color);
                }
            }
        }
    }
}

#[async_trait]
impl Tool for StyleExtractionTool {
    fn name(&self) -> &str {
        names::EXTRACT_STYLE
    }

    fn description(&self) -> &str {
        "Extract a style profile (palette, style description, voice, forbidden elements, risk thresholds) \
         from the reference images and notes supplied with the goal. Call this first unless a cached profile is loaded."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ExtractStyleArgs>()
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::InputArtifacts]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Phase, StateField::StyleProfile]
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.backoff.total_budget(self.timeout))
    }

    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput {
        let args: ExtractStyleArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        let inputs = state.input_artifacts();
        let images = reference_images(inputs);
        let skipped = inputs
            .iter()
            .filter(|a| a.kind() == ArtifactKind::Image && !a.is_valid_image())
            .count();
        if skipped > 0 {
            tracing::warn!(skipped, "ignoring invalid reference images");
        }

        if images.is_empty() {
            let profile = StyleProfile::default_profile();
            let payload = json!({
                "profile": profile,
                "is_default": true,
                "images_used": 0,
                "images_skipped": skipped,
                "note": "No valid reference images; using the default style profile",
                "next_step": names::GENERATE_IMAGE,
            });
            return ToolOutput::new(
                ToolResult::success(payload),
                StateDelta::new()
                    .with(StateChange::Phase(AgentPhase::Analyzing))
                    .with(StateChange::StyleProfile(profile)),
            );
        }

        let request = CompletionRequest {
            purpose: CompletionPurpose::StyleExtraction,
            prompt: Self::prompt(inputs, args.focus.as_deref()),
            images,
            timeout: self.timeout,
        };
        let llm = &self.llm;
        let req = &request;
        let raw = match self
            .backoff
            .retry("extract_style", None, LlmError::is_transient, |_| async move {
                llm.complete(req).await
            })
            .await
        {
            Ok(text) => text,
            Err(e) => {
                return ToolOutput::failure(ToolResult::soft_retry(format!(
                    "Style extraction failed: {e}"
                )))
            }
        };

        let normalized = extract_json(&raw)
            .map(|v| normalize_profile(&v))
            .unwrap_or_else(|| normalize_profile(&Value::Null));
        if normalized.shape.is_none() {
            tracing::warn!("style profile response not recognized, using default profile");
        }
        let mut profile = normalized.value;
        if normalized.shape.is_some() {
            merge_swatches(&mut profile, inputs);
        }

        let payload = json!({
            "profile": profile,
            "is_default": profile.is_default(),
            "shape": normalized.shape.map(|s| s.as_str()),
            "images_used": request.images.len(),
            "images_skipped": skipped,
            "next_step": names::GENERATE_IMAGE,
        });
        ToolOutput::new(
            ToolResult::success(payload),
            StateDelta::new()
                .with(StateChange::Phase(AgentPhase::Analyzing))
                .with(StateChange::StyleProfile(profile)),
        )
    }
}
