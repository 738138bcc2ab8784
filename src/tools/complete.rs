//! 完成：success + message → 终态结果
//!
//! 产物永远取 state.current_artifact；模型回传的 artifact 字段只是占位字符串，直接忽略。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{AgentPhase, AgentState, StateChange, StateDelta, ToolResult};
use crate::tools::{names, parse_args, schema_value, StateField, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteArgs {
    /// 目标是否达成
    pub success: bool,
    /// 给用户的说明
    pub message: String,
    /// 模型可能回传的产物引用（会被忽略）
    pub artifact: Option<String>,
}

#[derive(Debug, Default)]
pub struct CompleteTool;

#[async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &str {
        names::COMPLETE
    }

    fn description(&self) -> &str {
        "Finish the run. The most recently generated image is returned to the user automatically."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<CompleteArgs>()
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::CurrentArtifact]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Phase]
    }

    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput {
        let args: CompleteArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        if let Some(echoed) = &args.artifact {
            tracing::debug!(%echoed, "ignoring artifact reference supplied by the model");
        }
        let artifact_id = state.current_artifact().map(|a| a.id.clone());
        let payload = json!({
            "success": args.success,
            "message": args.message,
            "artifact_id": artifact_id,
        });
        ToolOutput::new(
            ToolResult::success(payload),
            StateDelta::new()
                .with(StateChange::Phase(AgentPhase::Complete))
                .with(StateChange::Finish {
                    success: args.success,
                    message: args.message,
                }),
        )
    }
}
