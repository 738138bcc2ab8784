//! 工具层：注册表、参数 schema、六个能力执行器、响应形状归一化、带超时与审计的执行器

pub mod complete;
pub mod executor;
pub mod image_generation;
pub mod normalize;
pub mod refine;
pub mod registry;
pub mod schema;
pub mod search;
pub mod style_extraction;
pub mod validation;

pub use complete::CompleteTool;
pub use executor::ToolExecutor;
pub use image_generation::ImageGenerationTool;
pub use normalize::{normalize_profile, normalize_validation, Issue, Normalized, ProfileShape, ValidationReport};
pub use refine::RefinePromptTool;
pub use registry::{StateField, Tool, ToolOutput, ToolRegistry, ToolSpec};
pub use schema::{is_flat, schema_value};
pub use search::SearchTool;
pub use style_extraction::StyleExtractionTool;
pub use validation::ValidationTool;

/// 工具名称常量与工具 → 阶段映射
pub mod names {
    use crate::core::AgentPhase;

    pub const EXTRACT_STYLE: &str = "extract_style";
    pub const GENERATE_IMAGE: &str = "generate_image";
    pub const VALIDATE_COMPLIANCE: &str = "validate_compliance";
    pub const REFINE_PROMPT: &str = "refine_prompt";
    pub const SEARCH_CONTEXT: &str = "search_context";
    pub const COMPLETE: &str = "complete";

    /// 参数未通过 schema 校验的错误前缀（这类调用不消耗生成次数）
    pub const INVALID_ARGS_PREFIX: &str = "Invalid arguments for";
    /// 生成次数用尽时拒绝调用的错误前缀
    pub const ATTEMPT_LIMIT_PREFIX: &str = "Generation attempt limit reached";

    /// 工具成功后进入的阶段；search 不改变阶段
    pub fn phase_for(tool: &str) -> Option<AgentPhase> {
        match tool {
            EXTRACT_STYLE => Some(AgentPhase::Analyzing),
            GENERATE_IMAGE => Some(AgentPhase::Generating),
            VALIDATE_COMPLIANCE => Some(AgentPhase::Auditing),
            REFINE_PROMPT => Some(AgentPhase::Refining),
            COMPLETE => Some(AgentPhase::Complete),
            _ => None,
        }
    }
}

/// 将参数反序列化为工具参数结构体；失败转为不可重试的 HardFailure
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    args: serde_json::Value,
) -> Result<T, ToolOutput> {
    serde_json::from_value(args).map_err(|e| {
        ToolOutput::failure(crate::core::ToolResult::hard(format!(
            "Malformed arguments for {tool}: {e}"
        )))
    })
}

/// 有效的输入图片（借用，不复制）
pub(crate) fn reference_images(
    inputs: &[crate::core::InputArtifact],
) -> Vec<crate::llm::ImageInput<'_>> {
    inputs
        .iter()
        .filter(|a| a.is_valid_image())
        .filter_map(|a| match a {
            crate::core::InputArtifact::Image { mime_type, data } => Some(crate::llm::ImageInput {
                mime_type: mime_type.as_str(),
                data: data.as_slice(),
            }),
            _ => None,
        })
        .collect()
}
