//! 上下文检索：查询 → 外部知识源给出的文本摘要
//!
//! 尽力而为：失败时降级为空摘要（degraded = true），不中断运行。
//! 结果超过 max_result_chars 时截断并追加 ...[truncated]。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{AgentState, BackoffPolicy, StateDelta, ToolResult};
use crate::llm::{CompletionPurpose, CompletionRequest, LlmClient, LlmError};
use crate::tools::{names, parse_args, schema_value, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 检索词
    pub query: String,
}

/// Search 工具：超时与最大字符数由配置决定
pub struct SearchTool {
    llm: Arc<dyn LlmClient>,
    backoff: BackoffPolicy,
    timeout: Duration,
    max_result_chars: usize,
}

impl SearchTool {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        backoff: BackoffPolicy,
        timeout: Duration,
        max_result_chars: usize,
    ) -> Self {
        Self {
            llm,
            backoff,
            timeout,
            max_result_chars,
        }
    }

    fn truncate(&self, text: &str) -> (String, bool) {
        if text.chars().count() > self.max_result_chars {
            let cut: String = text.chars().take(self.max_result_chars).collect();
            (format!("{cut}...[truncated]"), true)
        } else {
            (text.to_string(), false)
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        names::SEARCH_CONTEXT
    }

    fn description(&self) -> &str {
        "Look up background context (brand facts, product details, audience) and return a short text summary. Best-effort."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SearchArgs>()
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.backoff.total_budget(self.timeout))
    }

    async fn execute(&self, args: Value, _state: &AgentState) -> ToolOutput {
        let args: SearchArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(out) => return out,
        };
        let query = args.query.trim();
        if query.is_empty() {
            return ToolOutput::failure(ToolResult::hard("query must not be empty"));
        }

        let request = CompletionRequest {
            purpose: CompletionPurpose::Search,
            prompt: format!("Summarize what is known about: {query}"),
            images: Vec::new(),
            timeout: self.timeout,
        };
        let llm = &self.llm;
        let req = &request;
        let payload = match self
            .backoff
            .retry("search_context", None, LlmError::is_transient, |_| async move {
                llm.complete(req).await
            })
            .await
        {
            Ok(text) => {
                let (summary, truncated) = self.truncate(text.trim());
                json!({ "query": query, "summary": summary, "truncated": truncated })
            }
            Err(e) => {
                tracing::warn!(query, error = %e, "search degraded to empty result");
                json!({ "query": query, "summary": "", "degraded": true })
            }
        };
        ToolOutput::new(ToolResult::success(payload), StateDelta::new())
    }
}
