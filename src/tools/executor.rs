//! 工具执行器
//!
//! 持有 ToolRegistry、默认超时与并发调度器。execute(call, state) 先校验工具名与参数，
//! 再在超时内调用工具；未知工具、参数违规、超时都转为 ToolResult，绝不向上抛错。
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::{AgentState, TaskScheduler, ToolResult};
use crate::llm::ToolCallRequest;
use crate::tools::{names, ToolOutput, ToolRegistry, ToolSpec};

/// 工具执行器：对每次调用施加超时，并将失败映射为 ToolResult
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// 执行一次工具调用；输出 JSON 审计日志
    pub async fn execute(&self, call: &ToolCallRequest, state: &AgentState) -> ToolOutput {
        let start = Instant::now();
        let (output, outcome) = self.dispatch(call, state).await;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": output.result.is_success(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        output
    }

    async fn dispatch(&self, call: &ToolCallRequest, state: &AgentState) -> (ToolOutput, &'static str) {
        let Some(tool) = self.registry.get(&call.name) else {
            let result = ToolResult::soft(format!(
                "Unknown tool: {}. Available tools: {}",
                call.name,
                self.registry.tool_names().join(", ")
            ));
            return (ToolOutput::failure(result), "unknown_tool");
        };
        if let Err(violations) = self.registry.validate_args(&call.name, &call.args) {
            let result = ToolResult::hard(format!(
                "{} {}: {}",
                names::INVALID_ARGS_PREFIX,
                call.name,
                violations.join("; ")
            ));
            return (ToolOutput::failure(result), "invalid_args");
        }

        // 信号量关闭时不限流，照常执行
        let _permit = self.scheduler.acquire_tool().await;
        let limit = tool.timeout().unwrap_or(self.timeout);
        match timeout(limit, tool.execute(call.args.clone(), state)).await {
            Ok(output) => {
                let outcome = match &output.result {
                    ToolResult::Success { .. } => "ok",
                    ToolResult::SoftFailure { .. } => "soft_failure",
                    ToolResult::HardFailure { .. } => "hard_failure",
                };
                (output, outcome)
            }
            Err(_) => {
                let result = ToolResult::soft_retry(format!(
                    "{} timed out after {}s",
                    call.name,
                    limit.as_secs()
                ));
                (ToolOutput::failure(result), "timeout")
            }
        }
    }

    /// 并发执行一批调用；结果按请求顺序返回，与完成顺序无关
    pub async fn execute_batch(&self, calls: &[ToolCallRequest], state: &AgentState) -> Vec<ToolOutput> {
        join_all(calls.iter().map(|call| self.execute(call, state))).await
    }

    /// 工具已注册且参数通过校验（循环据此决定是否为生成调用计数）
    pub fn accepts(&self, call: &ToolCallRequest) -> bool {
        self.registry.validate_args(&call.name, &call.args).is_ok()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.list()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
