//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按注册顺序保存。
//! 注册时编译参数 schema，派发前用同一份 schema 校验参数；reads / writes 只是给维护者看的文档，不做强制。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::{AgentState, StateDelta, ToolResult};

/// AgentState 中的字段（用于声明工具的读写范围）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Phase,
    StyleProfile,
    CurrentArtifact,
    ValidationScore,
    Attempts,
    CurrentPrompt,
    InputArtifacts,
}

/// 工具执行产出：结果 + 交给循环合并的状态增量
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: ToolResult,
    pub delta: StateDelta,
}

impl ToolOutput {
    pub fn new(result: ToolResult, delta: StateDelta) -> Self {
        Self { result, delta }
    }

    /// 失败结果不携带任何状态变更
    pub fn failure(result: ToolResult) -> Self {
        Self {
            result,
            delta: StateDelta::new(),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、扁平参数 schema、只读状态快照上的异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型工具调用中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，必须是扁平对象
    fn parameters_schema(&self) -> Value;

    fn reads(&self) -> &'static [StateField] {
        &[]
    }

    fn writes(&self) -> &'static [StateField] {
        &[]
    }

    /// 工具专属超时；None 时使用执行器默认值
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 执行工具；任何失败都以 ToolResult 表达，不返回 Err
    async fn execute(&self, args: Value, state: &AgentState) -> ToolOutput;
}

/// 向模型公布的工具描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

struct Entry {
    tool: Arc<dyn Tool>,
    validator: Option<jsonschema::Validator>,
}

/// 工具注册表：保持注册顺序，支持 register / get / list / validate_args
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名工具后注册者覆盖先注册者
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.parameters_schema();
        if !crate::tools::schema::is_flat(&schema) {
            tracing::warn!(tool = tool.name(), "tool schema is nested; remote services may reject it");
        }
        let validator = match jsonschema::validator_for(&schema) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(tool = tool.name(), error = %e, "schema does not compile, arguments will not be validated");
                None
            }
        };
        let name = tool.name().to_string();
        let entry = Entry { tool, validator };
        match self.index.get(&name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| self.entries[i].tool.clone())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.tool.name().to_string()).collect()
    }

    /// 按注册顺序列出 {name, description, input_schema}
    pub fn list(&self) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .map(|e| ToolSpec {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                input_schema: e.tool.parameters_schema(),
            })
            .collect()
    }

    /// 校验参数；返回全部违规描述
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), Vec<String>> {
        let Some(entry) = self.index.get(name).map(|&i| &self.entries[i]) else {
            return Err(vec![format!("Unknown tool: {name}")]);
        };
        let Some(validator) = &entry.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(args)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
