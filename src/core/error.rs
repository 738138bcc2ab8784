//! 运行级错误类型
//!
//! 工具失败永远不会变成 AgentError（它们以 ToolResult 形式回灌给模型）；
//! 只有回合交换失败、取消、配置与历史数据错误才会终止一次运行。

use thiserror::Error;

use crate::core::AgentAction;
use crate::llm::LlmError;

/// 终止一次运行的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 与模型的回合交换在重试后仍失败，且没有可降级返回的产物
    #[error("Turn exchange failed: {0}")]
    TurnExchange(#[from] LlmError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 恢复会话时传入的历史不合法（序号不递增等）
    #[error("Invalid prior history: {0}")]
    InvalidHistory(String),
}

/// 向调用方传播的失败：附带已记录的完整历史，便于重建尝试过程
#[derive(Error, Debug)]
#[error("{source}")]
pub struct RunError {
    pub source: AgentError,
    pub history: Vec<AgentAction>,
}

impl RunError {
    pub fn new(source: AgentError, history: Vec<AgentAction>) -> Self {
        Self { source, history }
    }
}
