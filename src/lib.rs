//! Muse - 风格驱动的图像生成智能体
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（run / run_with_cache / run_stream）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态（单写者）、错误、统一退避策略、工具并发调度
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 回合对话与续接令牌、会话恢复、风格档案缓存
//! - **observability**: 日志初始化
//! - **react**: 编排主循环与进度事件
//! - **tools**: 工具注册表、六个能力执行器与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{build_registry, create_llm_from_config, Agent};
pub use react::{RunOutcome, RunRequest, StopReason};
