//! 核心层：运行级错误、状态管理（单写者）、统一退避策略、工具并发调度

pub mod backoff;
pub mod error;
pub mod state;
pub mod task_scheduler;

pub use backoff::{BackoffPolicy, RetryHint};
pub use error::{AgentError, RunError};
pub use state::{
    AgentAction, AgentPhase, AgentState, Artifact, ArtifactKind, ArtifactRef, FinalBundle,
    InputArtifact, ProfileSource, StateChange, StateDelta, StyleProfile, ToolResult,
};
pub use task_scheduler::TaskScheduler;
