//! 编排层：主循环（回合交换、并行派发、增量合并、终止判定）与进度事件

pub mod events;
pub mod loop_;

pub use events::{ChannelProgress, NoopProgress, ProgressEvent, ProgressSink};
pub use loop_::{LoopConfig, Orchestrator, RunOutcome, RunRequest, StopReason};
