//! 进度事件：每次工具调用一条，运行结束一条
//!
//! ProgressSink::emit 由循环在 AgentAction 追加后同步调用，实现必须立即返回。
//! 事件本身可携带产物二进制（调用方需要图片），但 to_wire() 渲染的传输帧只含产物引用。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{AgentAction, AgentPhase, Artifact, ArtifactRef};
use crate::react::StopReason;

/// 单条进度事件
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// 开始第 turn 次回合交换
    TurnStarted { turn: u32, max_turns: u32 },
    /// 一次工具调用已记录
    Action {
        action: AgentAction,
        phase: AgentPhase,
        /// 本次调用生成的产物
        artifact: Option<Arc<Artifact>>,
    },
    /// 运行结束（含降级结束）
    Finished {
        success: bool,
        message: String,
        stop_reason: StopReason,
        artifact: Option<Arc<Artifact>>,
    },
    /// 运行失败（无可降级返回的产物）
    Failed { error: String },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent<'a> {
    TurnStarted {
        turn: u32,
        max_turns: u32,
    },
    Action {
        action: &'a AgentAction,
        phase: AgentPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<ArtifactRef>,
    },
    Finished {
        success: bool,
        message: &'a str,
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<ArtifactRef>,
    },
    Failed {
        error: &'a str,
    },
}

impl ProgressEvent {
    /// 传输帧：产物只以 {id, mime_type, bytes} 引用出现
    pub fn to_wire(&self) -> Value {
        let wire = match self {
            ProgressEvent::TurnStarted { turn, max_turns } => WireEvent::TurnStarted {
                turn: *turn,
                max_turns: *max_turns,
            },
            ProgressEvent::Action {
                action,
                phase,
                artifact,
            } => WireEvent::Action {
                action,
                phase: *phase,
                artifact: artifact.as_deref().map(Artifact::reference),
            },
            ProgressEvent::Finished {
                success,
                message,
                stop_reason,
                artifact,
            } => WireEvent::Finished {
                success: *success,
                message,
                stop_reason: *stop_reason,
                artifact: artifact.as_deref().map(Artifact::reference),
            },
            ProgressEvent::Failed { error } => WireEvent::Failed { error },
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

/// 进度接收方
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// 推送到无界通道；接收方已关闭时静默丢弃
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("progress listener dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn action() -> AgentAction {
        AgentAction {
            sequence_number: 1,
            turn: 1,
            call_id: "call-1-1".into(),
            tool_name: "generate_image".into(),
            input_args: json!({"prompt": "p"}),
            output_result: json!({"ok": true}),
            reasoning_text: None,
            continuation_token: None,
            artifact_reference: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_wire_frame_carries_reference_not_bytes() {
        let artifact = Arc::new(Artifact::new("image/png", vec![0; 4096]));
        let event = ProgressEvent::Action {
            action: action(),
            phase: AgentPhase::Generating,
            artifact: Some(artifact.clone()),
        };
        let wire = event.to_wire();
        assert_eq!(wire["type"], "action");
        assert_eq!(wire["artifact"]["id"], artifact.id.as_str());
        assert_eq!(wire["artifact"]["bytes"], 4096);
        assert!(wire.to_string().len() < 1024);
    }

    #[test]
    fn test_finished_frame() {
        let wire = ProgressEvent::Finished {
            success: true,
            message: "ok".into(),
            stop_reason: StopReason::Completed,
            artifact: None,
        }
        .to_wire();
        assert_eq!(wire["stop_reason"], "completed");
        assert!(wire.get("artifact").is_none());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelProgress::new(tx);
        drop(rx);
        sink.emit(ProgressEvent::Failed { error: "x".into() });
    }
}
