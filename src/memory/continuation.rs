//! 续接管理：开场消息、会话恢复
//!
//! 从上一会话的 AgentAction 列表重建对话时，不假设远端服务能直接“接着聊”，
//! 而是按回合重放：开场 User 消息 → 每回合一条 Model 消息（推理 + 工具调用 + 原位令牌）
//! → 一条 Tool 消息（结果摘要）。重放结果与现场运行构造出的对话结构完全一致。

use crate::core::{AgentAction, AgentState, ArtifactKind, InputArtifact};
use crate::llm::{ModelTurn, ToolCallRequest};
use crate::memory::{Conversation, Message, Part};
use crate::tools::names;

pub const GOAL_PREFIX: &str = "Goal: ";
pub const NEXT_STEP_PREFIX: &str = "Suggested next step: ";

/// 开场消息：目标、素材概要、建议的第一步
pub fn opening_message(goal: &str, inputs: &[InputArtifact], profile_cached: bool) -> Message {
    let count = |kind: ArtifactKind| inputs.iter().filter(|a| a.kind() == kind).count();
    let mut text = format!(
        "{GOAL_PREFIX}{goal}\nInput artifacts: {} image(s), {} note(s), {} swatch(es)",
        count(ArtifactKind::Image),
        count(ArtifactKind::Text),
        count(ArtifactKind::Swatch),
    );

    let notes: Vec<&str> = inputs
        .iter()
        .filter_map(|a| match a {
            InputArtifact::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    if !notes.is_empty() {
        text.push_str("\nNotes:");
        for note in notes {
            text.push_str("\n- ");
            text.push_str(note);
        }
    }

    let swatches: Vec<&str> = inputs
        .iter()
        .filter_map(|a| match a {
            InputArtifact::Swatch { color } => Some(color.as_str()),
            _ => None,
        })
        .collect();
    if !swatches.is_empty() {
        text.push_str("\nSwatches: ");
        text.push_str(&swatches.join(", "));
    }

    if profile_cached {
        text.push_str("\nA cached style profile is already loaded; extraction can be skipped.");
    }
    let first = if profile_cached {
        names::GENERATE_IMAGE
    } else {
        names::EXTRACT_STYLE
    };
    text.push_str(&format!("\n{NEXT_STEP_PREFIX}{first}"));
    Message::user(text)
}

/// 恢复会话时追加在重放对话之后的状态说明
pub fn resume_note(state: &AgentState) -> Message {
    let next = if state.style_profile().is_none() {
        names::EXTRACT_STYLE
    } else if state.attempts_remaining() > 0 {
        names::GENERATE_IMAGE
    } else {
        names::COMPLETE
    };
    let score = state
        .validation_score()
        .map(|s| format!("{s:.0}"))
        .unwrap_or_else(|| "none".to_string());
    Message::user(format!(
        "Session resumed after {} recorded action(s). Phase: {:?}. Attempts used: {}/{}. Last score: {}. \
         Previously generated images are not carried over; generate again before validating.\n{NEXT_STEP_PREFIX}{next}",
        state.history().len(),
        state.phase(),
        state.attempts(),
        state.max_attempts(),
        score,
    ))
}

/// 按回合重放历史，令牌放回它被记录时所在的 Model 消息
pub fn replay(
    goal: &str,
    inputs: &[InputArtifact],
    profile_cached: bool,
    history: &[AgentAction],
) -> Conversation {
    let mut conversation = Conversation::start(opening_message(goal, inputs, profile_cached));

    let mut start = 0;
    while start < history.len() {
        let turn = history[start].turn;
        let end = history[start..]
            .iter()
            .position(|a| a.turn != turn)
            .map_or(history.len(), |offset| start + offset);
        let group = &history[start..end];

        let model_turn = ModelTurn {
            text: group[0].reasoning_text.clone(),
            tool_calls: group
                .iter()
                .map(|a| ToolCallRequest::new(a.tool_name.clone(), a.input_args.clone()).with_id(a.call_id.clone()))
                .collect(),
            continuation: group.iter().find_map(|a| a.continuation_token.clone()),
        };
        conversation.push_model_turn(&model_turn);
        conversation.push_tool_results(
            group
                .iter()
                .map(|a| Part::ToolResult {
                    call_id: a.call_id.clone(),
                    name: a.tool_name.clone(),
                    content: a.output_result.clone(),
                })
                .collect(),
        );
        start = end;
    }
    conversation
}

/// 从对话首条 User 消息中取出目标
pub fn goal_of(messages: &[Message]) -> Option<String> {
    messages.first().and_then(|m| {
        m.text()
            .lines()
            .find_map(|l| l.strip_prefix(GOAL_PREFIX).map(|g| g.trim().to_string()))
    })
}

/// 从文本中取出“建议的下一步”
pub fn suggested_step(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .find_map(|l| l.strip_prefix(NEXT_STEP_PREFIX).map(|s| s.trim().to_string()))
}
