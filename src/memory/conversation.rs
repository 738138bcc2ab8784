//! 对话历史：回合消息与续接令牌
//!
//! 模型返回的续接令牌挂在收到它的那条 Model 消息上，之后原样随该消息重发，绝不移动到其它消息。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ModelTurn, ToolCallRequest};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// 消息片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        call: ToolCallRequest,
    },
    /// 工具结果摘要（不含二进制产物）
    ToolResult {
        call_id: String,
        name: String,
        content: Value,
    },
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            continuation: None,
        }
    }

    /// 由模型回合构造：推理文本在前，工具调用按请求顺序在后，令牌留在本消息
    pub fn model_turn(turn: &ModelTurn) -> Self {
        let mut parts = Vec::with_capacity(turn.tool_calls.len() + 1);
        if let Some(text) = turn.text.as_ref().filter(|t| !t.is_empty()) {
            parts.push(Part::Text { text: text.clone() });
        }
        parts.extend(
            turn.tool_calls
                .iter()
                .cloned()
                .map(|call| Part::ToolCall { call }),
        );
        Self {
            role: Role::Model,
            parts,
            continuation: turn.continuation.clone(),
        }
    }

    pub fn tool_results(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Tool,
            parts,
            continuation: None,
        }
    }

    /// 拼接所有文本片段
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall { call } => Some(call),
            _ => None,
        })
    }
}

/// 一次运行的对话：只追加
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(opening: Message) -> Self {
        Self {
            messages: vec![opening],
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn push_model_turn(&mut self, turn: &ModelTurn) {
        let msg = Message::model_turn(turn);
        if msg.parts.is_empty() && msg.continuation.is_none() {
            return;
        }
        self.messages.push(msg);
    }

    pub fn push_tool_results(&mut self, parts: Vec<Part>) {
        if !parts.is_empty() {
            self.messages.push(Message::tool_results(parts));
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 所有续接令牌及其所在消息下标
    pub fn continuation_positions(&self) -> Vec<(usize, String)> {
        self.messages
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.continuation.clone().map(|t| (i, t)))
            .collect()
    }
}
