//! 状态定义：AgentState、StateDelta、AgentAction 与 ToolResult
//!
//! AgentState 只有一个写者（编排循环）。工具执行器只读取快照并返回 StateDelta，
//! 由循环按请求顺序合并：同一字段后写覆盖，历史只追加、永不修改。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::names;

/// 回灌给模型的摘要中，单个字符串字段的最大字符数
const SUMMARY_TEXT_CHARS: usize = 400;
/// 摘要中数组保留的最大元素数
const SUMMARY_ARRAY_ITEMS: usize = 12;

/// 运行阶段：单调前进，仅 generating → auditing → refining → generating 允许有界回环
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Analyzing,
    Generating,
    Auditing,
    Refining,
    Complete,
}

impl AgentPhase {
    fn rank(self) -> u8 {
        match self {
            AgentPhase::Planning => 0,
            AgentPhase::Analyzing => 1,
            AgentPhase::Generating => 2,
            AgentPhase::Auditing => 3,
            AgentPhase::Refining => 4,
            AgentPhase::Complete => 5,
        }
    }

    /// 是否允许从 self 迁移到 next
    pub fn can_transition_to(self, next: AgentPhase) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (AgentPhase::Complete, _) => false,
            (AgentPhase::Auditing | AgentPhase::Refining, AgentPhase::Generating) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// 风格档案来源
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    /// 由风格提取工具从输入素材得到
    Extracted,
    /// 固定默认档案（无有效图片或模型输出无法识别）
    #[default]
    Default,
    /// 来自上一会话的缓存
    Cached,
}

/// 风格档案：色板、风格描述、语气、禁用元素、风险阈值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub palette: Vec<String>,
    pub style_description: String,
    pub voice: String,
    pub forbidden_elements: Vec<String>,
    pub risk_thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub source: ProfileSource,
}

impl StyleProfile {
    /// 固定默认档案：缺失字段一律从这里补齐
    pub fn default_profile() -> Self {
        let mut risk_thresholds = BTreeMap::new();
        risk_thresholds.insert("palette_deviation".to_string(), 0.2);
        risk_thresholds.insert("forbidden_elements".to_string(), 0.0);
        Self {
            palette: vec![
                "#1A1A1A".to_string(),
                "#FFFFFF".to_string(),
                "#3B82F6".to_string(),
            ],
            style_description: "Clean, modern composition with generous whitespace and a single focal subject"
                .to_string(),
            voice: "Confident, friendly and concise".to_string(),
            forbidden_elements: vec![
                "low-resolution imagery".to_string(),
                "off-palette colors".to_string(),
                "distorted logos".to_string(),
            ],
            risk_thresholds,
            source: ProfileSource::Default,
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ProfileSource::Default
    }

    pub fn with_source(mut self, source: ProfileSource) -> Self {
        self.source = source;
        self
    }

    /// 拼入生成/校验提示词的文本块
    pub fn to_prompt_block(&self) -> String {
        let risks = self
            .risk_thresholds
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Palette: {}\nStyle: {}\nVoice: {}\nForbidden: {}\nRisk thresholds: {}",
            self.palette.join(", "),
            self.style_description,
            self.voice,
            self.forbidden_elements.join(", "),
            risks
        )
    }
}

/// 输入素材种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Text,
    Swatch,
}

/// 调用方提供的参考素材（整个运行期间只读）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputArtifact {
    Image { mime_type: String, data: Vec<u8> },
    Text { content: String },
    Swatch { color: String },
}

impl InputArtifact {
    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        InputArtifact::Image {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        InputArtifact::Text {
            content: content.into(),
        }
    }

    pub fn swatch(color: impl Into<String>) -> Self {
        InputArtifact::Swatch {
            color: color.into(),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            InputArtifact::Image { .. } => ArtifactKind::Image,
            InputArtifact::Text { .. } => ArtifactKind::Text,
            InputArtifact::Swatch { .. } => ArtifactKind::Swatch,
        }
    }

    /// 非空且 MIME 为 image/* 的图片才算有效
    pub fn is_valid_image(&self) -> bool {
        match self {
            InputArtifact::Image { mime_type, data } => {
                !data.is_empty() && mime_type.starts_with("image/")
            }
            _ => false,
        }
    }
}

/// 生成的二进制产物（只存在于 AgentState 与进度事件中）
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: format!("artifact-{}", uuid::Uuid::new_v4()),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            mime_type: self.mime_type.clone(),
            bytes: self.data.len(),
        }
    }
}

/// 产物引用：用于传输层与摘要，不含二进制
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub mime_type: String,
    pub bytes: usize,
}

/// 工具执行结果：成功 / 可重试的软失败 / 不可重试的硬失败
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success { payload: Value },
    SoftFailure { reason: String, retry_suggested: bool },
    HardFailure { reason: String },
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        ToolResult::Success { payload }
    }

    pub fn soft(reason: impl Into<String>) -> Self {
        ToolResult::SoftFailure {
            reason: reason.into(),
            retry_suggested: false,
        }
    }

    pub fn soft_retry(reason: impl Into<String>) -> Self {
        ToolResult::SoftFailure {
            reason: reason.into(),
            retry_suggested: true,
        }
    }

    pub fn hard(reason: impl Into<String>) -> Self {
        ToolResult::HardFailure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }

    /// 回灌给模型的紧凑摘要：成功标志、关键字段、截断后的短文本
    pub fn summary(&self) -> Value {
        match self {
            ToolResult::Success { payload } => serde_json::json!({
                "ok": true,
                "result": compact(payload),
            }),
            ToolResult::SoftFailure {
                reason,
                retry_suggested,
            } => serde_json::json!({
                "ok": false,
                "retryable": true,
                "retry_suggested": retry_suggested,
                "error": truncate(reason),
            }),
            ToolResult::HardFailure { reason } => serde_json::json!({
                "ok": false,
                "retryable": false,
                "error": truncate(reason),
            }),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > SUMMARY_TEXT_CHARS {
        format!("{}...", s.chars().take(SUMMARY_TEXT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

fn compact(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(SUMMARY_ARRAY_ITEMS)
                .map(compact)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), compact(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 这条 generate_image 记录在运行时是否消耗了生成次数：
/// 参数未通过 schema 校验或因次数用尽被拒绝的调用不计数
fn consumed_attempt(output: &Value) -> bool {
    if output.get("ok").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let error = output.get("error").and_then(Value::as_str).unwrap_or_default();
    !(error.starts_with(names::INVALID_ARGS_PREFIX) || error.starts_with(names::ATTEMPT_LIMIT_PREFIX))
}

/// 单个字段变更；StateDelta 按顺序应用
#[derive(Clone, Debug)]
pub enum StateChange {
    Phase(AgentPhase),
    StyleProfile(StyleProfile),
    Artifact(Arc<Artifact>),
    /// 校验结果只在 artifact_id 仍是当前产物时生效
    Validation {
        artifact_id: String,
        score: f64,
        passed: bool,
        feedback: Vec<String>,
    },
    /// 新产物生成后，旧的校验结果失效
    ClearValidation,
    Prompt(String),
    /// 终止信号（仅 complete 工具产生）
    Finish { success: bool, message: String },
}

/// 工具返回的状态增量
#[derive(Clone, Debug, Default)]
pub struct StateDelta {
    changes: Vec<StateChange>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, change: StateChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn push(&mut self, change: StateChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// 本增量写入的产物（用于 AgentAction.artifact_reference）
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        self.changes.iter().rev().find_map(|c| match c {
            StateChange::Artifact(a) => Some(a),
            _ => None,
        })
    }
}

/// 单次工具调用记录；追加后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    /// 全运行内的全序（派发时按请求顺序分配）
    pub sequence_number: u64,
    /// 所属回合（1 起）
    pub turn: u32,
    pub call_id: String,
    pub tool_name: String,
    pub input_args: Value,
    /// ToolResult 的紧凑摘要
    pub output_result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_reference: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// complete 工具合并时生成的终态结果
#[derive(Clone, Debug)]
pub struct FinalBundle {
    pub success: bool,
    pub message: String,
    pub artifact: Option<Arc<Artifact>>,
}

/// 单次运行的全部可变状态；只有编排循环持有可变引用
#[derive(Debug, Clone)]
pub struct AgentState {
    phase: AgentPhase,
    style_profile: Option<StyleProfile>,
    current_artifact: Option<Arc<Artifact>>,
    validation_score: Option<f64>,
    validation_passed: Option<bool>,
    validation_feedback: Vec<String>,
    best_artifact: Option<(f64, Arc<Artifact>)>,
    attempts: u32,
    max_attempts: u32,
    current_prompt: Option<String>,
    history: Vec<AgentAction>,
    input_artifacts: Arc<[InputArtifact]>,
    next_sequence: u64,
}

impl AgentState {
    pub fn new(input_artifacts: Vec<InputArtifact>, max_attempts: u32) -> Self {
        Self {
            phase: AgentPhase::Planning,
            style_profile: None,
            current_artifact: None,
            validation_score: None,
            validation_passed: None,
            validation_feedback: Vec::new(),
            best_artifact: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            current_prompt: None,
            history: Vec::new(),
            input_artifacts: input_artifacts.into(),
            next_sequence: 1,
        }
    }

    /// 从缓存档案与上一会话的历史恢复状态。
    /// 产物二进制无法从历史恢复（历史只保存引用），attempts / 校验结果 / 阶段按历史重放得出。
    pub fn hydrate(
        input_artifacts: Vec<InputArtifact>,
        max_attempts: u32,
        cached_profile: Option<StyleProfile>,
        prior_history: Vec<AgentAction>,
    ) -> Result<Self, AgentError> {
        let mut state = Self::new(input_artifacts, max_attempts);
        if let Some(profile) = cached_profile {
            state.style_profile = Some(profile.with_source(ProfileSource::Cached));
        }

        let mut last_seq = 0;
        for action in &prior_history {
            if action.sequence_number <= last_seq {
                return Err(AgentError::InvalidHistory(format!(
                    "sequence number {} follows {}",
                    action.sequence_number, last_seq
                )));
            }
            last_seq = action.sequence_number;

            let ok = action
                .output_result
                .get("ok")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            match action.tool_name.as_str() {
                names::GENERATE_IMAGE => {
                    if consumed_attempt(&action.output_result) {
                        state.attempts = (state.attempts + 1).min(state.max_attempts);
                    }
                    if ok {
                        state.validation_score = None;
                        state.validation_passed = None;
                        state.validation_feedback.clear();
                        if let Some(prompt) = action.input_args.get("prompt").and_then(Value::as_str) {
                            state.current_prompt = Some(prompt.to_string());
                        }
                    }
                }
                names::VALIDATE_COMPLIANCE if ok => {
                    let result = &action.output_result["result"];
                    state.validation_score = result.get("score").and_then(Value::as_f64);
                    state.validation_passed = result.get("passed").and_then(Value::as_bool);
                    state.validation_feedback = result
                        .get("fix_instructions")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                }
                names::REFINE_PROMPT if ok => {
                    if let Some(prompt) = action.output_result["result"]
                        .get("revised_prompt")
                        .and_then(Value::as_str)
                    {
                        state.current_prompt = Some(prompt.to_string());
                    }
                }
                _ => {}
            }
            if ok {
                if let Some(phase) = names::phase_for(&action.tool_name) {
                    state.set_phase(phase);
                }
            }
        }
        state.next_sequence = last_seq + 1;
        state.history = prior_history;
        Ok(state)
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn style_profile(&self) -> Option<&StyleProfile> {
        self.style_profile.as_ref()
    }

    pub fn current_artifact(&self) -> Option<&Arc<Artifact>> {
        self.current_artifact.as_ref()
    }

    pub fn validation_score(&self) -> Option<f64> {
        self.validation_score
    }

    pub fn validation_passed(&self) -> Option<bool> {
        self.validation_passed
    }

    pub fn validation_feedback(&self) -> &[String] {
        &self.validation_feedback
    }

    /// 当前产物尚未校验时返回当前产物；否则返回校验分数最高的产物
    pub fn best_artifact(&self) -> Option<&Arc<Artifact>> {
        if self.validation_score.is_none() && self.current_artifact.is_some() {
            return self.current_artifact.as_ref();
        }
        self.best_artifact
            .as_ref()
            .map(|(_, a)| a)
            .or(self.current_artifact.as_ref())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }

    pub fn history(&self) -> &[AgentAction] {
        &self.history
    }

    pub fn input_artifacts(&self) -> &[InputArtifact] {
        &self.input_artifacts
    }

    /// 历史中最大的回合号（恢复会话时回合编号从其后继续）
    pub fn last_turn(&self) -> u32 {
        self.history.iter().map(|a| a.turn).max().unwrap_or(0)
    }

    /// 分配下一个序号（派发前调用，保证按请求顺序）
    pub(crate) fn reserve_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub(crate) fn consume_attempt(&mut self) {
        self.attempts += 1;
    }

    /// 非法迁移被忽略并返回 false
    pub(crate) fn set_phase(&mut self, next: AgentPhase) -> bool {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            true
        } else {
            tracing::debug!(from = ?self.phase, to = ?next, "ignoring phase regression");
            false
        }
    }

    /// 按顺序应用增量；若含 Finish，返回此刻的终态结果（产物取 state 中的权威值）
    pub(crate) fn apply(&mut self, delta: &StateDelta) -> Option<FinalBundle> {
        let mut bundle = None;
        for change in delta.changes() {
            match change {
                StateChange::Phase(p) => {
                    self.set_phase(*p);
                }
                StateChange::StyleProfile(profile) => self.style_profile = Some(profile.clone()),
                StateChange::Artifact(artifact) => self.current_artifact = Some(artifact.clone()),
                StateChange::Validation {
                    artifact_id,
                    score,
                    passed,
                    feedback,
                } => {
                    let Some(current) = self.current_artifact.clone() else {
                        continue;
                    };
                    if &current.id != artifact_id {
                        tracing::debug!(%artifact_id, "ignoring validation of a superseded artifact");
                        continue;
                    }
                    self.validation_score = Some(*score);
                    self.validation_passed = Some(*passed);
                    self.validation_feedback = feedback.clone();
                    if self.best_artifact.as_ref().map_or(true, |(best, _)| *score > *best) {
                        self.best_artifact = Some((*score, current));
                    }
                }
                StateChange::ClearValidation => {
                    self.validation_score = None;
                    self.validation_passed = None;
                    self.validation_feedback.clear();
                }
                StateChange::Prompt(prompt) => self.current_prompt = Some(prompt.clone()),
                StateChange::Finish { success, message } => {
                    bundle = Some(FinalBundle {
                        success: *success,
                        message: message.clone(),
                        artifact: self.current_artifact.clone(),
                    });
                }
            }
        }
        bundle
    }

    pub(crate) fn append(&mut self, action: AgentAction) {
        debug_assert!(self
            .history
            .last()
            .map_or(true, |last| last.sequence_number < action.sequence_number));
        self.history.push(action);
    }

    pub(crate) fn into_history(self) -> Vec<AgentAction> {
        self.history
    }

    #[cfg(test)]
    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }
}
