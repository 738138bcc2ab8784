//! 编排主循环
//!
//! 回合交换 → 解析工具调用 → 按请求顺序分配序号并并行派发 → 按请求顺序合并增量、追加历史、推送进度 →
//! 结果摘要作为下一回合输入。complete 工具、模型不再调用工具、回合上限、尝试上限、取消都会结束循环。
//! 回合交换失败在退避重试后：有产物则降级返回，无产物则连同历史一并向上传播。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    AgentAction, AgentError, AgentState, Artifact, BackoffPolicy, FinalBundle, InputArtifact,
    RunError, StyleProfile, ToolResult,
};
use crate::llm::{LlmClient, LlmError, ModelTurn, TurnRequest};
use crate::memory::{continuation, Conversation, Part};
use crate::react::{ProgressEvent, ProgressSink};
use crate::tools::{names, ToolExecutor, ToolOutput};

/// 循环的上限与超时
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// 回合交换上限
    pub max_iterations: u32,
    /// generate → validate → refine 循环上限
    pub max_attempts: u32,
    /// 单次回合交换超时
    pub turn_timeout: Duration,
}

impl LoopConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.agent.max_iterations.max(1),
            max_attempts: cfg.agent.max_attempts.max(1),
            turn_timeout: Duration::from_secs(cfg.llm.timeouts.text_secs.max(1)),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次运行的输入
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub goal: String,
    pub input_artifacts: Vec<InputArtifact>,
    /// 上一会话缓存的风格档案（命中时可跳过 analyze）
    pub cached_profile: Option<StyleProfile>,
    /// 上一会话的历史（恢复会话）
    pub prior_history: Vec<AgentAction>,
}

impl RunRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<InputArtifact>) -> Self {
        self.input_artifacts = inputs;
        self
    }

    pub fn with_cached_profile(mut self, profile: Option<StyleProfile>) -> Self {
        self.cached_profile = profile;
        self
    }

    pub fn with_prior_history(mut self, history: Vec<AgentAction>) -> Self {
        self.prior_history = history;
        self
    }
}

/// 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// complete 工具被调用
    Completed,
    /// 模型本回合没有调用任何工具
    ModelStopped,
    /// 达到回合上限
    IterationLimit,
    /// 尝试次数用尽且最后一次校验未通过
    AttemptLimit,
    /// 回合交换失败，降级返回已有产物
    Degraded,
    /// 调用方取消
    Cancelled,
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub artifact: Option<Arc<Artifact>>,
    pub message: String,
    pub history: Vec<AgentAction>,
    pub profile: Option<StyleProfile>,
    pub stop_reason: StopReason,
    /// 未经 complete 正常结束、返回的是部分结果
    pub degraded: bool,
    /// 本次运行的回合交换次数
    pub turns: u32,
    pub validation_score: Option<f64>,
}

/// 编排器：持有模型客户端、工具执行器与统一退避策略
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    backoff: BackoffPolicy,
    config: LoopConfig,
}

struct Ending {
    success: bool,
    artifact: Option<Arc<Artifact>>,
    message: String,
    stop_reason: StopReason,
    degraded: bool,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        backoff: BackoffPolicy,
        config: LoopConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            backoff,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    fn system_prompt(&self, state: &AgentState) -> String {
        let profile = match state.style_profile() {
            Some(p) => format!("loaded ({:?})", p.source),
            None => "not extracted".to_string(),
        };
        let artifact = state
            .current_artifact()
            .map(|a| a.id.clone())
            .unwrap_or_else(|| "none".to_string());
        let score = state
            .validation_score()
            .map(|s| format!("{s:.0}"))
            .unwrap_or_else(|| "none".to_string());
        format!(
            "You produce on-style marketing images by calling tools. Work in order: extract_style, \
             generate_image, validate_compliance, then refine_prompt and generate_image again while \
             validation fails and attempts remain. Call complete when done. Multiple independent tools \
             may be called in one turn.\n\
             Current phase: {:?}. Style profile: {profile}. Current image: {artifact}. Last score: {score}. \
             Generation attempts used: {}/{}.",
            state.phase(),
            state.attempts(),
            state.max_attempts(),
        )
    }

    /// 执行一次运行
    pub async fn run(
        &self,
        request: RunRequest,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let RunRequest {
            goal,
            input_artifacts,
            cached_profile,
            prior_history,
        } = request;
        let profile_cached = cached_profile.is_some();
        let resumed = !prior_history.is_empty();
        let recorded = prior_history.clone();

        let mut state = match AgentState::hydrate(
            input_artifacts,
            self.config.max_attempts,
            cached_profile,
            prior_history,
        ) {
            Ok(state) => state,
            Err(e) => {
                progress.emit(ProgressEvent::Failed {
                    error: e.to_string(),
                });
                return Err(RunError::new(e, recorded));
            }
        };

        let mut conversation = if resumed {
            let mut replayed = continuation::replay(
                &goal,
                state.input_artifacts(),
                profile_cached,
                state.history(),
            );
            replayed.push(continuation::resume_note(&state));
            tracing::info!(actions = state.history().len(), "resuming from prior history");
            replayed
        } else {
            Conversation::start(continuation::opening_message(
                &goal,
                state.input_artifacts(),
                profile_cached,
            ))
        };

        let first_turn = state.last_turn();
        let mut turns = 0u32;
        loop {
            if cancel.is_cancelled() {
                return self.cancelled(state, turns, progress);
            }
            if turns >= self.config.max_iterations {
                tracing::warn!(max_iterations = self.config.max_iterations, "iteration limit reached");
                let artifact = state.best_artifact().cloned();
                let ending = Ending {
                    success: artifact.is_some(),
                    message: format!(
                        "Stopped after {} turn(s) without completion{}",
                        turns,
                        if artifact.is_some() {
                            "; returning the best image produced so far"
                        } else {
                            ""
                        }
                    ),
                    artifact,
                    stop_reason: StopReason::IterationLimit,
                    degraded: true,
                };
                return Ok(self.finish(state, ending, turns, progress));
            }
            turns += 1;
            let turn_no = first_turn + turns;
            progress.emit(ProgressEvent::TurnStarted {
                turn: turns,
                max_turns: self.config.max_iterations,
            });

            let turn_request = TurnRequest {
                system: self.system_prompt(&state),
                tools: self.executor.specs(),
                messages: conversation.messages().to_vec(),
                timeout: self.config.turn_timeout,
            };
            let mut model_turn = match self.exchange(&turn_request, &cancel).await {
                Ok(turn) => turn,
                Err(_) if cancel.is_cancelled() => return self.cancelled(state, turns, progress),
                Err(e) => return self.exchange_failed(state, e, turns, progress),
            };

            for (i, call) in model_turn.tool_calls.iter_mut().enumerate() {
                if call.id.is_empty() {
                    call.id = format!("call-{turn_no}-{}", i + 1);
                }
            }
            conversation.push_model_turn(&model_turn);
            tracing::info!(
                turn = turn_no,
                calls = model_turn.tool_calls.len(),
                has_continuation = model_turn.continuation.is_some(),
                "model turn"
            );

            if model_turn.tool_calls.is_empty() {
                let artifact = state.current_artifact().cloned();
                let success = artifact.is_some() && state.validation_passed() != Some(false);
                let ending = Ending {
                    success,
                    artifact,
                    message: model_turn
                        .text
                        .clone()
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_else(|| "The model stopped without calling complete".to_string()),
                    stop_reason: StopReason::ModelStopped,
                    degraded: false,
                };
                return Ok(self.finish(state, ending, turns, progress));
            }
            if cancel.is_cancelled() {
                return self.cancelled(state, turns, progress);
            }

            let outputs = self.dispatch(&model_turn, &mut state).await;
            if cancel.is_cancelled() {
                tracing::warn!(turn = turn_no, "run cancelled; discarding batch results");
                return self.cancelled(state, turns, progress);
            }

            let terminal = self.merge(&model_turn, outputs, turn_no, &mut state, &mut conversation, progress);
            if let Some(bundle) = terminal {
                let ending = Ending {
                    success: bundle.success,
                    artifact: bundle.artifact,
                    message: bundle.message,
                    stop_reason: StopReason::Completed,
                    degraded: false,
                };
                return Ok(self.finish(state, ending, turns, progress));
            }

            if state.attempts_remaining() == 0 && state.validation_passed() == Some(false) {
                tracing::warn!(attempts = state.attempts(), "attempt limit reached without a passing image");
                let artifact = state.best_artifact().cloned();
                let ending = Ending {
                    success: artifact.is_some(),
                    message: format!(
                        "Used all {} generation attempts without passing validation; returning the best image produced",
                        state.max_attempts()
                    ),
                    artifact,
                    stop_reason: StopReason::AttemptLimit,
                    degraded: true,
                };
                return Ok(self.finish(state, ending, turns, progress));
            }
        }
    }

    /// 回合交换：每次尝试都带显式超时，瞬时故障按退避策略重试
    async fn exchange(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, LlmError> {
        let llm = &self.llm;
        self.backoff
            .retry("turn_exchange", Some(cancel), LlmError::is_transient, |attempt| async move {
                tracing::debug!(attempt, "exchanging turn");
                match timeout(request.timeout, llm.exchange(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout),
                }
            })
            .await
    }

    /// 按请求顺序分配序号、做生成次数闸门，然后并行执行
    async fn dispatch(&self, turn: &ModelTurn, state: &mut AgentState) -> Vec<(u64, ToolOutput)> {
        let calls = &turn.tool_calls;
        let sequence: Vec<u64> = calls.iter().map(|_| state.reserve_sequence()).collect();
        let admitted: Vec<bool> = calls
            .iter()
            .map(|call| {
                if call.name != names::GENERATE_IMAGE || !self.executor.accepts(call) {
                    return true;
                }
                if state.attempts_remaining() == 0 {
                    return false;
                }
                state.consume_attempt();
                true
            })
            .collect();

        let max_attempts = state.max_attempts();
        let snapshot: &AgentState = state;
        let outputs = join_all(calls.iter().zip(admitted).map(|(call, admitted)| async move {
            if admitted {
                self.executor.execute(call, snapshot).await
            } else {
                ToolOutput::failure(ToolResult::soft(format!(
                    "{} ({max_attempts}); validate the current image or call complete",
                    names::ATTEMPT_LIMIT_PREFIX
                )))
            }
        }))
        .await;
        sequence.into_iter().zip(outputs).collect()
    }

    /// 按请求顺序合并：应用增量、追加历史、推送进度、构造回灌给模型的结果消息。
    /// 返回本批次中第一个 complete 产生的终态结果。
    fn merge(
        &self,
        turn: &ModelTurn,
        outputs: Vec<(u64, ToolOutput)>,
        turn_no: u32,
        state: &mut AgentState,
        conversation: &mut Conversation,
        progress: &dyn ProgressSink,
    ) -> Option<FinalBundle> {
        let mut terminal = None;
        let mut parts = Vec::with_capacity(outputs.len());
        for (i, (call, (sequence_number, output))) in turn.tool_calls.iter().zip(outputs).enumerate() {
            let bundle = state.apply(&output.delta);
            if terminal.is_none() {
                terminal = bundle;
            }
            let summary = output.result.summary();
            let produced = output.delta.artifact().cloned();
            let action = AgentAction {
                sequence_number,
                turn: turn_no,
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input_args: call.args.clone(),
                output_result: summary.clone(),
                reasoning_text: if i == 0 { turn.text.clone() } else { None },
                continuation_token: if i == 0 { turn.continuation.clone() } else { None },
                artifact_reference: produced.as_ref().map(|a| a.id.clone()),
                recorded_at: Utc::now(),
            };
            state.append(action.clone());
            progress.emit(ProgressEvent::Action {
                action,
                phase: state.phase(),
                artifact: produced,
            });
            parts.push(Part::ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: summary,
            });
        }
        conversation.push_tool_results(parts);
        terminal
    }

    fn exchange_failed(
        &self,
        state: AgentState,
        error: LlmError,
        turns: u32,
        progress: &dyn ProgressSink,
    ) -> Result<RunOutcome, RunError> {
        if let Some(artifact) = state.current_artifact().cloned() {
            tracing::warn!(error = %error, artifact_id = %artifact.id, "turn exchange failed; degrading to the current image");
            let ending = Ending {
                success: true,
                artifact: Some(artifact),
                message: format!(
                    "The run was interrupted ({error}); returning the most recent image"
                ),
                stop_reason: StopReason::Degraded,
                degraded: true,
            };
            return Ok(self.finish(state, ending, turns, progress));
        }
        tracing::error!(error = %error, "turn exchange failed with no image to fall back on");
        let source = AgentError::TurnExchange(error);
        progress.emit(ProgressEvent::Failed {
            error: source.to_string(),
        });
        Err(RunError::new(source, state.into_history()))
    }

    fn cancelled(
        &self,
        state: AgentState,
        turns: u32,
        progress: &dyn ProgressSink,
    ) -> Result<RunOutcome, RunError> {
        tracing::info!(turns, "run cancelled");
        match state.best_artifact().cloned() {
            Some(artifact) => {
                let ending = Ending {
                    success: false,
                    artifact: Some(artifact),
                    message: "Run cancelled; returning the best image produced so far".to_string(),
                    stop_reason: StopReason::Cancelled,
                    degraded: true,
                };
                Ok(self.finish(state, ending, turns, progress))
            }
            None => {
                progress.emit(ProgressEvent::Failed {
                    error: AgentError::Cancelled.to_string(),
                });
                Err(RunError::new(AgentError::Cancelled, state.into_history()))
            }
        }
    }

    fn finish(
        &self,
        state: AgentState,
        ending: Ending,
        turns: u32,
        progress: &dyn ProgressSink,
    ) -> RunOutcome {
        tracing::info!(
            success = ending.success,
            stop_reason = ?ending.stop_reason,
            turns,
            actions = state.history().len(),
            "run finished"
        );
        progress.emit(ProgressEvent::Finished {
            success: ending.success,
            message: ending.message.clone(),
            stop_reason: ending.stop_reason,
            artifact: ending.artifact.clone(),
        });
        let profile = state.style_profile().cloned();
        let validation_score = state.validation_score();
        RunOutcome {
            success: ending.success,
            artifact: ending.artifact,
            message: ending.message,
            history: state.into_history(),
            profile,
            stop_reason: ending.stop_reason,
            degraded: ending.degraded,
            turns,
            validation_score,
        }
    }
}
