//! 编排循环集成测试：全部通过 MockLlmClient 驱动，不访问网络

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use muse::config::AppConfig;
use muse::core::{AgentError, InputArtifact, ProfileSource, StyleProfile};
use muse::llm::{CompletionPurpose, LlmError, MockLlmClient, ModelTurn};
use muse::memory::continuation;
use muse::react::{ChannelProgress, NoopProgress, ProgressEvent};
use muse::tools::names;
use muse::{Agent, RunRequest, StopReason};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn test_config(max_iterations: u32) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".into();
    cfg.agent.max_iterations = max_iterations;
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 2;
    cfg.retry.jitter = false;
    cfg
}

fn agent_with(mock: &Arc<MockLlmClient>, cfg: &AppConfig) -> Agent {
    Agent::from_config(cfg, mock.clone())
}

fn reference_image() -> Vec<InputArtifact> {
    vec![InputArtifact::image("image/png", vec![0x89, 0x50, 0x4E, 0x47])]
}

fn validation_json(score: u32, pass: bool) -> String {
    json!({ "score": score, "pass": pass, "issues": [], "fix_instructions": ["tighten the palette"] })
        .to_string()
}

fn tool_names(history: &[muse::core::AgentAction]) -> Vec<&str> {
    history.iter().map(|a| a.tool_name.as_str()).collect()
}

#[tokio::test]
async fn test_iteration_ceiling_bounds_history() {
    let mock = Arc::new(MockLlmClient::new().with_turns(|_, turn| {
        Ok(ModelTurn::call(names::SEARCH_CONTEXT, json!({ "query": format!("trend {turn}") })))
    }));
    let agent = agent_with(&mock, &test_config(5));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::IterationLimit);
    assert!(!outcome.success);
    assert!(outcome.artifact.is_none());
    assert_eq!(outcome.turns, 5);
    assert_eq!(mock.turn_count(), 5);
    assert_eq!(outcome.history.len(), 5);
}

#[tokio::test]
async fn test_complete_flag_is_reported_as_success() {
    let mock = Arc::new(MockLlmClient::new().with_script([ModelTurn::call(
        names::COMPLETE,
        json!({ "success": false, "message": "Could not reach the goal" }),
    )]));
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert!(!outcome.success);
    assert!(!outcome.degraded);
    assert_eq!(outcome.message, "Could not reach the goal");
    assert_eq!(tool_names(&outcome.history), [names::COMPLETE]);
}

#[tokio::test]
async fn test_parallel_results_merge_in_request_order() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_script([
                ModelTurn::call(names::SEARCH_CONTEXT, json!({ "query": "alpha" }))
                    .with_call(names::SEARCH_CONTEXT, json!({ "query": "beta" }))
                    .with_call(names::SEARCH_CONTEXT, json!({ "query": "gamma" }))
                    .with_text("Gathering context")
                    .with_continuation("sig-1"),
                ModelTurn::call(names::COMPLETE, json!({ "success": false, "message": "done" })),
            ])
            .with_completion_latency(|req| {
                if req.prompt.contains("alpha") {
                    Duration::from_millis(120)
                } else if req.prompt.contains("beta") {
                    Duration::from_millis(60)
                } else {
                    Duration::from_millis(1)
                }
            }),
    );
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    let finished = mock.finished_completions();
    assert_eq!(finished.len(), 3);
    assert!(finished[0].contains("gamma"));
    assert!(finished[2].contains("alpha"));

    let searches = &outcome.history[..3];
    let queries: Vec<_> = searches.iter().map(|a| a.input_args["query"].as_str().unwrap()).collect();
    assert_eq!(queries, ["alpha", "beta", "gamma"]);
    assert!(searches.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
    assert!(searches.iter().all(|a| a.turn == searches[0].turn));

    // 推理文本与续接令牌只记录在该回合的第一个动作上
    assert_eq!(searches[0].reasoning_text.as_deref(), Some("Gathering context"));
    assert_eq!(searches[0].continuation_token.as_deref(), Some("sig-1"));
    assert!(searches[1..].iter().all(|a| a.continuation_token.is_none()));

    let second = &mock.requests()[1];
    let results = &second.messages.last().unwrap().parts;
    let ids: Vec<_> = results
        .iter()
        .filter_map(|p| match p {
            muse::memory::Part::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = searches.iter().map(|a| a.call_id.clone()).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_profile_shapes_normalize_to_same_profile() {
    let shapes = [
        json!({
            "palette": ["#0a0a0a", "ffcc00"],
            "style_description": "Bold geometric shapes",
            "voice": "Energetic",
            "forbidden_elements": ["gradients"],
            "risk_thresholds": { "palette_deviation": 0.1 }
        }),
        json!({
            "style_profile": {
                "palette": ["#0A0A0A", "#FFCC00"],
                "style_description": "Bold geometric shapes",
                "voice": "Energetic",
                "forbidden_elements": ["gradients"],
                "risk_thresholds": { "palette_deviation": 0.1 }
            }
        }),
        json!({
            "colorPalette": "#0A0A0A, #FFCC00",
            "aesthetic": "Bold geometric shapes",
            "brandVoice": "Energetic",
            "forbiddenElements": ["gradients"],
            "riskThresholds": { "palette_deviation": 0.1 }
        }),
    ];

    let mut profiles = Vec::new();
    for shape in shapes {
        let raw = format!("Here is the profile:\n```json\n{shape}\n```");
        let mock = Arc::new(
            MockLlmClient::new()
                .with_script([
                    ModelTurn::call(names::EXTRACT_STYLE, json!({})),
                    ModelTurn::call(names::COMPLETE, json!({ "success": false, "message": "stop" })),
                ])
                .with_completion(move |req| match req.purpose {
                    CompletionPurpose::StyleExtraction => Ok(raw.clone()),
                    _ => Ok(validation_json(95, true)),
                }),
        );
        let agent = agent_with(&mock, &test_config(8));
        let outcome = agent
            .run("poster", reference_image(), None, Vec::new())
            .await
            .unwrap();
        profiles.push(outcome.profile.unwrap());
    }

    assert_eq!(profiles[0].source, ProfileSource::Extracted);
    assert_eq!(profiles[0].palette, ["#0A0A0A", "#FFCC00"]);
    assert_eq!(profiles[0], profiles[1]);
    assert_eq!(profiles[0], profiles[2]);
}

#[tokio::test]
async fn test_passing_score_goes_straight_to_complete() {
    // 模型的 pass 标志与分数矛盾时以分数为准
    let mock = Arc::new(MockLlmClient::new().with_completion(|req| match req.purpose {
        CompletionPurpose::Validation => Ok(validation_json(92, false)),
        CompletionPurpose::StyleExtraction => Ok(json!({ "voice": "Calm" }).to_string()),
        _ => Ok("unused".to_string()),
    }));
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent
        .run("A spring sale banner", reference_image(), None, Vec::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.validation_score, Some(92.0));
    assert_eq!(
        tool_names(&outcome.history),
        [names::EXTRACT_STYLE, names::GENERATE_IMAGE, names::VALIDATE_COMPLIANCE, names::COMPLETE]
    );
    assert_eq!(mock.image_count(), 1);
}

#[tokio::test]
async fn test_failing_score_triggers_refine_then_regenerate() {
    let validations = Arc::new(AtomicU32::new(0));
    let counter = validations.clone();
    let mock = Arc::new(MockLlmClient::new().with_completion(move |req| match req.purpose {
        CompletionPurpose::Validation => {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 { validation_json(60, false) } else { validation_json(95, true) })
        }
        CompletionPurpose::Refinement => Ok("A spring sale banner in navy and orange".to_string()),
        _ => Ok(json!({ "palette": ["#001F3F", "#FF851B"] }).to_string()),
    }));
    let agent = agent_with(&mock, &test_config(10));

    let outcome = agent
        .run("A spring sale banner", reference_image(), None, Vec::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(
        tool_names(&outcome.history),
        [
            names::EXTRACT_STYLE,
            names::GENERATE_IMAGE,
            names::VALIDATE_COMPLIANCE,
            names::REFINE_PROMPT,
            names::GENERATE_IMAGE,
            names::VALIDATE_COMPLIANCE,
            names::COMPLETE,
        ]
    );
    let second_generate = &outcome.history[4];
    assert_eq!(second_generate.input_args["prompt"], "A spring sale banner in navy and orange");
    assert_eq!(outcome.validation_score, Some(95.0));
    assert_eq!(mock.image_count(), 2);
}

#[tokio::test]
async fn test_attempt_limit_returns_best_image() {
    let mock = Arc::new(MockLlmClient::new().with_completion(|req| match req.purpose {
        CompletionPurpose::Validation => Ok(validation_json(40, false)),
        CompletionPurpose::Refinement => Ok("try again with fewer elements".to_string()),
        _ => Ok("{}".to_string()),
    }));
    let agent = agent_with(&mock, &test_config(20));

    let outcome = agent
        .run("poster", reference_image(), None, Vec::new())
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::AttemptLimit);
    assert!(outcome.success);
    assert!(outcome.degraded);
    assert!(outcome.artifact.is_some());
    assert_eq!(mock.image_count(), 3);
    let generates = outcome
        .history
        .iter()
        .filter(|a| a.tool_name == names::GENERATE_IMAGE)
        .count();
    assert_eq!(generates, 3);
    assert_eq!(outcome.history.last().unwrap().tool_name, names::VALIDATE_COMPLIANCE);
}

#[tokio::test]
async fn test_generation_beyond_limit_is_soft_failure() {
    let mock = Arc::new(MockLlmClient::new().with_turns(|_, turn| {
        Ok(if turn <= 4 {
            ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": format!("draft {turn}") }))
        } else {
            ModelTurn::call(names::COMPLETE, json!({ "success": true, "message": "done" }))
        })
    }));
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert_eq!(mock.image_count(), 3);
    assert_eq!(outcome.history.len(), 5);
    let rejected = &outcome.history[3].output_result;
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["retryable"], true);
    assert!(outcome.success);
}

#[tokio::test]
async fn test_exchange_failure_after_images_degrades() {
    let mock = Arc::new(MockLlmClient::new().with_turns(|_, turn| {
        if turn <= 3 {
            Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": format!("draft {turn}") })))
        } else {
            Err(LlmError::Rejected {
                status: 400,
                message: "context too long".into(),
            })
        }
    }));
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert!(outcome.success);
    assert!(outcome.degraded);
    assert_eq!(outcome.stop_reason, StopReason::Degraded);
    assert_eq!(mock.image_count(), 3);
    assert_eq!(outcome.history.len(), 3);
    let last_image = outcome.history[2].artifact_reference.clone();
    assert_eq!(outcome.artifact.map(|a| a.id.clone()), last_image);
}

#[tokio::test]
async fn test_exchange_failure_returns_newest_image_not_older_validated_one() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_turns(|_, turn| match turn {
                1 => Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": "first draft" }))),
                2 => Ok(ModelTurn::call(names::VALIDATE_COMPLIANCE, json!({}))),
                3 => Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": "second draft" }))),
                _ => Err(LlmError::Rejected {
                    status: 400,
                    message: "bad request".into(),
                }),
            })
            .with_completion(|_| Ok(validation_json(40, false))),
    );
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Degraded);
    assert!(outcome.success);
    let first = outcome.history[0].artifact_reference.clone().unwrap();
    let second = outcome.history[2].artifact_reference.clone().unwrap();
    let returned = outcome.artifact.unwrap().id.clone();
    assert_eq!(returned, second);
    assert_ne!(returned, first);
}

#[tokio::test]
async fn test_exhausted_transient_retries_degrade_to_current_image() {
    let cfg = test_config(8);
    let mock = Arc::new(MockLlmClient::new().with_turns(|_, turn| {
        if turn <= 2 {
            Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": format!("draft {turn}") })))
        } else {
            Err(LlmError::Server {
                status: 503,
                message: "overloaded".into(),
            })
        }
    }));
    let agent = agent_with(&mock, &cfg);

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Degraded);
    assert!(outcome.success);
    assert!(outcome.degraded);
    assert_eq!(mock.turn_count(), 2 + cfg.retry.max_attempts);
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(
        outcome.artifact.map(|a| a.id.clone()),
        outcome.history[1].artifact_reference.clone()
    );
}

#[tokio::test]
async fn test_exchange_failure_without_image_returns_history() {
    let mock = Arc::new(MockLlmClient::new().with_turns(|_, turn| {
        if turn == 1 {
            Ok(ModelTurn::call(names::SEARCH_CONTEXT, json!({ "query": "brand" })))
        } else {
            Err(LlmError::InvalidResponse("no candidates".into()))
        }
    }));
    let agent = agent_with(&mock, &test_config(8));

    let err = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap_err();

    assert!(matches!(err.source, AgentError::TurnExchange(LlmError::InvalidResponse(_))));
    assert_eq!(tool_names(&err.history), [names::SEARCH_CONTEXT]);
}

#[tokio::test]
async fn test_transient_exchange_error_is_retried() {
    let mock = Arc::new(MockLlmClient::new());
    mock.push_error(LlmError::Server {
        status: 503,
        message: "overloaded".into(),
    });
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent
        .run("poster", reference_image(), None, Vec::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.turns, 4);
    assert_eq!(mock.turn_count(), 5);
}

#[tokio::test]
async fn test_zero_inputs_use_default_profile() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent.run("poster", Vec::new(), None, Vec::new()).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.profile, Some(StyleProfile::default_profile()));
    // 只有校验调用了补全
    assert_eq!(mock.finished_completions().len(), 1);
}

#[tokio::test]
async fn test_replay_matches_live_conversation() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));
    let inputs = reference_image();

    let outcome = agent
        .run("A launch poster", inputs.clone(), None, Vec::new())
        .await
        .unwrap();
    assert_eq!(outcome.history.len(), 4);

    let requests = mock.requests();
    let live = &requests[3].messages;
    let replayed = continuation::replay("A launch poster", &inputs, false, &outcome.history[..3]);
    assert_eq!(replayed.messages(), live.as_slice());

    let tokens: Vec<_> = replayed
        .continuation_positions()
        .into_iter()
        .map(|(_, token)| token)
        .collect();
    assert_eq!(tokens, ["mock-1", "mock-2", "mock-3"]);
}

#[tokio::test]
async fn test_resume_continues_sequence_numbers() {
    let first_mock = Arc::new(MockLlmClient::new());
    let first = agent_with(&first_mock, &test_config(2))
        .run("poster", reference_image(), None, Vec::new())
        .await
        .unwrap();
    assert_eq!(first.stop_reason, StopReason::IterationLimit);
    assert_eq!(tool_names(&first.history), [names::EXTRACT_STYLE, names::GENERATE_IMAGE]);

    let mock = Arc::new(MockLlmClient::new());
    let resumed = agent_with(&mock, &test_config(8))
        .run("poster", reference_image(), first.profile.clone(), first.history.clone())
        .await
        .unwrap();

    assert!(resumed.success);
    assert_eq!(
        tool_names(&resumed.history),
        [
            names::EXTRACT_STYLE,
            names::GENERATE_IMAGE,
            names::GENERATE_IMAGE,
            names::VALIDATE_COMPLIANCE,
            names::COMPLETE,
        ]
    );
    assert!(resumed
        .history
        .windows(2)
        .all(|w| w[0].sequence_number < w[1].sequence_number));
    assert!(resumed.history[2].turn > first.history[1].turn);

    // 首个回合请求 = 重放的历史 + 恢复说明
    let opening = &mock.requests()[0].messages;
    assert_eq!(opening.len(), 6);
    let replayed = continuation::replay("poster", &reference_image(), true, &first.history);
    assert_eq!(&opening[..5], replayed.messages());
}

#[tokio::test]
async fn test_resume_does_not_count_rejected_generations() {
    let first_mock = Arc::new(MockLlmClient::new().with_turns(|_, _| {
        Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": 5 })))
    }));
    let first = agent_with(&first_mock, &test_config(3))
        .run("poster", Vec::new(), None, Vec::new())
        .await
        .unwrap();
    assert_eq!(first.stop_reason, StopReason::IterationLimit);
    assert_eq!(first_mock.image_count(), 0);
    assert!(first.history.iter().all(|a| a.output_result["ok"] == false));

    let mock = Arc::new(MockLlmClient::new().with_script([
        ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": "a clean poster" })),
        ModelTurn::call(names::COMPLETE, json!({ "success": true, "message": "done" })),
    ]));
    let resumed = agent_with(&mock, &test_config(8))
        .run("poster", Vec::new(), None, first.history.clone())
        .await
        .unwrap();

    assert_eq!(mock.image_count(), 1);
    assert_eq!(resumed.history[3].output_result["ok"], true);
    assert!(resumed.artifact.is_some());
    assert!(resumed.success);
}

#[tokio::test]
async fn test_out_of_order_history_is_rejected() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));
    let done = agent
        .run("poster", Vec::new(), None, Vec::new())
        .await
        .unwrap();
    let mut history = done.history;
    history.swap(0, 1);

    let err = agent
        .run("poster", Vec::new(), None, history)
        .await
        .unwrap_err();
    assert!(matches!(err.source, AgentError::InvalidHistory(_)));
    assert_eq!(mock.turn_count(), 4);
}

#[tokio::test]
async fn test_cancel_before_start_fails_without_history() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = agent
        .run_request(RunRequest::new("poster"), &NoopProgress, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err.source, AgentError::Cancelled));
    assert!(err.history.is_empty());
    assert_eq!(mock.turn_count(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_returns_partial_result() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mock = Arc::new(MockLlmClient::new().with_turns(move |_, turn| match turn {
        1 => Ok(ModelTurn::call(names::GENERATE_IMAGE, json!({ "prompt": "draft" }))),
        _ => {
            trigger.cancel();
            Ok(ModelTurn::call(names::VALIDATE_COMPLIANCE, json!({})))
        }
    }));
    let agent = agent_with(&mock, &test_config(8));

    let outcome = agent
        .run_request(RunRequest::new("poster"), &NoopProgress, cancel)
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert!(!outcome.success);
    assert!(outcome.artifact.is_some());
    assert_eq!(tool_names(&outcome.history), [names::GENERATE_IMAGE]);
}

#[tokio::test]
async fn test_progress_stream_mirrors_history() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let outcome = agent
        .run_stream(
            RunRequest::new("poster").with_inputs(reference_image()),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let actions: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Action { action, .. } => Some(action.sequence_number),
            _ => None,
        })
        .collect();
    let recorded: Vec<_> = outcome.history.iter().map(|a| a.sequence_number).collect();
    assert_eq!(actions, recorded);
    assert!(matches!(events.first(), Some(ProgressEvent::TurnStarted { turn: 1, .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Finished { success: true, stop_reason: StopReason::Completed, .. })
    ));

    // 传输帧中产物只以引用出现
    let generated = events
        .iter()
        .find(|e| matches!(e, ProgressEvent::Action { artifact: Some(_), .. }))
        .unwrap()
        .to_wire();
    assert_eq!(generated["type"], "action");
    assert!(generated["artifact"]["id"].is_string());
    assert!(generated["artifact"].get("data").is_none());
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = agent_with(&mock, &test_config(8));
    let sink_a = ChannelProgress::new(tokio::sync::mpsc::unbounded_channel().0);

    let (a, b) = tokio::join!(
        agent.run_request(RunRequest::new("first").with_inputs(reference_image()), &sink_a, CancellationToken::new()),
        agent.run_request(RunRequest::new("second"), &NoopProgress, CancellationToken::new()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.success && b.success);
    assert_eq!(a.history.len(), 4);
    assert_eq!(b.history.len(), 4);
    assert_eq!(a.profile.unwrap().source, ProfileSource::Extracted);
    assert_eq!(b.profile.unwrap().source, ProfileSource::Default);
    let first: Vec<Value> = a.history.iter().map(|h| h.input_args.clone()).collect();
    assert_eq!(first[1]["prompt"], "first");
}
