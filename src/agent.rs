//! Headless Agent 运行时
//!
//! 由配置构建 LLM 客户端、六个工具与编排器，对外提供 run / run_with_cache / run_stream。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentAction, AgentError, BackoffPolicy, InputArtifact, ProfileSource, RunError, StyleProfile, TaskScheduler};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::ProfileCache;
use crate::react::{
    ChannelProgress, LoopConfig, NoopProgress, Orchestrator, ProgressEvent, ProgressSink,
    RunOutcome, RunRequest,
};
use crate::tools::{
    CompleteTool, ImageGenerationTool, RefinePromptTool, SearchTool, StyleExtractionTool,
    ToolExecutor, ToolRegistry, ValidationTool,
};

/// 根据配置创建 LLM 客户端：openai 缺少 API Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient::new()))
        }
        "openai" => match std::env::var(&cfg.llm.api_key_env) {
            Ok(key) if !key.trim().is_empty() => {
                tracing::info!(model = %cfg.llm.model, image_model = %cfg.llm.image_model, "Using OpenAI-compatible LLM");
                Ok(Arc::new(OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    &cfg.llm.image_model,
                    Some(&key),
                )))
            }
            _ => {
                tracing::warn!(env = %cfg.llm.api_key_env, "No API key set, using Mock LLM");
                Ok(Arc::new(MockLlmClient::new()))
            }
        },
        other => Err(AgentError::ConfigError(format!("unknown llm provider: {other}"))),
    }
}

/// 注册全部工具：文本类调用用 text_secs 超时，图像生成用 generation_secs
pub fn build_registry(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> ToolRegistry {
    let backoff = BackoffPolicy::from_config(&cfg.retry);
    let text = Duration::from_secs(cfg.llm.timeouts.text_secs.max(1));
    let generation = Duration::from_secs(cfg.llm.timeouts.generation_secs.max(1));

    let mut tools = ToolRegistry::new();
    tools.register(StyleExtractionTool::new(llm.clone(), backoff.clone(), text));
    tools.register(ImageGenerationTool::new(llm.clone(), backoff.clone(), generation));
    tools.register(ValidationTool::new(
        llm.clone(),
        backoff.clone(),
        text,
        cfg.agent.pass_threshold,
    ));
    tools.register(RefinePromptTool::new(llm.clone(), backoff.clone(), text));
    tools.register(SearchTool::new(
        llm,
        backoff,
        text,
        cfg.tools.search.max_result_chars,
    ));
    tools.register(CompleteTool);
    tools
}

/// 无界面 Agent：一个实例可顺序或并发执行多次运行，每次运行的状态互相独立
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    orchestrator: Orchestrator,
}

impl Agent {
    pub fn from_config(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let executor = ToolExecutor::new(build_registry(cfg, llm.clone()), cfg.tools.default_timeout_secs)
            .with_scheduler(TaskScheduler::new(cfg.agent.max_concurrent_tools));
        let orchestrator = Orchestrator::new(
            llm.clone(),
            executor,
            BackoffPolicy::from_config(&cfg.retry),
            LoopConfig::from_config(cfg),
        );
        Self { llm, orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// run(goal, inputArtifacts, cachedProfile?, priorHistory?)
    pub async fn run(
        &self,
        goal: impl Into<String>,
        input_artifacts: Vec<InputArtifact>,
        cached_profile: Option<StyleProfile>,
        prior_history: Vec<AgentAction>,
    ) -> Result<RunOutcome, RunError> {
        let request = RunRequest::new(goal)
            .with_inputs(input_artifacts)
            .with_cached_profile(cached_profile)
            .with_prior_history(prior_history);
        self.orchestrator
            .run(request, &NoopProgress, CancellationToken::new())
            .await
    }

    /// 带进度与取消的完整入口
    pub async fn run_request(
        &self,
        request: RunRequest,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        self.orchestrator.run(request, progress, cancel).await
    }

    /// 先查档案缓存（命中则跳过 analyze），运行结束后把新提取的档案写回缓存
    pub async fn run_with_cache(
        &self,
        cache: &dyn ProfileCache,
        key: &str,
        mut request: RunRequest,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if request.cached_profile.is_none() {
            request.cached_profile = cache.get(key);
            if request.cached_profile.is_some() {
                tracing::info!(key, "style profile cache hit");
            }
        }
        let outcome = self.orchestrator.run(request, progress, cancel).await?;
        if let Some(profile) = outcome
            .profile
            .as_ref()
            .filter(|p| p.source == ProfileSource::Extracted)
        {
            cache.put(key, profile);
        }
        Ok(outcome)
    }

    /// 进度事件推送到通道；通道的关闭不影响运行
    pub async fn run_stream(
        &self,
        request: RunRequest,
        tx: UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let sink = ChannelProgress::new(tx);
        self.orchestrator.run(request, &sink, cancel).await
    }

    /// 累计 token 使用：(prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProfileCache;
    use crate::react::StopReason;

    fn mock_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 2;
        cfg
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "carrier-pigeon".into();
        assert!(matches!(create_llm_from_config(&cfg), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_registry_lists_all_tools_with_flat_schemas() {
        let cfg = mock_config();
        let registry = build_registry(&cfg, Arc::new(MockLlmClient::new()));
        let specs = registry.list();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["extract_style", "generate_image", "validate_compliance", "refine_prompt", "search_context", "complete"]
        );
        assert!(specs.iter().all(|s| crate::tools::is_flat(&s.input_schema)));
    }

    #[tokio::test]
    async fn test_autopilot_run_completes() {
        let cfg = mock_config();
        let agent = Agent::from_config(&cfg, Arc::new(MockLlmClient::new()));
        let outcome = agent
            .run("A launch poster", vec![InputArtifact::image("image/png", vec![1, 2, 3])], None, Vec::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert!(outcome.artifact.is_some());
        let tools: Vec<_> = outcome.history.iter().map(|a| a.tool_name.as_str()).collect();
        assert_eq!(tools, ["extract_style", "generate_image", "validate_compliance", "complete"]);
    }

    #[tokio::test]
    async fn test_cache_is_filled_then_used() {
        let cfg = mock_config();
        let cache = InMemoryProfileCache::new();
        let agent = Agent::from_config(&cfg, Arc::new(MockLlmClient::new()));
        let request = || RunRequest::new("poster").with_inputs(vec![InputArtifact::image("image/png", vec![1])]);

        let first = agent
            .run_with_cache(&cache, "acme", request(), &NoopProgress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.history[0].tool_name, "extract_style");
        assert!(cache.get("acme").is_some());

        let second = agent
            .run_with_cache(&cache, "acme", request(), &NoopProgress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.history[0].tool_name, "generate_image");
        assert_eq!(second.profile.unwrap().source, ProfileSource::Cached);
    }
}
