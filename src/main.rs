//! Muse 命令行入口
//!
//! 初始化日志、加载配置、构建 Agent，运行一次目标并把进度事件以 JSON 行输出到 stdout。

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use muse::config::{load_config, AppConfig};
use muse::core::{AgentAction, InputArtifact};
use muse::memory::FileProfileCache;
use muse::react::{ChannelProgress, ProgressEvent};
use muse::{create_llm_from_config, observability, Agent, RunRequest};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "muse", version, about = "Style-driven image generation agent")]
struct Cli {
    /// 自然语言目标
    goal: String,
    /// 参考图片（可多次指定）
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    /// 文字笔记（可多次指定）
    #[arg(long = "note")]
    notes: Vec<String>,
    /// 色块，例如 "#112233"（可多次指定）
    #[arg(long = "swatch")]
    swatches: Vec<String>,
    /// 风格档案缓存文件（JSON）
    #[arg(long)]
    profile_cache: Option<PathBuf>,
    /// 缓存键
    #[arg(long, default_value = "default")]
    cache_key: String,
    /// 从上一会话的历史（JSON 数组）恢复
    #[arg(long)]
    resume: Option<PathBuf>,
    /// 写出本次运行的历史
    #[arg(long)]
    history_out: Option<PathBuf>,
    /// 生成图片的输出路径
    #[arg(long)]
    out: Option<PathBuf>,
    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

fn load_inputs(cli: &Cli) -> anyhow::Result<Vec<InputArtifact>> {
    let mut inputs = Vec::new();
    for path in &cli.images {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        inputs.push(InputArtifact::image(mime_for(path), data));
    }
    inputs.extend(cli.notes.iter().map(InputArtifact::text));
    inputs.extend(cli.swatches.iter().map(InputArtifact::swatch));
    Ok(inputs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    let llm = create_llm_from_config(&cfg).context("Failed to create LLM client")?;
    let agent = Agent::from_config(&cfg, llm);

    let prior_history: Vec<AgentAction> = match &cli.resume {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw).context("Invalid history file")?
        }
        None => Vec::new(),
    };
    let request = RunRequest::new(cli.goal.clone())
        .with_inputs(load_inputs(&cli)?)
        .with_prior_history(prior_history);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", event.to_wire());
        }
    });

    let result = match &cli.profile_cache {
        Some(path) => {
            let cache = FileProfileCache::new(path);
            let sink = ChannelProgress::new(tx);
            agent
                .run_with_cache(&cache, &cli.cache_key, request, &sink, cancel)
                .await
        }
        None => agent.run_stream(request, tx, cancel).await,
    };
    let _ = printer.await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(path) = &cli.history_out {
                write_history(path, &err.history)?;
            }
            return Err(anyhow::Error::new(err.source)).context("Run failed");
        }
    };

    if let (Some(path), Some(artifact)) = (&cli.out, &outcome.artifact) {
        std::fs::write(path, &artifact.data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    if let Some(path) = &cli.history_out {
        write_history(path, &outcome.history)?;
    }

    let (prompt_tokens, completion_tokens, total_tokens) = agent.token_usage();
    let summary = serde_json::json!({
        "type": "summary",
        "success": outcome.success,
        "message": outcome.message,
        "stop_reason": outcome.stop_reason,
        "degraded": outcome.degraded,
        "turns": outcome.turns,
        "actions": outcome.history.len(),
        "validation_score": outcome.validation_score,
        "artifact": outcome.artifact.as_deref().map(|a| a.reference()),
        "out": cli.out.as_ref().filter(|_| outcome.artifact.is_some()),
        "token_usage": {
            "prompt": prompt_tokens,
            "completion": completion_tokens,
            "total": total_tokens,
        },
    });
    println!("{summary}");
    Ok(())
}

fn write_history(path: &Path, history: &[AgentAction]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(history)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
