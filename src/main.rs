use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use mother::config::{scaffold_workspace, Config, SandboxMode};
use mother::events::EventScheduler;
use mother::llm::{CompatibleBackend, LlmBackend};
use mother::orchestrator::Orchestrator;
use mother::sandbox::{ContainerSandbox, HostSandbox, Sandbox};
use mother::security::SecurityPolicy;
use mother::store::ChannelStore;
use mother::transport::cli::CLI_CHANNEL_ID;
use mother::transport::{CliTransport, DiscordTransport, InboundMessage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

/// Chat-connected autonomous agent host.
#[derive(Parser, Debug)]
#[command(name = "mother", version)]
struct Cli {
    /// Executor for tools: 'host' or the name of a running container.
    #[arg(long, default_value = "host")]
    sandbox: String,

    /// Drive the orchestrator from stdin/stdout instead of the chat
    /// transport, using the synthetic channel id 'cli'.
    #[arg(long)]
    cli: bool,

    /// Workspace directory.
    working_directory: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let config = match Config::load(cli.working_directory, &cli.sandbox, cli.cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let sandbox: Arc<dyn Sandbox> = match build_sandbox(&config).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("sandbox validation failed: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(config, sandbox).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn build_sandbox(config: &Config) -> Result<Arc<dyn Sandbox>> {
    match &config.sandbox {
        SandboxMode::Host => Ok(Arc::new(HostSandbox::new(config.workspace_dir.clone()))),
        SandboxMode::Container(name) => {
            let sandbox = ContainerSandbox::new(name.clone(), config.workspace_dir.clone());
            sandbox.validate().await?;
            Ok(Arc::new(sandbox))
        }
    }
}

async fn run(config: Config, sandbox: Arc<dyn Sandbox>) -> Result<()> {
    scaffold_workspace(&config.workspace_dir)?;

    // The guard sees paths in the sandbox namespace: the on-disk workspace
    // on the host, `/workspace` inside a container.
    let policy = Arc::new(SecurityPolicy::new(
        &sandbox.workspace_path(),
        &config.allowed_paths,
        &config.allowed_commands,
    ));
    let store = Arc::new(ChannelStore::new(config.workspace_dir.clone()));

    let model_info = config.model_info();
    let backend: Arc<dyn LlmBackend> = Arc::new(
        CompatibleBackend::new(
            &config.model_provider,
            &config.llm_url,
            config.api_key.as_deref(),
            &config.model_id,
            model_info.context_window,
        )
        .with_pricing(
            model_info.input_cost_per_mtok,
            model_info.output_cost_per_mtok,
        )
        .with_local(config.is_local_provider()),
    );

    tracing::info!(
        workspace = %config.workspace_dir.display(),
        sandbox = sandbox.name(),
        provider = %config.model_provider,
        model = %config.model_id,
        "mother starting"
    );

    if config.cli_mode {
        let transport: Arc<CliTransport> = Arc::new(CliTransport::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.workspace_dir.clone(),
            store,
            transport.clone(),
            backend,
            policy,
            sandbox,
            config.agent_cmd.clone(),
            config.thinking_to_thread,
            None,
        ));
        spawn_scheduler(&config, &orchestrator);
        run_cli_loop(orchestrator).await
    } else {
        let transport = Arc::new(DiscordTransport::new(
            config.bot_token.clone().unwrap_or_default(),
            config.guild_id.clone().unwrap_or_default(),
        ));
        let mention_token = transport.mention_token().await?;
        let orchestrator = Arc::new(Orchestrator::new(
            config.workspace_dir.clone(),
            store,
            transport.clone(),
            backend,
            policy,
            sandbox,
            config.agent_cmd.clone(),
            config.thinking_to_thread,
            Some(mention_token),
        ));
        spawn_scheduler(&config, &orchestrator);
        run_chat_loop(transport, orchestrator).await
    }
}

fn spawn_scheduler(config: &Config, orchestrator: &Arc<Orchestrator>) {
    let scheduler = EventScheduler::new(
        config.workspace_dir.join("events"),
        orchestrator.event_sink(),
    );
    tokio::spawn(scheduler.run());
}

/// `--cli`: every stdin line becomes one inbound message on channel `cli`.
async fn run_cli_loop(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" || text == "/exit" {
                    break;
                }
                let msg = InboundMessage {
                    channel_id: CLI_CHANNEL_ID.to_string(),
                    ts: Utc::now().timestamp_millis().to_string(),
                    user_id: "operator".into(),
                    user_name: Some("operator".into()),
                    display_name: None,
                    text,
                    files: Vec::new(),
                    sent_at: Utc::now(),
                    is_bot: false,
                };
                if let Err(e) = orchestrator.handle_inbound(msg).await {
                    tracing::error!("failed to handle input: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    tracing::info!("shutting down");
    Ok(())
}

async fn run_chat_loop(
    transport: Arc<DiscordTransport>,
    orchestrator: Arc<Orchestrator>,
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<InboundMessage>(64);
    let listener = {
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.listen(tx).await {
                tracing::error!("transport listener exited: {e:#}");
            }
        })
    };

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let channel_id = msg.channel_id.clone();
                if let Err(e) = orchestrator.handle_inbound(msg).await {
                    tracing::error!(channel = %channel_id, "failed to handle message: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    listener.abort();
    tracing::info!("shutting down");
    Ok(())
}
