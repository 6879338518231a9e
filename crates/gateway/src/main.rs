use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parlor_domain::agent::ChatProviderKind;
use parlor_domain::config::{EnvConfig, ServerConfig};
use parlor_domain::registry::AgentRegistry;
use parlor_gateway::hub::{HubDeps, SessionHub};
use parlor_gateway::scheduler::Scheduler;
use parlor_gateway::state::AppState;
use parlor_providers::history::{
    ClaudeHistoryProvider, CodexHistoryProvider, HistoryProviderRegistry, PiHistoryProvider,
};
use parlor_providers::{OpenAiProvider, ProviderRegistry};
use parlor_tools::CompositeToolHost;

#[derive(Parser)]
#[command(name = "parlor", about = "Multi-agent conversation server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate the agents config file.
    Validate {
        /// Config path (defaults to `$PARLOR_AGENTS_CONFIG`, then
        /// `<dataDir>/agents.json`).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server().await
        }
        Some(Command::Config(ConfigCommand::Validate { path })) => {
            let path = path.unwrap_or_else(default_config_path);
            match ServerConfig::load(&path) {
                Ok(config) => {
                    println!(
                        "ok: {} agent(s), {} mcp server(s)",
                        config.agents.len(),
                        config.mcp_servers.len()
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Version) => {
            println!("parlor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parlor_gateway=debug")),
        )
        .init();
}

fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PARLOR_AGENTS_CONFIG") {
        return PathBuf::from(path);
    }
    EnvConfig::from_env().data_dir.join("agents.json")
}

async fn run_server() -> anyhow::Result<()> {
    tracing::info!("parlor starting");

    let env = Arc::new(EnvConfig::from_env());
    std::fs::create_dir_all(&env.data_dir)
        .with_context(|| format!("creating data dir {}", env.data_dir.display()))?;

    let config = Arc::new(
        ServerConfig::load(&default_config_path()).context("loading agents config")?,
    );
    let agents = Arc::new(AgentRegistry::new(config.agents.clone()).context("agent registry")?);

    // ── Durable stores ───────────────────────────────────────────────
    let index = Arc::new(
        parlor_sessions::SessionIndex::load(&env.data_dir).context("loading session index")?,
    );
    let events = Arc::new(parlor_sessions::EventStore::new(env.data_dir.clone()));

    // ── Chat providers ───────────────────────────────────────────────
    let mut providers = ProviderRegistry::new();
    let openai_base = env
        .openai_base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
    match OpenAiProvider::new("openai", &openai_base, env.openai_api_key.clone(), "gpt-4o") {
        Ok(provider) => {
            let provider = Arc::new(provider);
            providers.register(ChatProviderKind::Openai, provider.clone());
            providers.register(ChatProviderKind::OpenaiCompatible, provider);
        }
        Err(e) => tracing::warn!(error = %e, "openai provider unavailable"),
    }
    if providers.is_empty() {
        tracing::warn!("no chat providers configured; chat agents will be unavailable");
    }

    // ── History providers (CLI transcripts) ──────────────────────────
    let history = Arc::new(HistoryProviderRegistry::new(vec![
        Arc::new(ClaudeHistoryProvider::new(None)),
        Arc::new(CodexHistoryProvider::new(
            None,
            env.data_dir.join("codex-sessions.json"),
        )),
        Arc::new(PiHistoryProvider::new(
            None,
            config.sessions.mirror_pi_session_history,
        )),
    ]));

    // ── Hub, scheduler, HTTP ─────────────────────────────────────────
    let hub = SessionHub::new(HubDeps {
        config: config.clone(),
        env: env.clone(),
        agents,
        index,
        events,
        providers: Arc::new(providers),
        history,
        base_tools: Arc::new(CompositeToolHost::new(Vec::new())),
    });

    let scheduler = Scheduler::new(hub.clone());
    scheduler.start();

    let state = AppState {
        hub,
        scheduler,
    };
    let router = parlor_gateway::api::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], env.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, router).await.context("server loop")?;
    Ok(())
}
