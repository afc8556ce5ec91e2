use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ads_agents::{AgentInput, SendOptions};
use ads_core::{AdsConfig, SessionManager};
use ads_server::coordination::coordinate_reply;
use ads_server::{serve, BridgeConfig, BridgeState};
use ads_store::TaskStore;

#[derive(Parser, Debug)]
#[command(name = "ads-engine")]
#[command(about = "Headless agent dev station backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the WebSocket front door.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8765)]
        port: u16,
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, env = "ADS_WS_TOKEN")]
        token: Option<String>,
        #[arg(long, env = "ADS_WS_ORIGINS")]
        origins: Option<String>,
        #[arg(long, default_value_t = 32)]
        max_clients: usize,
    },
    /// One-shot prompt from the argument or stdin; events stream to stdout
    /// as JSON lines.
    Run {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        cwd: Option<String>,
        prompt: Option<String>,
    },
}

fn resolve_workspace(arg: Option<String>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .or_else(|| dirs::home_dir())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn state_dir(workspace: &std::path::Path) -> anyhow::Result<PathBuf> {
    let dir = workspace.join(".ads");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create state dir {}", dir.display()))?;
    let marker = dir.join("workspace.json");
    if !marker.exists() {
        let body = serde_json::json!({
            "workspace": workspace.display().to_string(),
            "createdAt": chrono::Utc::now().to_rfc3339(),
        });
        std::fs::write(&marker, serde_json::to_string_pretty(&body)?)
            .with_context(|| format!("failed to write {}", marker.display()))?;
    }
    Ok(dir)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            hostname,
            port,
            workspace,
            token,
            origins,
            max_clients,
        } => {
            let workspace = resolve_workspace(workspace);
            let state_dir = state_dir(&workspace)?;
            let config = AdsConfig::from_env().context("invalid environment configuration")?;
            let store = Arc::new(
                TaskStore::open(&state_dir.join("state.db"))
                    .await
                    .context("failed to open task store")?,
            );
            let sessions = SessionManager::new(config, state_dir.clone());
            let shutdown = CancellationToken::new();
            let cleanup = sessions.spawn_idle_cleanup(shutdown.clone());

            let bridge = BridgeState::new(
                sessions,
                Some(store),
                BridgeConfig {
                    auth_token: token,
                    allowed_origins: origins
                        .map(|value| {
                            value
                                .split(',')
                                .map(|origin| origin.trim().to_string())
                                .filter(|origin| !origin.is_empty())
                                .collect()
                        })
                        .unwrap_or_default(),
                    max_clients,
                    workspace: workspace.clone(),
                    ..Default::default()
                },
            );

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(workspace = %workspace.display(), %addr, "starting ads engine");
            serve(addr, bridge).await?;
            shutdown.cancel();
            if let Some(cleanup) = cleanup {
                let _ = cleanup.await;
            }
        }
        Command::Run { agent, cwd, prompt } => {
            let workspace = resolve_workspace(cwd);
            let state_dir = state_dir(&workspace)?;
            let config = AdsConfig::from_env().context("invalid environment configuration")?;
            let store = Arc::new(
                TaskStore::open(&state_dir.join("state.db"))
                    .await
                    .context("failed to open task store")?,
            );
            let sessions = SessionManager::new(config, state_dir);

            let prompt = match prompt {
                Some(prompt) => prompt,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("failed to read prompt from stdin")?;
                    buffer
                }
            };
            if prompt.trim().is_empty() {
                anyhow::bail!("empty prompt");
            }

            let session = sessions
                .get_or_create("cli", workspace.clone(), true)
                .await;
            if let Some(agent) = agent {
                sessions
                    .switch_agent("cli", &agent)
                    .await
                    .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            }

            // Stream progress events to stdout as JSON lines while the turn
            // is in flight.
            let mut events = session.orchestrator.subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
            });

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            let reply = sessions
                .send(
                    "cli",
                    workspace.clone(),
                    AgentInput::Text(prompt),
                    SendOptions {
                        streaming: true,
                        cancel: cancel.clone(),
                        output_schema: None,
                    },
                )
                .await
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;

            let response = coordinate_reply(
                sessions.config(),
                session.orchestrator.clone(),
                store,
                "default",
                "cli",
                &reply.response,
                cancel,
            )
            .await;

            printer.abort();
            println!("{response}");
        }
    }
    Ok(())
}
