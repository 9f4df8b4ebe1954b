use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use council_client::{attach_router, ApiClient, ConnectionManager};
use council_core::config::AppConfig;
use council_core::event::{ControlAction, HumanReviewRequest, ReviewDecision, ServerEvent};
use council_core::types::SessionId;
use council_sync::{EventRouter, LayeredLayout, RunGraphStore, TranscriptStore};

#[derive(Parser)]
#[command(name = "council", version, about = "Control surface for council workflow runs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "council.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow run and stream its transcript to the terminal
    Watch {
        /// Workflow template id
        #[arg(long)]
        template: String,
        /// Agent group id
        #[arg(long)]
        group: String,
    },
    /// Send a control action (pause, resume, stop) to a running session
    Control {
        /// Session id
        session: String,
        /// One of: pause, resume, stop
        action: String,
    },
    /// Answer a pending human-review interrupt
    Review {
        /// Session id
        session: String,
        /// Node awaiting review
        node: String,
        /// One of: approve, reject, modify
        decision: String,
        /// File with replacement content for a modify decision
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List configured agents
    Agents,
    /// List workflow templates
    Templates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Watch { template, group } => watch(&config, &template, &group).await,
        Commands::Control { session, action } => {
            let action = parse_control(&action)?;
            let graph = RunGraphStore::new(config.server.api_base.clone());
            graph
                .send_control(&SessionId::from_string(&session), action)
                .await?;
            println!("{} acknowledged for session {}", action, session);
            Ok(())
        }
        Commands::Review {
            session,
            node,
            decision,
            file,
        } => {
            let decision = parse_decision(&decision)?;
            let data = match file {
                Some(path) => Some(serde_json::json!({
                    "content": std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?,
                })),
                None => None,
            };
            let graph = RunGraphStore::new(config.server.api_base.clone());
            graph.set_human_review(Some(HumanReviewRequest {
                session_id: session.clone(),
                node_id: node,
                reason: String::new(),
                timeout_secs: 0,
                payload: None,
            }));
            graph.submit_human_review(decision, data).await?;
            println!("Review submitted for session {}", session);
            Ok(())
        }
        Commands::Agents => {
            let api = ApiClient::new(config.server.api_base.clone());
            for agent in api.list_agents().await? {
                println!(
                    "{:<24} {} {}",
                    agent.id,
                    agent.name,
                    agent.role.unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::Templates => {
            let api = ApiClient::new(config.server.api_base.clone());
            for template in api.list_templates().await? {
                println!(
                    "{:<24} {:<20} {} nodes",
                    template.id,
                    template.name,
                    template.graph.nodes.len()
                );
            }
            Ok(())
        }
    }
}

fn parse_control(s: &str) -> anyhow::Result<ControlAction> {
    match s {
        "pause" => Ok(ControlAction::Pause),
        "resume" => Ok(ControlAction::Resume),
        "stop" => Ok(ControlAction::Stop),
        other => bail!("unknown control action: {other} (expected pause, resume or stop)"),
    }
}

fn parse_decision(s: &str) -> anyhow::Result<ReviewDecision> {
    match s {
        "approve" => Ok(ReviewDecision::Approve),
        "reject" => Ok(ReviewDecision::Reject),
        "modify" => Ok(ReviewDecision::Modify),
        other => bail!("unknown decision: {other} (expected approve, reject or modify)"),
    }
}

async fn watch(config: &AppConfig, template_id: &str, group_id: &str) -> anyhow::Result<()> {
    let api = ApiClient::new(config.server.api_base.clone());
    let template = api.get_template(template_id).await?;
    let init = api.start_session(&template.id, group_id).await?;
    let session_id = init.session_id.clone();
    info!(%session_id, template = %template.name, "Session started");

    let transcript = Arc::new(TranscriptStore::new());
    let graph = Arc::new(RunGraphStore::with_tick_interval(
        config.server.api_base.clone(),
        Duration::from_millis(config.timer.tick_interval_ms),
    ));
    transcript.init_session(init);
    graph.set_graph_from_template(&LayeredLayout::default(), &template.graph);

    let conn = ConnectionManager::new(
        config.reconnect.clone(),
        Duration::from_secs(config.heartbeat.interval_secs),
    );
    attach_router(&conn, EventRouter::new(transcript.clone(), graph.clone()));

    // Terminal echo reads the latest-message slot; it is display glue and
    // may skip frames under load, the projections never do.
    let mut messages = conn.subscribe();
    let printer = tokio::spawn(async move {
        while messages.changed().await.is_ok() {
            let msg = match messages.borrow_and_update().clone() {
                Some(msg) => msg,
                None => continue,
            };
            match msg.event {
                ServerEvent::TokenStream { chunk, .. } => {
                    use std::io::Write;
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                }
                ServerEvent::NodeStateChange { node_id, status } => {
                    println!("\n── {} is {} ──", node_id, status);
                }
                ServerEvent::HumanInteractionRequired { node_id, reason, .. } => {
                    println!("\n!! review required at {}: {}", node_id, reason);
                }
                ServerEvent::Error { error, .. } => {
                    eprintln!("\nserver error: {}", error);
                }
                _ => {}
            }
        }
    });

    conn.connect(&config.server.ws_url);
    tokio::select! {
        result = conn.wait_connected() => result?,
        _ = tokio::signal::ctrl_c() => {
            conn.disconnect();
            printer.abort();
            return Ok(());
        }
    }
    info!("Streaming transcript; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    conn.disconnect();
    printer.abort();

    let stats = graph.stats();
    println!(
        "\n{}/{} nodes completed, {} failed, {} tokens, ${:.4}, {:.1}s",
        stats.completed_nodes,
        stats.total_nodes,
        stats.failed_nodes,
        stats.total_tokens,
        stats.total_cost_usd,
        stats.elapsed_ms as f64 / 1000.0
    );
    Ok(())
}
