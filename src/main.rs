use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use kf_assist::channels::{CliSimulator, SimInput};
use kf_assist::clock::SystemClock;
use kf_assist::config::AgentConfig;
use kf_assist::journal::ConversationJournal;
use kf_assist::knowledge::{KnowledgeBase, KnowledgeMatcher};
use kf_assist::llm::{GenerativeGateway, LlmConfig, compose_system_prompt, create_gateway};
use kf_assist::pipeline::ReplyCoordinator;

/// Storefront chat reply assistant (terminal simulator).
#[derive(Debug, Parser)]
#[command(name = "kf-assist", version)]
struct Cli {
    /// Handle a single message and exit.
    #[arg(short, long)]
    message: Option<String>,

    /// Conversation id used by the simulator.
    #[arg(long, default_value = "sim_session")]
    conversation_id: String,

    /// Never call the generative model.
    #[arg(long)]
    no_llm: bool,

    /// Directory for the session store and conversation journal.
    #[arg(long, env = "KF_ASSIST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Knowledge base JSON file.
    #[arg(long, env = "KF_ASSIST_KNOWLEDGE_FILE")]
    knowledge: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON turn output.
    let (file_layer, _log_guard) = match std::env::var("KF_ASSIST_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "kf-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    let mut config = AgentConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(file) = cli.knowledge {
        config.knowledge_file = file;
    }

    let knowledge = Arc::new(KnowledgeBase::load(&config.knowledge_file).with_context(|| {
        format!(
            "failed to load knowledge base {}",
            config.knowledge_file.display()
        )
    })?);

    let gateway: Option<Arc<dyn GenerativeGateway>> = if cli.no_llm {
        None
    } else {
        match LlmConfig::from_env() {
            Some(llm_config) => {
                let matcher = KnowledgeMatcher::new(config.knowledge_threshold);
                let system_prompt = compose_system_prompt(&config.load_prompt_docs());
                match create_gateway(
                    &llm_config,
                    Some(system_prompt),
                    Some((Arc::clone(&knowledge), matcher)),
                ) {
                    Ok(gateway) => Some(gateway),
                    Err(e) => {
                        tracing::warn!("Generative gateway disabled: {}", e);
                        None
                    }
                }
            }
            None => {
                tracing::warn!("KF_ASSIST_LLM_API_KEY not set; generative replies disabled");
                None
            }
        }
    };

    let coordinator = ReplyCoordinator::new(
        &config,
        Arc::clone(&knowledge),
        gateway,
        Arc::new(SystemClock),
    )
    .context("invalid rule configuration")?
    .with_journal(ConversationJournal::new(config.journal_dir()));

    let simulator = CliSimulator::new();
    let conversation_id = cli.conversation_id;

    if let Some(text) = cli.message {
        let message = coordinator.message(&conversation_id, &text);
        let outcome = coordinator.handle(message).await?;
        simulator.print_outcome(&outcome);
        return Ok(());
    }

    eprintln!("KF Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data dir: {}", config.data_dir.display());
    eprintln!(
        "   Knowledge: {} ({} entries)",
        config.knowledge_file.display(),
        knowledge.snapshot().len()
    );
    eprintln!(
        "   Generative: {}",
        if coordinator.has_gateway() { "on" } else { "off" }
    );
    eprintln!("   /reset clears the session, /reload re-reads knowledge, /exit quits.\n");

    let mut inputs = simulator.inputs();
    while let Some(input) = inputs.next().await {
        match input {
            SimInput::Exit => break,
            SimInput::Reset => match coordinator.reset(&conversation_id) {
                Ok(()) => eprintln!("session reset"),
                Err(e) => eprintln!("reset refused: {e}"),
            },
            SimInput::Reload => match knowledge.reload() {
                Ok(count) => eprintln!("knowledge reloaded: {count} entries"),
                Err(e) => eprintln!("reload failed, keeping previous knowledge: {e}"),
            },
            SimInput::Message(text) => {
                let message = coordinator.message(&conversation_id, &text);
                match coordinator.handle(message).await {
                    Ok(outcome) => simulator.print_outcome(&outcome),
                    Err(e) => tracing::error!(conversation_id = %conversation_id, "Turn failed: {}", e),
                }
            }
        }
        simulator.prompt();
    }

    Ok(())
}
