//! `pincer agent`: interactive or single-message chat mode.

use std::sync::Arc;

use pincer_agent::{AgentLoop, InMemorySessionStore};
use pincer_config::{AppConfig, ProviderKind};
use pincer_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::console::{self, StdinBus, StdoutSink};

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    check_credentials(&config)?;

    let chain = Arc::new(pincer_providers::build_from_config(&config));
    let members = chain.members().join(" -> ");
    let sessions = Arc::new(InMemorySessionStore::new());
    let tools = Arc::new(ToolRegistry::new());

    let agent = AgentLoop::from_config(&config, chain.clone(), tools, sessions);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    if let Some(text) = message {
        eprint!("  Thinking...");
        let result = agent
            .process_direct(&text, console::CHANNEL, console::CHAT_ID, &cancel)
            .await;
        eprint!("\r              \r");
        match result {
            Ok(reply) => println!("{reply}"),
            Err(e) if e.is_cancelled() => eprintln!("  Cancelled."),
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    println!();
    println!("  pincer agent (interactive)");
    println!();
    println!("  Upstreams: {members}");
    println!("  Model:     {}", config.default_model);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or press Ctrl+C to quit.");
    println!();
    print!("{}", console::PROMPT);
    {
        use std::io::Write;
        std::io::stdout().flush()?;
    }

    let agent = Arc::new(agent.with_channels(Arc::new(StdinBus), Arc::new(StdoutSink)));
    agent.run(cancel).await?;

    if chain.failovers() > 0 {
        info!(failovers = chain.failovers(), "Session used fallback upstreams");
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}

/// Fail early with setup instructions when no upstream can authenticate.
fn check_credentials(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let chain = config.provider_chain();
    let usable = chain
        .iter()
        .any(|p| p.kind == ProviderKind::Ollama || p.api_key.is_some() || config.api_key.is_some());
    if usable {
        return Ok(());
    }

    warn!("No API key configured");
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    PINCER_API_KEY     (generic)");
    eprintln!("    OPENAI_API_KEY     (OpenAI or compatible)");
    eprintln!("    ANTHROPIC_API_KEY  (Anthropic)");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
    Err("No API key found. See above for setup instructions.".into())
}
