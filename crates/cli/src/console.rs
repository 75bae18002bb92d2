//! Terminal bus for interactive mode: stdin lines in, replies to stdout.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use pincer_core::channel::{InboundBus, InboundMessage, OutboundMessage, OutboundSink};
use pincer_core::error::ChannelError;
use tokio::sync::mpsc;
use tracing::warn;

pub const CHANNEL: &str = "cli";
pub const CHAT_ID: &str = "local";

/// Reads stdin line by line. The bus closes on EOF or an exit command.
///
/// The reader runs on a detached OS thread; runtime shutdown does not wait
/// for a pending read.
pub struct StdinBus;

#[async_trait]
impl InboundBus for StdinBus {
    async fn subscribe(&self) -> Result<mpsc::Receiver<InboundMessage>, ChannelError> {
        let (tx, rx) = mpsc::channel(32);

        std::thread::Builder::new()
            .name("pincer-stdin".into())
            .spawn(move || forward_lines(std::io::stdin().lock(), &tx))
            .map_err(|e| ChannelError::ConnectionLost(e.to_string()))?;

        Ok(rx)
    }
}

/// Forward non-blank lines from `reader` as inbound messages until EOF, an
/// exit command, a read error, or the receiver going away.
fn forward_lines(reader: impl BufRead, tx: &mpsc::Sender<InboundMessage>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_exit_command(line) {
            break;
        }

        let mut message = InboundMessage::new(CHANNEL, CHAT_ID, line);
        message.sender_id = "local_user".into();
        if tx.blocking_send(message).is_err() {
            break;
        }
    }
}

/// Prints replies and re-prompts.
pub struct StdoutSink;

#[async_trait]
impl OutboundSink for StdoutSink {
    async fn send(&self, reply: OutboundMessage) -> Result<(), ChannelError> {
        let mut stdout = std::io::stdout().lock();
        write!(stdout, "\n{}\n", format_reply(&reply.content))
            .and_then(|_| write!(stdout, "{PROMPT}"))
            .and_then(|_| stdout.flush())
            .map_err(|e| ChannelError::DeliveryFailed {
                channel: reply.channel,
                reason: e.to_string(),
            })
    }
}

pub const PROMPT: &str = "  You > ";

pub fn is_exit_command(line: &str) -> bool {
    matches!(line, "exit" | "quit" | "/exit" | "/quit" | ":q")
}

/// Prefix every line of a reply so multi-line answers stay readable.
pub fn format_reply(content: &str) -> String {
    if content.is_empty() {
        return "  Assistant > (no reply)".into();
    }
    content
        .lines()
        .map(|line| format!("  Assistant > {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
