//! Interactive chat loop
//!
//! Reads commands from stdin, sends chat messages through the session
//! binding and renders whatever the channel delivers.

use std::sync::Arc;

use parley_core::{ChannelState, ChatError, Direction, Envelope, SessionBinding, TargetKind};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::render::Renderer;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Address a user
    To(String),
    /// Address a group
    Group(String),
    History,
    Quit,
    Send(String),
    Empty,
}

/// Parse a line typed at the prompt
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    if !line.starts_with('/') {
        return Ok(Command::Send(line.to_string()));
    }

    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };

    match name {
        "/to" | "/group" if arg.is_empty() || arg.contains(char::is_whitespace) => {
            Err(format!("Usage: {name} <id>"))
        }
        "/to" => Ok(Command::To(arg.to_string())),
        "/group" => Ok(Command::Group(arg.to_string())),
        "/history" => Ok(Command::History),
        "/quit" | "/exit" => Ok(Command::Quit),
        _ => Err(format!("Unknown command: {name}")),
    }
}

/// Current recipient for plain lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub kind: TargetKind,
}

/// Run the chat session until `/quit`, end of input, or the channel closes
///
/// The session is signed out on the way out, so the channel is closed and
/// the transcript cleared whether the loop ends cleanly or not.
pub async fn run_chat(
    binding: Arc<SessionBinding>,
    renderer: Renderer,
    initial_target: Option<Target>,
) -> Result<(), ChatError> {
    let result = chat_loop(&binding, renderer, initial_target).await;
    binding.sign_out().await;
    result
}

async fn chat_loop(
    binding: &SessionBinding,
    renderer: Renderer,
    mut target: Option<Target>,
) -> Result<(), ChatError> {
    let channel = binding.connect().await?;

    channel.on_message(move |envelope| renderer.print_envelope(Direction::Inbound, envelope));
    channel.on_event(move |event| renderer.print_event(event));

    let state = channel.wait_for_state(|s| s.is_open() || s.is_closed()).await;
    if state.is_closed() {
        return Err(channel.last_error().unwrap_or(ChatError::NotConnected));
    }

    renderer.notice(&format!(
        "Connected as {}. /to <id>, /group <id>, /history, /quit",
        channel.identity().user_id()
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = channel.watch_state();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = state_rx.wait_for(ChannelState::is_closed) => {
                return Err(channel.last_error().unwrap_or(ChatError::NotConnected));
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Stdin closed");
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Error reading stdin: {}", e);
                return Ok(());
            }
        };

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                renderer.notice(&message);
                continue;
            }
        };

        match command {
            Command::Empty => {}
            Command::Quit => return Ok(()),
            Command::To(id) => {
                renderer.notice(&format!("Talking to {id}"));
                target = Some(Target {
                    id,
                    kind: TargetKind::User,
                });
            }
            Command::Group(id) => {
                renderer.notice(&format!("Talking to group #{id}"));
                target = Some(Target {
                    id,
                    kind: TargetKind::Group,
                });
            }
            Command::History => {
                let snapshot = binding.transcript().snapshot();
                for entry in &snapshot {
                    renderer.print_entry(entry);
                }
                renderer.notice(&format!("{} messages", snapshot.len()));
            }
            Command::Send(text) => {
                let Some(target) = &target else {
                    renderer.notice("No recipient yet: use /to <id> or /group <id>");
                    continue;
                };
                let envelope = Envelope::message(target.id.clone(), target.kind, text);
                match binding.send(envelope).await {
                    Ok(sent) => renderer.print_envelope(Direction::Outbound, &sent),
                    Err(e) => renderer.notice(&format!("Not sent: {e}")),
                }
            }
        }
    }
}
