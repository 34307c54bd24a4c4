//! Parley CLI
//!
//! Terminal chat client. Logs in against the chat service, binds the
//! identity to a session and chats over the session's WebSocket channel.

use clap::{Parser, Subcommand};
use parley_core::{ClientConfig, SessionBinding, SessionContext, TargetKind, WsConnector};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod auth;
mod chat;
mod render;

use auth::AuthClient;
use chat::Target;
use render::Renderer;

/// Parley - chat from the terminal
///
/// Type a message to send it to the current recipient. Commands:
/// /to <id>, /group <id>, /history, /quit.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Args {
    /// Base URL of the HTTP API
    #[arg(long, env = "PARLEY_API_URL", global = true)]
    api_url: Option<String>,

    /// WebSocket endpoint for the chat channel
    #[arg(long, env = "PARLEY_WS_URL", global = true)]
    ws_url: Option<String>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Reconnect attempts after the connection drops (0 disables)
    #[arg(long, global = true)]
    max_reconnects: Option<u32>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and start chatting
    Login {
        #[arg(long, env = "PARLEY_EMAIL")]
        email: String,

        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Create an account, log in and start chatting
    Register {
        #[arg(long)]
        username: String,

        #[arg(long, env = "PARLEY_EMAIL")]
        email: String,

        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: String,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Start talking to this user
    #[arg(long, conflicts_with = "group")]
    to: Option<String>,

    /// Start talking to this group
    #[arg(long)]
    group: Option<String>,
}

impl TargetArgs {
    fn into_target(self) -> Option<Target> {
        match (self.to, self.group) {
            (Some(id), _) => Some(Target {
                id,
                kind: TargetKind::User,
            }),
            (None, Some(id)) => Some(Target {
                id,
                kind: TargetKind::Group,
            }),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl Args {
    /// File configuration with command-line overrides applied
    fn client_config(&self) -> parley_core::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(ws_url) = &self.ws_url {
            config.ws_url = ws_url.clone();
        }
        if let Some(max_reconnects) = self.max_reconnects {
            config.channel.reconnect.max_attempts = max_reconnects;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> parley_core::Result<()> {
    let config = args.client_config()?;
    let renderer = Renderer::new(matches!(args.format, OutputFormat::Json));
    let auth = AuthClient::new(config.api_url.clone());

    let (login, target) = match args.command {
        Command::Login {
            email,
            password,
            target,
        } => (auth.login(&email, &password).await?, target),
        Command::Register {
            username,
            email,
            password,
            target,
        } => {
            if let Some(user_id) = auth.register(&username, &email, &password).await? {
                renderer.notice(&format!("Registered {username} ({user_id})"));
            }
            (auth.login(&email, &password).await?, target)
        }
    };

    let session = SessionContext::new();
    session.sign_in(login.identity())?;

    tracing::info!("Connecting to {}", config.ws_url);
    let binding = Arc::new(SessionBinding::new(
        session,
        Arc::new(WsConnector::new()),
        &config,
    ));

    chat::run_chat(binding, renderer, target.into_target()).await
}
