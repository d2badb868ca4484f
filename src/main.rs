//! termlink - drive an interactive CLI coding agent from your phone
//!
//! Usage:
//!   termlink serve -- claude       # Serve `claude` over WebSocket
//!   termlink serve --mock          # Serve a scripted demo agent
//!   termlink serve --token <t>     # Use a fixed access token

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use termlink::auth::TokenAuthorizer;
use termlink::config::load_config;
use termlink::notify::{NoopNotifier, Notifier, PushNotifier};
use termlink::server::EngineServer;
use termlink::source::{PtySource, ScriptSource, TermSource};

const DEFAULT_PORT: u16 = 8787;

#[derive(Parser)]
#[command(name = "termlink")]
#[command(version)]
#[command(about = "Drive an interactive CLI coding agent from your phone", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and serve clients over WebSocket
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Access token clients must present (default: generated at startup,
        /// or the TERMLINK_TOKEN environment variable)
        #[arg(short, long)]
        token: Option<String>,

        /// Serve a scripted demo agent instead of a real command
        #[arg(long)]
        mock: bool,

        /// Agent command and arguments to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("termlink=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            token,
            mock,
            args,
        } => match serve(port, token, mock, args).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}: {}", "Error".red().bold(), e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn serve(
    port: u16,
    token: Option<String>,
    mock: bool,
    mut args: Vec<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load_config();

    let (source, command): (Arc<dyn TermSource>, String) = if mock {
        (Arc::new(ScriptSource::demo()), "mock-agent".to_string())
    } else {
        if args.is_empty() {
            return Err("no command given (or pass --mock for a demo agent)".into());
        }
        let command = args.remove(0);
        (Arc::new(PtySource), command)
    };

    let token = token
        .or_else(|| std::env::var("TERMLINK_TOKEN").ok())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let notifier: Arc<dyn Notifier> = match config.push_topic_url.clone() {
        Some(url) => Arc::new(PushNotifier::new(
            url,
            Duration::from_secs(config.notify_debounce_secs),
        )),
        None => Arc::new(NoopNotifier),
    };

    let authorizer = Arc::new(TokenAuthorizer::new(token.clone()));
    let server = EngineServer::new(config, command.clone(), source, authorizer, notifier);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    println!("{} termlink serving {}", "▶".green(), command.cyan());
    match local_ip_address::local_ip() {
        Ok(ip) => println!("  Connect: {}", format!("ws://{}:{}", ip, port).cyan()),
        Err(_) => println!("  Connect: {}", format!("ws://<your-ip>:{}", port).cyan()),
    }
    println!("  Token:   {}", token.yellow());
    if !mock {
        println!(
            "  {}",
            format!("Clients launch sessions with start; args go to {}", command).dimmed()
        );
    }

    server.run(listener).await?;
    Ok(())
}
