use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chatstream_core::{
    client::ChatClient,
    config::Config,
    model::{CompletionRequest, Message},
    server::{self, AppState},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatstream service and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the completion service with the echo generator
    Serve {
        #[arg(long, help = "Config file (JSON or TOML)")]
        config: Option<PathBuf>,
        #[arg(long, help = "Override server.listen")]
        listen: Option<String>,
    },
    /// Send a chat completion request (prints deltas live)
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "echo")]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Print only the assembled message")]
        no_stream: bool,
        #[arg(long, help = "Give up on the whole response after this many milliseconds")]
        timeout_ms: Option<u64>,
        #[arg(long, help = "Config file for the http and stream sections (JSON or TOML)")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, listen } => {
            let mut cfg = load_config(config)?;
            if let Some(listen) = listen {
                cfg.server.listen = listen;
            }
            let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
                .await
                .with_context(|| format!("binding {}", cfg.server.listen))?;
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            server::serve(listener, AppState::echo(cfg), shutdown).await?;
        }
        Commands::Chat {
            url,
            model,
            message,
            no_stream,
            timeout_ms,
            config,
        } => {
            let cfg = load_config(config)?;
            let client = ChatClient::new(url, &cfg.http, cfg.stream)?;
            let req = CompletionRequest::new(model, vec![Message::user(message)]);
            let mut handle = client.open_stream(req).await?;

            let cancel = handle.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let deadline =
                timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
            let mut stdout = io::stdout();
            while let Some(update) = handle.next_capped(deadline).await {
                match update {
                    Ok(update) if !no_stream => {
                        print!("{}", update.delta);
                        stdout.flush().ok();
                    }
                    Ok(_) => {}
                    Err(err) => eprintln!("\n[error: {err}]"),
                }
            }

            let done = handle.into_completion();
            if no_stream {
                print!("{}", done.text());
            }
            println!();
            eprintln!("[status: {}]", done.status.as_str());
            if !done.is_completed() {
                anyhow::bail!("stream ended {}", done.status.as_str());
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_path(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(Config::default()),
    }
}
