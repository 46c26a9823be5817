//! Huddle command-line client.
//!
//! # Usage
//!
//! ```bash
//! huddle alice 127.0.0.1 42424
//! ```
//!
//! Every line typed on stdin is sent as a chat message; every line received
//! from the server is written to stdout. End of input leaves the chat.

use clap::Parser;
use huddle_client::{ChatClient, ServerLine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Huddle chat client
#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Line-oriented Huddle chat client")]
#[command(version)]
struct Args {
    /// Username to register
    username: String,

    /// Server host
    host: String,

    /// Server port
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // Logs go to stderr so stdout only carries chat lines
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let mut stdout = tokio::io::stdout();
    let (mut client, backlog) =
        ChatClient::connect((args.host.as_str(), args.port), &args.username).await?;

    for line in &backlog {
        show(&mut stdout, line).await?;
    }
    show(&mut stdout, &ServerLine::joined(client.username())).await?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            typed = input.next_line() => match typed? {
                Some(body) if body.trim().is_empty() => {},
                Some(body) => client.send_message(&body).await?,
                None => {
                    client.disconnect().await?;
                    break;
                },
            },
            received = client.next_line() => match received? {
                Some(line) => show(&mut stdout, &line).await?,
                None => {
                    tracing::warn!("server closed the connection");
                    break;
                },
            },
        }
    }

    Ok(())
}

async fn show(stdout: &mut Stdout, line: &ServerLine) -> std::io::Result<()> {
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await
}
