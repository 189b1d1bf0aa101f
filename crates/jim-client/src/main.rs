//! # JIM Client
//!
//! ## Usage
//!
//! ```bash
//! # Prompt for the account name
//! jim-client
//!
//! # Sign in as alice against a remote server
//! JIM_NAME=alice JIM_HOST=10.0.0.5 JIM_PORT=7777 jim-client
//! ```

use anyhow::{Context, Result};
use jim_client::{ClientConfig, Session};
use std::io::{BufRead, Write};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Forward stdin lines from a dedicated thread.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jim_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::load()?;
    let mut lines = spawn_stdin_reader();

    let name = match config.name.clone() {
        Some(name) => name,
        None => {
            print!("Account name: ");
            std::io::stdout().flush()?;
            let line = lines.recv().await.context("No account name given")?;
            line.trim().to_string()
        }
    };
    println!("----- {name} -----");

    let mut session = Session::connect(&config, &name)
        .await
        .with_context(|| format!("Could not sign in to {}", config.server_addr()))?;
    session.bootstrap().await;

    let (display_tx, mut display_rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = display_rx.recv().await {
            println!("{line}");
        }
    });

    let result = session.run(lines, display_tx).await;
    let _ = printer.await;

    result.context("Session ended")?;
    println!("Bye");
    Ok(())
}
