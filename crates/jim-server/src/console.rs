//! Operator console on stdin.
//!
//! Commands read the same gateway the event loop writes to. `exit` asks
//! the event loop to stop.

use jim_core::{Gateway, StorageError};
use std::fmt::Write as _;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const HELP: &str = "\
Commands:
  help            show this help
  users           known users with their last login
  connected       users signed in right now
  loghist [name]  login history, optionally for one user
  stats           messages sent and received per user
  exit            stop the server";

/// Console errors.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Unrecognised input.
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),

    /// Gateway failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Users,
    Connected,
    LoginHistory(Option<String>),
    Stats,
    Exit,
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next(), words.next()) {
            (Some("help"), None, _) => ConsoleCommand::Help,
            (Some("users"), None, _) => ConsoleCommand::Users,
            (Some("connected"), None, _) => ConsoleCommand::Connected,
            (Some("loghist"), name, None) => ConsoleCommand::LoginHistory(name.map(String::from)),
            (Some("stats"), None, _) => ConsoleCommand::Stats,
            (Some("exit"), None, _) => ConsoleCommand::Exit,
            _ => return Err(ConsoleError::Unknown(line.trim().to_string())),
        };
        Ok(command)
    }
}

/// Render the output of a query command.
///
/// # Errors
///
/// Returns an error if the gateway fails.
pub fn render(command: &ConsoleCommand, gateway: &dyn Gateway) -> Result<String, StorageError> {
    let mut out = String::new();

    match command {
        ConsoleCommand::Help | ConsoleCommand::Exit => out.push_str(HELP),
        ConsoleCommand::Users => {
            for user in gateway.list_users()? {
                let _ = writeln!(out, "{}, last login {}", user.username, user.last_login);
            }
        }
        ConsoleCommand::Connected => {
            for session in gateway.active_sessions()? {
                let _ = writeln!(
                    out,
                    "{} from {}:{}, since {}",
                    session.username, session.address, session.port, session.since
                );
            }
        }
        ConsoleCommand::LoginHistory(name) => {
            for entry in gateway.login_history(name.as_deref())? {
                let _ = writeln!(
                    out,
                    "{} at {} from {}:{}",
                    entry.username, entry.date, entry.address, entry.port
                );
            }
        }
        ConsoleCommand::Stats => {
            for (name, counters) in gateway.message_counters()? {
                let _ = writeln!(
                    out,
                    "{}: sent {}, received {}",
                    name, counters.sent, counters.received
                );
            }
        }
    }

    if out.is_empty() {
        out.push_str("(none)");
    }
    Ok(out.trim_end().to_string())
}

/// Forward stdin lines from a dedicated thread.
///
/// Blocking reads stay off the runtime so they never hold up shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });

    rx
}

/// Serve console commands until `exit` or end of input.
pub async fn run(gateway: Arc<dyn Gateway>, shutdown: watch::Sender<bool>) {
    let mut lines = spawn_stdin_reader();
    println!("{HELP}");

    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ConsoleCommand>() {
            Ok(ConsoleCommand::Exit) => {
                info!("Shutdown requested from console");
                let _ = shutdown.send(true);
                return;
            }
            Ok(command) => match render(&command, gateway.as_ref()) {
                Ok(output) => println!("{output}"),
                Err(e) => warn!(error = %e, "Console query failed"),
            },
            Err(e) => println!("{e}"),
        }
    }
}
