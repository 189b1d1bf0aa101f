//! Command-line parsing for the interactive client.

use crate::store::Direction;
use std::str::FromStr;
use thiserror::Error;

/// Help text shown at startup and on `help`.
pub const HELP: &str = "\
Commands:
  message <to> <text>  send a message
  history [in|out]     show message history
  contacts             list contacts
  users                list known users
  add <name>           add a contact
  del <name>           remove a contact
  help                 show this help
  exit                 leave";

/// Parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// One user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Message { to: String, text: String },
    History(Option<Direction>),
    Contacts,
    Users,
    Add(String),
    Del(String),
    Help,
    Exit,
}

/// Split off the first word, trimming what follows.
fn split_word(input: &str) -> (&str, &str) {
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}

/// Exactly one argument.
fn single(rest: &str, usage: &'static str) -> Result<String, CommandError> {
    match split_word(rest) {
        (name, "") if !name.is_empty() => Ok(name.to_string()),
        _ => Err(CommandError::Usage(usage)),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (word, rest) = split_word(line.trim());

        match word {
            "message" | "msg" => {
                let (to, text) = split_word(rest);
                if to.is_empty() || text.is_empty() {
                    return Err(CommandError::Usage("message <to> <text>"));
                }
                Ok(Command::Message {
                    to: to.to_string(),
                    text: text.trim_end().to_string(),
                })
            }
            "history" => match rest {
                "" => Ok(Command::History(None)),
                "in" => Ok(Command::History(Some(Direction::Incoming))),
                "out" => Ok(Command::History(Some(Direction::Outgoing))),
                _ => Err(CommandError::Usage("history [in|out]")),
            },
            "contacts" if rest.is_empty() => Ok(Command::Contacts),
            "users" if rest.is_empty() => Ok(Command::Users),
            "add" => single(rest, "add <name>").map(Command::Add),
            "del" => single(rest, "del <name>").map(Command::Del),
            "help" => Ok(Command::Help),
            "exit" => Ok(Command::Exit),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}
