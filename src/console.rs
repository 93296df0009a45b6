use std::str::FromStr;
use std::sync::Arc;

use crate::chord_node::ChordNode;
use crate::error::{Error, Result};

/// One line typed at the operator prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Set { key: String, value: String },
    Delete(String),
    Join(String),
    Leave,
    Show,
    Summary,
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Command> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let needs_arg = |what: &str| -> Result<String> {
            if rest.is_empty() {
                Err(Error::InvalidCommand(format!("{verb} needs {what}")))
            } else {
                Ok(rest.to_string())
            }
        };

        match verb {
            "get" => Ok(Command::Get(needs_arg("a key")?)),
            "delete" => Ok(Command::Delete(needs_arg("a key")?)),
            "join" => Ok(Command::Join(needs_arg("an address")?)),
            "set" => {
                let arg = needs_arg("key:value")?;
                match arg.split_once(':') {
                    Some((key, value)) if !key.is_empty() => Ok(Command::Set {
                        key: key.to_string(),
                        value: value.to_string(),
                    }),
                    _ => Err(Error::InvalidCommand(format!("set expects key:value, got {arg:?}"))),
                }
            }
            "leave" => Ok(Command::Leave),
            "show" => Ok(Command::Show),
            "summary" => Ok(Command::Summary),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err(Error::InvalidCommand("empty line".to_string())),
            other => Err(Error::InvalidCommand(format!("unknown command {other:?}"))),
        }
    }
}

/// Runs one command against `node` and returns the text to print.
pub async fn execute(node: &Arc<ChordNode>, command: Command) -> Result<String> {
    match command {
        Command::Get(key) => node.get(&key).await,
        Command::Set { key, value } => {
            node.set(&key, &value).await?;
            Ok(format!("stored {key}"))
        }
        Command::Delete(key) => {
            node.delete(&key).await?;
            Ok(format!("deleted {key}"))
        }
        Command::Join(address) => {
            node.join(&address).await?;
            Ok(format!("joined via {address}"))
        }
        Command::Leave => {
            node.leave().await?;
            Ok("left the ring".to_string())
        }
        Command::Show => Ok(node.show()),
        Command::Summary => Ok(node.summary()),
        Command::Quit => Ok("bye".to_string()),
    }
}
