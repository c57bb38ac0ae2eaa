//! Parsing of stdin lines.

use herald_core::types::Reaction;

pub const USAGE: &str = "commands: <text> | :message <sender> <text> | \
:react <sender> <reply|ignore|archive|priority> | :stats | :quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Blank,
    Command(String),
    Message { sender: String, text: String },
    React { sender: String, reaction: Reaction },
    Stats,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown directive ':{0}'")]
    UnknownDirective(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    Reaction(String),
}

pub fn parse_line(line: &str) -> Result<Line, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Blank);
    }
    let Some(directive) = line.strip_prefix(':') else {
        return Ok(Line::Command(line.to_string()));
    };

    let (name, rest) = match directive.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (directive, ""),
    };
    match name {
        "message" => {
            let (sender, text) = rest
                .split_once(char::is_whitespace)
                .map(|(s, t)| (s, t.trim()))
                .filter(|(_, t)| !t.is_empty())
                .ok_or(ProtocolError::Usage(":message <sender> <text>"))?;
            Ok(Line::Message {
                sender: sender.to_string(),
                text: text.to_string(),
            })
        }
        "react" => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(sender), Some(reaction), None) => Ok(Line::React {
                    sender: sender.to_string(),
                    reaction: reaction
                        .to_lowercase()
                        .parse()
                        .map_err(ProtocolError::Reaction)?,
                }),
                _ => Err(ProtocolError::Usage(
                    ":react <sender> <reply|ignore|archive|priority>",
                )),
            }
        }
        "stats" => Ok(Line::Stats),
        "quit" | "exit" => Ok(Line::Quit),
        other => Err(ProtocolError::UnknownDirective(other.to_string())),
    }
}
