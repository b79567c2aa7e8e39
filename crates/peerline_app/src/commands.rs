//! Parsing of the slash commands typed at the prompt.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use peerline_network::PeerId;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Probe a peer and start a chat. An address seeds the directory first.
    Add { peer: PeerId, addr: Option<SocketAddr> },
    Msg { peer: PeerId, text: String },
    /// Send a file as a media message.
    Media { peer: PeerId, path: PathBuf },
    Typing(PeerId),
    Call { peer: PeerId, offer: String },
    Safety(PeerId),
    Remove(PeerId),
    Peers,
    History(PeerId),
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  /add <id> [addr]      probe a peer and start a chat
  /msg <id> <text>      send a text message
  /media <id> <file>    send a photo or file
  /typing <id>          send a typing indicator
  /call <id> <offer>    send a call offer
  /safety <id>          show the safety number for a secured channel
  /remove <id>          close the connection and forget the key
  /peers                list known and connected peers
  /history <id>         show stored messages
  /help                 show this help
  /quit                 leave";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        bail!("Not a command (try /help): {line}");
    };

    let (name, args) = split_word(rest);
    let command = match name {
        "add" => {
            let (peer, addr) = split_word(args);
            let addr = match addr {
                "" => None,
                a => Some(
                    a.parse()
                        .with_context(|| format!("Invalid address: {a}"))?,
                ),
            };
            Command::Add {
                peer: peer_arg(peer)?,
                addr,
            }
        }
        "msg" => {
            let (peer, text) = split_word(args);
            if text.is_empty() {
                bail!("Usage: /msg <id> <text>");
            }
            Command::Msg {
                peer: peer_arg(peer)?,
                text: text.to_string(),
            }
        }
        "media" => {
            let (peer, path) = split_word(args);
            if path.is_empty() {
                bail!("Usage: /media <id> <file>");
            }
            Command::Media {
                peer: peer_arg(peer)?,
                path: PathBuf::from(path),
            }
        }
        "call" => {
            let (peer, offer) = split_word(args);
            if offer.is_empty() {
                bail!("Usage: /call <id> <offer>");
            }
            Command::Call {
                peer: peer_arg(peer)?,
                offer: offer.to_string(),
            }
        }
        "typing" => Command::Typing(peer_arg(args)?),
        "safety" => Command::Safety(peer_arg(args)?),
        "remove" => Command::Remove(peer_arg(args)?),
        "history" => Command::History(peer_arg(args)?),
        "peers" => Command::Peers,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("Unknown command: /{other}"),
    };
    Ok(Some(command))
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn peer_arg(s: &str) -> Result<PeerId> {
    if s.is_empty() {
        bail!("Missing peer id");
    }
    Ok(PeerId::parse(s)?)
}
