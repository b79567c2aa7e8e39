mod commands;
mod media;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use peerline_core::config::AppConfig;
use peerline_core::logging;
use peerline_core::persistence::Database;
use peerline_network::{ChatNode, NetworkConfig, NodeProfile, PeerDirectory};

use crate::session::Flow;

#[derive(Parser, Debug)]
#[command(name = "peerline", version, about = "Encrypted peer-to-peer terminal chat")]
struct Args {
    /// Display name sent to peers (saved to the config).
    #[arg(long)]
    name: Option<String>,
    /// Address to listen on for peer connections.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Known peer, as `<id>=<addr>`. Repeatable.
    #[arg(long = "peer", value_name = "ID=ADDR", value_parser = parse_peer_arg)]
    peers: Vec<(String, SocketAddr)>,
    /// Disable LAN discovery.
    #[arg(long)]
    no_discovery: bool,
    /// Refuse to send content over channels that are not secured.
    #[arg(long)]
    require_encryption: bool,
}

fn parse_peer_arg(s: &str) -> Result<(String, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<addr>, got {s}"))?;
    let id = peerline_network::PeerId::parse(id).map_err(|e| e.to_string())?;
    let addr = addr.parse().map_err(|e| format!("invalid address {addr}: {e}"))?;
    Ok((id.to_string(), addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut app_config = AppConfig::load()?;
    let _log_guard = logging::init_logging(&app_config.log_filter)?;
    info!("Starting peerline v{}", env!("CARGO_PKG_VERSION"));

    if let Some(name) = &args.name {
        app_config.display_name = name.clone();
        app_config.save()?;
    }

    let network_config = network_config(&args)?;

    let profile_path = AppConfig::profile_path()?;
    let mut profile = NodeProfile::load_or_generate(&profile_path, &app_config.display_name);
    if profile.name != app_config.display_name {
        profile.name = app_config.display_name.clone();
        if let Err(e) = profile.save_to_file(&profile_path) {
            warn!("Failed to save profile: {e}");
        }
    }

    let db = Arc::new(Mutex::new(
        Database::open().context("Failed to open the chat database")?,
    ));

    let mut node = ChatNode::new(profile, network_config);
    restore_directory(&node)?;
    session::register_handlers(&node, Arc::clone(&db));
    node.start().await.context("Failed to start the chat node")?;

    println!(
        "peerline: you are {} ({}), listening on {}",
        node.profile().name,
        node.peer_id(),
        node.local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".into())
    );
    println!("Type /help for commands.");

    let result = run_input_loop(&node, &db).await;

    if let Err(e) = node.directory().save_to_file(&AppConfig::peers_path()?) {
        warn!("Failed to save peer directory: {e}");
    }
    node.stop().await;
    info!("peerline stopped");
    result
}

/// Stored network config with the command-line overrides applied.
fn network_config(args: &Args) -> Result<NetworkConfig> {
    let mut config = NetworkConfig::load_or_default(&AppConfig::network_config_path()?);
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut NetworkConfig, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    for (id, addr) in &args.peers {
        config.known_peers.insert(id.clone(), addr.to_string());
    }
    if args.no_discovery {
        config.discovery_enabled = false;
    }
    if args.require_encryption {
        config.require_encryption = true;
    }
}

/// Bring back peers saved by the last run. Configured peers win.
fn restore_directory(node: &ChatNode) -> Result<()> {
    let saved = PeerDirectory::load_or_default(&AppConfig::peers_path()?);
    for record in saved.list() {
        if node.directory().get(&record.id).is_none() {
            node.directory().upsert(record);
        }
    }
    Ok(())
}

async fn run_input_loop(node: &ChatNode, db: &Mutex<Database>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("! {e:#}");
                continue;
            }
        };

        match session::execute(node, db, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => return Ok(()),
            Err(e) => {
                error!("Command failed: {e:#}");
                println!("! {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_arg_parses_id_and_addr() {
        let (id, addr) = parse_peer_arg("bob=127.0.0.1:9470").unwrap();
        assert_eq!(id, "bob");
        assert_eq!(addr, "127.0.0.1:9470".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn peer_arg_rejects_garbage() {
        assert!(parse_peer_arg("bob").is_err());
        assert!(parse_peer_arg("bob=nowhere").is_err());
        assert!(parse_peer_arg("=127.0.0.1:1").is_err());
    }

    #[test]
    fn cli_flags_override_network_config() {
        let args = Args::parse_from([
            "peerline",
            "--listen",
            "127.0.0.1:0",
            "--peer",
            "bob=127.0.0.1:9000",
            "--peer",
            "carol=127.0.0.1:9001",
            "--no-discovery",
            "--require-encryption",
        ]);
        let mut config = NetworkConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.listen_addr, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert_eq!(config.known_peers.len(), 2);
        assert_eq!(config.known_peers["carol"], "127.0.0.1:9001");
        assert!(!config.discovery_enabled);
        assert!(config.require_encryption);
    }

    #[test]
    fn no_flags_keep_stored_config() {
        let args = Args::parse_from(["peerline"]);
        let mut config = NetworkConfig::default();
        apply_overrides(&mut config, &args);
        let defaults = NetworkConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert!(config.known_peers.is_empty());
        assert_eq!(config.discovery_enabled, defaults.discovery_enabled);
        assert!(!config.require_encryption);
    }
}
