//! Glue between the chat node, the terminal and the local store.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

use peerline_core::{ChatRow, Database, MessageRow};
use peerline_network::{
    ChatNode, DecodeStatus, Envelope, InboundPacket, PacketType, PeerId, PresenceStatus,
    packet_handler,
};

use crate::commands::{Command, HELP};
use crate::media;

/// Whether the input loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Register terminal output and persistence for every routed packet.
pub fn register_handlers(node: &ChatNode, db: Arc<Mutex<Database>>) {
    let content_db = Arc::clone(&db);
    node.on_content(packet_handler(move |packet| {
        let db = Arc::clone(&content_db);
        async move { deliver(&db, &packet) }
    }));

    let call_db = db;
    node.on_call_offer(packet_handler(move |packet| {
        let db = Arc::clone(&call_db);
        async move { deliver(&db, &packet) }
    }));

    node.on_presence(packet_handler(|packet| async move {
        println!("{}", render_inbound(&packet));
    }));
}

fn deliver(db: &Mutex<Database>, packet: &InboundPacket) {
    println!("{}", render_inbound(packet));
    if let Err(e) = record_inbound(&db.lock(), packet) {
        warn!("Failed to store message from {}: {e:#}", packet.from);
    }
}

/// One line of terminal output for an inbound packet.
pub fn render_inbound(packet: &InboundPacket) -> String {
    let name = display_name(packet);
    match packet.envelope.packet_type {
        PacketType::Typing => format!("  {name} is typing..."),
        PacketType::Presence => match packet.envelope.sender.status {
            PresenceStatus::Online => format!("* {name} is online"),
            PresenceStatus::Offline => format!("* {name} went offline"),
        },
        PacketType::Call => format!("* {name} is calling: {}", packet.envelope.data),
        _ if packet.decode == DecodeStatus::Undecryptable => {
            format!("[{name}] <message could not be decrypted>")
        }
        PacketType::Media => {
            format!("[{name}] <media {}>", media::describe(&packet.envelope.data))
        }
        PacketType::Voice => format!("[{name}] <voice {} bytes>", packet.envelope.data.len()),
        _ => {
            let lock = if packet.decode == DecodeStatus::Decrypted {
                ""
            } else {
                " (unencrypted)"
            };
            format!("[{name}]{lock} {}", packet.envelope.data)
        }
    }
}

fn display_name(packet: &InboundPacket) -> &str {
    if packet.envelope.sender.name.is_empty() {
        packet.from.as_str()
    } else {
        &packet.envelope.sender.name
    }
}

/// Store a delivered content packet. Typing indicators are not stored.
pub fn record_inbound(db: &Database, packet: &InboundPacket) -> Result<Option<MessageRow>> {
    if packet.envelope.packet_type == PacketType::Typing {
        return Ok(None);
    }

    let chat_id = packet.from.as_str();
    if db.get_chat(chat_id)?.is_none() {
        db.save_chat(&ChatRow {
            id: chat_id.to_string(),
            name: display_name(packet).to_string(),
            last_message: None,
            last_activity: 0,
            unread_count: 0,
        })?;
    }

    let status = match packet.decode {
        DecodeStatus::Undecryptable => "undecryptable",
        _ => "received",
    };
    let row = message_row(&packet.from, &packet.from, &packet.envelope, false, status);
    db.save_message(&row)?;
    Ok(Some(row))
}

/// Store an envelope we sent to `peer`.
pub fn record_outbound(
    db: &Database,
    local: &PeerId,
    peer: &PeerId,
    envelope: &Envelope,
) -> Result<MessageRow> {
    let row = message_row(peer, local, envelope, true, "sent");
    db.save_message(&row)?;
    Ok(row)
}

fn message_row(
    chat: &PeerId,
    sender: &PeerId,
    envelope: &Envelope,
    is_self: bool,
    status: &str,
) -> MessageRow {
    MessageRow {
        id: envelope
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        chat_id: chat.to_string(),
        sender_id: sender.to_string(),
        kind: envelope.packet_type.to_string(),
        body: envelope.data.clone(),
        timestamp: envelope
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        is_self,
        status: status.to_string(),
    }
}

/// Run one command against the node and the store.
pub async fn execute(node: &ChatNode, db: &Mutex<Database>, command: Command) -> Result<Flow> {
    match command {
        Command::Add { peer, addr } => {
            if let Some(addr) = addr {
                node.directory().insert_static(peer.clone(), addr);
            }
            if node.probe(&peer).await {
                let name = node
                    .directory()
                    .get(&peer)
                    .and_then(|r| r.name)
                    .unwrap_or_else(|| peer.to_string());
                let db = db.lock();
                if db.get_chat(peer.as_str())?.is_none() {
                    db.save_chat(&ChatRow {
                        id: peer.to_string(),
                        name,
                        last_message: None,
                        last_activity: chrono::Utc::now().timestamp_millis(),
                        unread_count: 0,
                    })?;
                }
                println!("* {peer} is reachable, chat added");
            } else {
                println!("* {peer} is not reachable");
            }
        }
        Command::Msg { peer, text } => {
            let envelope = node.send_text(&peer, text).await?;
            record_outbound(&db.lock(), node.peer_id(), &peer, &envelope)?;
            if !node.channel_state(&peer).is_secured() {
                println!("* sent to {peer} without encryption");
            }
        }
        Command::Media { peer, path } => {
            let data_url = media::read_data_url(&path).await?;
            let envelope = node.send_media(&peer, data_url).await?;
            record_outbound(&db.lock(), node.peer_id(), &peer, &envelope)?;
            println!(
                "* sent {} to {peer} ({})",
                path.display(),
                media::describe(&envelope.data)
            );
        }
        Command::Typing(peer) => node.send_typing(&peer).await?,
        Command::Call { peer, offer } => {
            let envelope = node.send_call_offer(&peer, offer).await?;
            record_outbound(&db.lock(), node.peer_id(), &peer, &envelope)?;
            println!("* calling {peer}");
        }
        Command::Safety(peer) => match node.safety_number(&peer) {
            Some(number) => println!("Safety number with {peer}:\n  {number}"),
            None => println!("* channel with {peer} is {}", node.channel_state(&peer)),
        },
        Command::Remove(peer) => {
            let closed = node.remove_contact(&peer);
            let deleted = db.lock().delete_chat(peer.as_str())?;
            info!("Removed {peer} (connection/key: {closed}, chat: {deleted})");
            println!("* removed {peer}");
        }
        Command::Peers => print_peers(node),
        Command::History(peer) => {
            let db = db.lock();
            let messages = db.list_messages(peer.as_str())?;
            if messages.is_empty() {
                println!("* no messages with {peer}");
            }
            for m in &messages {
                let who = if m.is_self { "me" } else { m.sender_id.as_str() };
                let when = chrono::DateTime::from_timestamp_millis(m.timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                if m.kind == PacketType::Media.to_string() {
                    println!("{when} [{who}] <media {}>", media::describe(&m.body));
                } else {
                    println!("{when} [{who}] {}", m.body);
                }
            }
            db.mark_read(peer.as_str())?;
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn print_peers(node: &ChatNode) {
    let connected = node.connected_peers();
    let records = node.directory().list();
    if records.is_empty() && connected.is_empty() {
        println!("* no known peers");
        return;
    }
    for record in &records {
        let link = if connected.contains(&record.id) {
            "connected"
        } else {
            "offline"
        };
        println!(
            "  {:<24} {:<21} {:<10} {}",
            record.id.as_str(),
            record.addr.to_string(),
            link,
            node.channel_state(&record.id)
        );
    }
    for peer in connected.iter().filter(|p| !records.iter().any(|r| &r.id == *p)) {
        println!(
            "  {:<24} {:<21} {:<10} {}",
            peer.as_str(),
            "-",
            "connected",
            node.channel_state(peer)
        );
    }
}
