use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::info;

use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A one-to-one chat with a contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRow {
    /// The contact's peer id.
    pub id: String,
    pub name: String,
    pub last_message: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub last_activity: i64,
    pub unread_count: u32,
}

/// A decoded chat message, sent or received.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    /// Message id from the envelope.
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// Packet type (`text`, `media`, `voice`, `call`).
    pub kind: String,
    pub body: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_self: bool,
    /// `sent`, `received` or `undecryptable`.
    pub status: String,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite store for chats, messages and small key/value settings.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) the database at `~/.peerline/peerline.db`.
    pub fn open() -> Result<Self> {
        Self::open_at(&AppConfig::db_path()?)
    }

    /// Opens (or creates) the SQLite database at the given path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.init_schema()?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                last_message TEXT,
                last_activity INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_self INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (chat_id, id)
            );

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
                ON messages(chat_id, timestamp);
            ",
        )?;
        self.migrate_message_key()
    }

    /// Databases from before messages were keyed per chat have `id` as the
    /// sole primary key. Rebuild the table with the `(chat_id, id)` key.
    fn migrate_message_key(&self) -> Result<()> {
        let key_columns: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE pk > 0",
            [],
            |row| row.get(0),
        )?;
        if key_columns != 1 {
            return Ok(());
        }

        info!("Migrating messages table to per-chat message ids");
        self.conn.execute_batch(
            "
            BEGIN;
            ALTER TABLE messages RENAME TO messages_legacy;
            DROP INDEX IF EXISTS idx_messages_chat;
            CREATE TABLE messages (
                id TEXT NOT NULL,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_self INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (chat_id, id)
            );
            INSERT INTO messages SELECT
                id, chat_id, sender_id, kind, body, timestamp, is_self, status
                FROM messages_legacy ORDER BY rowid;
            DROP TABLE messages_legacy;
            CREATE INDEX idx_messages_chat ON messages(chat_id, timestamp);
            COMMIT;
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    /// Inserts or replaces a chat.
    pub fn save_chat(&self, chat: &ChatRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO chats (id, name, last_message, last_activity, unread_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 last_message = excluded.last_message,
                 last_activity = excluded.last_activity,
                 unread_count = excluded.unread_count",
            params![
                chat.id,
                chat.name,
                chat.last_message,
                chat.last_activity,
                chat.unread_count
            ],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.conn
            .query_row(
                "SELECT id, name, last_message, last_activity, unread_count
                 FROM chats WHERE id = ?1",
                params![id],
                chat_from_row,
            )
            .optional()
            .context("Failed to read chat row")
    }

    /// Lists chats, most recently active first.
    pub fn list_chats(&self) -> Result<Vec<ChatRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, last_message, last_activity, unread_count
             FROM chats ORDER BY last_activity DESC, id",
        )?;
        let rows = stmt.query_map([], chat_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read chat row")?);
        }
        Ok(result)
    }

    /// Deletes a chat and its messages.
    pub fn delete_chat(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Stores a message, creating its chat if needed and bumping the chat's
    /// preview. Ids are unique per chat: a repeated `(chat_id, id)` is
    /// ignored and leaves the preview and unread count alone. Returns
    /// whether the message was new.
    pub fn save_message(&self, msg: &MessageRow) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO chats (id, name, last_activity) VALUES (?1, ?1, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![msg.chat_id, msg.timestamp],
        )?;
        let inserted = tx.execute(
            "INSERT INTO messages
                 (id, chat_id, sender_id, kind, body, timestamp, is_self, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(chat_id, id) DO NOTHING",
            params![
                msg.id,
                msg.chat_id,
                msg.sender_id,
                msg.kind,
                msg.body,
                msg.timestamp,
                msg.is_self,
                msg.status
            ],
        )?;
        if inserted == 1 {
            tx.execute(
                "UPDATE chats SET
                     last_message = ?2,
                     last_activity = MAX(last_activity, ?3),
                     unread_count = unread_count + ?4
                 WHERE id = ?1",
                params![msg.chat_id, msg.body, msg.timestamp, u32::from(!msg.is_self)],
            )?;
        }
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// Messages of one chat in timestamp order.
    pub fn list_messages(&self, chat_id: &str) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, chat_id, sender_id, kind, body, timestamp, is_self, status
             FROM messages WHERE chat_id = ?1
             ORDER BY timestamp, rowid",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                sender_id: row.get(2)?,
                kind: row.get(3)?,
                body: row.get(4)?,
                timestamp: row.get(5)?,
                is_self: row.get(6)?,
                status: row.get(7)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read message row")?);
        }
        Ok(result)
    }

    /// Reset a chat's unread counter.
    pub fn mark_read(&self, chat_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE chats SET unread_count = 0 WHERE id = ?1",
            params![chat_id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Key/value
    // -----------------------------------------------------------------------

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read kv entry")
    }

    /// All entries, sorted by key.
    pub fn all_kv(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read kv entry")?);
        }
        Ok(result)
    }
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        name: row.get(1)?,
        last_message: row.get(2)?,
        last_activity: row.get(3)?,
        unread_count: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
