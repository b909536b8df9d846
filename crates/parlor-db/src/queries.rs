use std::collections::HashMap;

use crate::Database;
use crate::models::{MessageRow, NewMessage, ProfileRow};
use anyhow::Result;
use chrono::SecondsFormat;
use rusqlite::{Connection, Row};
use tracing::warn;

const MESSAGE_COLUMNS: &str =
    "id, room, user_id, username, display_name, content, image_urls, created_at";

/// Ordering used to compute the rank decorations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaderboard {
    /// Highest `used_quota` first
    Usage,
    /// Highest `quota` first
    Balance,
}

impl Database {
    // -- Messages --

    /// Insert a message and return it with its assigned id and timestamp.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<MessageRow> {
        let image_urls = serde_json::to_string(msg.image_urls)?;
        let created_at = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (room, user_id, username, display_name, content, image_urls, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.room,
                    msg.user_id,
                    msg.username,
                    msg.display_name,
                    msg.content,
                    image_urls,
                    created_at,
                ],
            )?;

            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                room: msg.room.to_string(),
                user_id: msg.user_id,
                username: msg.username.to_string(),
                display_name: msg.display_name.to_string(),
                content: msg.content.to_string(),
                image_urls: msg.image_urls.to_vec(),
                created_at,
            })
        })
    }

    /// Newest-first page of a room. With `before_id`, only rows with a
    /// smaller id are considered.
    pub fn list_messages(&self, room: &str, limit: usize, before_id: Option<i64>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room, limit, before_id))
    }

    pub fn count_messages(&self, room: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE room = ?1",
                [room],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Delete everything in `room` except the newest `keep` rows.
    /// Returns the deleted rows so their attachments can be removed.
    pub fn trim_messages(&self, room: &str, keep: usize) -> Result<Vec<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let excess = {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                     WHERE room = ?1
                     ORDER BY id DESC
                     LIMIT -1 OFFSET ?2"
                );
                let mut stmt = tx.prepare(&sql)?;
                stmt.query_map(rusqlite::params![room, keep as i64], message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            // Excess rows are exactly the oldest ones, so one bound covers them all.
            if let Some(newest_excess) = excess.first() {
                tx.execute(
                    "DELETE FROM chat_messages WHERE room = ?1 AND id <= ?2",
                    rusqlite::params![room, newest_excess.id],
                )?;
            }

            tx.commit()?;
            Ok(excess)
        })
    }

    // -- Settings --

    pub fn load_settings(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let pairs = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;
            Ok(pairs)
        })
    }

    /// Write all pairs in a single transaction.
    pub fn save_settings<K: AsRef<str>>(&self, pairs: &[(K, String)]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in pairs {
                tx.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key.as_ref(), value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // -- Profiles --

    pub fn upsert_profile(&self, profile: &ProfileRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO user_profiles (id, username, display_name, avatar_url, quota, used_quota)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url,
                    quota = excluded.quota,
                    used_quota = excluded.used_quota",
                rusqlite::params![
                    profile.id,
                    profile.username,
                    profile.display_name,
                    profile.avatar_url,
                    profile.quota,
                    profile.used_quota,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, display_name, avatar_url, quota, used_quota
                 FROM user_profiles WHERE id = ?1",
                [user_id],
                |row| {
                    Ok(ProfileRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                        quota: row.get(4)?,
                        used_quota: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }

    /// User ids in leaderboard order, best first.
    pub fn leaderboard(&self, board: Leaderboard, limit: usize) -> Result<Vec<i64>> {
        let sql = match board {
            Leaderboard::Usage => {
                "SELECT id FROM user_profiles WHERE id > 0 ORDER BY used_quota DESC, id ASC LIMIT ?1"
            }
            Leaderboard::Balance => {
                "SELECT id FROM user_profiles WHERE id > 0 ORDER BY quota DESC, id ASC LIMIT ?1"
            }
        };

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let ids = stmt
                .query_map([limit as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }
}

fn query_messages(
    conn: &Connection,
    room: &str,
    limit: usize,
    before_id: Option<i64>,
) -> Result<Vec<MessageRow>> {
    let rows = match before_id {
        Some(before_id) => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE room = ?1 AND id < ?2
                 ORDER BY id DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params![room, before_id, limit as i64], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE room = ?1
                 ORDER BY id DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params![room, limit as i64], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: i64 = row.get(0)?;
    let raw_urls: String = row.get(6)?;
    let image_urls = serde_json::from_str(&raw_urls).unwrap_or_else(|e| {
        warn!("Corrupt image_urls on message {}: {}", id, e);
        Vec::new()
    });

    Ok(MessageRow {
        id,
        room: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        display_name: row.get(4)?,
        content: row.get(5)?,
        image_urls,
        created_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
