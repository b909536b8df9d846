use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (chat messages, settings, profiles)");
        conn.execute_batch(
            "
            CREATE TABLE chat_messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                room            TEXT NOT NULL,
                user_id         INTEGER NOT NULL DEFAULT 0,
                username        TEXT NOT NULL DEFAULT '',
                display_name    TEXT NOT NULL DEFAULT '',
                content         TEXT NOT NULL DEFAULT '',
                image_urls      TEXT NOT NULL DEFAULT '[]',
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_chat_messages_room
                ON chat_messages(room, id);

            CREATE TABLE settings (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE user_profiles (
                id              INTEGER PRIMARY KEY,
                username        TEXT NOT NULL,
                display_name    TEXT NOT NULL DEFAULT '',
                avatar_url      TEXT NOT NULL DEFAULT '',
                quota           INTEGER NOT NULL DEFAULT 0,
                used_quota      INTEGER NOT NULL DEFAULT 0
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
