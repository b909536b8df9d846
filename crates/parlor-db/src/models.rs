/// Database row types: these map directly to SQLite rows.
/// Distinct from parlor-types API models to keep the DB layer independent.

pub struct MessageRow {
    pub id: i64,
    pub room: String,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub content: String,
    pub image_urls: Vec<String>,
    pub created_at: String,
}

/// Fields of a message before the store assigns its id.
pub struct NewMessage<'a> {
    pub room: &'a str,
    pub user_id: i64,
    pub username: &'a str,
    pub display_name: &'a str,
    pub content: &'a str,
    pub image_urls: &'a [String],
}

pub struct ProfileRow {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub quota: i64,
    pub used_quota: i64,
}
