/// Database row types, mapped 1:1 from SQLite rows.
/// Timestamps are RFC 3339 text; conversion to domain types happens in the store.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender: String,
    pub receiver: Option<String>,
    pub content: String,
    pub room: String,
    pub kind: String,
    pub read: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ReactionRow {
    pub id: i64,
    pub message_id: String,
    pub user_id: String,
    pub reaction: String,
    pub created_at: String,
}
