use crate::models::{MessageRow, ReactionRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row};

const USER_COLUMNS: &str = "id, username, password, online, last_seen, created_at";
const MESSAGE_COLUMNS: &str =
    "id, sender, receiver, content, room, kind, read, created_at, updated_at";

impl Database {
    // -- Users --

    /// Insert a user. Returns `false` if the username is taken.
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        created_at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(username) DO NOTHING",
                (id, username, password_hash, created_at),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))?;
            let rows = stmt
                .query_map([], user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns the number of users updated (0 or 1).
    pub fn set_online(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("UPDATE users SET online = 1 WHERE id = ?1", [id])?)
        })
    }

    pub fn set_offline(&self, id: &str, last_seen: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE users SET online = 0, last_seen = ?2 WHERE id = ?1",
                (id, last_seen),
            )?)
        })
    }

    pub fn touch_last_seen(&self, id: &str, last_seen: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE id = ?1",
                (id, last_seen),
            )?)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                rusqlite::params![
                    row.id,
                    row.sender,
                    row.receiver,
                    row.content,
                    row.room,
                    row.kind,
                    row.read,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
            let row = stmt.query_row([id], message_row).optional()?;
            Ok(row)
        })
    }

    /// Mark a message read. `updated_at` only moves on the first call.
    /// Returns the number of matching messages (0 or 1).
    pub fn mark_read(&self, id: &str, updated_at: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages
                 SET updated_at = CASE WHEN read = 0 THEN ?2 ELSE updated_at END,
                     read = 1
                 WHERE id = ?1",
                (id, updated_at),
            )?)
        })
    }

    /// Append a reaction. Returns `false` if the message does not exist.
    pub fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: &str,
        created_at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let touched = conn.execute(
                "UPDATE messages SET updated_at = ?2 WHERE id = ?1",
                (message_id, created_at),
            )?;
            if touched == 0 {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO reactions (message_id, user_id, reaction, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (message_id, user_id, reaction, created_at),
            )?;
            Ok(true)
        })
    }

    /// Messages of a room, newest first. Insertion order breaks timestamp ties.
    pub fn get_room_messages(
        &self,
        room: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![room, limit, offset], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Reactions --

    /// Batch-fetch reactions for a set of message IDs, in insertion order.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, reaction, created_at FROM reactions
                 WHERE message_id IN ({})
                 ORDER BY id",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        reaction: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"
    ))?;
    let row = stmt.query_row([value], user_row).optional()?;
    Ok(row)
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        content: row.get(3)?,
        room: row.get(4)?,
        kind: row.get(5)?,
        read: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: &str = "2024-03-01T10:00:00.000000Z";
    const T1: &str = "2024-03-01T11:00:00.000000Z";

    fn message(id: &str, room: &str, created_at: &str) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            sender: "u1".to_string(),
            receiver: None,
            content: format!("content of {id}"),
            room: room.to_string(),
            kind: "text".to_string(),
            read: false,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| crate::migrations::run(conn)).unwrap();
    }

    #[test]
    fn test_unique_username() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_user("a", "alice", "hash", T0).unwrap());
        assert!(!db.create_user("b", "alice", "hash", T0).unwrap());
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_rows_are_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_user("a", "alice", "hash", T0).unwrap());

        assert_eq!(db.get_user_by_id("a").unwrap().unwrap().username, "alice");
        assert!(db.get_user_by_id("nobody").unwrap().is_none());
        assert!(db.get_user_by_username("bob").unwrap().is_none());
        assert!(db.get_message("missing").unwrap().is_none());
    }

    #[test]
    fn test_room_messages_order_and_ties() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&message("m1", "global", T0)).unwrap();
        db.insert_message(&message("m2", "global", T0)).unwrap();
        db.insert_message(&message("m3", "global", T1)).unwrap();
        db.insert_message(&message("p1", "u1:u2", T1)).unwrap();

        let ids: Vec<String> = db
            .get_room_messages("global", 0, 10)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m3", "m2", "m1"]);

        let page: Vec<String> = db
            .get_room_messages("global", 1, 1)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(page, vec!["m2"]);
    }

    #[test]
    fn test_mark_read_keeps_first_update() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&message("m1", "global", T0)).unwrap();

        assert_eq!(db.mark_read("m1", T1).unwrap(), 1);
        assert_eq!(db.mark_read("m1", "2024-03-02T00:00:00.000000Z").unwrap(), 1);
        let row = db.get_message("m1").unwrap().unwrap();
        assert!(row.read);
        assert_eq!(row.updated_at, T1);

        assert_eq!(db.mark_read("missing", T1).unwrap(), 0);
    }

    #[test]
    fn test_reactions_allow_repeats() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&message("m1", "global", T0)).unwrap();

        assert!(db.add_reaction("m1", "u1", "👍", T1).unwrap());
        assert!(db.add_reaction("m1", "u1", "👍", T1).unwrap());
        assert!(!db.add_reaction("missing", "u1", "👍", T1).unwrap());

        let rows = db.get_reactions_for_messages(&["m1".to_string()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);
    }
}
