use diesel::prelude::*;

use crate::store::{PooledConnection, StoredMessage, schema::messages};
use crate::types::ChatMessage;

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = messages)]
pub struct MessageRow {
    pub username: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessageRow {
    pub username: String,
    pub text: String,
    pub timestamp: i64,
}

impl From<&ChatMessage> for NewMessageRow {
    fn from(message: &ChatMessage) -> Self {
        Self {
            username: message.username.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}

impl NewMessageRow {
    pub fn insert(&self, conn: &mut PooledConnection) -> QueryResult<usize> {
        diesel::insert_into(messages::table)
            .values(self)
            .execute(conn)
    }
}

/// Load the newest rows at or after the cutoff, returned in
/// chronological order (insertion order breaks timestamp ties).
pub fn load_recent(
    conn: &mut PooledConnection,
    cutoff: i64,
    limit: i64,
) -> QueryResult<Vec<StoredMessage>> {
    messages::table
        .filter(messages::timestamp.ge(cutoff))
        .order(messages::timestamp.desc())
        .then_order_by(messages::id.desc())
        .limit(limit)
        .select(MessageRow::as_select())
        .load(conn)
        .map(|mut rows| {
            rows.reverse();
            rows.into_iter()
                .map(|row| StoredMessage {
                    username: row.username,
                    text: row.text,
                    timestamp: row.timestamp,
                })
                .collect()
        })
}

/// Delete rows with a timestamp strictly older than the cutoff.
pub fn purge_older_than(conn: &mut PooledConnection, cutoff: i64) -> QueryResult<usize> {
    diesel::delete(messages::table.filter(messages::timestamp.lt(cutoff))).execute(conn)
}
