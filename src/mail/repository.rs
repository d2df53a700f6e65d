//! Message repository for mailsink.
//!
//! All persistence of captured messages goes through here: transactional
//! saves, filtered listing, dual-mode search, single and bulk deletion, and
//! the two eviction policies used by retention.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use super::types::{
    from_micros, to_micros, Attachment, AttachmentMeta, HeaderFields, Message, MessageFilter,
    MessagePage, MessageStats, NewMessage, Page,
};
use crate::db::{Database, SearchMode};
use crate::{MailsinkError, Result};

const MESSAGE_COLUMNS: &str = "m.id, m.external_id, m.sender, m.recipients, m.cc_recipients, \
     m.bcc_recipients, m.subject, m.plain_body, m.markup_body, m.header_fields, m.byte_size, \
     m.received_at, m.is_read";

const CANONICAL_ORDER: &str = " ORDER BY m.received_at DESC, m.id DESC";

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    external_id: Option<String>,
    sender: String,
    recipients: String,
    cc_recipients: String,
    bcc_recipients: String,
    subject: String,
    plain_body: String,
    markup_body: String,
    header_fields: String,
    byte_size: i64,
    received_at: i64,
    is_read: bool,
}

impl MessageRow {
    fn into_message(self, attachments: Vec<AttachmentMeta>) -> Result<Message> {
        Ok(Message {
            id: self.id,
            external_id: self.external_id,
            sender: self.sender,
            recipients: decode_json(&self.recipients, "recipients")?,
            cc_recipients: decode_json(&self.cc_recipients, "cc_recipients")?,
            bcc_recipients: decode_json(&self.bcc_recipients, "bcc_recipients")?,
            subject: self.subject,
            plain_body: self.plain_body,
            markup_body: self.markup_body,
            header_fields: decode_json::<HeaderFields>(&self.header_fields, "header_fields")?,
            attachments,
            byte_size: self.byte_size,
            received_at: from_micros(self.received_at),
            is_read: self.is_read,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T, column: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| MailsinkError::Database(format!("failed to encode {column}: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str, column: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| MailsinkError::Database(format!("corrupt {column} column: {e}")))
}

/// `%needle%` with LIKE wildcards in `needle` escaped by `\`.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// FTS5 expression matching every whitespace-separated token of `query`.
///
/// Each token becomes a quoted string so punctuation never turns into
/// query syntax.
pub(crate) fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// Repository for captured messages.
pub struct MessageRepository<'a> {
    db: &'a Database,
}

impl<'a> MessageRepository<'a> {
    /// Create a new MessageRepository over the given database.
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Store a message and all of its attachments in one transaction.
    ///
    /// Returns the assigned message ID.
    pub async fn save(&self, message: &NewMessage) -> Result<i64> {
        let recipients = encode_json(&message.recipients, "recipients")?;
        let cc_recipients = encode_json(&message.cc_recipients, "cc_recipients")?;
        let bcc_recipients = encode_json(&message.bcc_recipients, "bcc_recipients")?;
        let header_fields = encode_json(&message.header_fields, "header_fields")?;

        let mut write = self.db.begin_write().await?;

        let result = sqlx::query(
            "INSERT INTO messages (external_id, sender, recipients, cc_recipients, bcc_recipients,
                                   subject, plain_body, markup_body, header_fields, byte_size,
                                   received_at, folded_sender, folded_recipients, folded_subject,
                                   folded_body)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.external_id)
        .bind(&message.sender)
        .bind(&recipients)
        .bind(&cc_recipients)
        .bind(&bcc_recipients)
        .bind(&message.subject)
        .bind(&message.plain_body)
        .bind(&message.markup_body)
        .bind(&header_fields)
        .bind(message.byte_size)
        .bind(to_micros(message.received_at))
        .bind(message.sender.to_lowercase())
        .bind(recipients.to_lowercase())
        .bind(message.subject.to_lowercase())
        .bind(message.plain_body.to_lowercase())
        .execute(write.conn())
        .await?;

        let id = result.last_insert_rowid();

        for attachment in &message.attachments {
            sqlx::query(
                "INSERT INTO attachments (message_id, filename, content_type, byte_size, payload)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.byte_size())
            .bind(&attachment.payload)
            .execute(write.conn())
            .await?;
        }

        write.commit().await?;

        debug!(id, attachments = message.attachments.len(), "Stored message");
        Ok(id)
    }

    /// Get a message by ID, with attachment metadata.
    pub async fn get(&self, id: i64) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| MailsinkError::NotFound("message".to_string()))?;

        let attachments = sqlx::query_as::<_, AttachmentMeta>(
            "SELECT id, message_id, filename, content_type, byte_size
             FROM attachments WHERE message_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.db.pool())
        .await?;

        row.into_message(attachments)
    }

    /// List messages matching `filter`, newest first.
    pub async fn list(&self, filter: &MessageFilter, page: Page) -> Result<MessagePage> {
        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM messages m WHERE 1 = 1");
        push_filter(&mut count_query, filter);
        let (total,): (i64,) = count_query
            .build_query_as()
            .fetch_one(self.db.pool())
            .await?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE 1 = 1"
        ));
        push_filter(&mut query, filter);
        push_page(&mut query, page);
        let rows = query
            .build_query_as::<MessageRow>()
            .fetch_all(self.db.pool())
            .await?;

        self.assemble_page(rows, total).await
    }

    /// Search messages.
    ///
    /// Uses the full-text index when the store opened with one, otherwise a
    /// case-insensitive substring scan over subject, sender, recipients and
    /// plain body. Results are newest first in both modes.
    pub async fn search(&self, query: &str, page: Page) -> Result<MessagePage> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MailsinkError::InvalidArgument(
                "search query is required".to_string(),
            ));
        }

        match self.db.search_mode() {
            SearchMode::FullText => self.search_full_text(query, page).await,
            SearchMode::Substring => self.search_substring(query, page).await,
        }
    }

    async fn search_full_text(&self, query: &str, page: Page) -> Result<MessagePage> {
        let expression = fts_match_expression(query).ok_or_else(|| {
            MailsinkError::InvalidArgument("search query is required".to_string())
        })?;
        const MATCHING: &str =
            " WHERE m.id IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ";

        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM messages m");
        count_query.push(MATCHING);
        count_query.push_bind(&expression);
        count_query.push(")");
        let (total,): (i64,) = count_query
            .build_query_as()
            .fetch_one(self.db.pool())
            .await?;

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages m"));
        select.push(MATCHING);
        select.push_bind(&expression);
        select.push(")");
        push_page(&mut select, page);
        let rows = select
            .build_query_as::<MessageRow>()
            .fetch_all(self.db.pool())
            .await?;

        self.assemble_page(rows, total).await
    }

    async fn search_substring(&self, query: &str, page: Page) -> Result<MessagePage> {
        let pattern = like_pattern(&query.to_lowercase());

        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM messages m");
        push_substring_match(&mut count_query, &pattern);
        let (total,): (i64,) = count_query
            .build_query_as()
            .fetch_one(self.db.pool())
            .await?;

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages m"));
        push_substring_match(&mut select, &pattern);
        push_page(&mut select, page);
        let rows = select
            .build_query_as::<MessageRow>()
            .fetch_all(self.db.pool())
            .await?;

        self.assemble_page(rows, total).await
    }

    /// Attach metadata to a page of rows with a single extra query.
    async fn assemble_page(&self, rows: Vec<MessageRow>, total: i64) -> Result<MessagePage> {
        let mut by_message: HashMap<i64, Vec<AttachmentMeta>> = HashMap::new();

        if !rows.is_empty() {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, message_id, filename, content_type, byte_size
                 FROM attachments WHERE message_id IN (",
            );
            let mut ids = query.separated(", ");
            for row in &rows {
                ids.push_bind(row.id);
            }
            query.push(") ORDER BY id");

            let metas = query
                .build_query_as::<AttachmentMeta>()
                .fetch_all(self.db.pool())
                .await?;
            for meta in metas {
                by_message.entry(meta.message_id).or_default().push(meta);
            }
        }

        let messages = rows
            .into_iter()
            .map(|row| {
                let attachments = by_message.remove(&row.id).unwrap_or_default();
                row.into_message(attachments)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MessagePage { messages, total })
    }

    /// Delete a message and its attachments.
    pub async fn delete_one(&self, id: i64) -> Result<()> {
        let mut write = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(write.conn())
            .await?;

        if result.rows_affected() == 0 {
            return Err(MailsinkError::NotFound("message".to_string()));
        }

        write.commit().await?;
        debug!(id, "Deleted message");
        Ok(())
    }

    /// Delete every message. Returns how many were removed.
    pub async fn delete_all(&self) -> Result<u64> {
        let mut write = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM messages")
            .execute(write.conn())
            .await?;
        write.commit().await?;

        debug!(deleted = result.rows_affected(), "Deleted all messages");
        Ok(result.rows_affected())
    }

    /// Get an attachment with its payload.
    pub async fn get_attachment(&self, id: i64) -> Result<Attachment> {
        let row: Option<(i64, i64, String, String, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT id, message_id, filename, content_type, byte_size, payload
             FROM attachments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        let (id, message_id, filename, content_type, byte_size, payload) =
            row.ok_or_else(|| MailsinkError::NotFound("attachment".to_string()))?;

        Ok(Attachment {
            meta: AttachmentMeta {
                id,
                message_id,
                filename,
                content_type,
                byte_size,
            },
            payload,
        })
    }

    /// Set or clear the read flag.
    pub async fn mark_read(&self, id: i64, is_read: bool) -> Result<()> {
        let mut write = self.db.begin_write().await?;
        let result = sqlx::query("UPDATE messages SET is_read = ? WHERE id = ?")
            .bind(is_read)
            .bind(id)
            .execute(write.conn())
            .await?;

        if result.rows_affected() == 0 {
            return Err(MailsinkError::NotFound("message".to_string()));
        }

        write.commit().await?;
        Ok(())
    }

    /// Delete messages received strictly before `cutoff`.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut write = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM messages WHERE received_at < ?")
            .bind(to_micros(cutoff))
            .execute(write.conn())
            .await?;
        write.commit().await?;
        Ok(result.rows_affected())
    }

    /// Keep only the `max_count` newest messages.
    pub async fn delete_excess(&self, max_count: u64) -> Result<u64> {
        let keep = i64::try_from(max_count).unwrap_or(i64::MAX);

        let mut write = self.db.begin_write().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(write.conn())
            .await?;
        if count <= keep {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM messages WHERE id IN (
                SELECT id FROM messages
                ORDER BY received_at DESC, id DESC
                LIMIT -1 OFFSET ?
             )",
        )
        .bind(keep)
        .execute(write.conn())
        .await?;
        write.commit().await?;

        Ok(result.rows_affected())
    }

    /// Number of stored messages.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Total count and count received since the start of `now`'s UTC day.
    pub async fn stats(&self, now: DateTime<Utc>) -> Result<MessageStats> {
        let start_of_day = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let (total, today): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN received_at >= ? THEN 1 ELSE 0 END), 0)
             FROM messages",
        )
        .bind(to_micros(start_of_day))
        .fetch_one(self.db.pool())
        .await?;

        Ok(MessageStats { total, today })
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &MessageFilter) {
    let substring_columns = [
        ("m.folded_sender", &filter.sender),
        ("m.folded_recipients", &filter.recipient),
        ("m.folded_subject", &filter.subject),
    ];
    for (column, needle) in substring_columns {
        if let Some(needle) = needle.as_deref().filter(|n| !n.is_empty()) {
            query.push(format!(" AND {column} LIKE "));
            query.push_bind(like_pattern(&needle.to_lowercase()));
            query.push(" ESCAPE '\\'");
        }
    }
    if let Some(after) = filter.received_after {
        query.push(" AND m.received_at >= ");
        query.push_bind(to_micros(after));
    }
    if let Some(before) = filter.received_before {
        query.push(" AND m.received_at <= ");
        query.push_bind(to_micros(before));
    }
}

fn push_substring_match(query: &mut QueryBuilder<'_, Sqlite>, pattern: &str) {
    query.push(" WHERE (");
    let columns = [
        "m.folded_subject",
        "m.folded_sender",
        "m.folded_recipients",
        "m.folded_body",
    ];
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            query.push(" OR ");
        }
        query.push(format!("{column} LIKE "));
        query.push_bind(pattern.to_string());
        query.push(" ESCAPE '\\'");
    }
    query.push(")");
}

fn push_page(query: &mut QueryBuilder<'_, Sqlite>, page: Page) {
    query.push(CANONICAL_ORDER);
    query.push(" LIMIT ");
    query.push_bind(page.limit());
    query.push(" OFFSET ");
    query.push_bind(page.offset());
}
