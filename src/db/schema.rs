//! Database schema and migrations for mailsink.
//!
//! Migrations are applied in order when the database is first opened or
//! upgraded. The full-text index lives outside the migration list because
//! the SQLite build may lack FTS5; see [`FTS_SCHEMA`].

/// Database migrations.
///
/// Each migration is a SQL script executed in its own transaction.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: messages and attachments
    r#"
-- Captured messages. Address lists and headers are JSON text.
CREATE TABLE messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id     TEXT UNIQUE,                 -- Message-ID header, NULL when absent
    sender          TEXT NOT NULL,
    recipients      TEXT NOT NULL DEFAULT '[]',
    cc_recipients   TEXT NOT NULL DEFAULT '[]',
    bcc_recipients  TEXT NOT NULL DEFAULT '[]',
    subject         TEXT NOT NULL DEFAULT '',
    plain_body      TEXT NOT NULL DEFAULT '',
    markup_body     TEXT NOT NULL DEFAULT '',
    header_fields   TEXT NOT NULL DEFAULT '{}',
    byte_size       INTEGER NOT NULL DEFAULT 0,
    received_at     INTEGER NOT NULL,            -- microseconds since the Unix epoch
    is_read         INTEGER NOT NULL DEFAULT 0,
    -- Lowercased copies for case-insensitive substring matching. SQLite
    -- LIKE only folds ASCII, so these are folded before insert.
    folded_sender     TEXT NOT NULL DEFAULT '',
    folded_recipients TEXT NOT NULL DEFAULT '',
    folded_subject    TEXT NOT NULL DEFAULT '',
    folded_body       TEXT NOT NULL DEFAULT ''
);

CREATE INDEX idx_messages_received ON messages(received_at DESC, id DESC);
CREATE INDEX idx_messages_sender ON messages(sender);

CREATE TABLE attachments (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id      INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    filename        TEXT NOT NULL,
    content_type    TEXT NOT NULL,
    byte_size       INTEGER NOT NULL,
    payload         BLOB NOT NULL
);

CREATE INDEX idx_attachments_message_id ON attachments(message_id);
"#,
];

/// Name of the FTS5 table.
pub const FTS_TABLE: &str = "messages_fts";

/// External-content FTS5 index over the searchable message columns, plus
/// the triggers that keep it in step with `messages`.
///
/// Every statement is idempotent. Creation fails when FTS5 is unavailable,
/// in which case search falls back to substring matching.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject,
    sender,
    recipients,
    plain_body,
    content='messages',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, sender, recipients, plain_body)
    VALUES (new.id, new.subject, new.sender, new.recipients, new.plain_body);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, sender, recipients, plain_body)
    VALUES ('delete', old.id, old.subject, old.sender, old.recipients, old.plain_body);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_update
AFTER UPDATE OF subject, sender, recipients, plain_body ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, sender, recipients, plain_body)
    VALUES ('delete', old.id, old.subject, old.sender, old.recipients, old.plain_body);
    INSERT INTO messages_fts(rowid, subject, sender, recipients, plain_body)
    VALUES (new.id, new.subject, new.sender, new.recipients, new.plain_body);
END;
"#;

/// Repopulates the index from `messages`; run when the index is newly created.
pub const FTS_REBUILD: &str = "INSERT INTO messages_fts(messages_fts) VALUES('rebuild')";
