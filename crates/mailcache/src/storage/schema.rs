//! Database schema
//!
//! Each migration is applied in order. The user_version pragma tracks which
//! migrations have been applied. Timestamps are stored as unix milliseconds
//! so range scans and ordering stay numeric.

use rusqlite_migration::{M, Migrations};

pub(crate) fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Accounts, emails and their child rows
        M::up(
            r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                credential TEXT,              -- AES-GCM sealed token JSON
                auth_state TEXT NOT NULL DEFAULT 'active',
                sync_cursor TEXT,
                last_sync_at INTEGER,
                last_error TEXT,
                last_error_at INTEGER,
                added_at INTEGER NOT NULL
            );

            CREATE TABLE categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                color TEXT,
                icon TEXT,
                is_system INTEGER NOT NULL DEFAULT 0,
                UNIQUE (account_id, name)
            );

            CREATE TABLE emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                remote_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT NOT NULL,     -- lowercased
                subject TEXT NOT NULL,
                normalized_subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_trashed INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                has_list_unsubscribe INTEGER NOT NULL DEFAULT 0,
                is_bulk INTEGER NOT NULL DEFAULT 0,
                has_body INTEGER NOT NULL DEFAULT 0,
                body_text BLOB,               -- zstd compressed
                body_html BLOB,               -- zstd compressed
                category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                category_override INTEGER NOT NULL DEFAULT 0,
                -- Local edits not yet confirmed by the provider (NULL = none)
                pending_read INTEGER,
                pending_starred INTEGER,
                pending_trash INTEGER,
                UNIQUE (account_id, remote_id)
            );

            CREATE INDEX idx_emails_account_received
                ON emails(account_id, received_at DESC);
            CREATE INDEX idx_emails_sender ON emails(account_id, from_email);
            CREATE INDEX idx_emails_topic ON emails(account_id, normalized_subject);
            CREATE INDEX idx_emails_category ON emails(account_id, category_id);

            CREATE TABLE email_recipients (
                email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,           -- 'to' | 'cc'
                name TEXT,
                email TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (email_id, kind, position)
            );

            CREATE INDEX idx_email_recipients_email ON email_recipients(email);

            -- Non-flag labels; UNREAD/STARRED/TRASH live in columns
            CREATE TABLE email_labels (
                email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
                label_id TEXT NOT NULL,
                PRIMARY KEY (email_id, label_id)
            );

            CREATE INDEX idx_email_labels_label ON email_labels(label_id);

            CREATE TABLE attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                remote_attachment_id TEXT NOT NULL
            );

            CREATE INDEX idx_attachments_email ON attachments(email_id);

            -- Local label edits awaiting provider confirmation
            CREATE TABLE pending_label_ops (
                email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
                label_id TEXT NOT NULL,
                op TEXT NOT NULL,             -- 'add' | 'remove'
                PRIMARY KEY (email_id, label_id)
            );
            "#,
        ),
        // Migration 2: Derived indexes and categorization rules
        M::up(
            r#"
            CREATE TABLE sender_groups (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                sender_email TEXT NOT NULL,
                display_name TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, sender_email)
            );

            CREATE TABLE topics (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                normalized_subject TEXT NOT NULL,
                display_subject TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, normalized_subject)
            );

            CREATE TABLE newsletter_senders (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                sender_email TEXT NOT NULL,
                display_name TEXT,
                email_count INTEGER NOT NULL DEFAULT 0,
                is_muted INTEGER NOT NULL DEFAULT 0,
                is_dismissed INTEGER NOT NULL DEFAULT 0,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, sender_email)
            );

            CREATE TABLE categorization_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                priority INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_rules_account ON categorization_rules(account_id, priority, id);
            "#,
        ),
        // Migration 3: Due items
        M::up(
            r#"
            CREATE TABLE scheduled_emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                to_addrs TEXT NOT NULL,       -- JSON array of addresses
                cc_addrs TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                send_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_scheduled_due ON scheduled_emails(status, send_at);

            CREATE TABLE reminders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                email_id INTEGER REFERENCES emails(id) ON DELETE SET NULL,
                note TEXT NOT NULL,
                remind_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                claimed_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_reminders_due ON reminders(status, remind_at);
            "#,
        ),
    ])
}
