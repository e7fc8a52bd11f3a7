//! SQLite-backed mailbox store

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::schema::migrations;
use crate::models::{Account, AccountId, AuthState};

/// The durable local cache
///
/// One connection behind a mutex: every write (sync apply, UI mutation,
/// worker claim) is serialized through it.
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (or create) the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers unblocked during a sync transaction;
        // foreign_keys is required for ON DELETE CASCADE.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, turning a poisoned lock into an error
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    // === Accounts ===

    /// Register an account, or return the existing one for this address
    pub fn create_account(&self, email: &str, display_name: Option<&str>) -> Result<Account> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (email, display_name, added_at) VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name)",
            params![email, display_name, to_millis(Utc::now())],
        )?;

        load_account(&conn, "email = ?", email)?
            .with_context(|| format!("Account {} vanished after insert", email))
    }

    pub fn get_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        let conn = self.lock()?;
        load_account(&conn, "id = ?", account_id)
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.lock()?;
        load_account(&conn, "email = ?", email)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", ACCOUNT_SELECT))?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    /// Delete an account and, by cascade, everything it owns
    pub fn delete_account(&self, account_id: AccountId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM accounts WHERE id = ?", [account_id])?;
        if deleted > 0 {
            log::info!("[STORE] Deleted account {} and its data", account_id);
        }
        Ok(deleted > 0)
    }

    pub fn set_auth_state(&self, account_id: AccountId, state: AuthState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE accounts SET auth_state = ? WHERE id = ?",
            params![state.as_str(), account_id],
        )?;
        Ok(())
    }

    /// Record a failed sync cycle as account health status
    pub fn record_sync_error(
        &self,
        account_id: AccountId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE accounts SET last_error = ?, last_error_at = ? WHERE id = ?",
            params![message, to_millis(at), account_id],
        )?;
        Ok(())
    }

    pub fn get_sync_cursor(&self, account_id: AccountId) -> Result<Option<String>> {
        let conn = self.lock()?;
        let cursor: Option<Option<String>> = conn
            .query_row(
                "SELECT sync_cursor FROM accounts WHERE id = ?",
                [account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.flatten())
    }

    /// Forget the cursor so the next cycle performs a full listing
    pub fn reset_sync_cursor(&self, account_id: AccountId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE accounts SET sync_cursor = NULL WHERE id = ?",
            [account_id],
        )?;
        Ok(())
    }

    // === Credential blobs ===

    /// The sealed credential for an account; `Err` if the account is unknown
    pub fn load_credential(&self, account_id: AccountId) -> Result<Option<String>> {
        let conn = self.lock()?;
        let blob: Option<Option<String>> = conn
            .query_row(
                "SELECT credential FROM accounts WHERE id = ?",
                [account_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.with_context(|| format!("Unknown account {}", account_id))
    }

    pub fn save_credential(&self, account_id: AccountId, sealed: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE accounts SET credential = ? WHERE id = ?",
            params![sealed, account_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("Unknown account {}", account_id));
        }
        Ok(())
    }
}

const ACCOUNT_SELECT: &str = "SELECT id, email, display_name, auth_state, last_sync_at,
        sync_cursor, last_error, last_error_at, added_at
 FROM accounts";

fn load_account(
    conn: &Connection,
    predicate: &str,
    key: impl rusqlite::ToSql,
) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("{} WHERE {}", ACCOUNT_SELECT, predicate),
            [key],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let auth_state: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        auth_state: AuthState::parse(&auth_state),
        last_sync_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        sync_cursor: row.get(5)?,
        last_error: row.get(6)?,
        last_error_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        added_at: from_millis(row.get(8)?),
    })
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mail.db");
        {
            let store = SqliteMailStore::open(&path).unwrap();
            store.create_account("a@example.com", None).unwrap();
        }

        // Reopening runs migrations as a no-op and keeps data
        let store = SqliteMailStore::open(&path).unwrap();
        assert_eq!(store.list_accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_create_account_is_idempotent() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let first = store.create_account("a@example.com", Some("A")).unwrap();
        let second = store.create_account("a@example.com", None).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("A"));
        assert!(second.is_authenticated());
        assert_eq!(second.sync_cursor, None);
    }

    #[test]
    fn test_auth_state_and_errors() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("a@example.com", None).unwrap();

        store
            .set_auth_state(account.id, AuthState::Unauthenticated)
            .unwrap();
        let now = Utc::now();
        store.record_sync_error(account.id, "boom", now).unwrap();

        let loaded = store.get_account(account.id).unwrap().unwrap();
        assert_eq!(loaded.auth_state, AuthState::Unauthenticated);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
        assert_eq!(
            loaded.last_error_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[test]
    fn test_credential_blob() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("a@example.com", None).unwrap();

        assert_eq!(store.load_credential(account.id).unwrap(), None);
        store.save_credential(account.id, "sealed").unwrap();
        assert_eq!(
            store.load_credential(account.id).unwrap().as_deref(),
            Some("sealed")
        );
        assert!(store.load_credential(999).is_err());
        assert!(store.save_credential(999, "x").is_err());
    }

    #[test]
    fn test_millis_round_trip() {
        let at = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(at), 1_700_000_000_123);
    }
}
