//! SQLite-backed contact, result, and status store.
//!
//! One table holds contacts; per conversation title a result table (one
//! column per information item) and a status table are created on demand.
//! Thread-safe via an internal `Mutex<Connection>`; writes are short
//! transactions around each upsert.

use crate::conversation::{ConversationConfig, sanitize_identifier};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// One row of the contacts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
}

/// Campaign outcome for one contact under one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    NotReached,
    Aborted,
    Completed,
}

impl ContactOutcome {
    /// Stable string form stored in the status table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotReached => "NOT_REACHED",
            Self::Aborted => "ABORTED",
            Self::Completed => "COMPLETED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "ABORTED" => Self::Aborted,
            "COMPLETED" => Self::Completed,
            _ => Self::NotReached,
        }
    }
}

/// Attempt bookkeeping for one contact under one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactStatus {
    pub num_attempts: u32,
    pub outcome: ContactOutcome,
}

/// The process-wide store.
pub struct ContactStore {
    conn: Mutex<Connection>,
}

impl ContactStore {
    /// Open (or create) the database and ensure the contacts table.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contacts (
                contact_id INTEGER PRIMARY KEY,
                name TEXT,
                phone_number TEXT,
                CONSTRAINT unq UNIQUE (name, phone_number)
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create the result and status tables for a conversation.
    ///
    /// The result table gets one TEXT column per information title.
    ///
    /// # Errors
    ///
    /// Returns an error when table creation fails.
    pub fn ensure_conversation_tables(&self, config: &ConversationConfig) -> Result<()> {
        let table = config.table_name();
        let mut fields = String::new();
        for column in config.information_titles() {
            fields.push_str(&format!(",\n                {column} TEXT"));
        }

        let conn = self.lock();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                result_id INTEGER PRIMARY KEY,
                contact_id INTEGER UNIQUE{fields}
            );
            CREATE TABLE IF NOT EXISTS {table}_status (
                status_id INTEGER PRIMARY KEY,
                contact_id INTEGER UNIQUE,
                num_attempts INTEGER,
                status TEXT
            );"
        ))?;
        info!("ensured tables for conversation '{table}'");
        Ok(())
    }

    /// Insert a contact; duplicates of `(name, phone_number)` are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub fn add_contact(&self, name: &str, phone_number: &str) -> Result<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO contacts (name, phone_number) VALUES (?1, ?2)",
            params![name, phone_number],
        )?;
        Ok(())
    }

    /// Look a contact up by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn get_contact(&self, contact_id: i64) -> Result<Option<ContactRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT contact_id, name, phone_number FROM contacts WHERE contact_id = ?1",
                params![contact_id],
                |row| {
                    Ok(ContactRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        phone_number: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// All contact ids, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn contact_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT contact_id FROM contacts ORDER BY contact_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Status row for a contact under a conversation, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn get_status(&self, table: &str, contact_id: i64) -> Result<Option<ContactStatus>> {
        let conn = self.lock();
        let status = conn
            .query_row(
                &format!(
                    "SELECT num_attempts, status FROM {table}_status WHERE contact_id = ?1"
                ),
                params![contact_id],
                |row| {
                    let raw: String = row.get(1)?;
                    Ok(ContactStatus {
                        num_attempts: row.get(0)?,
                        outcome: ContactOutcome::parse(&raw),
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    /// Ensure a `(NOT_REACHED, 0)` status row exists for a contact.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub fn ensure_status(&self, table: &str, contact_id: i64) -> Result<()> {
        self.lock().execute(
            &format!(
                "INSERT OR IGNORE INTO {table}_status (contact_id, num_attempts, status)
                 VALUES (?1, 0, 'NOT_REACHED')"
            ),
            params![contact_id],
        )?;
        Ok(())
    }

    /// Count one more call attempt for a contact.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub fn increment_attempts(&self, table: &str, contact_id: i64) -> Result<()> {
        self.lock().execute(
            &format!(
                "UPDATE {table}_status SET num_attempts = num_attempts + 1
                 WHERE contact_id = ?1"
            ),
            params![contact_id],
        )?;
        Ok(())
    }

    /// Record the outcome of the latest attempt.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub fn set_outcome(&self, table: &str, contact_id: i64, outcome: ContactOutcome) -> Result<()> {
        self.lock().execute(
            &format!("UPDATE {table}_status SET status = ?1 WHERE contact_id = ?2"),
            params![outcome.as_str(), contact_id],
        )?;
        Ok(())
    }

    /// Upsert an extraction result keyed by contact id, refreshing the row
    /// on repeated attempts.
    ///
    /// # Errors
    ///
    /// Returns an error when the upsert fails.
    pub fn upsert_result(
        &self,
        table: &str,
        contact_id: i64,
        values: &std::collections::BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let columns: Vec<String> = values.keys().map(|k| sanitize_identifier(k)).collect();
        let mut sql = format!("INSERT OR REPLACE INTO {table} (contact_id");
        for column in &columns {
            sql.push_str(", ");
            sql.push_str(column);
        }
        sql.push_str(") VALUES (?1");
        for i in 0..columns.len() {
            sql.push_str(&format!(", ?{}", i + 2));
        }
        sql.push(')');

        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(contact_id)];
        for value in values.values() {
            bound.push(Box::new(value.clone()));
        }

        self.lock().execute(
            &sql,
            rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::conversation::ConversationConfig;
    use std::collections::BTreeMap;

    const SCRIPT: &str = r#"
conversation_title: Survey Call
conversation_paths:
  entry:
    - type: information
      interactive: true
      title: Name
      description: the caller's name
      format: text
    - type: information
      interactive: true
      title: Date of Birth
      description: the caller's date of birth
      format: DD.MM.YYYY
    - type: read
      text: Thanks
  aborted:
    - type: read
      text: Sorry, goodbye
"#;

    fn store_with_tables() -> (ContactStore, ConversationConfig) {
        let store = ContactStore::open_in_memory().unwrap();
        let config = ConversationConfig::from_yaml_str(SCRIPT).unwrap();
        store.ensure_conversation_tables(&config).unwrap();
        (store, config)
    }

    #[test]
    fn contacts_are_unique_by_name_and_number() {
        let (store, _) = store_with_tables();
        store.add_contact("Max", "+100").unwrap();
        store.add_contact("Max", "+100").unwrap();
        store.add_contact("Max", "+200").unwrap();
        assert_eq!(store.contact_ids().unwrap().len(), 2);
    }

    #[test]
    fn get_contact_returns_none_for_unknown_id() {
        let (store, _) = store_with_tables();
        assert!(store.get_contact(42).unwrap().is_none());
    }

    #[test]
    fn status_lifecycle() {
        let (store, config) = store_with_tables();
        let table = config.table_name();
        store.add_contact("Max", "+100").unwrap();
        let id = store.contact_ids().unwrap()[0];

        assert!(store.get_status(table, id).unwrap().is_none());
        store.ensure_status(table, id).unwrap();
        store.ensure_status(table, id).unwrap();
        store.increment_attempts(table, id).unwrap();
        store.increment_attempts(table, id).unwrap();

        let status = store.get_status(table, id).unwrap().unwrap();
        assert_eq!(status.num_attempts, 2);
        assert_eq!(status.outcome, ContactOutcome::NotReached);

        store.set_outcome(table, id, ContactOutcome::Completed).unwrap();
        let status = store.get_status(table, id).unwrap().unwrap();
        assert_eq!(status.outcome, ContactOutcome::Completed);
    }

    #[test]
    fn results_upsert_refreshes_the_row() {
        let (store, config) = store_with_tables();
        let table = config.table_name();
        store.add_contact("Max", "+100").unwrap();
        let id = store.contact_ids().unwrap()[0];

        let mut values = BTreeMap::new();
        values.insert("name".to_owned(), Some("Max".to_owned()));
        values.insert("date_of_birth".to_owned(), None);
        store.upsert_result(table, id, &values).unwrap();

        values.insert("date_of_birth".to_owned(), Some("01.02.1990".to_owned()));
        store.upsert_result(table, id, &values).unwrap();

        let conn = store.lock();
        let (name, dob): (Option<String>, Option<String>) = conn
            .query_row(
                &format!("SELECT name, date_of_birth FROM {table} WHERE contact_id = ?1"),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        drop(conn);
        assert_eq!(name.as_deref(), Some("Max"));
        assert_eq!(dob.as_deref(), Some("01.02.1990"));

        // Still one row for the contact.
        let conn = store.lock();
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE contact_id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
