use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use serde::Serialize;
use shared::composition::IoTApp;

/// One row of the app listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppListing {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// Saved compositions, keyed by the app's stable id
pub struct AppStore {
    conn: Connection,
}

impl AppStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Save an app. Returns true if it was not stored before.
    pub fn upsert_app(&self, app: &IoTApp) -> Result<bool> {
        let existed = self
            .conn
            .query_row("SELECT 1 FROM apps WHERE id = ?1", params![app.id()], |_| Ok(()))
            .optional()
            .context("Failed to query existing app")?
            .is_some();

        let body = app.to_json().context("Failed to serialize app")?;

        self.conn.execute(
            r#"
            INSERT INTO apps (id, name, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![app.id(), app.name(), body, Utc::now().to_rfc3339()],
        )
        .context("Failed to upsert app")?;

        Ok(!existed)
    }

    pub fn get_app(&self, id: &str) -> Result<Option<IoTApp>> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM apps WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to query app")?;

        body.map(|body| {
            IoTApp::from_json(&body).with_context(|| format!("Stored app {} is unreadable", id))
        })
        .transpose()
    }

    /// All saved apps, most recently updated first
    pub fn list_apps(&self) -> Result<Vec<AppListing>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, updated_at FROM apps ORDER BY updated_at DESC, id")
            .context("Failed to prepare query")?;

        let apps = stmt
            .query_map([], Self::row_to_listing)
            .context("Failed to query apps")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect apps")?;

        Ok(apps)
    }

    /// Returns true if something was deleted
    pub fn delete_app(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM apps WHERE id = ?1", params![id])
            .context("Failed to delete app")?;
        Ok(count > 0)
    }

    fn row_to_listing(row: &rusqlite::Row) -> Result<AppListing, rusqlite::Error> {
        let updated_str: String = row.get(2)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(AppListing {
            id: row.get(0)?,
            name: row.get(1)?,
            updated_at,
        })
    }
}
