//! Favicon storage.
//!
//! Lives in its own SQLite file so razing the history database never loses
//! icons. The engine keeps its transaction in lock step with the history
//! store's commit cycle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use crate::types::{time_from_micros, time_to_micros};

const FAVICON_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS icons (
    id INTEGER PRIMARY KEY,
    icon_url TEXT NOT NULL UNIQUE,
    image_data BLOB NOT NULL,
    last_updated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS icon_mappings (
    page_url TEXT NOT NULL,
    icon_id INTEGER NOT NULL,
    PRIMARY KEY(page_url, icon_id),
    FOREIGN KEY(icon_id) REFERENCES icons(id)
);
"#;

#[derive(Debug, Clone)]
pub struct Favicon {
    pub icon_url: String,
    pub image_data: Vec<u8>,
    pub last_updated: DateTime<Utc>,
}

pub struct FaviconStore {
    conn: Connection,
    in_transaction: bool,
}

impl FaviconStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(FAVICON_SCHEMA)?;
        Ok(FaviconStore {
            conn,
            in_transaction: false,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(FAVICON_SCHEMA)?;
        Ok(FaviconStore {
            conn,
            in_transaction: false,
        })
    }

    pub fn begin_singleton_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit_singleton_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn set_favicon(
        &self,
        page_url: &str,
        icon_url: &str,
        image_data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO icons (icon_url, image_data, last_updated) VALUES (?, ?, ?)
             ON CONFLICT(icon_url)
             DO UPDATE SET image_data = excluded.image_data,
                           last_updated = excluded.last_updated",
            params![icon_url, image_data, time_to_micros(now)],
        )?;
        let icon_id: i64 = self.conn.query_row(
            "SELECT id FROM icons WHERE icon_url = ?",
            params![icon_url],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO icon_mappings (page_url, icon_id) VALUES (?, ?)",
            params![page_url, icon_id],
        )?;
        Ok(())
    }

    pub fn get_favicon_for_page(&self, page_url: &str) -> Result<Option<Favicon>> {
        let result = self.conn.query_row(
            "SELECT i.icon_url, i.image_data, i.last_updated
             FROM icon_mappings m JOIN icons i ON m.icon_id = i.id
             WHERE m.page_url = ?
             ORDER BY i.last_updated DESC LIMIT 1",
            params![page_url],
            |row| {
                Ok(Favicon {
                    icon_url: row.get(0)?,
                    image_data: row.get(1)?,
                    last_updated: time_from_micros(row.get(2)?),
                })
            },
        );
        match result {
            Ok(icon) => Ok(Some(icon)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the source page's icon mappings onto the destination page.
    /// Used when typed credit moves to a redirect destination.
    pub fn clone_favicon_mappings(&self, from_page: &str, to_page: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO icon_mappings (page_url, icon_id)
             SELECT ?, icon_id FROM icon_mappings WHERE page_url = ?",
            params![to_page, from_page],
        )?;
        Ok(())
    }

    pub fn delete_mappings_for_pages(&self, page_urls: &[String]) -> Result<()> {
        for page_url in page_urls {
            self.conn.execute(
                "DELETE FROM icon_mappings WHERE page_url = ?",
                params![page_url],
            )?;
        }
        Ok(())
    }

    /// Drops icons no page maps to any more. Runs after bulk deletions.
    pub fn delete_unused_icons(&self) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM icons WHERE id NOT IN (SELECT icon_id FROM icon_mappings)",
            [],
        )?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM icon_mappings; DELETE FROM icons;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_favicon() {
        let store = FaviconStore::open_in_memory().unwrap();
        store
            .set_favicon("https://a.com/", "https://a.com/favicon.ico", b"png", Utc::now())
            .unwrap();

        let icon = store.get_favicon_for_page("https://a.com/").unwrap().unwrap();
        assert_eq!(icon.icon_url, "https://a.com/favicon.ico");
        assert_eq!(icon.image_data, b"png");
        assert!(store.get_favicon_for_page("https://b.com/").unwrap().is_none());
    }

    #[test]
    fn test_clone_mappings_and_prune() {
        let store = FaviconStore::open_in_memory().unwrap();
        store
            .set_favicon("http://a.com/", "http://a.com/favicon.ico", b"x", Utc::now())
            .unwrap();
        store
            .clone_favicon_mappings("http://a.com/", "https://a.com/")
            .unwrap();
        assert!(store.get_favicon_for_page("https://a.com/").unwrap().is_some());

        store
            .delete_mappings_for_pages(&["http://a.com/".to_string(), "https://a.com/".to_string()])
            .unwrap();
        assert_eq!(store.delete_unused_icons().unwrap(), 1);
    }
}
