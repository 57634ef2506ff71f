//! Durable storage of the visitor's ticket list
//!
//! The list is a JSON array of [`SavedTicket`] entries. Writes go to a
//! temporary file that is synced and renamed over the target, so a crash
//! leaves either the old list or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use fleety_shared::SavedTicket;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for the saved ticket list
pub trait TicketStore: Send + Sync + 'static {
    /// Load the list; a missing or empty store is an empty list
    fn load(&self) -> Result<Vec<SavedTicket>, StorageError>;

    /// Replace the stored list
    fn save(&self, tickets: &[SavedTicket]) -> Result<(), StorageError>;
}

/// Ticket list stored as a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl TicketStore for JsonFileStore {
    fn load(&self) -> Result<Vec<SavedTicket>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, tickets: &[SavedTicket]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_vec_pretty(tickets)?;
        let tmp_path = self.tmp_path();
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        tracing::trace!(path = %self.path.display(), tickets = tickets.len(), "Saved ticket list");
        Ok(())
    }
}

/// Ticket list kept in memory, for embedding without a filesystem
#[derive(Debug, Default)]
pub struct MemoryStore {
    tickets: Mutex<Vec<SavedTicket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tickets(tickets: Vec<SavedTicket>) -> Self {
        Self {
            tickets: Mutex::new(tickets),
        }
    }
}

impl TicketStore for MemoryStore {
    fn load(&self) -> Result<Vec<SavedTicket>, StorageError> {
        Ok(self
            .tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, tickets: &[SavedTicket]) -> Result<(), StorageError> {
        *self.tickets.lock().unwrap_or_else(PoisonError::into_inner) = tickets.to_vec();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleety_shared::{TicketSlug, TicketStatus};
    use tempfile::TempDir;

    fn saved(slug: &str, unread: usize) -> SavedTicket {
        SavedTicket {
            slug: TicketSlug::from(slug),
            title: format!("Ticket {}", slug),
            status: TicketStatus::Open,
            unread_count: unread,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("supportTickets.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_in_nested_directory() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("supportTickets.json"));

        store.save(&[saved("abc-123", 2), saved("def-456", 0)]).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].slug.as_str(), "abc-123");
        assert_eq!(loaded[0].unread_count, 2);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_reads_camel_case_written_by_other_clients() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supportTickets.json");
        fs::write(
            &path,
            r#"[{"slug":"abc-123","title":"Help","status":"resolved","unreadCount":3}]"#,
        )
        .unwrap();

        let loaded = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(loaded[0].status, TicketStatus::Resolved);
        assert_eq!(loaded[0].unread_count, 3);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supportTickets.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(StorageError::Serialization(_))
        ));
    }
}
