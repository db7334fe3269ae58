//! Address book loaded from a contacts JSON export.
//!
//! Format: `[{"id": "...", "name": "...", "phoneNumbers": [...], "emailAddresses": [...]}]`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::AddressBook;
use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactEntry {
    id: String,
    name: String,
    #[serde(default)]
    phone_numbers: Vec<String>,
    #[serde(default)]
    email_addresses: Vec<String>,
}

#[derive(Default)]
struct Index {
    by_id: HashMap<String, String>,
    by_phone: HashMap<String, String>,
    by_email: HashMap<String, String>,
}

impl Index {
    fn build(entries: Vec<ContactEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            for phone in &entry.phone_numbers {
                let digits = phone_digits(phone);
                if !digits.is_empty() {
                    index.by_phone.insert(digits, entry.name.clone());
                }
            }
            for email in &entry.email_addresses {
                index
                    .by_email
                    .insert(email.trim().to_lowercase(), entry.name.clone());
            }
            index.by_id.insert(entry.id, entry.name);
        }
        index
    }
}

/// Phone numbers compare by their digits only
fn phone_digits(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Contacts file on disk; a missing file is an empty address book
pub struct JsonAddressBook {
    path: PathBuf,
    index: RwLock<Index>,
}

impl JsonAddressBook {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let book = Self {
            path: path.as_ref().to_path_buf(),
            index: RwLock::new(Index::default()),
        };
        book.reload().await?;
        Ok(book)
    }

    /// Re-read the file (callers should also clear the name cache)
    pub async fn reload(&self) -> Result<usize> {
        let entries: Vec<ContactEntry> = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No contacts file");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        let count = entries.len();
        *self.index.write().await = Index::build(entries);
        info!(count, "Contacts loaded");
        Ok(count)
    }
}

#[async_trait]
impl AddressBook for JsonAddressBook {
    async fn lookup_name(&self, contact_id: &str) -> Option<String> {
        self.index.read().await.by_id.get(contact_id).cloned()
    }

    async fn find_by_phone(&self, phone: &str) -> Option<String> {
        let digits = phone_digits(phone);
        if digits.is_empty() {
            return None;
        }
        self.index.read().await.by_phone.get(&digits).cloned()
    }

    async fn find_by_email(&self, email: &str) -> Option<String> {
        self.index
            .read()
            .await
            .by_email
            .get(&email.trim().to_lowercase())
            .cloned()
    }
}
