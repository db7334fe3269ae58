//! Contact id → display name resolution with a bounded cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::debug;

use crate::adapters::AddressBook;
use crate::domain::{DebriefRecord, DELETED_CONTACT, UNKNOWN_CONTACT};

/// Resolves display names through the address book.
///
/// Misses are cached as [`DELETED_CONTACT`] so a removed contact costs one
/// lookup. When full, an arbitrary entry is evicted (not LRU).
pub struct ContactNameResolver {
    book: Arc<dyn AddressBook>,
    cache: RwLock<HashMap<String, String>>,
    capacity: usize,
}

impl ContactNameResolver {
    pub fn new(book: Arc<dyn AddressBook>, capacity: usize) -> Self {
        Self {
            book,
            cache: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn resolve_name(&self, contact_id: &str) -> String {
        if contact_id.is_empty() {
            return UNKNOWN_CONTACT.to_string();
        }
        if let Some(name) = self.cache.read().await.get(contact_id) {
            debug!(contact_id, "Contact cache hit");
            return name.clone();
        }

        let name = self
            .book
            .lookup_name(contact_id)
            .await
            .unwrap_or_else(|| DELETED_CONTACT.to_string());
        self.insert(contact_id, &name).await;
        name
    }

    /// Display name for a record: contact id, then phone, then email,
    /// then whatever name the record already carries
    pub async fn resolve_record(&self, record: DebriefRecord) -> DebriefRecord {
        if !record.contact_id.is_empty() {
            let name = self.resolve_name(&record.contact_id).await;
            return record.with_contact_name(name);
        }

        if let Some(phone) = record.phone_number.as_deref().filter(|p| !p.is_empty()) {
            if let Some(name) = self.book.find_by_phone(phone).await {
                return record.with_contact_name(name);
            }
        }
        if let Some(email) = record.email.as_deref().filter(|e| !e.is_empty()) {
            if let Some(name) = self.book.find_by_email(email).await {
                return record.with_contact_name(name);
            }
        }

        if record.contact_name.trim().is_empty() {
            return record.with_contact_name(UNKNOWN_CONTACT);
        }
        record
    }

    /// Resolve a batch concurrently; output order matches input order
    pub async fn resolve_many(&self, records: Vec<DebriefRecord>) -> Vec<DebriefRecord> {
        // Warm the cache once per distinct id so duplicates cost one lookup
        let mut seen = HashSet::new();
        let ids: Vec<&str> = records
            .iter()
            .map(|r| r.contact_id.as_str())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .collect();
        join_all(ids.into_iter().map(|id| self.resolve_name(id))).await;

        join_all(records.into_iter().map(|r| self.resolve_record(r))).await
    }

    /// Forget every cached name (address book changed)
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        debug!("Contact cache cleared");
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn insert(&self, contact_id: &str, name: &str) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.capacity && !cache.contains_key(contact_id) {
            if let Some(victim) = cache.keys().next().cloned() {
                cache.remove(&victim);
            }
        }
        cache.insert(contact_id.to_string(), name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryAddressBook;
    use chrono::Utc;

    fn resolver(book: Arc<MemoryAddressBook>, capacity: usize) -> ContactNameResolver {
        ContactNameResolver::new(book, capacity)
    }

    #[tokio::test]
    async fn test_empty_id_is_unknown() {
        let book = Arc::new(MemoryAddressBook::new());
        let r = resolver(book.clone(), 10);
        assert_eq!(r.resolve_name("").await, "Unknown");
        assert_eq!(book.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_second_lookup_hits_cache() {
        let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice")]));
        let r = resolver(book.clone(), 10);
        assert_eq!(r.resolve_name("c-1").await, "Alice");
        assert_eq!(r.resolve_name("c-1").await, "Alice");
        assert_eq!(book.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_contact_cached_as_deleted() {
        let book = Arc::new(MemoryAddressBook::new());
        let r = resolver(book.clone(), 10);
        assert_eq!(r.resolve_name("gone").await, "Deleted Contact");
        assert_eq!(r.resolve_name("gone").await, "Deleted Contact");
        assert_eq!(book.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_repopulates_lazily() {
        let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice")]));
        let r = resolver(book.clone(), 10);
        r.resolve_name("c-1").await;
        book.insert("c-1", "Alice Cooper");
        r.clear_cache().await;
        assert_eq!(r.cache_len().await, 0);
        assert_eq!(r.resolve_name("c-1").await, "Alice Cooper");
        assert_eq!(book.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let book = Arc::new(MemoryAddressBook::new());
        let r = resolver(book, 3);
        for i in 0..10 {
            r.resolve_name(&format!("c-{}", i)).await;
        }
        assert_eq!(r.cache_len().await, 3);
    }

    #[tokio::test]
    async fn test_resolve_many_preserves_order() {
        let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice"), ("c-2", "Bob")]));
        let r = resolver(book.clone(), 10);
        let records: Vec<DebriefRecord> = ["c-2", "c-1", "c-2", ""]
            .iter()
            .map(|id| DebriefRecord::new_local("u-1", *id, "", Utc::now(), 1.0))
            .collect();
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

        let resolved = r.resolve_many(records).await;
        let names: Vec<&str> = resolved.iter().map(|r| r.contact_name.as_str()).collect();
        assert_eq!(names, ["Bob", "Alice", "Bob", "Unknown"]);
        assert_eq!(resolved.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(book.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_cascade_by_phone_then_email() {
        let book = Arc::new(MemoryAddressBook::new());
        book.insert_phone("+15550100", "Carol");
        book.insert_email("dan@example.com", "Dan");
        let r = resolver(book, 10);

        let mut by_phone = DebriefRecord::new_local("u-1", "", "Unknown", Utc::now(), 1.0);
        by_phone.phone_number = Some("+15550100".to_string());
        assert_eq!(r.resolve_record(by_phone).await.contact_name, "Carol");

        let mut by_email = DebriefRecord::new_local("u-1", "", "Unknown", Utc::now(), 1.0);
        by_email.email = Some("Dan@Example.com".to_string());
        assert_eq!(r.resolve_record(by_email).await.contact_name, "Dan");

        let stored = DebriefRecord::new_local("u-1", "", "Erin", Utc::now(), 1.0);
        assert_eq!(r.resolve_record(stored).await.contact_name, "Erin");
    }
}
