//! Storage drivers for saga instances.
//!
//! A [`SagaStore`] is the transactional load/insert/update/delete surface
//! the repository runs its turns against, keyed by correlation id. The
//! repository owns the turn protocol; the store only has to get two things
//! right:
//!
//! 1. **Insert is a uniqueness constraint.** Inserting an existing key must
//!    fail with [`StoreError::DuplicateKey`], never overwrite. This is what
//!    makes the speculative pre-insert safe under concurrent creation.
//! 2. **Duplicate and backend failures are distinct.** A duplicate key is
//!    expected under concurrency and recovered locally; a backend failure
//!    is a system-level fault that aborts the turn. Treating them the same
//!    breaks the create protocol.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::correlation::SagaQuery;
use crate::saga::Saga;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from saga instance storage.
#[derive(Debug)]
pub enum StoreError {
    /// An instance with this correlation id already exists.
    ///
    /// Expected under concurrent creation; the repository falls back to
    /// loading the existing record.
    DuplicateKey,

    /// No instance with this correlation id exists.
    NotFound,

    /// Storage backend failed (connection, serialization, poisoning).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateKey => {
                write!(f, "an instance with this correlation id already exists")
            }
            StoreError::NotFound => write!(f, "no instance with this correlation id exists"),
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::DuplicateKey | StoreError::NotFound => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Saga Store
// =============================================================================

/// Transactional storage for saga instances, keyed by correlation id.
#[async_trait]
pub trait SagaStore<T: Saga>: Send + Sync + 'static {
    /// Load the instance with the given correlation id.
    async fn load(&self, correlation_id: &Uuid) -> Result<Option<T>, StoreError>;

    /// Insert a new instance.
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the key already exists.
    async fn insert(&self, instance: &T) -> Result<(), StoreError>;

    /// Overwrite the stored instance.
    ///
    /// Fails with [`StoreError::NotFound`] if the instance was deleted
    /// out from under the caller.
    async fn update(&self, instance: &T) -> Result<(), StoreError>;

    /// Delete the instance with the given correlation id.
    async fn delete(&self, correlation_id: &Uuid) -> Result<(), StoreError>;

    /// Correlation ids of all instances matching the query.
    async fn find(&self, query: &SagaQuery<T>) -> Result<SmallVec<[Uuid; 1]>, StoreError>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory store backed by a concurrent map.
///
/// The reference backend for tests and single-process deployments.
pub struct InMemorySagaStore<T> {
    data: DashMap<Uuid, T>,
}

impl<T: Saga + Clone> InMemorySagaStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no instances are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of one instance, for assertions.
    pub fn get(&self, correlation_id: &Uuid) -> Option<T> {
        self.data.get(correlation_id).map(|r| r.value().clone())
    }
}

impl<T: Saga + Clone> Default for InMemorySagaStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Saga + Clone> SagaStore<T> for InMemorySagaStore<T> {
    async fn load(&self, correlation_id: &Uuid) -> Result<Option<T>, StoreError> {
        Ok(self.data.get(correlation_id).map(|r| r.value().clone()))
    }

    async fn insert(&self, instance: &T) -> Result<(), StoreError> {
        match self.data.entry(instance.correlation_id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::DuplicateKey),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, instance: &T) -> Result<(), StoreError> {
        match self.data.get_mut(&instance.correlation_id()) {
            Some(mut entry) => {
                *entry = instance.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, correlation_id: &Uuid) -> Result<(), StoreError> {
        match self.data.remove(correlation_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn find(&self, query: &SagaQuery<T>) -> Result<SmallVec<[Uuid; 1]>, StoreError> {
        Ok(self
            .data
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| *entry.key())
            .collect())
    }
}

// =============================================================================
// Document Store
// =============================================================================

/// Document-collection store holding instances as JSON documents.
///
/// The shape a document database (or a JSONB column) presents: instances
/// are serialized on write and rehydrated on read, so the stored form is
/// independent of the in-memory type layout.
pub struct DocumentSagaStore<T> {
    documents: Mutex<HashMap<Uuid, serde_json::Value>>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T> DocumentSagaStore<T>
where
    T: Saga + Serialize + DeserializeOwned,
{
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// True if no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, serde_json::Value>>, StoreError> {
        self.documents
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
    }

    fn to_document(instance: &T) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(instance)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("serialize instance: {}", e)))
    }

    fn from_document(document: &serde_json::Value) -> Result<T, StoreError> {
        serde_json::from_value(document.clone())
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("deserialize instance: {}", e)))
    }
}

impl<T> Default for DocumentSagaStore<T>
where
    T: Saga + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> SagaStore<T> for DocumentSagaStore<T>
where
    T: Saga + Serialize + DeserializeOwned,
{
    async fn load(&self, correlation_id: &Uuid) -> Result<Option<T>, StoreError> {
        let documents = self.lock()?;
        match documents.get(correlation_id) {
            Some(document) => Ok(Some(Self::from_document(document)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, instance: &T) -> Result<(), StoreError> {
        let document = Self::to_document(instance)?;
        let mut documents = self.lock()?;
        match documents.entry(instance.correlation_id()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(StoreError::DuplicateKey),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(document);
                Ok(())
            }
        }
    }

    async fn update(&self, instance: &T) -> Result<(), StoreError> {
        let document = Self::to_document(instance)?;
        let mut documents = self.lock()?;
        match documents.get_mut(&instance.correlation_id()) {
            Some(slot) => {
                *slot = document;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, correlation_id: &Uuid) -> Result<(), StoreError> {
        let mut documents = self.lock()?;
        match documents.remove(correlation_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn find(&self, query: &SagaQuery<T>) -> Result<SmallVec<[Uuid; 1]>, StoreError> {
        let documents = self.lock()?;
        let mut matched = SmallVec::new();
        for (id, document) in documents.iter() {
            if query.matches(&Self::from_document(document)?) {
                matched.push(*id);
            }
        }
        Ok(matched)
    }
}
