use std::{
    collections::BTreeMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    core::api::{ApiEntity, is_valid_name},
    ports::entity_store::{EntityFilter, EntityStore, StoreError, StoreResult},
};

type Key = (String, String);

/// In-process [`EntityStore`] with optimistic revisioning.
///
/// Revisions come from one store-wide counter, so every write gets a revision
/// greater than any before it.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<BTreeMap<Key, ApiEntity>>,
    last_revision: AtomicU64,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.last_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn key(organization_id: &str, name: &str) -> Key {
        (organization_id.to_string(), name.to_string())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Key, ApiEntity>> {
        self.entities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Key, ApiEntity>> {
        self.entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn add(&self, entity: &mut ApiEntity) -> StoreResult<String> {
        if !is_valid_name(&entity.name) {
            return Err(StoreError::InvalidName(entity.name.clone()));
        }

        let key = Self::key(&entity.organization_id, &entity.name);
        let mut entities = self.write();
        if entities.contains_key(&key) {
            return Err(StoreError::UniqueViolation(entity.key()));
        }

        let now = Utc::now();
        entity.id = uuid::Uuid::new_v4().to_string();
        entity.created_time = Some(now);
        entity.modified_time = Some(now);
        entity.revision = self.next_revision();
        entities.insert(key, entity.clone());

        Ok(entity.id.clone())
    }

    async fn get(
        &self,
        organization_id: &str,
        name: &str,
        filter: &EntityFilter,
    ) -> StoreResult<ApiEntity> {
        self.read()
            .get(&Self::key(organization_id, name))
            .filter(|entity| filter.matches(entity))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{organization_id}/{name}")))
    }

    async fn update(&self, expected_revision: u64, entity: &mut ApiEntity) -> StoreResult<u64> {
        let key = Self::key(&entity.organization_id, &entity.name);
        let mut entities = self.write();
        let Some(stored) = entities.get_mut(&key) else {
            return Err(StoreError::NotFound(entity.key()));
        };
        if stored.revision != expected_revision {
            return Err(StoreError::RevisionMismatch {
                key: entity.key(),
                expected: expected_revision,
                actual: stored.revision,
            });
        }

        entity.id.clone_from(&stored.id);
        entity.created_time = stored.created_time;
        entity.modified_time = Some(Utc::now());
        entity.revision = self.next_revision();
        *stored = entity.clone();

        Ok(entity.revision)
    }

    async fn delete(&self, organization_id: &str, name: &str) -> StoreResult<()> {
        self.write()
            .remove(&Self::key(organization_id, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{organization_id}/{name}")))
    }

    async fn list(
        &self,
        organization_id: &str,
        filter: &EntityFilter,
    ) -> StoreResult<Vec<ApiEntity>> {
        Ok(self
            .read()
            .iter()
            .filter(|((org, _), entity)| org == organization_id && filter.matches(entity))
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn list_global(&self, filter: &EntityFilter) -> StoreResult<Vec<ApiEntity>> {
        Ok(self
            .read()
            .values()
            .filter(|entity| filter.matches(entity))
            .cloned()
            .collect())
    }
}
