use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, warn};

use crate::core::api::{ApiEntity, Status};

/// Custom error type for entity store operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// No entity with that organization/name
    #[error("entity '{0}' not found")]
    NotFound(String),

    /// An entity with that organization/name already exists
    #[error("entity '{0}' already exists")]
    UniqueViolation(String),

    /// Optimistic concurrency check failed
    #[error("revision mismatch for '{key}': expected {expected}, found {actual}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Entity names are restricted to word characters and dashes
    #[error("invalid entity name '{0}'")]
    InvalidName(String),

    /// Stored data could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type alias for entity store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Exists,
    StatusIn(Vec<Status>),
    ModifiedBefore(DateTime<Utc>),
}

/// A conjunction of predicates over stored entities. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    conditions: Vec<Condition>,
}

impl EntityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude soft-deleted entities.
    pub fn exists(mut self) -> Self {
        self.conditions.push(Condition::Exists);
        self
    }

    pub fn status_in(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.conditions
            .push(Condition::StatusIn(statuses.into_iter().collect()));
        self
    }

    /// Keep entities last modified strictly before `instant`.
    /// Entities that were never stamped count as infinitely old.
    pub fn modified_before(mut self, instant: DateTime<Utc>) -> Self {
        self.conditions.push(Condition::ModifiedBefore(instant));
        self
    }

    pub fn matches(&self, entity: &ApiEntity) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Exists => !entity.delete,
            Condition::StatusIn(statuses) => statuses.contains(&entity.status),
            Condition::ModifiedBefore(instant) => {
                entity.modified_time.is_none_or(|modified| modified < *instant)
            }
        })
    }
}

/// EntityStore is the port for the persistent, revisioned record of API entities.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Insert a new entity. Assigns id, timestamps and revision on `entity`.
    async fn add(&self, entity: &mut ApiEntity) -> StoreResult<String>;

    async fn get(
        &self,
        organization_id: &str,
        name: &str,
        filter: &EntityFilter,
    ) -> StoreResult<ApiEntity>;

    /// Replace an entity if its stored revision equals `expected_revision`.
    /// On success `entity` carries the new revision and modified time.
    async fn update(&self, expected_revision: u64, entity: &mut ApiEntity) -> StoreResult<u64>;

    /// Hard delete.
    async fn delete(&self, organization_id: &str, name: &str) -> StoreResult<()>;

    async fn list(&self, organization_id: &str, filter: &EntityFilter)
    -> StoreResult<Vec<ApiEntity>>;

    /// List across all organizations.
    async fn list_global(&self, filter: &EntityFilter) -> StoreResult<Vec<ApiEntity>>;

    /// Persist the outcome of a reconciliation step.
    ///
    /// With an error the entity moves to [`Status::Error`] and the message is
    /// recorded as its reason. Persistence failures are logged, not returned.
    async fn update_with_error(&self, entity: &mut ApiEntity, error: Option<String>) {
        if let Some(reason) = error {
            warn!(entity = %entity.key(), %reason, "reconciliation failed, marking entity as errored");
            entity.status = Status::Error;
            entity.reason = vec![reason];
        }
        let revision = entity.revision;
        if let Err(e) = self.update(revision, entity).await {
            error!(entity = %entity.key(), error = %e, "failed to persist entity status");
        }
    }
}
