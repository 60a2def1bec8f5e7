//! Transport-agnostic management of declared APIs.
//!
//! Every mutation writes the desired state to the entity store with a
//! transitional status and announces it to the controller, which performs
//! the gateway side of the change.
use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    core::{
        api::{ApiEntity, ApiSpec, SOURCE_CONFIG, SOURCE_TAG, Status},
        controller::Watcher,
    },
    ports::entity_store::{EntityFilter, EntityStore, StoreError},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("api '{0}' not found")]
    NotFound(String),

    /// The name is taken, or the entity changed underneath the request.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid api: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ServiceError::NotFound(key),
            StoreError::UniqueViolation(_) | StoreError::RevisionMismatch { .. } => {
                ServiceError::Conflict(err.to_string())
            }
            StoreError::InvalidName(_) => ServiceError::Invalid(err.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Outcome of [`ApiService::apply`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct ApiService {
    store: Arc<dyn EntityStore>,
    watcher: Option<Watcher>,
}

impl ApiService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            watcher: None,
        }
    }

    pub fn with_watcher(mut self, watcher: Watcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    fn notify(&self, entity: &ApiEntity) {
        if let Some(watcher) = &self.watcher {
            watcher.on_action(entity.clone());
        }
    }

    pub async fn add_api(&self, organization_id: &str, spec: ApiSpec) -> ServiceResult<ApiEntity> {
        let mut entity = spec.into_entity(organization_id).with_status(Status::Creating);
        self.store.add(&mut entity).await?;
        info!(entity = %entity.key(), "api created");
        self.notify(&entity);
        Ok(entity)
    }

    pub async fn get_api(&self, organization_id: &str, name: &str) -> ServiceResult<ApiEntity> {
        Ok(self
            .store
            .get(organization_id, name, &EntityFilter::new().exists())
            .await?)
    }

    pub async fn list_apis(&self, organization_id: &str) -> ServiceResult<Vec<ApiEntity>> {
        Ok(self
            .store
            .list(organization_id, &EntityFilter::new().exists())
            .await?)
    }

    /// Replace the declaration of `name`. The driver-assigned identity and the
    /// entity id survive; tags are merged over the existing ones.
    pub async fn update_api(
        &self,
        organization_id: &str,
        name: &str,
        mut spec: ApiSpec,
    ) -> ServiceResult<ApiEntity> {
        let current = self.get_api(organization_id, name).await?;
        spec.name = name.to_string();

        let mut entity = spec.into_entity(organization_id).with_status(Status::Updating);
        entity.id.clone_from(&current.id);
        entity.created_time = current.created_time;
        entity.api.id.clone_from(&current.api.id);
        entity.api.created_at = current.api.created_at;
        let mut tags = current.tags.clone();
        tags.append(&mut entity.tags);
        entity.tags = tags;

        self.store.update(current.revision, &mut entity).await?;
        info!(entity = %entity.key(), "api updated");
        self.notify(&entity);
        Ok(entity)
    }

    /// Mark `name` for deletion; the controller removes it once the gateway has.
    pub async fn delete_api(&self, organization_id: &str, name: &str) -> ServiceResult<ApiEntity> {
        let mut entity = self.get_api(organization_id, name).await?;
        entity.status = Status::Deleting;
        let revision = entity.revision;
        self.store.update(revision, &mut entity).await?;
        info!(entity = %entity.key(), "api marked for deletion");
        self.notify(&entity);
        Ok(entity)
    }

    /// Converge the organization's config-declared APIs to `specs`.
    ///
    /// Missing APIs are added, changed or errored ones are updated, and
    /// entities tagged as config-sourced that are no longer declared are
    /// deleted. APIs created through other means are never touched.
    pub async fn apply(&self, organization_id: &str, specs: Vec<ApiSpec>) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let existing: BTreeMap<String, ApiEntity> = match self.list_apis(organization_id).await {
            Ok(entities) => entities.into_iter().map(|e| (e.name.clone(), e)).collect(),
            Err(e) => {
                warn!(organization = organization_id, error = %e, "failed to list apis, skipping apply");
                summary.failed = specs.len();
                return summary;
            }
        };

        let mut declared = Vec::with_capacity(specs.len());
        for mut spec in specs {
            spec.tags
                .insert(SOURCE_TAG.to_string(), SOURCE_CONFIG.to_string());
            declared.push(spec.name.clone());

            let outcome = match existing.get(&spec.name) {
                None => self
                    .add_api(organization_id, spec)
                    .await
                    .map(|_| summary.added += 1),
                Some(current) if current.status == Status::Deleting => {
                    warn!(entity = %current.key(), "api is being deleted, not re-applying yet");
                    Ok(())
                }
                Some(current) if needs_update(current, &spec, organization_id) => {
                    let name = spec.name.clone();
                    self.update_api(organization_id, &name, spec)
                        .await
                        .map(|_| summary.updated += 1)
                }
                Some(_) => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(organization = organization_id, error = %e, "failed to apply declared api");
                summary.failed += 1;
            }
        }

        for entity in existing.values() {
            if !entity.is_from_config()
                || entity.status == Status::Deleting
                || declared.contains(&entity.name)
            {
                continue;
            }
            match self.delete_api(organization_id, &entity.name).await {
                Ok(_) => summary.deleted += 1,
                Err(e) => {
                    warn!(entity = %entity.key(), error = %e, "failed to delete undeclared api");
                    summary.failed += 1;
                }
            }
        }

        info!(
            organization = organization_id,
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            failed = summary.failed,
            "declared apis applied"
        );
        summary
    }
}

/// Whether `current` differs from what `spec` declares, ignoring driver-assigned fields.
fn needs_update(current: &ApiEntity, spec: &ApiSpec, organization_id: &str) -> bool {
    if current.status == Status::Error {
        return true;
    }
    let desired = spec.clone().into_entity(organization_id);
    let mut api = desired.api;
    api.id.clone_from(&current.api.id);
    api.created_at = current.api.created_at;
    api != current.api
        || desired
            .tags
            .iter()
            .any(|(k, v)| current.tags.get(k) != Some(v))
}
