//! API records and their stored entity form.
//!
//! An [`Api`] is the unit of routing configuration handed to gateway drivers.
//! An [`ApiEntity`] wraps it with the bookkeeping the entity store keeps
//! (revision, lifecycle status, tags). [`ApiSpec`] is the user-facing
//! declaration that is mapped onto an entity.
use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// HTTP method automatically added to CORS enabled APIs (preflight requests).
pub const CORS_PREFLIGHT_METHOD: &str = "OPTIONS";

/// Tag key marking entities created from the `[[apis]]` section of the config file.
pub const SOURCE_TAG: &str = "source";
/// Tag value for [`SOURCE_TAG`] on config-declared entities.
pub const SOURCE_CONFIG: &str = "config";

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\d\-]+$").expect("valid regex"));

/// Entity names are word characters, digits and dashes only.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// A declared route binding: host/path/method predicates mapped onto a function.
///
/// Empty `hosts`, `uris` or `methods` act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Api {
    /// Assigned by the gateway driver on creation, preserved afterwards.
    pub id: String,
    /// Unix timestamp assigned by the gateway driver on creation.
    pub created_at: i64,
    pub name: String,
    pub organization_id: String,
    pub function: String,
    pub authentication: String,
    pub enabled: bool,
    pub tls: String,
    pub hosts: Vec<String>,
    pub uris: Vec<String>,
    pub methods: Vec<String>,
    pub protocols: Vec<String>,
    pub cors: bool,
}

impl Api {
    /// Canonicalize the method set: upper-case verbs and, for CORS enabled APIs
    /// with an explicit method list, make sure `OPTIONS` is present.
    ///
    /// An empty method list is left empty since it already matches every verb.
    pub fn normalize(&mut self) {
        for method in &mut self.methods {
            *method = method.trim().to_ascii_uppercase();
        }
        if self.cors
            && !self.methods.is_empty()
            && !self.methods.iter().any(|m| m == CORS_PREFLIGHT_METHOD)
        {
            self.methods.push(CORS_PREFLIGHT_METHOD.to_string());
        }
    }

    /// Consuming variant of [`Api::normalize`].
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Whether the declared method set admits `method` (empty set = any).
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    /// The single protocol this API is restricted to, if exactly one is declared.
    pub fn required_protocol(&self) -> Option<&str> {
        match self.protocols.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

/// Lifecycle status of a stored entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Initialized,
    Creating,
    Ready,
    Updating,
    Deleting,
    Deleted,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Initialized => "INITIALIZED",
            Status::Creating => "CREATING",
            Status::Ready => "READY",
            Status::Updating => "UPDATING",
            Status::Deleting => "DELETING",
            Status::Deleted => "DELETED",
            Status::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// An API record as persisted in the entity store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEntity {
    pub id: String,
    /// Unique per organization; stable for the life of the entity.
    pub name: String,
    pub organization_id: String,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub revision: u64,
    pub status: Status,
    #[serde(default)]
    pub reason: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Soft-delete marker. Never set on the active path but honored when present.
    #[serde(default)]
    pub delete: bool,
    pub api: Api,
}

impl ApiEntity {
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>, api: Api) -> Self {
        Self {
            name: name.into(),
            organization_id: organization_id.into(),
            api,
            ..Default::default()
        }
    }

    /// Builder-style status setter.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// `organization/name`, used for logging and for sharding controller work.
    pub fn key(&self) -> String {
        format!("{}/{}", self.organization_id, self.name)
    }

    pub fn is_from_config(&self) -> bool {
        self.tags.get(SOURCE_TAG).map(String::as_str) == Some(SOURCE_CONFIG)
    }
}

/// User-facing declaration of an API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSpec {
    pub name: String,
    pub function: String,
    pub authentication: String,
    pub enabled: bool,
    pub tls: String,
    pub hosts: Vec<String>,
    pub uris: Vec<String>,
    pub methods: Vec<String>,
    pub protocols: Vec<String>,
    pub cors: bool,
    pub tags: BTreeMap<String, String>,
}

impl ApiSpec {
    /// Map the declaration onto a store entity for `organization_id`.
    ///
    /// All organizations share one gateway, so the gateway-level name is
    /// prefixed with the organization, and when no host is declared every URI
    /// is namespaced under `/{organization}/`.
    pub fn into_entity(self, organization_id: &str) -> ApiEntity {
        let uris = if self.hosts.is_empty() {
            self.uris
                .iter()
                .map(|uri| format!("/{}/{}", organization_id, uri.trim_start_matches('/')))
                .collect()
        } else {
            self.uris
        };

        let api = Api {
            name: format!("{}-{}", organization_id, self.name),
            organization_id: organization_id.to_string(),
            function: self.function,
            authentication: self.authentication,
            enabled: self.enabled,
            tls: self.tls,
            hosts: self.hosts,
            uris,
            methods: self.methods,
            protocols: self.protocols,
            cors: self.cors,
            ..Default::default()
        }
        .normalized();

        let mut entity = ApiEntity::new(organization_id, self.name, api);
        entity.tags = self.tags;
        entity
    }
}
