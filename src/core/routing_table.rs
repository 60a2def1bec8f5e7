//! In-memory routing index for the local gateway.
//!
//! The table owns the raw record set keyed by API name plus three derived
//! indices (path, host, method). Every mutation recomputes all three indices
//! from the record set and swaps them in together, so a reader holding the
//! table never sees a half-built index. Locking is the owner's concern; see
//! `adapters::local_gateway`.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tracing::debug;

use crate::core::api::{Api, CORS_PREFLIGHT_METHOD};

type Buckets = HashMap<String, Vec<Arc<Api>>>;

#[derive(Debug, Default)]
pub struct RoutingTable {
    // Ordered by name so bucket order (and thus first-match order) is deterministic.
    apis: BTreeMap<String, Arc<Api>>,
    path_lookup: Buckets,
    host_lookup: Buckets,
    method_lookup: Buckets,
}

/// Sizes of the derived indices, used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSizes {
    pub apis: usize,
    pub paths: usize,
    pub hosts: usize,
    pub methods: usize,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from an authoritative record set.
    pub fn from_apis(apis: impl IntoIterator<Item = Api>) -> Self {
        let mut table = Self::new();
        table.replace(apis);
        table
    }

    /// Insert or replace a record by name.
    pub fn upsert(&mut self, api: Api) {
        self.apis.insert(api.name.clone(), Arc::new(api));
        self.rebuild();
    }

    /// Remove a record by name, returning it if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Api> {
        let removed = self.apis.remove(name);
        if removed.is_some() {
            self.rebuild();
        }
        removed.map(|api| (*api).clone())
    }

    /// Discard the current record set in favour of `apis`.
    pub fn replace(&mut self, apis: impl IntoIterator<Item = Api>) {
        self.apis = apis
            .into_iter()
            .map(|api| (api.name.clone(), Arc::new(api)))
            .collect();
        self.rebuild();
    }

    /// Recompute the three indices from the record set.
    ///
    /// Disabled records are kept in the record set but indexed nowhere.
    pub fn rebuild(&mut self) {
        let mut path_lookup = Buckets::new();
        let mut host_lookup = Buckets::new();
        let mut method_lookup = Buckets::new();

        for api in self.apis.values().filter(|api| api.enabled) {
            for host in &api.hosts {
                host_lookup.entry(host.clone()).or_default().push(api.clone());
            }
            for uri in &api.uris {
                path_lookup.entry(uri.clone()).or_default().push(api.clone());
            }
            for method in &api.methods {
                method_lookup
                    .entry(method.clone())
                    .or_default()
                    .push(api.clone());
            }
        }

        self.path_lookup = path_lookup;
        self.host_lookup = host_lookup;
        self.method_lookup = method_lookup;

        let sizes = self.index_sizes();
        debug!(
            apis = sizes.apis,
            paths = sizes.paths,
            hosts = sizes.hosts,
            methods = sizes.methods,
            "routing table rebuilt"
        );
    }

    /// Copy of the named record, enabled or not.
    pub fn get(&self, name: &str) -> Option<Api> {
        self.apis.get(name).map(|api| (**api).clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apis.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    /// Copies of every record, ordered by name.
    pub fn apis(&self) -> Vec<Api> {
        self.apis.values().map(|api| (**api).clone()).collect()
    }

    pub fn index_sizes(&self) -> IndexSizes {
        IndexSizes {
            apis: self.apis.len(),
            paths: self.path_lookup.len(),
            hosts: self.host_lookup.len(),
            methods: self.method_lookup.len(),
        }
    }

    /// Resolve a request to a single record.
    ///
    /// Stages run in order (exact path, exact method, exact host) and the first
    /// candidate whose remaining predicates match wins. The result is a copy.
    pub fn lookup(&self, host: &str, path: &str, method: &str) -> Option<Api> {
        debug!(host, path, method, "matching api");

        let by_path = first_match(self.path_lookup.get(path), |api| {
            match_api_against(api, host, method, "")
        });
        let found = by_path
            .or_else(|| {
                first_match(self.method_lookup.get(method), |api| {
                    match_api_against(api, host, "", path)
                })
            })
            .or_else(|| {
                first_match(self.host_lookup.get(host), |api| {
                    match_api_against(api, "", method, path)
                })
            });

        found.map(|api| (**api).clone())
    }
}

fn first_match<'a>(
    bucket: Option<&'a Vec<Arc<Api>>>,
    predicate: impl Fn(&Api) -> bool,
) -> Option<&'a Arc<Api>> {
    bucket?.iter().find(|api| predicate(api))
}

/// Check the host, method and path predicates of `api`. Empty arguments are
/// not checked. `OPTIONS` always satisfies the method predicate.
pub fn match_api_against(api: &Api, host: &str, method: &str, path: &str) -> bool {
    let method_ok = method == CORS_PREFLIGHT_METHOD || match_string(&api.methods, method);
    match_string(&api.hosts, host) && match_string(&api.uris, path) && method_ok
}

/// Set membership with wildcard semantics: an empty set or an empty needle matches.
pub fn match_string(set: &[String], needle: &str) -> bool {
    set.is_empty() || needle.is_empty() || set.iter().any(|s| s == needle)
}

/// Strip a `:port` suffix from a `Host` header value.
pub fn clean_host(host: &str) -> &str {
    host.split(':').next().unwrap_or_default()
}
