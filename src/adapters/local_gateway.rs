//! The embedded gateway driver: a routing table plus the dispatcher.
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use axum::body::Body;
use chrono::Utc;
use hyper::{Request, Response, StatusCode, header};
use tracing::{Instrument, debug, warn};

use crate::{
    core::{
        api::{Api, Status},
        dispatcher::{DispatchOptions, Dispatcher, ResponseWriter, write_error},
        routing_table::{RoutingTable, clean_host},
    },
    metrics,
    ports::{
        entity_store::{EntityFilter, EntityStore},
        function_client::FunctionClient,
        gateway::{Gateway, GatewayError, GatewayResult},
    },
    tracing_setup,
};

/// A pending change applied on top of the store's record set.
enum Overlay<'a> {
    Upsert(&'a Api),
    Remove(&'a str),
}

/// In-process [`Gateway`] that also serves the routed traffic.
///
/// With an entity store attached, every mutation re-lists the store and uses
/// it as the authoritative record set, so a restarted process routes every
/// stored API again. The mutation being applied is overlaid on that list.
///
/// Readers only take the table lock. Writers hold `commit_lock` from the store
/// listing until the rebuilt table is swapped in, so a rebuild never installs
/// a listing older than the one before it.
pub struct LocalGateway {
    table: RwLock<RoutingTable>,
    commit_lock: tokio::sync::Mutex<()>,
    store: Option<Arc<dyn EntityStore>>,
    dispatcher: Dispatcher,
}

impl LocalGateway {
    pub async fn new(
        store: Option<Arc<dyn EntityStore>>,
        client: Arc<dyn FunctionClient>,
        options: DispatchOptions,
    ) -> Self {
        let gateway = Self {
            table: RwLock::new(RoutingTable::new()),
            commit_lock: tokio::sync::Mutex::new(()),
            store,
            dispatcher: Dispatcher::new(client, options),
        };
        if let Some(apis) = gateway.store_records().await {
            gateway.write_table().replace(apis);
        }
        metrics::set_routing_table_apis(gateway.read_table().len());
        gateway
    }

    fn read_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every API in the store not on its way out, or `None` without a store
    /// or when listing fails (the in-memory set is used then).
    async fn store_records(&self) -> Option<Vec<Api>> {
        let store = self.store.as_ref()?;
        let filter = EntityFilter::new().exists().status_in([
            Status::Initialized,
            Status::Creating,
            Status::Updating,
            Status::Ready,
            Status::Error,
        ]);
        match store.list_global(&filter).await {
            Ok(entities) => Some(entities.into_iter().map(|entity| entity.api).collect()),
            Err(e) => {
                warn!(error = %e, "failed to list apis from store, keeping in-memory routes");
                None
            }
        }
    }

    /// Apply `overlays` in order and rebuild the indices, from the store when there is one.
    async fn commit(&self, overlays: &[Overlay<'_>]) {
        let _serialized = self.commit_lock.lock().await;
        let records = self.store_records().await;

        let mut table = self.write_table();
        match records {
            Some(mut apis) => {
                for overlay in overlays {
                    match overlay {
                        Overlay::Upsert(api) => {
                            apis.retain(|existing| existing.name != api.name);
                            apis.push(Api::clone(api));
                        }
                        Overlay::Remove(name) => apis.retain(|existing| existing.name != *name),
                    }
                }
                table.replace(apis);
            }
            None => {
                for overlay in overlays {
                    match overlay {
                        Overlay::Upsert(api) => table.upsert(Api::clone(api)),
                        Overlay::Remove(name) => {
                            table.remove(name);
                        }
                    }
                }
            }
        }
        metrics::set_routing_table_apis(table.len());
    }

    /// Resolve a request to an API record. The table lock is released before returning.
    pub fn match_api(&self, host: &str, path: &str, method: &str) -> Option<Api> {
        self.read_table().lookup(host, path, method)
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        self.dispatcher.options()
    }

    /// Number of records currently routed (enabled or not).
    pub fn api_count(&self) -> usize {
        self.read_table().len()
    }

    /// Serve one inbound request. `secure` reports whether it arrived over TLS.
    pub async fn handle_request(&self, req: Request<Body>, secure: bool) -> Response<Body> {
        let method = req.method().to_string();
        let _timer = metrics::RequestTimer::new(&method);
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing_setup::create_request_span(&method, req.uri().path(), &request_id);

        let response = async {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .or_else(|| req.uri().host())
                .unwrap_or_default();
            let host = clean_host(host).to_string();
            let path = req.uri().path().to_string();

            let Some(api) = self.match_api(&host, &path, &method) else {
                debug!(%host, %path, %method, "no api matched");
                let mut rw = ResponseWriter::new();
                write_error(&mut rw, StatusCode::NOT_FOUND, "no API found with those values");
                return rw.into_response();
            };

            tracing::Span::current().record("api.name", api.name.as_str());
            self.dispatcher.dispatch(api, req, secure).await
        }
        .instrument(span.clone())
        .await;

        span.record("http.status_code", response.status().as_u16());
        metrics::increment_request_total(&method, response.status().as_u16());
        response
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    async fn add_api(&self, api: &Api) -> GatewayResult<Api> {
        let mut api = api.clone().normalized();
        if api.id.is_empty() {
            api.id = uuid::Uuid::new_v4().to_string();
        }
        if api.created_at == 0 {
            api.created_at = Utc::now().timestamp();
        }

        self.commit(&[Overlay::Upsert(&api)]).await;
        debug!(api = %api.name, "api added to local gateway");
        Ok(api)
    }

    async fn get_api(&self, name: &str) -> GatewayResult<Api> {
        self.read_table()
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn update_api(&self, name: &str, api: &Api) -> GatewayResult<Api> {
        let existing = self
            .read_table()
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;

        let mut api = api.clone().normalized();
        if api.id.is_empty() {
            api.id = existing.id;
        }
        if api.created_at == 0 {
            api.created_at = existing.created_at;
        }
        if api.name == name {
            self.commit(&[Overlay::Upsert(&api)]).await;
        } else {
            self.commit(&[Overlay::Remove(name), Overlay::Upsert(&api)]).await;
        }
        debug!(api = %api.name, "api updated in local gateway");
        Ok(api)
    }

    async fn delete_api(&self, api: &Api) -> GatewayResult<()> {
        if !self.read_table().contains(&api.name) {
            return Err(GatewayError::NotFound(api.name.clone()));
        }

        self.commit(&[Overlay::Remove(&api.name)]).await;
        debug!(api = %api.name, "api deleted from local gateway");
        Ok(())
    }
}
