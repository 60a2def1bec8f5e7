//! [`Gateway`] driver for the Kong admin API.
use std::collections::BTreeMap;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::models::KongConfig,
    core::api::{Api, CORS_PREFLIGHT_METHOD},
    ports::gateway::{Gateway, GatewayError, GatewayResult},
};

const CORS_PLUGIN: &str = "cors";
const TRANSFORMER_PLUGIN: &str = "dispatch-transformer";

/// API object as Kong stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct KongApi {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    created_at: i64,
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    upstream_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    methods: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    https_only: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KongPlugin {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PluginList {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    data: Vec<KongPlugin>,
}

/// Kong admin API client.
pub struct KongClient {
    http: reqwest::Client,
    host: String,
    upstream: String,
}

impl KongClient {
    pub fn new(config: &KongConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .wrap_err("Failed to build Kong admin client")?;
        Ok(Self {
            http,
            host: config.host.trim_end_matches('/').to_string(),
            upstream: config.upstream.clone(),
        })
    }

    /// Install the global request transformer plugin that adapts Kong traffic
    /// to function runs.
    pub async fn initialize(&self) -> GatewayResult<()> {
        let config: BTreeMap<&str, String> = [
            ("config.substitute.input", "input"),
            ("config.substitute.output", "output"),
            ("config.enable.input", "true"),
            ("config.enable.output", "true"),
            ("config.http_method", "POST"),
            ("config.add.header", "cookie:cookie"),
            ("config.header_prefix_for_insertion", "x-dispatch-"),
            ("config.insert_to_body.header", "blocking:true"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        self.upsert_plugin(None, TRANSFORMER_PLUGIN, &config).await
    }

    fn to_kong(&self, api: &Api) -> KongApi {
        let mut methods = api.methods.clone();
        if api.cors && !methods.iter().any(|m| m == CORS_PREFLIGHT_METHOD) {
            methods.push(CORS_PREFLIGHT_METHOD.to_string());
        }
        KongApi {
            id: api.id.clone(),
            created_at: api.created_at,
            name: api.name.clone(),
            upstream_url: format!(
                "http://{}/v1/function/{}/runs",
                self.upstream, api.function
            ),
            uris: api.uris.clone(),
            hosts: api.hosts.clone(),
            methods,
            https_only: api.required_protocol() == Some("https"),
        }
    }

    fn from_kong(kong: KongApi) -> Api {
        Api {
            id: kong.id,
            created_at: kong.created_at,
            name: kong.name,
            hosts: kong.hosts,
            uris: kong.uris,
            methods: kong.methods,
            ..Default::default()
        }
    }

    fn plugin_url(&self, api: Option<&str>, plugin_id: Option<&str>) -> String {
        let mut url = self.host.clone();
        if let Some(api) = api {
            url.push_str(&format!("/apis/{api}"));
        }
        url.push_str("/plugins");
        if let Some(id) = plugin_id {
            url.push_str(&format!("/{id}"));
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> GatewayResult<Response> {
        request
            .send()
            .await
            .map_err(|e| GatewayError::Driver(e.to_string()))
    }

    async fn error_from(operation: &str, response: Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        format!("kong.{operation}: {status}, {body}")
    }

    async fn api_from(response: Response) -> GatewayResult<Api> {
        let kong: KongApi = response
            .json()
            .await
            .map_err(|e| GatewayError::Marshal(e.to_string()))?;
        Ok(Self::from_kong(kong))
    }

    /// Plugins named `name` on `api` (global when `None`). An empty result is not-found.
    async fn plugins(&self, api: Option<&str>, name: &str) -> GatewayResult<Vec<KongPlugin>> {
        let url = self.plugin_url(api, None);
        let response = self
            .send(self.http.get(&url).query(&[("name", name)]))
            .await?;

        let status = response.status();
        if status.is_success() {
            let list: PluginList = response
                .json()
                .await
                .map_err(|e| GatewayError::Marshal(e.to_string()))?;
            if list.total == 0 || list.data.is_empty() {
                return Err(GatewayError::NotFound(format!("plugin {name}")));
            }
            return Ok(list.data);
        }

        let message = Self::error_from("getPlugins", response).await;
        if status == StatusCode::NOT_FOUND {
            Err(GatewayError::NotFound(message))
        } else {
            Err(GatewayError::Driver(message))
        }
    }

    /// Create the plugin, or patch every existing instance of it.
    async fn upsert_plugin(
        &self,
        api: Option<&str>,
        name: &str,
        config: &BTreeMap<&str, String>,
    ) -> GatewayResult<()> {
        let existing: Vec<Option<String>> = match self.plugins(api, name).await {
            Ok(plugins) => plugins.into_iter().map(|p| Some(p.id)).collect(),
            Err(e) if e.is_not_found() => {
                debug!(plugin = name, "plugin not installed yet, creating");
                vec![None]
            }
            Err(e) => return Err(e),
        };

        let mut form: Vec<(&str, &str)> = config.iter().map(|(k, v)| (*k, v.as_str())).collect();
        form.push(("name", name));

        for id in existing {
            let (method, url) = match id.as_deref() {
                Some(id) if !id.is_empty() => (Method::PATCH, self.plugin_url(api, Some(id))),
                _ => (Method::POST, self.plugin_url(api, None)),
            };
            let response = self.send(self.http.request(method, &url).form(&form)).await?;
            if !matches!(response.status(), StatusCode::OK | StatusCode::CREATED) {
                return Err(GatewayError::Driver(
                    Self::error_from("updatePlugin", response).await,
                ));
            }
        }
        Ok(())
    }

    /// Remove every instance of the plugin. Missing plugins are fine.
    async fn delete_plugin(&self, api: &str, name: &str) -> GatewayResult<()> {
        let plugins = match self.plugins(Some(api), name).await {
            Ok(plugins) => plugins,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for plugin in plugins {
            let url = self.plugin_url(Some(api), Some(&plugin.id));
            let response = self.send(self.http.delete(&url)).await?;
            match response.status() {
                StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {}
                _ => {
                    return Err(GatewayError::Driver(
                        Self::error_from("deletePlugin", response).await,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn sync_cors_plugin(&self, api: &Api, kong: &KongApi) -> GatewayResult<()> {
        if api.cors {
            let config = BTreeMap::from([
                ("config.origins", "*".to_string()),
                ("config.methods", kong.methods.join(",")),
            ]);
            self.upsert_plugin(Some(&api.name), CORS_PLUGIN, &config)
                .await
        } else {
            self.delete_plugin(&api.name, CORS_PLUGIN).await
        }
    }
}

#[async_trait]
impl Gateway for KongClient {
    async fn add_api(&self, api: &Api) -> GatewayResult<Api> {
        let kong = self.to_kong(api);
        let url = format!("{}/apis/", self.host);
        let response = self.send(self.http.post(&url).json(&kong)).await?;
        debug!(api = %api.name, status = %response.status(), "kong add api");

        if response.status() != StatusCode::CREATED {
            return Err(GatewayError::Driver(
                Self::error_from("addAPI", response).await,
            ));
        }
        let result = Self::api_from(response).await?;

        if api.cors {
            self.sync_cors_plugin(api, &kong).await?;
        }
        Ok(result)
    }

    async fn get_api(&self, name: &str) -> GatewayResult<Api> {
        let url = format!("{}/apis/{}", self.host, name);
        let response = self.send(self.http.get(&url)).await?;

        match response.status() {
            StatusCode::OK => Self::api_from(response).await,
            _ => Err(GatewayError::NotFound(
                Self::error_from("getAPI", response).await,
            )),
        }
    }

    async fn update_api(&self, name: &str, api: &Api) -> GatewayResult<Api> {
        // Kong needs id and created_at on PUT.
        let kong = self.to_kong(api);
        let url = format!("{}/apis", self.host);
        let response = self.send(self.http.put(&url).json(&kong)).await?;
        debug!(api = %name, status = %response.status(), "kong update api");

        let result = match response.status() {
            StatusCode::OK | StatusCode::CREATED => Self::api_from(response).await?,
            StatusCode::NOT_FOUND => {
                return Err(GatewayError::NotFound(
                    Self::error_from("updateAPI", response).await,
                ));
            }
            _ => {
                return Err(GatewayError::Driver(
                    Self::error_from("updateAPI", response).await,
                ));
            }
        };

        self.sync_cors_plugin(api, &kong).await?;
        Ok(result)
    }

    async fn delete_api(&self, api: &Api) -> GatewayResult<()> {
        if api.cors {
            self.delete_plugin(&api.name, CORS_PLUGIN).await?;
        }

        let url = format!("{}/apis/{}", self.host, api.name);
        let response = self.send(self.http.delete(&url)).await?;
        debug!(api = %api.name, status = %response.status(), "kong delete api");

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(api.name.clone())),
            _ => Err(GatewayError::Driver(
                Self::error_from("deleteAPI", response).await,
            )),
        }
    }
}
