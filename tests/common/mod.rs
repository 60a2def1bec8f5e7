// Shared fakes for integration tests
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use apiman::{
    core::Api,
    ports::{
        FunctionClient, FunctionClientError, FunctionClientResult, Gateway, GatewayError,
        GatewayResult, RunRequest, RunResponse,
    },
};
use async_trait::async_trait;
use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use serde_json::Value;

/// Records every invocation and answers with a queued result, or `{output}` = the input.
#[derive(Default)]
pub struct RecordingClient {
    pub calls: Mutex<Vec<(String, RunRequest)>>,
    responses: Mutex<VecDeque<FunctionClientResult<RunResponse>>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_with(&self, result: FunctionClientResult<RunResponse>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn last_call(&self) -> Option<(String, RunRequest)> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl FunctionClient for RecordingClient {
    async fn run_function(
        &self,
        organization_id: &str,
        request: RunRequest,
    ) -> FunctionClientResult<RunResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((organization_id.to_string(), request.clone()));
        if let Some(scripted) = self.responses.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(RunResponse {
            output: Some(serde_json::to_value(&request.input).unwrap()),
        })
    }
}

/// Scripted failures for [`ScriptedGateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    Driver,
}

impl Failure {
    fn error(self, name: &str) -> GatewayError {
        match self {
            Failure::NotFound => GatewayError::NotFound(name.to_string()),
            Failure::Driver => GatewayError::Driver(format!("scripted failure for {name}")),
        }
    }
}

/// In-memory driver whose next add/update/delete calls can be made to fail.
#[derive(Default)]
pub struct ScriptedGateway {
    pub apis: Mutex<BTreeMap<String, Api>>,
    pub calls: Mutex<Vec<String>>,
    add_failures: Mutex<VecDeque<Failure>>,
    update_failures: Mutex<VecDeque<Failure>>,
    delete_failures: Mutex<VecDeque<Failure>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_add(&self, failure: Failure) {
        self.add_failures.lock().unwrap().push_back(failure);
    }

    pub fn fail_update(&self, failure: Failure) {
        self.update_failures.lock().unwrap().push_back(failure);
    }

    pub fn fail_delete(&self, failure: Failure) {
        self.delete_failures.lock().unwrap().push_back(failure);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apis.lock().unwrap().contains_key(name)
    }

    fn record(&self, call: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{call}:{name}"));
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn add_api(&self, api: &Api) -> GatewayResult<Api> {
        self.record("add", &api.name);
        if let Some(failure) = self.add_failures.lock().unwrap().pop_front() {
            return Err(failure.error(&api.name));
        }
        let mut added = api.clone();
        added.id = format!("id-{}", api.name);
        added.created_at = 1_700_000_000;
        self.apis
            .lock()
            .unwrap()
            .insert(api.name.clone(), added.clone());
        Ok(added)
    }

    async fn get_api(&self, name: &str) -> GatewayResult<Api> {
        self.record("get", name);
        self.apis
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn update_api(&self, name: &str, api: &Api) -> GatewayResult<Api> {
        self.record("update", name);
        if let Some(failure) = self.update_failures.lock().unwrap().pop_front() {
            return Err(failure.error(name));
        }
        let mut apis = self.apis.lock().unwrap();
        let existing = apis
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;
        let mut updated = api.clone();
        updated.id = existing.id;
        updated.created_at = existing.created_at;
        apis.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    async fn delete_api(&self, api: &Api) -> GatewayResult<()> {
        self.record("delete", &api.name);
        if let Some(failure) = self.delete_failures.lock().unwrap().pop_front() {
            return Err(failure.error(&api.name));
        }
        self.apis
            .lock()
            .unwrap()
            .remove(&api.name)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(api.name.clone()))
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn request(method: &str, host: &str, uri: &str) -> hyper::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    if host.is_empty() {
        builder
    } else {
        builder.header("host", host)
    }
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = body_string(response).await;
    serde_json::from_str(&body).unwrap()
}

pub fn status_error(code: u16, message: &str) -> FunctionClientResult<RunResponse> {
    Err(FunctionClientError::Status {
        code,
        message: message.to_string(),
    })
}
