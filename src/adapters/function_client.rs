use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::Deserialize;

use crate::ports::function_client::{
    FunctionClient, FunctionClientError, FunctionClientResult, RunRequest, RunResponse,
};

/// Header carrying the organization on function manager calls.
pub const ORG_HEADER: &str = "X-Dispatch-Org";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<u16>,
    message: Option<String>,
}

/// [`FunctionClient`] backed by the function manager's REST API.
pub struct HttpFunctionClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFunctionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("apiman/", env!("CARGO_PKG_VERSION")))
            .build()
            .wrap_err("Failed to build function manager client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn runs_url(&self, function: &str) -> String {
        format!("{}/v1/function/{}/runs", self.base_url, function)
    }
}

#[async_trait]
impl FunctionClient for HttpFunctionClient {
    async fn run_function(
        &self,
        organization_id: &str,
        request: RunRequest,
    ) -> FunctionClientResult<RunResponse> {
        let url = self.runs_url(&request.function_name);
        tracing::debug!(%url, blocking = request.blocking, "running function");

        let response = self
            .client
            .post(&url)
            .header(ORG_HEADER, organization_id)
            .json(&request)
            .send()
            .await
            .map_err(|e| FunctionClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FunctionClientError::Transport(e.to_string()))?;

        if status.is_success() {
            if body.is_empty() {
                return Ok(RunResponse::default());
            }
            return serde_json::from_slice(&body)
                .map_err(|e| FunctionClientError::Transport(format!("invalid run response: {e}")));
        }

        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(ErrorBody {
                code,
                message: Some(message),
            }) => Err(FunctionClientError::Status {
                code: code.unwrap_or(status.as_u16()),
                message,
            }),
            _ => Err(FunctionClientError::Transport(format!(
                "function manager returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}
