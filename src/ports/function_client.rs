use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::input::FunctionInput;

/// Errors returned when invoking a function.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FunctionClientError {
    /// The function service answered with an error carrying its own status code
    #[error("{message}")]
    Status {
        /// HTTP status code to surface to the caller
        code: u16,
        /// Message to surface verbatim
        message: String,
    },

    /// The function service could not be reached or returned garbage
    #[error("function service transport error: {0}")]
    Transport(String),
}

/// Result type alias for function invocations
pub type FunctionClientResult<T> = Result<T, FunctionClientError>;

/// A single function execution request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub blocking: bool,
    pub function_name: String,
    pub input: FunctionInput,
    pub http_context: Map<String, Value>,
}

/// The outcome of a function execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunResponse {
    /// `None` when the function produced no output (or a JSON `null`).
    #[serde(default)]
    pub output: Option<Value>,
}

/// FunctionClient is the port used by the dispatcher to execute functions.
///
/// Cancellation is cooperative: dropping the returned future abandons the call.
#[async_trait]
pub trait FunctionClient: Send + Sync + 'static {
    async fn run_function(
        &self,
        organization_id: &str,
        request: RunRequest,
    ) -> FunctionClientResult<RunResponse>;
}
