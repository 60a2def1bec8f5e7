//! Executes a matched API against the function client and shapes the HTTP response.
use std::sync::Arc;

use axum::body::Body;
use bytes::BytesMut;
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    config::models::ProtocolMismatchPolicy,
    core::{
        api::Api,
        input::{self, DEFAULT_MAX_FORM_BYTES},
    },
    metrics,
    ports::function_client::{FunctionClient, FunctionClientError, RunRequest},
};

/// Header that switches an invocation to fire-and-forget when set to `false`.
pub const BLOCKING_HEADER: &str = "x-dispatch-blocking";

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub protocol_mismatch: ProtocolMismatchPolicy,
    pub max_form_bytes: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            protocol_mismatch: ProtocolMismatchPolicy::Continue,
            max_form_bytes: DEFAULT_MAX_FORM_BYTES,
        }
    }
}

/// Buffered response with write-once status semantics.
///
/// The first status written is final. Headers added after it are dropped and
/// body writes always append (an implicit 200 if no status was written yet).
#[derive(Debug, Default)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.status.is_none() {
            self.headers.insert(name, value);
        }
    }

    pub fn write_header(&mut self, status: StatusCode) {
        match self.status {
            None => self.status = Some(status),
            Some(written) => debug!(%written, ignored = %status, "superfluous status write"),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(bytes);
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

/// Write a JSON `{"message": ..}` error with `code`.
pub fn write_error(rw: &mut ResponseWriter, code: StatusCode, message: &str) {
    rw.set_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rw.write_header(code);
    write_json(rw, &json!({ "message": message }));
}

fn write_json(rw: &mut ResponseWriter, value: &Value) {
    match serde_json::to_vec(value) {
        Ok(mut encoded) => {
            encoded.push(b'\n');
            rw.write(&encoded);
        }
        Err(e) => warn!(error = %e, "failed to encode response body"),
    }
}

/// Runs matched requests through a [`FunctionClient`].
#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn FunctionClient>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn FunctionClient>, options: DispatchOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    /// Dispatch `req` to the function bound by `api`. `secure` reports whether
    /// the request arrived over TLS.
    pub async fn dispatch(&self, api: Api, req: Request<Body>, secure: bool) -> Response<Body> {
        let mut rw = ResponseWriter::new();

        if let Some(required) = api.required_protocol() {
            let required = required.to_ascii_uppercase();
            let actual = if secure { "HTTPS" } else { "HTTP" };
            if required != actual {
                write_error(
                    &mut rw,
                    StatusCode::BAD_REQUEST,
                    &format!("Please use {required} protocol"),
                );
                if self.options.protocol_mismatch == ProtocolMismatchPolicy::Reject {
                    return rw.into_response();
                }
                warn!(api = %api.name, required = %required, actual, "protocol mismatch, continuing dispatch");
            }
        }

        if api.cors {
            add_cors_headers(&mut rw);
        }

        if req.method() == Method::OPTIONS {
            rw.write_header(StatusCode::OK);
            return rw.into_response();
        }

        let blocking = is_blocking(req.headers());
        let http_context = http_context(&req, &api.function, secure);

        let input = match input::get_input(req, self.options.max_form_bytes).await {
            Ok(input) => input,
            Err(e) => {
                write_error(&mut rw, StatusCode::BAD_REQUEST, &e.to_string());
                return rw.into_response();
            }
        };

        let run = RunRequest {
            blocking,
            function_name: api.function.clone(),
            input,
            http_context,
        };

        match self.client.run_function(&api.organization_id, run).await {
            Err(FunctionClientError::Status { code, message }) => {
                metrics::record_function_invocation(&api.function, "error");
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                write_error(&mut rw, status, &message);
            }
            Err(e) => {
                metrics::record_function_invocation(&api.function, "error");
                write_error(&mut rw, StatusCode::BAD_REQUEST, &e.to_string());
            }
            Ok(response) => {
                metrics::record_function_invocation(&api.function, "ok");
                match response.output {
                    Some(output) if blocking && !is_empty_output(&output) => {
                        rw.set_header(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                        rw.write_header(StatusCode::OK);
                        write_json(&mut rw, &output);
                    }
                    _ => rw.write_header(StatusCode::OK),
                }
            }
        }

        rw.into_response()
    }
}

fn is_empty_output(output: &Value) -> bool {
    match output {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn add_cors_headers(rw: &mut ResponseWriter) {
    let wildcard = HeaderValue::from_static("*");
    rw.set_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, wildcard.clone());
    rw.set_header(header::ACCESS_CONTROL_ALLOW_METHODS, wildcard.clone());
    rw.set_header(header::ACCESS_CONTROL_ALLOW_HEADERS, wildcard);
}

fn is_blocking(headers: &HeaderMap) -> bool {
    headers
        .get(BLOCKING_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|v| v != "false")
}

/// Request metadata passed to the function alongside its input.
pub fn http_context(req: &Request<Body>, function: &str, secure: bool) -> Map<String, Value> {
    let scheme = if secure { "https" } else { "http" };
    let uri = req.uri();
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default();
    let path = uri.path();
    let request_uri = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(path);
    let full_url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        format!("{scheme}://{host}{request_uri}")
    };

    let mut context = Map::new();
    context.insert("args".into(), uri.query().unwrap_or_default().into());
    context.insert("request".into(), full_url.into());
    context.insert("request_uri".into(), request_uri.into());
    context.insert("scheme".into(), scheme.into());
    context.insert("server_protocol".into(), format!("{:?}", req.version()).into());
    context.insert("upstream_uri".into(), function.into());
    context.insert("uri".into(), request_uri.into());
    context.insert("method".into(), req.method().as_str().into());
    context
}
