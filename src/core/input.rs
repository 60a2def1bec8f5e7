//! Conversion of an inbound HTTP request into function input.
use std::{collections::BTreeMap, convert::Infallible};

use axum::{
    body::{Body, to_bytes},
    extract::{DefaultBodyLimit, FromRequest, Multipart},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{Method, Request, header::CONTENT_LENGTH, header::CONTENT_TYPE};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tower::{Layer, ServiceExt, service_fn};

/// Form bodies (urlencoded or multipart) larger than this are rejected.
pub const DEFAULT_MAX_FORM_BYTES: usize = 10 << 20;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InputError {
    #[error("request body is not json: {0}")]
    NotJson(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
}

pub type InputResult<T> = Result<T, InputError>;

/// Input handed to a function: structured JSON or the raw request bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionInput {
    Json(Value),
    Raw(Bytes),
}

impl FunctionInput {
    pub fn empty() -> Self {
        FunctionInput::Json(Value::Object(Map::new()))
    }
}

impl Serialize for FunctionInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FunctionInput::Json(value) => value.serialize(serializer),
            // Same wire shape as a JSON-encoded byte slice.
            FunctionInput::Raw(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
        }
    }
}

/// Extract function input from `req`, consuming its body.
///
/// GET uses the query string. Other methods are decided by the content type:
/// form encodings and JSON are parsed, a missing content type passes the raw
/// body through, anything else is rejected.
pub async fn get_input(req: Request<Body>, max_form_bytes: usize) -> InputResult<FunctionInput> {
    let query = req.uri().query().map(str::to_owned);

    if req.method() == Method::GET {
        return Ok(FunctionInput::Json(process_values(query_pairs(
            query.as_deref(),
        ))));
    }

    if declared_length(&req) == Some(0) {
        return Ok(FunctionInput::empty());
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if is_form_content_type(&content_type) {
        let mut values = if media_type_is(&content_type, "multipart/form-data") {
            multipart_values(req, max_form_bytes).await?
        } else {
            let body = read_limited(req.into_body(), max_form_bytes).await?;
            url::form_urlencoded::parse(&body).into_owned().collect()
        };
        // Body values take precedence over query values for the same key.
        values.extend(query_pairs(query.as_deref()));
        return Ok(FunctionInput::Json(process_values(values)));
    }

    if is_json_content_type(&content_type) {
        let body = read_all(req.into_body()).await?;
        return serde_json::from_slice(&body)
            .map(FunctionInput::Json)
            .map_err(|e| InputError::NotJson(e.to_string()));
    }

    if !content_type.is_empty() {
        return Err(InputError::UnsupportedContentType(content_type));
    }

    Ok(FunctionInput::Raw(read_all(req.into_body()).await?))
}

/// Flatten form-style values: a key with one value maps to that string, a key
/// with several maps to the array of them.
pub fn process_values(values: impl IntoIterator<Item = (String, String)>) -> Value {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in values {
        grouped.entry(key).or_default().push(value);
    }

    let object = grouped
        .into_iter()
        .map(|(key, mut vals)| {
            let value = if vals.len() == 1 {
                Value::String(vals.remove(0))
            } else {
                Value::Array(vals.into_iter().map(Value::String).collect())
            };
            (key, value)
        })
        .collect::<Map<_, _>>();
    Value::Object(object)
}

/// `application/json` or any `application/*+json`.
pub fn is_json_content_type(content_type: &str) -> bool {
    media_types(content_type).any(|media| {
        media == "application/json"
            || media
                .strip_prefix("application/")
                .is_some_and(|sub| sub.ends_with("+json"))
    })
}

pub fn is_form_content_type(content_type: &str) -> bool {
    media_type_is(content_type, "application/x-www-form-urlencoded")
        || media_type_is(content_type, "multipart/form-data")
}

fn media_type_is(content_type: &str, expected: &str) -> bool {
    media_types(content_type).any(|media| media == expected)
}

/// Media types of a (possibly comma separated) content type, parameters stripped.
fn media_types(content_type: &str) -> impl Iterator<Item = String> + '_ {
    content_type.split(',').map(|part| {
        part.split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    })
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Content-Length if declared, else the body's exact size hint when it has one.
fn declared_length(req: &Request<Body>) -> Option<u64> {
    let header = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    header.or_else(|| hyper::body::Body::size_hint(req.body()).exact())
}

async fn read_all(body: Body) -> InputResult<Bytes> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| InputError::BodyRead(e.to_string()))
}

async fn read_limited(body: Body, limit: usize) -> InputResult<Bytes> {
    to_bytes(body, limit)
        .await
        .map_err(|_| InputError::TooLarge(limit))
}

/// Text fields of a multipart body. File parts are skipped.
///
/// The body is buffered under `limit` first, so an oversized form is reported
/// as [`InputError::TooLarge`] whatever body limit the caller installed.
async fn multipart_values(req: Request<Body>, limit: usize) -> InputResult<Vec<(String, String)>> {
    let (parts, body) = req.into_parts();
    let body = read_limited(body, limit).await?;
    let req = DefaultBodyLimit::disable()
        .layer(service_fn(|req: Request<Body>| async move { Ok::<_, Infallible>(req) }))
        .oneshot(Request::from_parts(parts, Body::from(body)))
        .await
        .unwrap_or_else(|never| match never {});

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| InputError::BodyRead(e.body_text()))?;

    let mut values = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InputError::BodyRead(e.body_text()))?
    {
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let text = field
            .text()
            .await
            .map_err(|e| InputError::BodyRead(e.body_text()))?;
        values.push((name, text));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(method: Method, uri: &str, content_type: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder
            .header(CONTENT_LENGTH, body.len())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_json_content_types() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/vnd.api+json"));
        assert!(is_json_content_type("text/plain, application/json"));
        assert!(!is_json_content_type("text/json"));
        assert!(!is_json_content_type(""));
    }

    #[test]
    fn test_process_values_flattens_single_values() {
        let value = process_values(vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("b".to_string(), "3".to_string()),
        ]);
        assert_eq!(value, json!({"a": "1", "b": ["2", "3"]}));
    }

    #[tokio::test]
    async fn test_get_uses_query() {
        let req = request(Method::GET, "/hello?name=foo&tag=a&tag=b", None, "");
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(
            input,
            FunctionInput::Json(json!({"name": "foo", "tag": ["a", "b"]}))
        );
    }

    #[tokio::test]
    async fn test_json_body() {
        let req = request(
            Method::POST,
            "/hello",
            Some("application/json"),
            r#"{"key":"value"}"#,
        );
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(input, FunctionInput::Json(json!({"key": "value"})));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let req = request(Method::POST, "/hello", Some("application/json"), "{nope");
        let err = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap_err();
        assert!(matches!(err, InputError::NotJson(_)));
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_mapping() {
        let req = request(Method::POST, "/hello", Some("text/plain"), "");
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(input, FunctionInput::empty());
    }

    #[tokio::test]
    async fn test_urlencoded_form() {
        let req = request(
            Method::POST,
            "/hello",
            Some("application/x-www-form-urlencoded"),
            "name=VMware&place=Palo+Alto",
        );
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(
            input,
            FunctionInput::Json(json!({"name": "VMware", "place": "Palo Alto"}))
        );
    }

    #[tokio::test]
    async fn test_form_over_limit() {
        let req = request(
            Method::POST,
            "/hello",
            Some("application/x-www-form-urlencoded"),
            "name=0123456789",
        );
        let err = get_input(req, 4).await.unwrap_err();
        assert!(matches!(err, InputError::TooLarge(4)));
    }

    #[tokio::test]
    async fn test_multipart_form_skips_files() {
        let body = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"name\"\r\n\r\n\
            VMware\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file contents\r\n\
            --XYZ--\r\n";
        let req = request(
            Method::POST,
            "/hello",
            Some("multipart/form-data; boundary=XYZ"),
            body,
        );
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(input, FunctionInput::Json(json!({"name": "VMware"})));
    }

    fn multipart_body(field: &str, value: &str) -> String {
        format!(
            "--XYZ\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n--XYZ--\r\n"
        )
    }

    #[tokio::test]
    async fn test_multipart_form_above_default_body_limit() {
        // Larger than axum's 2 MiB default, within the form limit.
        let large = "a".repeat(3 << 20);
        let req = request(
            Method::POST,
            "/hello",
            Some("multipart/form-data; boundary=XYZ"),
            &multipart_body("blob", &large),
        );
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        let FunctionInput::Json(value) = input else {
            panic!("multipart input should be json");
        };
        assert_eq!(value["blob"].as_str().map(str::len), Some(3 << 20));
    }

    #[tokio::test]
    async fn test_multipart_form_over_limit() {
        let req = request(
            Method::POST,
            "/hello",
            Some("multipart/form-data; boundary=XYZ"),
            &multipart_body("name", &"x".repeat(1024)),
        );
        let err = get_input(req, 512).await.unwrap_err();
        assert!(matches!(err, InputError::TooLarge(512)));
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let req = request(Method::POST, "/hello", Some("text/plain"), "hello");
        let err = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap_err();
        assert!(matches!(err, InputError::UnsupportedContentType(ct) if ct == "text/plain"));
    }

    #[tokio::test]
    async fn test_raw_body_without_content_type() {
        let req = request(Method::PUT, "/hello", None, "raw bytes");
        let input = get_input(req, DEFAULT_MAX_FORM_BYTES).await.unwrap();
        assert_eq!(input, FunctionInput::Raw(Bytes::from_static(b"raw bytes")));
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!(STANDARD.encode("raw bytes"))
        );
    }
}
