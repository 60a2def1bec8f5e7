//! REST management surface over [`ApiService`].
use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::{
    adapters::function_client::ORG_HEADER,
    core::{
        api::{ApiEntity, ApiSpec},
        service::{ApiService, ServiceError},
    },
};

#[derive(Clone)]
pub struct AdminState {
    service: Arc<ApiService>,
    organization: String,
}

impl AdminState {
    /// `organization` is used when a request carries no organization header.
    pub fn new(service: Arc<ApiService>, organization: impl Into<String>) -> Self {
        Self {
            service,
            organization: organization.into(),
        }
    }
}

/// Organization a management request acts on.
struct Organization(String);

impl FromRequestParts<AdminState> for Organization {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AdminState,
    ) -> Result<Self, Self::Rejection> {
        let organization = parts
            .headers
            .get(ORG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&state.organization);
        Ok(Organization(organization.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

struct AdminError(ServiceError);

impl From<ServiceError> for AdminError {
    fn from(err: ServiceError) -> Self {
        AdminError(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "management request failed");
        }
        let body = ErrorBody {
            code: status.as_u16(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/v1/api", get(list_apis).post(add_api))
        .route(
            "/v1/api/{name}",
            get(get_api).put(update_api).delete(delete_api),
        )
        .with_state(state)
}

async fn list_apis(
    State(state): State<AdminState>,
    Organization(org): Organization,
) -> AdminResult<Json<Vec<ApiEntity>>> {
    Ok(Json(state.service.list_apis(&org).await?))
}

async fn add_api(
    State(state): State<AdminState>,
    Organization(org): Organization,
    Json(spec): Json<ApiSpec>,
) -> AdminResult<(StatusCode, Json<ApiEntity>)> {
    let entity = state.service.add_api(&org, spec).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn get_api(
    State(state): State<AdminState>,
    Organization(org): Organization,
    Path(name): Path<String>,
) -> AdminResult<Json<ApiEntity>> {
    Ok(Json(state.service.get_api(&org, &name).await?))
}

async fn update_api(
    State(state): State<AdminState>,
    Organization(org): Organization,
    Path(name): Path<String>,
    Json(spec): Json<ApiSpec>,
) -> AdminResult<Json<ApiEntity>> {
    Ok(Json(state.service.update_api(&org, &name, spec).await?))
}

async fn delete_api(
    State(state): State<AdminState>,
    Organization(org): Organization,
    Path(name): Path<String>,
) -> AdminResult<Json<ApiEntity>> {
    Ok(Json(state.service.delete_api(&org, &name).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use hyper::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{adapters::memory_store::InMemoryEntityStore, core::api::Status};

    fn app() -> Router {
        let service = Arc::new(ApiService::new(Arc::new(InMemoryEntityStore::new())));
        router(AdminState::new(service, "dispatch"))
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_crud_flow() {
        let app = app();
        let spec = json!({
            "name": "hello",
            "function": "hello",
            "enabled": true,
            "uris": ["/hello"],
            "methods": ["GET"],
        });

        let (status, body) = call(&app, json_request("POST", "/v1/api", spec.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "CREATING");
        assert_eq!(body["api"]["name"], "dispatch-hello");

        let (status, _) = call(&app, json_request("POST", "/v1/api", spec)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            Request::get("/v1/api").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            json_request(
                "PUT",
                "/v1/api/hello",
                json!({ "function": "hello", "enabled": false }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UPDATING");
        assert_eq!(body["api"]["enabled"], false);

        let (status, body) = call(
            &app,
            Request::delete("/v1/api/hello").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], serde_json::to_value(Status::Deleting).unwrap());
    }

    #[tokio::test]
    async fn test_organization_header_scopes_requests() {
        let app = app();
        let req = Request::builder()
            .method("POST")
            .uri("/v1/api")
            .header("content-type", "application/json")
            .header(ORG_HEADER, "acme")
            .body(Body::from(json!({ "name": "hello", "function": "f" }).to_string()))
            .unwrap();
        let (status, _) = call(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &app,
            Request::get("/v1/api/hello").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);

        let req = Request::get("/v1/api/hello")
            .header(ORG_HEADER, "acme")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["organizationId"], "acme");
    }

    #[tokio::test]
    async fn test_invalid_name_is_bad_request() {
        let app = app();
        let (status, body) = call(
            &app,
            json_request("POST", "/v1/api", json!({ "name": "not valid", "function": "f" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }
}
