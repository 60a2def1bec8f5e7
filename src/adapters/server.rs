//! HTTP listeners for the local gateway and the management API.
use std::{fs::File, io::BufReader, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    serve::Listener,
    routing::any,
};
use eyre::{Context, Result, eyre};
use futures_util::StreamExt;
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{adapters::local_gateway::LocalGateway, config::models::TlsConfig};

/// Adapts a stream of accepted connections to axum's [`Listener`].
struct StreamListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for StreamListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Every method on every path goes to the gateway. `secure` is reported to
/// the dispatcher as the request's transport.
pub fn gateway_router(gateway: Arc<LocalGateway>, secure: bool) -> Router {
    let body_limit = gateway.dispatch_options().max_form_bytes;
    let handler = move |req: Request| {
        let gateway = gateway.clone();
        async move { gateway.handle_request(req, secure).await }
    };

    Router::new()
        .route("/", any(handler.clone()))
        .route("/{*path}", any(handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

/// Build a rustls server config from PEM files.
pub fn load_tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let cert_file = &mut BufReader::new(
        File::open(&tls.cert_path)
            .with_context(|| format!("failed to open cert file {}", tls.cert_path))?,
    );
    let key_file = &mut BufReader::new(
        File::open(&tls.key_path)
            .with_context(|| format!("failed to open key file {}", tls.key_path))?,
    );

    let cert_chain = rustls_pemfile::certs(cert_file)
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("failed to parse certificates")?;
    let key = rustls_pemfile::private_key(key_file)
        .wrap_err("failed to parse private key")?
        .ok_or_else(|| eyre!("no private key found in {}", tls.key_path))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .wrap_err("invalid certificate/key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Serve the local gateway until `shutdown` is cancelled, over TLS when configured.
pub async fn serve_gateway(
    addr: SocketAddr,
    gateway: Arc<LocalGateway>,
    tls: Option<&TlsConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {addr}"))?;

    match tls {
        Some(tls) => {
            let config = load_tls_config(tls)?;
            let local_addr = listener.local_addr().context("failed to get local addr")?;
            let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
            let listener = StreamListener {
                stream: TlsListener::new(acceptor, listener),
                local_addr,
            };

            tracing::info!(%local_addr, "local gateway listening (https)");
            axum::serve(listener, gateway_router(gateway, true).into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .context("gateway server error")
        }
        None => {
            tracing::info!(%addr, "local gateway listening (http)");
            axum::serve(listener, gateway_router(gateway, false).into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .context("gateway server error")
        }
    }
}

/// Serve the management API until `shutdown` is cancelled.
pub async fn serve_admin(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {addr}"))?;
    tracing::info!(%addr, "management API listening");

    axum::serve(
        listener,
        router.layer(TraceLayer::new_for_http()).into_make_service(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .context("admin server error")
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::{api::Api, dispatcher::DispatchOptions},
        ports::{
            function_client::{FunctionClient, FunctionClientResult, RunRequest, RunResponse},
            gateway::Gateway,
        },
    };

    struct EchoClient;

    #[async_trait::async_trait]
    impl FunctionClient for EchoClient {
        async fn run_function(&self, _: &str, req: RunRequest) -> FunctionClientResult<RunResponse> {
            Ok(RunResponse {
                output: Some(serde_json::Value::String(
                    req.http_context["scheme"].as_str().unwrap_or_default().to_string(),
                )),
            })
        }
    }

    #[tokio::test]
    async fn test_router_reports_transport() {
        let gateway = Arc::new(
            LocalGateway::new(None, Arc::new(EchoClient), DispatchOptions::default()).await,
        );
        gateway
            .add_api(&Api {
                name: "scheme".to_string(),
                function: "scheme".to_string(),
                enabled: true,
                uris: vec!["/scheme".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        for (secure, expected) in [(false, "\"http\"\n"), (true, "\"https\"\n")] {
            let response = gateway_router(gateway.clone(), secure)
                .oneshot(
                    hyper::Request::builder()
                        .uri("/scheme")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, expected);
        }
    }

    #[test]
    fn test_missing_tls_files() {
        let err = load_tls_config(&TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to open cert file"));
    }
}
