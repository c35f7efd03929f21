//! Prometheus scrape endpoint.
//!
//! Serves every collector from [`registry::REGISTRY`] at `/metrics` in the
//! Prometheus text format.

use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use axum::{
    Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{metrics::registry, runtime::conf::MetricsConf};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics listen address '{0}'")]
    ListenAddress(String),

    #[error("failed to bind metrics server to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("metrics server error: {0}")]
    Serve(#[source] io::Error),

    #[error("prometheus registry error: {0}")]
    Registry(#[from] prometheus::Error),
}

fn encode_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&registry::REGISTRY.gather())
}

async fn metrics_handler() -> Response {
    let body = match tokio::task::spawn_blocking(encode_metrics).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            error!(
                event.name = "metrics.encode_failed",
                error.message = %e,
                "failed to encode metrics"
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}"))
                .into_response();
        }
        Err(e) => {
            error!(
                event.name = "metrics.gather_failed",
                error.message = %e,
                "metrics gathering task panicked"
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to gather metrics").into_response();
        }
    };

    let content_type = TextEncoder::new().format_type().to_string();
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

fn listen_addr(conf: &MetricsConf) -> Result<SocketAddr, MetricsError> {
    let ip: IpAddr = conf
        .listen_address
        .parse()
        .map_err(|_| MetricsError::ListenAddress(conf.listen_address.clone()))?;
    Ok(SocketAddr::new(ip, conf.port))
}

/// Serve `/metrics` until the listener fails.
///
/// Returns immediately with `Ok(())` when the server is disabled.
pub async fn start_metrics_server(conf: MetricsConf) -> Result<(), MetricsError> {
    if !conf.enabled {
        info!(
            event.name = "metrics.disabled",
            "metrics server is disabled in configuration"
        );
        return Ok(());
    }

    registry::init_registry()?;

    let address = listen_addr(&conf)?;
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| MetricsError::Bind { address, source })?;

    info!(
        event.name = "metrics.started",
        net.listen.address = %address,
        "metrics server started"
    );

    axum::serve(listener, metrics_router())
        .await
        .map_err(MetricsError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_collectors() {
        registry::init_registry().expect("registry should initialize");
        registry::STREAMS_CREATED_TOTAL.inc();

        let body = encode_metrics().expect("metrics should encode");
        assert!(body.contains("tlsflow_stream_streams_created_total"));
    }

    #[test]
    fn listen_addr_combines_address_and_port() {
        let conf = MetricsConf {
            listen_address: "127.0.0.1".to_string(),
            port: 9100,
            ..Default::default()
        };
        assert_eq!(
            listen_addr(&conf).expect("valid address"),
            "127.0.0.1:9100".parse::<SocketAddr>().expect("literal address")
        );
    }

    #[tokio::test]
    async fn disabled_server_returns_immediately() {
        let conf = MetricsConf {
            enabled: false,
            ..Default::default()
        };

        start_metrics_server(conf)
            .await
            .expect("disabled server should not fail");
    }

    #[tokio::test]
    async fn unparsable_listen_address_is_rejected() {
        let conf = MetricsConf {
            listen_address: "not-an-ip".to_string(),
            ..Default::default()
        };

        let err = start_metrics_server(conf)
            .await
            .expect_err("address cannot be parsed");
        assert!(matches!(err, MetricsError::ListenAddress(_)));
    }
}
