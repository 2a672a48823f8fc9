//! Prometheus exporter with process-wide, one-time initialization.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, BindSnafu, MetricsError, PrometheusInitSnafu,
};

/// Default metrics listen address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let builder = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?;
    builder.install_recorder().context(PrometheusInitSnafu)
}

/// Install the global recorder and serve `/metrics` and `/health` on `address`.
///
/// The listener is bound before returning so a bad address fails startup
/// instead of being logged from a background task.
pub async fn init_global(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu)?;
    let listener = TcpListener::bind(addr).await.context(BindSnafu {
        address: address.to_string(),
    })?;

    if HANDLE.get().is_some() {
        return AlreadyInitializedSnafu.fail();
    }
    let handle = install_recorder()?;
    HANDLE
        .set(handle.clone())
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint. Safe to call repeatedly.
pub fn init_test() -> &'static PrometheusHandle {
    if let Some(handle) = HANDLE.get() {
        return handle;
    }
    match install_recorder() {
        Ok(handle) => HANDLE.get_or_init(|| handle),
        // Another thread won the race to install the recorder
        Err(_) => loop {
            if let Some(handle) = HANDLE.get() {
                return handle;
            }
            std::hint::spin_loop();
        },
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn test_init_test_is_idempotent() {
        let first = init_test() as *const PrometheusHandle;
        let second = init_test() as *const PrometheusHandle;
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_contains_counter() {
        let handle = init_test();
        counter!("floe_test_counter").increment(3);
        assert!(handle.render().contains("floe_test_counter"));
    }

    #[tokio::test]
    async fn test_init_global_rejects_bad_address() {
        let err = init_global("not-an-address").await.unwrap_err();
        assert!(matches!(err, MetricsError::AddressParse { .. }));
    }
}
