use std::{net::SocketAddr, time::Duration};

use axum::{routing::put, Router};
use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::oneshot;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use super::api::{self, AppState};

pub const CONFIGURE_PATH: &str = "/api/v1/configure";

/// How long in-flight requests get to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            CONFIGURE_PATH,
            put(api::register)
                .delete(api::unregister)
                .patch(api::replace_targets),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serves the API until SIGINT/SIGTERM, then shuts down gracefully.
pub async fn server(addr: SocketAddr, state: AppState) -> Result<()> {
    let app = router(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = axum::Server::try_bind(&addr)
        .wrap_err_with(|| format!("failed to listen for http at {addr}"))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
    tracing::info!("start http server: {:?}", addr);

    tokio::pin!(server);
    tokio::select! {
        result = &mut server => return result.wrap_err("http server failed"),
        () = shutdown_signal() => tracing::info!("got signal, exiting"),
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(result) => result.wrap_err("failed to shut down http server"),
        Err(_) => {
            tracing::warn!(grace = ?SHUTDOWN_GRACE, "http server did not drain in time");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
