//! Gateway server entry point.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;

use super::{routes::build_router, state::AppState};

/// Bind the configured address, start the background daemons, and serve
/// until shutdown.  Blocks for the lifetime of the server.
pub async fn serve(state: Arc<AppState>) -> Result<(), String> {
    let addr = state.config.bind;
    state.start_background();

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("could not bind {addr}: {e}"))?;
    let local = listener
        .local_addr()
        .map_err(|e| format!("no local addr: {e}"))?;
    tracing::info!(%local, "palisade gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| format!("server error: {e}"))
}
