//! refunc-gateway — HTTP long-poll surface in front of the invocation clients.

pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use refunc_core::messages::MAX_PAYLOAD_SIZE;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::GatewayState;

pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tasks", get(handlers::handle_list_tasks))
        .route(
            "/{ns}/{name}/tasks",
            post(handlers::handle_create_task).layer(DefaultBodyLimit::max(MAX_PAYLOAD_SIZE)),
        )
        .route("/{ns}/{name}/_meta", get(handlers::handle_meta))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: GatewayState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "gateway listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
