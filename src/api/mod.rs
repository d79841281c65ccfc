mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::db::Database;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            db: orchestrator.db().clone(),
            orchestrator,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Projects
        .route("/projects", post(handlers::create_project))
        .route("/projects/{id}", get(handlers::get_project))
        .route(
            "/projects/{id}/files",
            get(handlers::list_files).put(handlers::upsert_file),
        )
        .route(
            "/projects/{id}/stories",
            get(handlers::list_stories).post(handlers::create_story),
        )
        // Stories
        .route("/stories/{id}", get(handlers::get_story))
        .route("/stories/{id}/tasks", get(handlers::list_tasks))
        .route("/stories/{id}/events", get(handlers::list_events))
        .route("/stories/{id}/process", post(handlers::process_story))
        .route("/stories/{id}/cancel", post(handlers::cancel_story))
        // Health
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
