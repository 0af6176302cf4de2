use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::DeploymentImpl;

pub mod auth;
pub mod config;
pub mod files;
pub mod health;
pub mod projects;
pub mod sites;
pub mod sync;
pub mod users;
pub mod workers;

pub fn router(deployment: DeploymentImpl) -> Router {
    let api = Router::new()
        .merge(config::router())
        .merge(auth::router())
        .merge(projects::router())
        .merge(sites::router(&deployment))
        .merge(workers::router())
        .merge(files::router(&deployment))
        .merge(users::router())
        .merge(sync::router());

    Router::new()
        .merge(health::router())
        .nest("/api/v1", api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(deployment)
}
