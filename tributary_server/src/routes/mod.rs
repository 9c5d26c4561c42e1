use axum::Router;
use axum::routing::get;

pub mod blueprints;
pub mod health;
pub mod pipelines;
pub mod plugins;
pub mod sources;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .merge(pipelines::router())
        .merge(blueprints::router())
        .merge(plugins::router())
        .merge(sources::router())
}
