use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use herald_core::config::HeraldConfig;
use herald_scheduler::ScheduleService;
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: HeraldConfig,
    pub schedule: ScheduleService,
}

impl AppState {
    pub fn new(config: HeraldConfig, schedule: ScheduleService) -> Self {
        Self { config, schedule }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::messages;

    let schedule = Router::new()
        .route(
            "/schedule/messages",
            get(messages::list_messages).post(messages::create_message),
        )
        .route(
            "/schedule/messages/{id}",
            get(messages::get_message)
                .put(messages::update_message)
                .delete(messages::delete_message),
        )
        .route("/schedule/messages/{id}/run", post(messages::run_message))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_token,
        ));

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .merge(schedule)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
